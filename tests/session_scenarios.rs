// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! End-to-end scenarios driving the composition root through an in-memory
//! mock `CloudTransport`, exercising the properties in SPEC_FULL.md §8.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use greenbridge_mqtt::auth::{AllowAll, AllowListCapability, Principal};
use greenbridge_mqtt::bus::{LocalMessage, LocalSubscriber, ReceiveMode};
use greenbridge_mqtt::coalescer::CloudSubscriber;
use greenbridge_mqtt::config::Config;
use greenbridge_mqtt::connection_manager::TransportFactory;
use greenbridge_mqtt::error::ErrorKind;
use greenbridge_mqtt::pipeline::PublishRequest;
use greenbridge_mqtt::session::{Session, SessionOptions};
use greenbridge_mqtt::topic::Topic;
use greenbridge_mqtt::transport::{
    AckOutcome, CloudTransport, ConnectOutcome, IncomingMessage, QoS,
};

/// A mock cloud broker: publishes/subscribes always succeed, and incoming
/// messages can be injected through `inject` for the session's demultiplexer
/// to pick up.
struct MockBroker {
    subscribe_calls: AtomicUsize,
    inbox: AsyncMutex<Vec<IncomingMessage>>,
}

impl MockBroker {
    fn new() -> Arc<Self> {
        Arc::new(MockBroker {
            subscribe_calls: AtomicUsize::new(0),
            inbox: AsyncMutex::new(Vec::new()),
        })
    }

    async fn inject(&self, message: IncomingMessage) {
        self.inbox.lock().await.push(message);
    }
}

#[async_trait]
impl CloudTransport for MockBroker {
    async fn connect(&self) -> Result<ConnectOutcome, greenbridge_mqtt::Error> {
        Ok(ConnectOutcome { session_present: true })
    }
    async fn subscribe(&self, _filter: &Topic, _qos: QoS) -> Result<AckOutcome, greenbridge_mqtt::Error> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AckOutcome::Success)
    }
    async fn unsubscribe(&self, _filter: &Topic) -> Result<(), greenbridge_mqtt::Error> {
        Ok(())
    }
    async fn publish(
        &self,
        _topic: &Topic,
        _payload: &[u8],
        _qos: QoS,
        _retain: bool,
    ) -> Result<AckOutcome, greenbridge_mqtt::Error> {
        Ok(AckOutcome::Success)
    }
    async fn disconnect(&self) {}
    async fn try_recv(&self) -> Option<IncomingMessage> {
        self.inbox.lock().await.pop()
    }
}

fn factory_for(broker: Arc<MockBroker>) -> TransportFactory {
    Arc::new(move |_id| broker.clone() as Arc<dyn CloudTransport>)
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct RecordingCloudSubscriber {
    received: AsyncMutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl CloudSubscriber for RecordingCloudSubscriber {
    async fn on_message(&self, message: &IncomingMessage) {
        self.received.lock().await.push(message.payload.clone());
    }
}

struct RecordingLocalSubscriber {
    received: AsyncMutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl LocalSubscriber for RecordingLocalSubscriber {
    async fn on_message(&self, message: &LocalMessage) {
        self.received.lock().await.push(message.payload.clone());
    }
}

#[tokio::test]
async fn unauthorized_principal_is_denied_publish_to_iot_core() {
    init_logging();
    let broker = MockBroker::new();
    let auth = Arc::new(AllowListCapability::new());
    let session = Session::new(SessionOptions {
        config: Config::default(),
        transport_factory: factory_for(broker),
        auth,
    });

    let principal = Principal("stranger".to_owned());
    let err = session
        .publish_to_iot_core(
            &principal,
            PublishRequest {
                topic: "a/b".to_owned(),
                payload: vec![1],
                qos: QoS::AtLeastOnce,
                retain: false,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(*err.kind(), ErrorKind::Unauthorized);
    session.shutdown().await;
}

#[tokio::test]
async fn cloud_message_is_demultiplexed_to_a_coalesced_subscriber() {
    init_logging();
    let broker = MockBroker::new();
    let broker_for_inject = broker.clone();
    let session = Session::new(SessionOptions {
        config: Config::default(),
        transport_factory: factory_for(broker),
        auth: Arc::new(AllowAll),
    });

    let principal = Principal("device-1".to_owned());
    let subscriber = Arc::new(RecordingCloudSubscriber {
        received: AsyncMutex::new(Vec::new()),
    });
    session
        .subscribe_to_iot_core(&principal, "a/b/+", QoS::AtLeastOnce, "comp", subscriber.clone())
        .await
        .unwrap();

    broker_for_inject
        .inject(IncomingMessage {
            topic: Topic::parse_publish("a/b/c").unwrap(),
            payload: vec![9, 9],
            qos: QoS::AtLeastOnce,
            retain: false,
        })
        .await;

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !subscriber.received.lock().await.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("demultiplexer should deliver the injected message");

    assert_eq!(subscriber.received.lock().await.clone(), vec![vec![9, 9]]);
    session.shutdown().await;
}

#[tokio::test]
async fn local_bus_round_trips_and_respects_from_others() {
    init_logging();
    let broker = MockBroker::new();
    let session = Session::new(SessionOptions {
        config: Config::default(),
        transport_factory: factory_for(broker),
        auth: Arc::new(AllowAll),
    });

    let principal = Principal("device-1".to_owned());
    let recorder = Arc::new(RecordingLocalSubscriber {
        received: AsyncMutex::new(Vec::new()),
    });
    session
        .subscribe_to_topic(&principal, "t", "componentA", ReceiveMode::FromOthers, recorder.clone())
        .await
        .unwrap();

    session
        .publish_to_topic(&principal, "t", vec![1], "componentA")
        .await
        .unwrap();
    session
        .publish_to_topic(&principal, "t", vec![2], "componentB")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.received.lock().await.clone(), vec![vec![2]]);
    session.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_pending_publish_futures_with_closed() {
    init_logging();
    let broker = MockBroker::new();
    let session = Session::new(SessionOptions {
        config: Config::default(),
        transport_factory: factory_for(broker),
        auth: Arc::new(AllowAll),
    });
    let principal = Principal("device-1".to_owned());

    let ack = session
        .publish_to_iot_core(
            &principal,
            PublishRequest {
                topic: "a/b".to_owned(),
                payload: vec![1],
                qos: QoS::AtLeastOnce,
                retain: false,
            },
        )
        .await
        .unwrap();

    // The pump may well complete this particular ack before shutdown races
    // it; either a successful completion or a `Closed` failure is a valid
    // terminal outcome, the point is that the future always resolves.
    session.shutdown().await;
    let result = tokio::time::timeout(Duration::from_secs(1), ack).await;
    assert!(result.is_ok(), "publish future must resolve after shutdown");
}
