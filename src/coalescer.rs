// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! The subscription coalescer (§4.E): deduplicates overlapping cloud
//! subscriptions by topic-wildcard superset, fans incoming cloud messages
//! out to every matching local consumer, and reference-counts each cloud
//! subscription so the last local unsubscribe drives the cloud unsubscribe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::RwLock;

use crate::bus::ReceiveMode;
use crate::connection_manager::ConnectionManager;
use crate::error::Error;
use crate::executor::OrderedExecutor;
use crate::topic::Topic;
use crate::transport::{IncomingMessage, QoS};

/// A stable handle for a cloud-facing local subscriber, returned by
/// `subscribe` and passed back to `unsubscribe` (§9 "Callback identity").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloudSubscriberHandle(u64);

/// A consumer of cloud-delivered messages, registered through the
/// coalescer.
#[async_trait]
pub trait CloudSubscriber: Send + Sync {
    async fn on_message(&self, message: &IncomingMessage);
}

struct SubscriberEntry {
    id: CloudSubscriberHandle,
    source: String,
    mode: ReceiveMode,
    callback: Arc<dyn CloudSubscriber>,
}

/// One distinct cloud subscription, keyed by its filter (§3
/// `SubscriptionRecord`).
struct CloudSubscription {
    filter: Topic,
    qos: QoS,
    subscribers: Vec<SubscriberEntry>,
}

/// The set of distinct cloud subscriptions and their local fan-out targets
/// (§4.E).
pub struct Coalescer {
    manager: Arc<ConnectionManager>,
    subscriptions: RwLock<Vec<CloudSubscription>>,
    executor: Arc<OrderedExecutor>,
    next_handle: AtomicU64,
}

impl Coalescer {
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager>, executor: Arc<OrderedExecutor>) -> Self {
        Coalescer {
            manager,
            subscriptions: RwLock::new(Vec::new()),
            executor,
            next_handle: AtomicU64::new(0),
        }
    }

    /// Registers a local consumer for cloud messages on `filter`, coalescing
    /// with an existing cloud subscription when one already covers it
    /// (§4.E step 1), or requesting a new cloud subscription and reparenting
    /// any strict-subset subscriptions onto it (§4.E step 2).
    ///
    /// # Errors
    /// `InvalidArguments` on a malformed filter; propagates whatever the
    /// connection manager's `subscribe` returns on failure.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        source: &str,
        mode: ReceiveMode,
        callback: Arc<dyn CloudSubscriber>,
    ) -> Result<CloudSubscriberHandle, Error> {
        let filter = Topic::parse_filter(filter)?;
        let handle = CloudSubscriberHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let entry = SubscriberEntry {
            id: handle,
            source: source.to_owned(),
            mode,
            callback,
        };

        let mut subscriptions = self.subscriptions.write().await;

        if let Some(existing) = subscriptions
            .iter_mut()
            .find(|s| s.filter.is_superset(&filter) || s.filter == filter)
        {
            log::debug!(
                "coalescer: `{filter}` covered by existing cloud subscription `{}`",
                existing.filter
            );
            existing.subscribers.push(entry);
            return Ok(handle);
        }

        self.manager.subscribe(&filter, qos).await?;

        let strict_subset_positions: Vec<usize> = subscriptions
            .iter()
            .enumerate()
            .filter(|(_, s)| filter.is_superset(&s.filter) && s.filter != filter)
            .map(|(i, _)| i)
            .collect();

        let mut reparented = Vec::new();
        for &idx in strict_subset_positions.iter().rev() {
            let subset = subscriptions.remove(idx);
            log::info!(
                "coalescer: `{}` subsumed by new subscription `{filter}`, unsubscribing it from the cloud",
                subset.filter
            );
            if let Err(err) = self.manager.unsubscribe(&subset.filter).await {
                log::warn!("coalescer: cloud unsubscribe of subsumed `{}` failed: {err}", subset.filter);
            }
            reparented.extend(subset.subscribers);
        }

        let mut subscribers = vec![entry];
        subscribers.extend(reparented);
        subscriptions.push(CloudSubscription {
            filter,
            qos,
            subscribers,
        });
        Ok(handle)
    }

    /// Removes a subscriber; if its cloud subscription's subscriber set
    /// becomes empty, issues a cloud unsubscribe (§4.E `unsubscribe`, §3
    /// I4).
    ///
    /// # Errors
    /// `ResourceNotFound` if `handle` does not name a currently registered
    /// subscriber.
    pub async fn unsubscribe(&self, handle: CloudSubscriberHandle) -> Result<(), Error> {
        let mut subscriptions = self.subscriptions.write().await;
        let mut emptied_at = None;
        let mut found = false;
        for (idx, sub) in subscriptions.iter_mut().enumerate() {
            let before = sub.subscribers.len();
            sub.subscribers.retain(|s| s.id != handle);
            if sub.subscribers.len() != before {
                found = true;
                if sub.subscribers.is_empty() {
                    emptied_at = Some(idx);
                }
                break;
            }
        }
        if !found {
            return Err(Error::new(
                crate::error::ErrorKind::ResourceNotFound,
                "no cloud subscriber registered for this handle",
            ));
        }
        if let Some(idx) = emptied_at {
            let sub = subscriptions.remove(idx);
            if let Err(err) = self.manager.unsubscribe(&sub.filter).await {
                log::warn!("coalescer: cloud unsubscribe of `{}` failed: {err}", sub.filter);
            }
        }
        Ok(())
    }

    /// Fans an incoming cloud message out to every matching local
    /// subscriber, filtered by `receive_mode` (§4.E "Fan-out"). Dispatch
    /// goes through the ordered executor keyed by the message's concrete
    /// topic so per-topic delivery order is preserved; a panicking callback
    /// is isolated and does not block delivery to others.
    pub async fn dispatch_incoming(&self, message: IncomingMessage, source: &str) {
        let targets: Vec<Arc<dyn CloudSubscriber>> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|s| s.filter.matches(&message.topic))
                .flat_map(|s| s.subscribers.iter())
                .filter(|entry| match entry.mode {
                    ReceiveMode::All => true,
                    ReceiveMode::FromOthers => entry.source != source,
                })
                .map(|entry| entry.callback.clone())
                .collect()
        };

        let key = message.topic.as_str().to_owned();
        let message = Arc::new(message);
        self.executor
            .dispatch(&key, async move {
                for target in targets {
                    let msg = message.clone();
                    let fut = async move { target.on_message(&msg).await };
                    if std::panic::AssertUnwindSafe(fut)
                        .catch_unwind()
                        .await
                        .is_err()
                    {
                        log::error!("coalescer: subscriber callback panicked, isolating it");
                    }
                }
            })
            .await;
    }

    /// Distinct cloud subscription count (§8 property 6), for tests.
    pub async fn cloud_subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// The filter currently covering `topic`, if any, for tests.
    pub async fn covering_filter(&self, topic: &str) -> Option<String> {
        let topic = Topic::parse_filter(topic).ok()?;
        let subscriptions = self.subscriptions.read().await;
        subscriptions
            .iter()
            .find(|s| s.filter.is_superset(&topic) || s.filter == topic)
            .map(|s| s.filter.as_str().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::ConnectionManagerConfig;
    use crate::transport::{AckOutcome, CloudTransport, ConnectOutcome};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    struct StubTransport {
        subscribe_calls: AtomicUsize,
        unsubscribe_calls: AtomicUsize,
    }

    #[async_trait]
    impl CloudTransport for StubTransport {
        async fn connect(&self) -> Result<ConnectOutcome, Error> {
            Ok(ConnectOutcome { session_present: true })
        }
        async fn subscribe(&self, _f: &Topic, _q: QoS) -> Result<AckOutcome, Error> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            Ok(AckOutcome::Success)
        }
        async fn unsubscribe(&self, _f: &Topic) -> Result<(), Error> {
            self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn publish(&self, _t: &Topic, _p: &[u8], _q: QoS, _r: bool) -> Result<AckOutcome, Error> {
            Ok(AckOutcome::Success)
        }
        async fn disconnect(&self) {}
        async fn try_recv(&self) -> Option<IncomingMessage> {
            None
        }
    }

    struct Recorder(AsyncMutex<Vec<Vec<u8>>>);

    #[async_trait]
    impl CloudSubscriber for Recorder {
        async fn on_message(&self, message: &IncomingMessage) {
            self.0.lock().await.push(message.payload.clone());
        }
    }

    async fn test_manager() -> (Arc<ConnectionManager>, Arc<StubTransport>) {
        let transport = Arc::new(StubTransport {
            subscribe_calls: AtomicUsize::new(0),
            unsubscribe_calls: AtomicUsize::new(0),
        });
        let transport_dyn = transport.clone();
        let manager = Arc::new(ConnectionManager::new(
            ConnectionManagerConfig::default(),
            Arc::new(move |_id: u64| transport_dyn.clone() as Arc<dyn CloudTransport>),
        ));
        (manager, transport)
    }

    fn msg(topic: &str, payload: &[u8]) -> IncomingMessage {
        IncomingMessage {
            topic: Topic::parse_publish(topic).unwrap(),
            payload: payload.to_vec(),
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    #[tokio::test]
    async fn subset_subscribe_coalesces_scenario_s1() {
        let (manager, transport) = test_manager().await;
        let executor = Arc::new(OrderedExecutor::new(16));
        let coalescer = Coalescer::new(manager, executor);

        let wide = coalescer
            .subscribe(
                "a/b/+",
                QoS::AtLeastOnce,
                "comp",
                ReceiveMode::All,
                Arc::new(Recorder(AsyncMutex::new(Vec::new()))),
            )
            .await
            .unwrap();
        let narrow = coalescer
            .subscribe(
                "a/b/c",
                QoS::AtLeastOnce,
                "comp",
                ReceiveMode::All,
                Arc::new(Recorder(AsyncMutex::new(Vec::new()))),
            )
            .await
            .unwrap();

        assert_eq!(transport.subscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.cloud_subscription_count().await, 1);

        coalescer.unsubscribe(wide).await.unwrap();
        assert_eq!(transport.unsubscribe_calls.load(Ordering::SeqCst), 0);
        assert_eq!(coalescer.cloud_subscription_count().await, 1);

        coalescer.unsubscribe(narrow).await.unwrap();
        assert_eq!(transport.unsubscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.cloud_subscription_count().await, 0);
    }

    #[tokio::test]
    async fn superset_subscribe_absorbs_existing_subset() {
        let (manager, transport) = test_manager().await;
        let executor = Arc::new(OrderedExecutor::new(16));
        let coalescer = Coalescer::new(manager, executor);

        coalescer
            .subscribe(
                "a/b/c",
                QoS::AtLeastOnce,
                "comp",
                ReceiveMode::All,
                Arc::new(Recorder(AsyncMutex::new(Vec::new()))),
            )
            .await
            .unwrap();
        coalescer
            .subscribe(
                "a/b/+",
                QoS::AtLeastOnce,
                "comp",
                ReceiveMode::All,
                Arc::new(Recorder(AsyncMutex::new(Vec::new()))),
            )
            .await
            .unwrap();

        assert_eq!(transport.subscribe_calls.load(Ordering::SeqCst), 2);
        assert_eq!(transport.unsubscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.cloud_subscription_count().await, 1);
        assert_eq!(
            coalescer.covering_filter("a/b/c").await.as_deref(),
            Some("a/b/+")
        );
    }

    #[tokio::test]
    async fn unsubscribing_an_unknown_handle_is_resource_not_found() {
        let (manager, _transport) = test_manager().await;
        let executor = Arc::new(OrderedExecutor::new(16));
        let coalescer = Coalescer::new(manager, executor);
        let handle = coalescer
            .subscribe(
                "a/b",
                QoS::AtLeastOnce,
                "comp",
                ReceiveMode::All,
                Arc::new(Recorder(AsyncMutex::new(Vec::new()))),
            )
            .await
            .unwrap();
        coalescer.unsubscribe(handle).await.unwrap();
        let err = coalescer.unsubscribe(handle).await.unwrap_err();
        assert_eq!(*err.kind(), crate::error::ErrorKind::ResourceNotFound);
    }

    #[tokio::test]
    async fn fan_out_respects_receive_mode() {
        let (manager, _transport) = test_manager().await;
        let executor = Arc::new(OrderedExecutor::new(16));
        let coalescer = Coalescer::new(manager, executor);

        let mine = Arc::new(Recorder(AsyncMutex::new(Vec::new())));
        let others = Arc::new(Recorder(AsyncMutex::new(Vec::new())));
        coalescer
            .subscribe("t", QoS::AtLeastOnce, "me", ReceiveMode::All, mine.clone())
            .await
            .unwrap();
        coalescer
            .subscribe("t", QoS::AtLeastOnce, "me", ReceiveMode::FromOthers, others.clone())
            .await
            .unwrap();

        coalescer.dispatch_incoming(msg("t", b"x"), "me").await;
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        assert_eq!(mine.0.lock().await.len(), 1);
        assert_eq!(others.0.lock().await.len(), 0);
    }
}
