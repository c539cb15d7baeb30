// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! The composition root (§9 "Global runtime singletons"): wires topic
//! matching, spooler, links, connection manager, coalescer, publish
//! pipeline and local bus into one explicitly constructed object, instead
//! of the source's process-singleton MQTT client.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::auth::{AuthCapability, Operation, Principal, Resource};
use crate::bus::{LocalBus, LocalSubscriber, ReceiveMode, SubscriberId};
use crate::coalescer::{Coalescer, CloudSubscriber, CloudSubscriberHandle};
use crate::config::Config;
use crate::connection_manager::{ConnectionManager, ConnectionManagerConfig, TransportFactory};
use crate::error::{Error, ErrorKind};
use crate::executor::OrderedExecutor;
use crate::pipeline::{PipelineConfig, PublishAck, PublishPipeline, PublishRequest};
use crate::spooler::Spooler;
use crate::transport::QoS;

/// The source component attributed to every cloud-delivered message, so
/// `FROM_OTHERS` subscribers (who can never *be* the cloud) always receive
/// them (§4.E "Fan-out").
const CLOUD_SOURCE: &str = "$cloud";

/// How often the demultiplexer polls links with nothing buffered, before
/// trying again (§5 "Link I/O": reads are demultiplexed through the
/// manager).
const DEMUX_IDLE_BACKOFF: Duration = Duration::from_millis(20);

/// Everything an embedder supplies at construction (§1, §9).
pub struct SessionOptions {
    pub config: Config,
    pub transport_factory: TransportFactory,
    pub auth: Arc<dyn AuthCapability>,
}

/// The explicitly constructed session object (§9 "Global runtime
/// singletons"): one logical cloud session plus the local bus, held by
/// handle rather than as process-global state.
pub struct Session {
    manager: Arc<ConnectionManager>,
    coalescer: Arc<Coalescer>,
    pipeline: Arc<PublishPipeline>,
    bus: Arc<LocalBus>,
    auth: Arc<dyn AuthCapability>,
    demux_handle: StdMutex<Option<JoinHandle<()>>>,
    cloud_executor: Arc<OrderedExecutor>,
    local_executor: Arc<OrderedExecutor>,
}

impl Session {
    #[must_use]
    pub fn new(options: SessionOptions) -> Arc<Self> {
        options.config.mqtt.validate().unwrap_or_else(|err| {
            log::warn!("session: invalid mqtt config, proceeding with defaults: {err}");
        });

        let spooler = Arc::new(Spooler::new((&options.config.spooler).into()));

        let manager_config = ConnectionManagerConfig::default();
        let manager = Arc::new(ConnectionManager::new(manager_config, options.transport_factory));

        let cloud_executor = Arc::new(OrderedExecutor::new(64));
        let local_executor = Arc::new(OrderedExecutor::new(64));

        let coalescer = Arc::new(Coalescer::new(manager.clone(), cloud_executor.clone()));
        let bus = Arc::new(LocalBus::new(local_executor.clone()));

        let pipeline_config = PipelineConfig {
            max_payload_bytes: options.config.mqtt.max_message_size_bytes,
        };
        let pipeline = PublishPipeline::new(pipeline_config, spooler, manager.clone());

        let session = Arc::new(Session {
            manager,
            coalescer,
            pipeline,
            bus,
            auth: options.auth,
            demux_handle: StdMutex::new(None),
            cloud_executor,
            local_executor,
        });
        session.clone().start_demultiplexer();
        session
    }

    fn start_demultiplexer(self: Arc<Self>) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let links = session.manager.links_snapshot().await;
                if links.is_empty() {
                    tokio::time::sleep(DEMUX_IDLE_BACKOFF).await;
                    continue;
                }
                let mut delivered_any = false;
                for link in &links {
                    while let Some(message) = link.poll_incoming().await {
                        delivered_any = true;
                        session.coalescer.dispatch_incoming(message, CLOUD_SOURCE).await;
                    }
                }
                if !delivered_any {
                    tokio::time::sleep(DEMUX_IDLE_BACKOFF).await;
                }
            }
        });
        *self.demux_handle.lock().expect("demux handle lock poisoned") = Some(handle);
    }

    async fn authorize(&self, principal: &Principal, operation: Operation, resource: &str) -> Result<(), Error> {
        if self.auth.check(principal, operation, &Resource(resource.to_owned())).await {
            Ok(())
        } else {
            Err(Error::new(ErrorKind::Unauthorized, "operation denied"))
        }
    }

    /// `publish_to_iot_core` (§6): authorize, then hand off to the publish
    /// pipeline.
    ///
    /// # Errors
    /// `Unauthorized` on a denied principal; otherwise whatever
    /// [`PublishPipeline::publish`] returns.
    pub async fn publish_to_iot_core(
        &self,
        principal: &Principal,
        request: PublishRequest,
    ) -> Result<PublishAck, Error> {
        self.authorize(principal, Operation::PublishToIotCore, &request.topic).await?;
        self.pipeline.publish(request).await
    }

    /// `subscribe_to_iot_core` (§6): authorize, then register with the
    /// coalescer.
    ///
    /// # Errors
    /// `Unauthorized` on a denied principal; otherwise whatever
    /// [`Coalescer::subscribe`] returns.
    pub async fn subscribe_to_iot_core(
        &self,
        principal: &Principal,
        filter: &str,
        qos: QoS,
        source: &str,
        callback: Arc<dyn CloudSubscriber>,
    ) -> Result<CloudSubscriberHandle, Error> {
        self.authorize(principal, Operation::SubscribeToIotCore, filter).await?;
        self.coalescer
            .subscribe(filter, qos, source, ReceiveMode::All, callback)
            .await
    }

    /// Removes a cloud subscriber registered through
    /// [`Session::subscribe_to_iot_core`].
    ///
    /// # Errors
    /// `ResourceNotFound` if `handle` is not currently registered.
    pub async fn unsubscribe_from_iot_core(&self, handle: CloudSubscriberHandle) -> Result<(), Error> {
        self.coalescer.unsubscribe(handle).await
    }

    /// `publish_to_topic` (§6): authorize, then publish on the local bus.
    ///
    /// # Errors
    /// `Unauthorized` on a denied principal; otherwise whatever
    /// [`LocalBus::publish`] returns.
    pub async fn publish_to_topic(
        &self,
        principal: &Principal,
        topic: &str,
        payload: Vec<u8>,
        source: &str,
    ) -> Result<(), Error> {
        self.authorize(principal, Operation::PublishToTopic, topic).await?;
        self.bus.publish(topic, payload, source).await
    }

    /// `subscribe_to_topic` (§6): authorize, then register on the local
    /// bus.
    ///
    /// # Errors
    /// `Unauthorized` on a denied principal; otherwise whatever
    /// [`LocalBus::subscribe`] returns.
    pub async fn subscribe_to_topic(
        &self,
        principal: &Principal,
        filter: &str,
        source: &str,
        mode: ReceiveMode,
        callback: Arc<dyn LocalSubscriber>,
    ) -> Result<SubscriberId, Error> {
        self.authorize(principal, Operation::SubscribeToTopic, filter).await?;
        self.bus.subscribe(filter, source, mode, callback).await
    }

    /// Removes a local subscriber registered through
    /// [`Session::subscribe_to_topic`].
    ///
    /// # Errors
    /// `ResourceNotFound` if `id` is not currently registered.
    pub async fn unsubscribe_from_topic(&self, id: SubscriberId) -> Result<(), Error> {
        self.bus.unsubscribe(id).await
    }

    /// Forwards a configuration-change notification to the connection
    /// manager (§4.D, §4.I).
    pub async fn configuration_changed(&self, change: crate::config::ConfigChange) {
        self.manager.configuration_changed(&change).await;
    }

    /// Notifies the pipeline that a link was interrupted, so QoS0 records
    /// can be dropped per policy (§4.F step 4). An embedder observing link
    /// state transitions through its own transport calls this.
    pub async fn notify_link_interrupted(&self) {
        self.pipeline.handle_link_interrupted().await;
    }

    /// Orderly shutdown (§5 "Resource scoping"): stop the demultiplexer,
    /// drain the publish pipeline, drain both ordered executors, then close
    /// every link.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.demux_handle.lock().expect("demux handle lock poisoned").take() {
            handle.abort();
        }
        self.pipeline.shutdown().await;
        self.cloud_executor.shutdown();
        self.local_executor.shutdown();
        self.manager.close_all().await;
    }
}
