// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! The publish pipeline (§4.F): validates publishes, spools them, and a
//! single pump task drains the spool onto links selected through the
//! connection manager, retrying up to a capped attempt count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::connection_manager::ConnectionManager;
use crate::error::{Error, ErrorKind};
use crate::spooler::Spooler;
use crate::topic::Topic;
use crate::transport::QoS;

/// An outbound publish request at the IPC boundary (§6
/// `publish_to_iot_core`).
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Resolves once the pump has either confirmed delivery or exhausted
/// retries (§9 "Futures + callbacks interplay").
pub struct PublishAck {
    receiver: oneshot::Receiver<Result<(), Error>>,
}

impl std::future::Future for PublishAck {
    type Output = Result<(), Error>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        match std::pin::Pin::new(&mut self.receiver).poll(cx) {
            std::task::Poll::Ready(Ok(result)) => std::task::Poll::Ready(result),
            std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Err(Error::closed())),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

/// Validation limits applied before spool admission (§4.F step 1, §6 "Topic
/// limits").
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_payload_bytes: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_payload_bytes: 128 * 1024,
        }
    }
}

/// Validates, spools and pumps outbound publishes to the cloud (§4.F).
pub struct PublishPipeline {
    config: PipelineConfig,
    spooler: Arc<Spooler>,
    manager: Arc<ConnectionManager>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<(), Error>>>>>,
    pump_handle: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PublishPipeline {
    #[must_use]
    pub fn new(config: PipelineConfig, spooler: Arc<Spooler>, manager: Arc<ConnectionManager>) -> Arc<Self> {
        let pipeline = Arc::new(PublishPipeline {
            config,
            spooler,
            manager,
            pending: Arc::new(Mutex::new(HashMap::new())),
            pump_handle: StdMutex::new(None),
            closed: AtomicBool::new(false),
        });
        pipeline.clone().start_pump();
        pipeline
    }

    fn start_pump(self: Arc<Self>) {
        let worker = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let id = match worker.spooler.pop_next_id().await {
                    Ok(id) => id,
                    Err(_) => {
                        log::info!("publish pipeline: pump exiting, spooler closed");
                        return;
                    }
                };
                worker.pump_one(id).await;
            }
        });
        *self.pump_handle.lock().expect("pump handle lock poisoned") = Some(handle);
    }

    async fn pump_one(&self, id: u64) {
        let Some(record) = self.spooler.get(id).await else {
            return;
        };

        let result = self
            .manager
            .publish(&record.topic, &record.payload, record.qos, record.retain)
            .await;

        match result {
            Ok(()) => {
                self.spooler.remove(id).await;
                self.complete(id, Ok(()));
            }
            Err(err) if *err.kind() == ErrorKind::Retryable => {
                if record.attempts >= self.spooler.config().max_retries {
                    log::warn!("publish pipeline: id={id} exhausted retries, dropping");
                    self.spooler.remove(id).await;
                    self.complete(id, Err(Error::non_retryable(err.reason().unwrap_or(
                        crate::transport::ReasonCode::ImplementationSpecificError,
                    ))));
                } else {
                    self.spooler.requeue(id).await;
                }
            }
            Err(err) => {
                self.spooler.remove(id).await;
                self.complete(id, Err(err));
            }
        }
    }

    fn complete(&self, id: u64, result: Result<(), Error>) {
        let pending = self.pending.clone();
        tokio::spawn(async move {
            if let Some(sender) = pending.lock().await.remove(&id) {
                let _ = sender.send(result);
            }
        });
    }

    /// Validates, admits to the spooler, and returns a future resolved when
    /// the pump completes delivery (§4.F steps 1-2).
    ///
    /// # Errors
    /// `InvalidArguments`/`TooLarge` on a failed validation; `Full` if the
    /// spooler has no room for a QoS >= 1 record; `Offline` if a QoS0
    /// publish was dropped by policy while offline; `Closed` once shut down.
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishAck, Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed());
        }

        if request.payload.len() as u64 > self.config.max_payload_bytes {
            return Err(Error::new(ErrorKind::TooLarge, "payload exceeds configured max size"));
        }

        let topic = Topic::parse_publish(&request.topic)?;

        let admitted = self
            .spooler
            .admit(topic, request.payload, request.qos, request.retain)
            .await?;

        let Some(id) = admitted else {
            return Err(Error::new(
                ErrorKind::Offline,
                "QoS0 publish dropped: offline and keep_qos0_when_offline is false",
            ));
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        Ok(PublishAck { receiver: rx })
    }

    /// Drops every spooled QoS0 record and fails their pending futures with
    /// `Offline` (§4.F step 4, triggered when a link transitions to
    /// `INTERRUPTED` and `keep_qos0_when_offline == false`).
    pub async fn handle_link_interrupted(&self) {
        let dropped = self.spooler.drop_qos0_on_disconnect().await;
        for id in dropped {
            self.complete(id, Err(Error::new(ErrorKind::Offline, "link interrupted, QoS0 record dropped")));
        }
    }

    /// Closes the pipeline: stops the pump, closes the spooler, and fails
    /// every still-pending future with `Closed` (§5 "Cancellation").
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.spooler.close().await;
        if let Some(handle) = self.pump_handle.lock().expect("pump handle lock poisoned").take() {
            handle.abort();
        }
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(Error::closed()));
        }
    }

    /// Number of futures still awaiting a pump outcome, for tests.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}
