// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! The local in-process pub/sub bus (§4.G).
//!
//! An independent fan-out surface from the cloud-facing coalescer (§4.E),
//! built on the same [`crate::topic`] matching primitives and dispatched
//! through the same [`crate::executor::OrderedExecutor`] shape, so ordering
//! guarantees (b) of §5 hold without a second implementation of "ordered
//! per-key delivery".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::RwLock;

use crate::error::{Error, ErrorKind};
use crate::executor::OrderedExecutor;
use crate::topic::Topic;

/// Whether a subscriber wants its own publishes echoed back (§3
/// `SubscriberHandle.receive_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    All,
    FromOthers,
}

/// A message delivered on the local bus.
#[derive(Debug, Clone)]
pub struct LocalMessage {
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub source: String,
}

/// A registered local consumer. Implementors should be cheap to invoke;
/// long work should hand off rather than block the per-topic worker.
#[async_trait]
pub trait LocalSubscriber: Send + Sync {
    async fn on_message(&self, message: &LocalMessage);
}

/// A stable identity handed back from `subscribe`, used to unsubscribe
/// (§9 "Callback identity": handles replace method-reference equality).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

struct Entry {
    id: SubscriberId,
    filter: Topic,
    source: String,
    mode: ReceiveMode,
    callback: Arc<dyn LocalSubscriber>,
}

/// The in-process topic bus (§4.G).
pub struct LocalBus {
    subscribers: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
    executor: Arc<OrderedExecutor>,
}

impl LocalBus {
    #[must_use]
    pub fn new(executor: Arc<OrderedExecutor>) -> Self {
        LocalBus {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
            executor,
        }
    }

    /// Registers a local consumer on `filter` (wildcards permitted).
    ///
    /// # Errors
    /// `InvalidArguments` if `filter` fails subscription-topic validation.
    pub async fn subscribe(
        &self,
        filter: &str,
        source: &str,
        mode: ReceiveMode,
        callback: Arc<dyn LocalSubscriber>,
    ) -> Result<SubscriberId, Error> {
        let filter = Topic::parse_filter(filter)?;
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().await.push(Entry {
            id,
            filter,
            source: source.to_owned(),
            mode,
            callback,
        });
        Ok(id)
    }

    /// Removes a previously registered subscriber.
    ///
    /// # Errors
    /// `ResourceNotFound` if `id` does not name a currently registered
    /// subscriber.
    pub async fn unsubscribe(&self, id: SubscriberId) -> Result<(), Error> {
        let mut subscribers = self.subscribers.write().await;
        let before = subscribers.len();
        subscribers.retain(|e| e.id != id);
        if subscribers.len() == before {
            return Err(Error::new(
                ErrorKind::ResourceNotFound,
                "no local subscriber registered for this id",
            ));
        }
        Ok(())
    }

    /// Publishes `payload` on `topic` from `source` (§4.G `publish`).
    ///
    /// Matching subscribers are resolved synchronously (so the delivery set
    /// is fixed to this call's point in time) and dispatched through the
    /// per-topic ordered executor, preserving publisher-to-subscriber order
    /// (§5 ordering guarantee (b)).
    ///
    /// # Errors
    /// `InvalidArguments` if `topic` is not a valid concrete publish topic.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, source: &str) -> Result<(), Error> {
        let topic = Topic::parse_publish(topic)?;
        let message = LocalMessage {
            topic: topic.clone(),
            payload,
            source: source.to_owned(),
        };

        let targets: Vec<Arc<dyn LocalSubscriber>> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .filter(|e| e.filter.matches(&topic))
                .filter(|e| match e.mode {
                    ReceiveMode::All => true,
                    ReceiveMode::FromOthers => e.source != message.source,
                })
                .map(|e| e.callback.clone())
                .collect()
        };

        let key = topic.as_str().to_owned();
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
                        log::error!("local bus: subscriber callback panicked, isolating it");
                    }
                }
            })
            .await;
        Ok(())
    }

    /// Current subscriber count, for tests.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
