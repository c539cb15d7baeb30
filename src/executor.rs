// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! The ordered per-topic executor (§4.G, §5 "Ordered executor").
//!
//! Guarantees that handlers for the same topic key never run concurrently
//! and always run in enqueue order, while distinct topic keys dispatch in
//! parallel. Each topic key gets its own lazily spawned worker task reading
//! off a bounded FIFO; when the FIFO is full, `dispatch` suspends (the
//! "backpressure" suspension point of §5).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct Worker {
    sender: mpsc::Sender<Job>,
    handle: JoinHandle<()>,
}

/// A bounded, per-key ordered dispatcher.
///
/// `per_topic_capacity` bounds each topic's FIFO depth; a topic with no
/// in-flight or queued jobs holds no worker task.
pub struct OrderedExecutor {
    workers: StdMutex<HashMap<String, Worker>>,
    per_topic_capacity: usize,
}

impl OrderedExecutor {
    #[must_use]
    pub fn new(per_topic_capacity: usize) -> Self {
        OrderedExecutor {
            workers: StdMutex::new(HashMap::new()),
            per_topic_capacity: per_topic_capacity.max(1),
        }
    }

    /// Enqueues `job` to run after every job already queued for `key`.
    ///
    /// Suspends the caller if `key`'s FIFO is at capacity. A job that panics
    /// is caught by `tokio`'s task boundary and does not poison the worker;
    /// the next queued job still runs.
    pub async fn dispatch<F>(&self, key: &str, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender_for(key);
        let boxed: Job = Box::new(move || Box::pin(job));
        if sender.send(boxed).await.is_err() {
            log::warn!("ordered executor: worker for topic `{key}` is gone, dropping job");
        }
    }

    fn sender_for(&self, key: &str) -> mpsc::Sender<Job> {
        let mut workers = self.workers.lock().expect("executor lock poisoned");
        if let Some(worker) = workers.get(key) {
            return worker.sender.clone();
        }
        let (tx, mut rx) = mpsc::channel::<Job>(self.per_topic_capacity);
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let fut = job();
                if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                    log::error!("ordered executor: job panicked, continuing with the next one");
                }
            }
        });
        workers.insert(key.to_owned(), Worker { sender: tx.clone(), handle });
        tx
    }

    /// Aborts every per-topic worker and drops their queues. Used during
    /// scoped shutdown (§5 "Resource scoping").
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock().expect("executor lock poisoned");
        for (_, worker) in workers.drain() {
            worker.handle.abort();
        }
    }

    /// Number of topic keys currently holding a worker, for tests.
    #[must_use]
    pub fn active_topics(&self) -> usize {
        self.workers.lock().expect("executor lock poisoned").len()
    }
}

impl Drop for OrderedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
