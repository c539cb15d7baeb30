// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! The outbound spooler (§4.B): an ordered, byte-bounded queue of publishes
//! awaiting cloud acknowledgement, split into a QoS0 and a QoS1+ FIFO.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use crate::error::{Error, ErrorKind};
use crate::topic::Topic;
use crate::transport::QoS;

/// Fixed per-record framing overhead folded into `size_bytes` (§3).
const FRAMING_OVERHEAD_BYTES: u64 = 16;

/// Where spool records live. `Memory` is this crate's only built-in backend;
/// a `Persistent` backend is an external collaborator wired in through
/// [`SpoolStore`] (§6 "Persisted state").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StorageType {
    Memory,
    Persistent,
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Memory
    }
}

/// Spooler-wide configuration (§3 `SpoolerConfig`).
#[derive(Debug, Clone)]
pub struct SpoolerConfig {
    pub keep_qos0_when_offline: bool,
    pub max_retries: u32,
    pub max_bytes: u64,
    pub storage: StorageType,
}

impl Default for SpoolerConfig {
    fn default() -> Self {
        SpoolerConfig {
            keep_qos0_when_offline: true,
            max_retries: 3,
            max_bytes: 10 * 1024 * 1024,
            storage: StorageType::Memory,
        }
    }
}

/// A single outbound publish awaiting delivery (§3 `PublishRecord`).
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub id: u64,
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub attempts: u32,
    pub enqueued_at: Instant,
    pub size_bytes: u64,
}

impl PublishRecord {
    fn size_of(topic: &Topic, payload: &[u8]) -> u64 {
        topic.as_str().len() as u64 + payload.len() as u64 + FRAMING_OVERHEAD_BYTES
    }
}

/// Durable-storage collaborator for spool records, keyed by id. The shipped
/// [`MemoryStore`] is a no-op; a `PERSISTENT`-backed implementation is an
/// external collaborator (§6).
pub trait SpoolStore: Send + Sync {
    fn persist(&self, record: &PublishRecord);
    fn forget(&self, id: u64);
    /// Reloads records in ascending id order without re-validating topic
    /// rules (§9 "Durable spool").
    fn recover(&self) -> Vec<PublishRecord>;
}

/// The default, non-durable store: `admit`/`remove` are purely in-memory.
#[derive(Debug, Default)]
pub struct MemoryStore;

impl SpoolStore for MemoryStore {
    fn persist(&self, _record: &PublishRecord) {}
    fn forget(&self, _id: u64) {}
    fn recover(&self) -> Vec<PublishRecord> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
struct Queue {
    order: VecDeque<u64>,
    records: HashMap<u64, PublishRecord>,
}

impl Queue {
    fn push_back(&mut self, record: PublishRecord) {
        self.order.push_back(record.id);
        self.records.insert(record.id, record);
    }

    fn push_front(&mut self, id: u64) {
        self.order.push_front(id);
    }

    fn peek_front_id(&self) -> Option<u64> {
        self.order.front().copied()
    }

    fn remove(&mut self, id: u64) -> Option<PublishRecord> {
        if let Some(pos) = self.order.iter().position(|x| *x == id) {
            self.order.remove(pos);
        }
        self.records.remove(&id)
    }

    fn pop_oldest(&mut self) -> Option<PublishRecord> {
        let id = self.order.pop_front()?;
        self.records.remove(&id)
    }

    fn total_bytes(&self) -> u64 {
        self.records.values().map(|r| r.size_bytes).sum()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

struct Inner {
    next_id: u64,
    qos0: Queue,
    qos1: Queue,
    closed: bool,
}

/// The ordered, byte-bounded outbound queue (§4.B).
///
/// A single mutex guards both queues and the byte counter (§5 "Shared
/// mutable state"); a [`Notify`] wakes `pop_next_id` waiters on admission,
/// requeue or close.
pub struct Spooler {
    config: SpoolerConfig,
    inner: Mutex<Inner>,
    store: Box<dyn SpoolStore>,
    notify: Notify,
}

impl Spooler {
    #[must_use]
    pub fn new(config: SpoolerConfig) -> Self {
        Self::with_store(config, Box::new(MemoryStore))
    }

    #[must_use]
    pub fn with_store(config: SpoolerConfig, store: Box<dyn SpoolStore>) -> Self {
        let recovered = store.recover();
        let mut inner = Inner {
            next_id: 0,
            qos0: Queue::default(),
            qos1: Queue::default(),
            closed: false,
        };
        for record in recovered {
            inner.next_id = inner.next_id.max(record.id + 1);
            if record.qos == QoS::AtMostOnce {
                inner.qos0.push_back(record);
            } else {
                inner.qos1.push_back(record);
            }
        }
        Spooler {
            config,
            inner: Mutex::new(inner),
            store,
            notify: Notify::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SpoolerConfig {
        &self.config
    }

    /// Admits a new publish, assigning it a monotonically increasing id
    /// (§4.B `admit`).
    ///
    /// Returns `Ok(None)` when a QoS0 record was silently dropped by policy
    /// because the byte budget could not be freed for it (§4.B "a QoS0
    /// incoming may be dropped by policy") — this is not an error.
    ///
    /// # Errors
    /// `Closed` if the spooler has been closed. `TooLarge` if the record
    /// alone exceeds the budget. `Full` if the byte budget cannot be freed
    /// for a QoS >= 1 record even after evicting lower priority entries.
    pub async fn admit(
        &self,
        topic: Topic,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<Option<u64>, Error> {
        let size_bytes = PublishRecord::size_of(&topic, &payload);
        if size_bytes > self.config.max_bytes {
            return Err(Error::new(
                ErrorKind::TooLarge,
                "record alone exceeds the spool byte budget",
            ));
        }

        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(Error::closed());
        }

        self.make_room(&mut inner, size_bytes, qos);

        if inner.qos0.total_bytes() + inner.qos1.total_bytes() + size_bytes > self.config.max_bytes
        {
            if qos == QoS::AtMostOnce {
                log::debug!("spooler: dropping QoS0 publish, budget exhausted");
                return Ok(None);
            }
            return Err(Error::new(ErrorKind::Full, "spool byte budget exhausted"));
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let record = PublishRecord {
            id,
            topic,
            payload,
            qos,
            retain,
            attempts: 0,
            enqueued_at: Instant::now(),
            size_bytes,
        };
        self.store.persist(&record);
        if qos == QoS::AtMostOnce {
            inner.qos0.push_back(record);
        } else {
            inner.qos1.push_back(record);
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(Some(id))
    }

    /// Evicts the oldest lowest-QoS records until `incoming_size` would fit,
    /// preferring to sacrifice QoS0 before ever touching QoS1+ (§4.B
    /// "Eviction policy").
    fn make_room(&self, inner: &mut Inner, incoming_size: u64, incoming_qos: QoS) {
        while inner.qos0.total_bytes() + inner.qos1.total_bytes() + incoming_size
            > self.config.max_bytes
        {
            if !inner.qos0.is_empty() {
                if let Some(evicted) = inner.qos0.pop_oldest() {
                    log::debug!("spooler: evicted QoS0 record id={}", evicted.id);
                    self.store.forget(evicted.id);
                }
                continue;
            }
            if incoming_qos == QoS::AtMostOnce {
                // Never evict QoS1+ to make room for an incoming QoS0.
                break;
            }
            if !inner.qos1.is_empty() {
                if let Some(evicted) = inner.qos1.pop_oldest() {
                    log::debug!("spooler: evicted QoS1+ record id={}", evicted.id);
                    self.store.forget(evicted.id);
                }
                continue;
            }
            break;
        }
    }

    /// Blocks until an id is ready, returning the smallest available id
    /// across both queues (§4.B `pop_next_id`).
    ///
    /// # Errors
    /// `Closed` once the spooler has been closed and drained.
    pub async fn pop_next_id(&self) -> Result<u64, Error> {
        loop {
            {
                let inner = self.inner.lock().await;
                if let Some(id) = Self::select_next(&inner) {
                    return Ok(id);
                }
                if inner.closed {
                    return Err(Error::closed());
                }
            }
            self.notify.notified().await;
        }
    }

    fn select_next(inner: &Inner) -> Option<u64> {
        match (inner.qos0.peek_front_id(), inner.qos1.peek_front_id()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Peeks a record without removing it (§4.B `get`).
    pub async fn get(&self, id: u64) -> Option<PublishRecord> {
        let inner = self.inner.lock().await;
        inner
            .qos0
            .records
            .get(&id)
            .or_else(|| inner.qos1.records.get(&id))
            .cloned()
    }

    /// Releases an id after a successful delivery or a terminal failure.
    /// Idempotent (§4.B, §8 property 7).
    pub async fn remove(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        if inner.qos0.remove(id).is_none() {
            inner.qos1.remove(id);
        }
        self.store.forget(id);
    }

    /// Returns an id to the front of its queue and bumps `attempts`
    /// (§4.B `requeue`).
    ///
    /// Returns `None` if the id is no longer present (already removed).
    pub async fn requeue(&self, id: u64) -> Option<u32> {
        let mut inner = self.inner.lock().await;
        let queue = if inner.qos0.records.contains_key(&id) {
            &mut inner.qos0
        } else if inner.qos1.records.contains_key(&id) {
            &mut inner.qos1
        } else {
            return None;
        };
        let attempts = {
            let record = queue.records.get_mut(&id)?;
            record.attempts += 1;
            record.attempts
        };
        queue.push_front(id);
        drop(inner);
        self.notify.notify_waiters();
        Some(attempts)
    }

    /// Removes every QoS0 record when a link transitions to interrupted and
    /// `keep_qos0_when_offline == false` (§4.B, §4.F "Connectivity
    /// transitions"). Returns the ids dropped so the pipeline can fail their
    /// pending futures.
    pub async fn drop_qos0_on_disconnect(&self) -> Vec<u64> {
        if self.config.keep_qos0_when_offline {
            return Vec::new();
        }
        let mut inner = self.inner.lock().await;
        let mut dropped = Vec::new();
        while let Some(record) = inner.qos0.pop_oldest() {
            self.store.forget(record.id);
            dropped.push(record.id);
        }
        dropped
    }

    /// Closes the spooler: further `admit` calls fail and any blocked
    /// `pop_next_id` waiters observe `Closed`.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Current total bytes held across both queues (for tests and metrics).
    pub async fn total_bytes(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.qos0.total_bytes() + inner.qos1.total_bytes()
    }

    /// Queue depths `(qos0, qos1_plus)`, for tests.
    pub async fn depths(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.qos0.order.len(), inner.qos1.order.len())
    }
}

/// How long a pump should wait for an ack before treating the operation as
/// timed out, matching the configured MQTT operation timeout (§5
/// "Cancellation").
#[must_use]
pub const fn default_operation_timeout() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_bytes: u64) -> SpoolerConfig {
        SpoolerConfig {
            keep_qos0_when_offline: true,
            max_retries: 3,
            max_bytes,
            storage: StorageType::Memory,
        }
    }

    fn topic(s: &str) -> Topic {
        Topic::parse_publish(s).unwrap()
    }

    async fn admit_ok(spooler: &Spooler, t: &str, payload: Vec<u8>, qos: QoS) -> u64 {
        spooler
            .admit(topic(t), payload, qos, false)
            .await
            .unwrap()
            .expect("record should have been admitted, not dropped by policy")
    }

    #[tokio::test]
    async fn admits_in_fifo_order_within_qos_class() {
        let spooler = Spooler::new(cfg(10_000));
        let mut ids = Vec::new();
        for i in 0..5 {
            let id = admit_ok(&spooler, "a/b", vec![i], QoS::AtLeastOnce).await;
            ids.push(id);
        }
        for expected in &ids {
            let popped = spooler.pop_next_id().await.unwrap();
            assert_eq!(popped, *expected);
            spooler.remove(popped).await;
        }
    }

    #[tokio::test]
    async fn pop_next_id_chooses_lower_id_across_queues() {
        let spooler = Spooler::new(cfg(10_000));
        let q1_id = admit_ok(&spooler, "a", vec![1], QoS::AtLeastOnce).await;
        let q0_id = admit_ok(&spooler, "a", vec![1], QoS::AtMostOnce).await;
        assert!(q0_id > q1_id);
        let popped = spooler.pop_next_id().await.unwrap();
        assert_eq!(popped, q1_id);
    }

    #[tokio::test]
    async fn budget_eviction_scenario_s3() {
        // S3: max_bytes = 25, framing overhead 16 bytes/topic "a" (1 byte) ->
        // payload budget per record is tight; use tiny topic/payload sizes
        // and a budget sized for this test's framing arithmetic.
        let size = PublishRecord::size_of(&topic("a"), &[0_u8; 10]);
        let spooler = Spooler::new(cfg(size + 2));

        let qos1_a = admit_ok(&spooler, "a", vec![0_u8; 10], QoS::AtLeastOnce).await;
        let _qos0 = admit_ok(&spooler, "a", vec![0_u8; 10], QoS::AtMostOnce).await;
        assert_eq!(spooler.depths().await, (1, 1));

        let qos1_b = admit_ok(&spooler, "a", vec![0_u8; 10], QoS::AtLeastOnce).await;
        let (qos0_depth, qos1_depth) = spooler.depths().await;
        assert_eq!(qos0_depth, 0, "QoS0 must be evicted to make room");
        assert_eq!(qos1_depth, 2);
        assert!(spooler.get(qos1_a).await.is_some());
        assert!(spooler.get(qos1_b).await.is_some());
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let spooler = Spooler::new(cfg(10_000));
        let id = admit_ok(&spooler, "a", vec![1], QoS::AtLeastOnce).await;
        spooler.remove(id).await;
        spooler.remove(id).await;
        assert!(spooler.get(id).await.is_none());
    }

    #[tokio::test]
    async fn requeue_increments_attempts_and_returns_to_front() {
        let spooler = Spooler::new(cfg(10_000));
        let first = admit_ok(&spooler, "a", vec![1], QoS::AtLeastOnce).await;
        let second = admit_ok(&spooler, "a", vec![2], QoS::AtLeastOnce).await;
        let popped = spooler.pop_next_id().await.unwrap();
        assert_eq!(popped, first);
        let attempts = spooler.requeue(popped).await.unwrap();
        assert_eq!(attempts, 1);
        let popped_again = spooler.pop_next_id().await.unwrap();
        assert_eq!(popped_again, first);
        spooler.remove(first).await;
        let next = spooler.pop_next_id().await.unwrap();
        assert_eq!(next, second);
    }

    #[tokio::test]
    async fn drop_qos0_on_disconnect_respects_policy() {
        let mut config = cfg(10_000);
        config.keep_qos0_when_offline = false;
        let spooler = Spooler::new(config);
        let qos0 = admit_ok(&spooler, "a", vec![1], QoS::AtMostOnce).await;
        let qos1 = admit_ok(&spooler, "a", vec![1], QoS::AtLeastOnce).await;
        let dropped = spooler.drop_qos0_on_disconnect().await;
        assert_eq!(dropped, vec![qos0]);
        assert!(spooler.get(qos1).await.is_some());
    }

    #[tokio::test]
    async fn close_unblocks_pop_next_id_waiters() {
        let spooler = std::sync::Arc::new(Spooler::new(cfg(10_000)));
        let waiter = {
            let spooler = spooler.clone();
            tokio::spawn(async move { spooler.pop_next_id().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        spooler.close().await;
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(e) if *e.kind() == ErrorKind::Closed));
    }
}
