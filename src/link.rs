// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! A single MQTT connection to the cloud, i.e. one "link" in the pool a
//! [`crate::connection_manager::ConnectionManager`] owns (§4.C).
//!
//! A link owns exactly one [`CloudTransport`] session: connect/subscribe/
//! unsubscribe/publish, re-subscription on session resumption, in-flight
//! subscribe accounting and rate-limited operation slots. It never frames an
//! MQTT control packet itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;

use crate::error::{Error, ErrorKind};
use crate::rate_limiter::RateLimiter;
use crate::topic::Topic;
use crate::transport::{AckOutcome, CloudTransport, ConnectOutcome, IncomingMessage, QoS};

/// A link's lifecycle state (§3 `Link.state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Interrupted,
    Closed,
}

/// How many times a resubscribe attempt for one filter is retried within a
/// single recovery cycle before giving up on it.
const MAX_RESUBSCRIBE_ATTEMPTS: u32 = 5;

/// Base interval for resubscribe exponential backoff; overridable for tests
/// via [`Link::with_resubscribe_backoff`].
const DEFAULT_RESUBSCRIBE_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct FilterHistory {
    /// Set the first time a resubscribe attempt for this filter fails, and
    /// never cleared for the link's lifetime. Drives the "still retry any
    /// that previously failed" branch of session-present resumption
    /// (§4.C, resolved Open Question in DESIGN.md).
    ever_failed: bool,
}

struct Inner {
    state: LinkState,
    subscriptions: HashMap<String, QoS>,
    session_present: bool,
    history: HashMap<String, FilterHistory>,
}

/// One MQTT session to the cloud broker (§3 `Link`, §4.C).
pub struct Link {
    pub id: u64,
    pub client_id: String,
    transport: Arc<dyn CloudTransport>,
    inner: Mutex<Inner>,
    in_flight_subscribes: AtomicU32,
    publish_limiter: RateLimiter,
    subscribe_limiter: RateLimiter,
    max_subscriptions: usize,
    resubscribe_base_delay: Duration,
}

impl Link {
    #[must_use]
    pub fn new(
        id: u64,
        client_id: String,
        transport: Arc<dyn CloudTransport>,
        publish_permits_per_sec: u32,
        subscribe_permits_per_sec: u32,
        max_subscriptions: usize,
    ) -> Self {
        Link {
            id,
            client_id,
            transport,
            inner: Mutex::new(Inner {
                state: LinkState::Disconnected,
                subscriptions: HashMap::new(),
                session_present: false,
                history: HashMap::new(),
            }),
            in_flight_subscribes: AtomicU32::new(0),
            publish_limiter: RateLimiter::new(publish_permits_per_sec, publish_permits_per_sec.max(1)),
            subscribe_limiter: RateLimiter::new(subscribe_permits_per_sec, subscribe_permits_per_sec.max(1)),
            max_subscriptions,
            resubscribe_base_delay: DEFAULT_RESUBSCRIBE_BASE_DELAY,
        }
    }

    /// Overrides the resubscribe backoff base interval; intended for tests
    /// that would otherwise wait out the real default.
    #[must_use]
    pub fn with_resubscribe_backoff(mut self, base_delay: Duration) -> Self {
        self.resubscribe_base_delay = base_delay;
        self
    }

    #[must_use]
    pub async fn state(&self) -> LinkState {
        self.inner.lock().await.state
    }

    /// Opens the connection (§4.C `connect`). Idempotent: a second call on
    /// an already-`Connected` link is a no-op.
    ///
    /// # Errors
    /// `Closed` if the link has been terminally closed.
    pub async fn connect(self: &Arc<Self>) -> Result<ConnectOutcome, Error> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                LinkState::Closed => return Err(Error::closed()),
                LinkState::Connected => {
                    return Ok(ConnectOutcome {
                        session_present: inner.session_present,
                    });
                }
                _ => inner.state = LinkState::Connecting,
            }
        }

        let outcome = self.transport.connect().await?;

        {
            let mut inner = self.inner.lock().await;
            inner.state = LinkState::Connected;
            inner.session_present = outcome.session_present;
        }

        log::info!(
            "link {}: connected, session_present={}",
            self.id,
            outcome.session_present
        );
        self.resume(outcome.session_present);
        Ok(outcome)
    }

    /// Drives re-subscription on session resumption (§4.C "Re-subscribe
    /// policy"). Spawned as background work so `connect` itself does not
    /// block on the full recovery cycle.
    fn resume(self: &Arc<Self>, session_present: bool) {
        let this = self.clone();
        tokio::spawn(async move {
            let targets: Vec<(String, QoS)> = {
                let inner = this.inner.lock().await;
                inner
                    .subscriptions
                    .iter()
                    .filter(|(filter, _)| {
                        if !session_present {
                            true
                        } else {
                            inner
                                .history
                                .get(*filter)
                                .is_some_and(|h| h.ever_failed)
                        }
                    })
                    .map(|(f, q)| (f.clone(), *q))
                    .collect()
            };
            for (filter, qos) in targets {
                let this = this.clone();
                tokio::spawn(async move {
                    this.resubscribe_one(filter, qos).await;
                });
            }
        });
    }

    async fn resubscribe_one(self: &Arc<Self>, filter: String, qos: QoS) {
        let topic = match Topic::parse_filter(&filter) {
            Ok(t) => t,
            Err(err) => {
                log::warn!("link {}: cannot resubscribe malformed filter `{filter}`: {err}", self.id);
                return;
            }
        };
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.do_subscribe(&topic, qos).await {
                Ok(AckOutcome::Success) => {
                    log::debug!("link {}: resubscribed `{filter}` (attempt {attempt})", self.id);
                    return;
                }
                _ => {
                    let mut inner = self.inner.lock().await;
                    inner.history.entry(filter.clone()).or_default().ever_failed = true;
                    drop(inner);
                    if attempt >= MAX_RESUBSCRIBE_ATTEMPTS {
                        log::warn!(
                            "link {}: giving up resubscribing `{filter}` after {attempt} attempts",
                            self.id
                        );
                        return;
                    }
                    let delay = self.backoff_with_jitter(attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.resubscribe_base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.min(10));
        let jitter = rand::thread_rng().gen_range(0..=base.max(1));
        Duration::from_millis(exp.saturating_add(jitter))
    }

    /// Subscribes to `filter` at `qos` (§4.C `subscribe`).
    ///
    /// # Errors
    /// Propagates transport errors; a failed ack leaves the filter out of
    /// the local subscriptions map.
    pub async fn subscribe(&self, filter: &Topic, qos: QoS) -> Result<AckOutcome, Error> {
        self.do_subscribe(filter, qos).await
    }

    async fn do_subscribe(&self, filter: &Topic, qos: QoS) -> Result<AckOutcome, Error> {
        self.subscribe_limiter.acquire().await?;
        self.in_flight_subscribes.fetch_add(1, Ordering::SeqCst);
        let result = self.transport.subscribe(filter, qos).await;
        self.in_flight_subscribes.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(AckOutcome::Success) => {
                let mut inner = self.inner.lock().await;
                inner.subscriptions.insert(filter.as_str().to_owned(), qos);
                Ok(AckOutcome::Success)
            }
            other => other,
        }
    }

    /// Unsubscribes from `filter` (§4.C `unsubscribe`). The cloud call is
    /// best-effort: local bookkeeping is removed regardless of outcome.
    pub async fn unsubscribe(&self, filter: &Topic) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock().await;
            inner.subscriptions.remove(filter.as_str());
            inner.history.remove(filter.as_str());
        }
        if let Err(err) = self.transport.unsubscribe(filter).await {
            log::warn!("link {}: best-effort unsubscribe of `{filter}` failed: {err}", self.id);
        }
        Ok(())
    }

    /// Publishes a record (§4.C `publish`). For QoS >= 1 this awaits the
    /// PUBACK/PUBREC via the transport.
    ///
    /// # Errors
    /// Propagates transport errors (including `Retryable`/`NonRetryable`
    /// reason codes surfaced as [`Error`]).
    pub async fn publish(
        &self,
        topic: &Topic,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), Error> {
        self.publish_limiter.acquire().await?;
        match self.transport.publish(topic, payload, qos, retain).await? {
            AckOutcome::Success => Ok(()),
            AckOutcome::Failed(reason) if reason.is_retryable() => Err(Error::retryable(reason)),
            AckOutcome::Failed(reason) => Err(Error::non_retryable(reason)),
        }
    }

    /// Forces a disconnect-then-connect cycle, preserving the subscription
    /// set for replay (§4.C `reconnect`).
    pub async fn reconnect(self: &Arc<Self>, delay: Duration) -> Result<ConnectOutcome, Error> {
        {
            let mut inner = self.inner.lock().await;
            if inner.state == LinkState::Closed {
                return Err(Error::closed());
            }
            inner.state = LinkState::Interrupted;
        }
        self.transport.disconnect().await;
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        self.connect().await
    }

    /// Terminal close: cancels pending operations and disconnects (§4.C
    /// `close`).
    pub async fn close(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.state = LinkState::Closed;
        }
        self.publish_limiter.close();
        self.subscribe_limiter.close();
        self.transport.disconnect().await;
    }

    /// Pulls the next buffered incoming message, if any (feeds the
    /// manager's demultiplexer, §5 "Link I/O").
    pub async fn poll_incoming(&self) -> Option<IncomingMessage> {
        self.transport.try_recv().await
    }

    /// True iff this link can take on one more cloud subscription (§4.D
    /// "Link placement").
    pub async fn can_accept_new_subscription(&self) -> bool {
        self.inner.lock().await.subscriptions.len() < self.max_subscriptions
    }

    /// True iff the link holds no subscriptions and has no in-flight
    /// subscribe (§4.C `is_closable`).
    pub async fn is_closable(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.subscriptions.is_empty() && self.in_flight_subscribes.load(Ordering::SeqCst) == 0
    }

    /// Current subscription count, for placement/tests.
    pub async fn subscription_count(&self) -> usize {
        self.inner.lock().await.subscriptions.len()
    }

    /// Snapshot of held filters, for tests and diagnostics.
    pub async fn subscribed_filters(&self) -> Vec<String> {
        self.inner.lock().await.subscriptions.keys().cloned().collect()
    }
}
