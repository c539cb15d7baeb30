// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! The connection manager (§4.D): a pool of [`Link`]s sharing one logical
//! cloud session, responsible for subscription placement, closing idle
//! links, and session-wide reconnects on configuration change.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;

use crate::config::ConfigChange;
use crate::error::{Error, ErrorKind};
use crate::link::Link;
use crate::topic::Topic;
use crate::transport::{CloudTransport, QoS};

/// A factory minting a fresh [`CloudTransport`] for a newly created link id.
/// Kept generic over construction so the manager never hard-codes how a
/// transport is wired (credentials, endpoint, TLS) — that is the embedder's
/// concern (§1).
pub type TransportFactory = Arc<dyn Fn(u64) -> Arc<dyn CloudTransport> + Send + Sync>;

/// Tunables for the connection manager and the links it creates.
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Per-link subscription cap (§4.D "Link placement", usually 50).
    pub max_subscriptions_per_link: usize,
    pub publish_permits_per_sec: u32,
    pub subscribe_permits_per_sec: u32,
    /// Upper bound of the uniform jitter added to a configuration-driven
    /// reconnect delay (§4.D).
    pub reconnect_jitter_ms: u64,
    pub client_id_prefix: String,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        ConnectionManagerConfig {
            max_subscriptions_per_link: 50,
            publish_permits_per_sec: 0,
            subscribe_permits_per_sec: 0,
            reconnect_jitter_ms: 2_000,
            client_id_prefix: "greenbridge".to_owned(),
        }
    }
}

/// Owns the pool of links forming one logical cloud session (§4.D).
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    factory: TransportFactory,
    links: Mutex<Vec<Arc<Link>>>,
    closed: AtomicBool,
    next_client_suffix: AtomicU64,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(config: ConnectionManagerConfig, factory: TransportFactory) -> Self {
        ConnectionManager {
            config,
            factory,
            links: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            next_client_suffix: AtomicU64::new(0),
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed());
        }
        Ok(())
    }

    fn smallest_unused_id(links: &[Arc<Link>]) -> u64 {
        let mut id = 0;
        loop {
            if !links.iter().any(|l| l.id == id) {
                return id;
            }
            id += 1;
        }
    }

    async fn spawn_link(&self, id: u64) -> Result<Arc<Link>, Error> {
        let suffix = self.next_client_suffix.fetch_add(1, Ordering::SeqCst);
        let client_id = format!("{}-{suffix}", self.config.client_id_prefix);
        let transport = (self.factory)(id);
        let link = Arc::new(Link::new(
            id,
            client_id,
            transport,
            self.config.publish_permits_per_sec,
            self.config.subscribe_permits_per_sec,
            self.config.max_subscriptions_per_link,
        ));
        link.connect().await?;
        log::info!("connection manager: created link {id}");
        Ok(link)
    }

    /// Places a new cloud subscription on the first link with room, or a
    /// freshly created one, then closes any other links left idle by the
    /// placement (§4.D "Link placement").
    ///
    /// # Errors
    /// `Closed` once `close_all` has run; otherwise propagates the link's
    /// subscribe error.
    pub async fn subscribe(&self, filter: &Topic, qos: QoS) -> Result<(), Error> {
        self.ensure_open()?;
        let mut links = self.links.lock().await;
        links.sort_by_key(|l| l.id);

        let mut target = None;
        for link in links.iter() {
            if link.can_accept_new_subscription().await {
                target = Some(link.clone());
                break;
            }
        }
        let link = match target {
            Some(link) => link,
            None => {
                let id = Self::smallest_unused_id(&links);
                let link = self.spawn_link(id).await?;
                links.push(link.clone());
                link
            }
        };

        link.subscribe(filter, qos).await?;
        self.close_idle_except(&mut links, link.id).await;
        Ok(())
    }

    /// Removes a cloud subscription from whichever link holds it (§4.D,
    /// invariant I5: a filter lives on at most one link).
    ///
    /// # Errors
    /// `Closed` once `close_all` has run.
    pub async fn unsubscribe(&self, filter: &Topic) -> Result<(), Error> {
        self.ensure_open()?;
        let links = self.links.lock().await;
        for link in links.iter() {
            if link.subscribed_filters().await.iter().any(|f| f == filter.as_str()) {
                return link.unsubscribe(filter).await;
            }
        }
        Ok(())
    }

    /// Publishes on any usable link, creating the first one lazily.
    ///
    /// # Errors
    /// `Closed` once `close_all` has run; otherwise propagates the link's
    /// publish error (including retryable/non-retryable reason codes).
    pub async fn publish(
        &self,
        topic: &Topic,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), Error> {
        self.ensure_open()?;
        let link = self.any_link().await?;
        link.publish(topic, payload, qos, retain).await
    }

    async fn any_link(&self) -> Result<Arc<Link>, Error> {
        let mut links = self.links.lock().await;
        if let Some(link) = links.first() {
            return Ok(link.clone());
        }
        let id = Self::smallest_unused_id(&links);
        let link = self.spawn_link(id).await?;
        links.push(link.clone());
        Ok(link)
    }

    async fn close_idle_except(&self, links: &mut Vec<Arc<Link>>, keep_id: u64) {
        let mut to_remove = Vec::new();
        for (idx, link) in links.iter().enumerate() {
            if link.id != keep_id && link.is_closable().await {
                link.close().await;
                to_remove.push(idx);
            }
        }
        for idx in to_remove.into_iter().rev() {
            let removed = links.remove(idx);
            log::debug!("connection manager: closed idle link {}", removed.id);
        }
    }

    /// Terminates the manager: closes every link; subsequent
    /// subscribe/unsubscribe/publish calls return `Closed` immediately
    /// (§4.D "Closed-state contract").
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut links = self.links.lock().await;
        for link in links.iter() {
            link.close().await;
        }
        links.clear();
    }

    /// Reconnects every link with a jittered delay when a recognized key
    /// changed (§4.D "Configuration-driven reconnects").
    pub async fn configuration_changed(&self, change: &ConfigChange) {
        if !change.triggers_reconnect() {
            log::debug!("connection manager: ignoring unrelated config keys {:?}", change.keys);
            return;
        }
        log::info!("connection manager: reconnecting all links due to config change {:?}", change.keys);
        let links = self.links.lock().await;
        for link in links.iter() {
            let link = link.clone();
            let delay = self.jittered_delay();
            tokio::spawn(async move {
                if let Err(err) = link.reconnect(delay).await {
                    log::warn!("connection manager: config-driven reconnect failed: {err}");
                }
            });
        }
    }

    fn jittered_delay(&self) -> Duration {
        if self.config.reconnect_jitter_ms == 0 {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(0..=self.config.reconnect_jitter_ms);
        Duration::from_millis(millis)
    }

    /// Snapshot of the current links, for the demultiplexer loop and tests.
    pub async fn links_snapshot(&self) -> Vec<Arc<Link>> {
        self.links.lock().await.clone()
    }

    /// Number of live links, for tests.
    pub async fn link_count(&self) -> usize {
        self.links.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AckOutcome, ConnectOutcome, IncomingMessage};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingTransport {
        subscribe_calls: AtomicUsize,
    }

    #[async_trait]
    impl CloudTransport for CountingTransport {
        async fn connect(&self) -> Result<ConnectOutcome, Error> {
            Ok(ConnectOutcome { session_present: true })
        }
        async fn subscribe(&self, _f: &Topic, _q: QoS) -> Result<AckOutcome, Error> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            Ok(AckOutcome::Success)
        }
        async fn unsubscribe(&self, _f: &Topic) -> Result<(), Error> {
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

    fn manager_with_cap(cap: usize) -> Arc<ConnectionManager> {
        let config = ConnectionManagerConfig {
            max_subscriptions_per_link: cap,
            ..ConnectionManagerConfig::default()
        };
        let factory: TransportFactory = Arc::new(|_id| {
            Arc::new(CountingTransport {
                subscribe_calls: AtomicUsize::new(0),
            }) as Arc<dyn CloudTransport>
        });
        Arc::new(ConnectionManager::new(config, factory))
    }

    fn filter(s: &str) -> Topic {
        Topic::parse_filter(s).unwrap()
    }

    #[tokio::test]
    async fn overflowing_a_link_creates_a_new_one() {
        let manager = manager_with_cap(1);
        manager.subscribe(&filter("a"), QoS::AtLeastOnce).await.unwrap();
        manager.subscribe(&filter("b"), QoS::AtLeastOnce).await.unwrap();
        assert_eq!(manager.link_count().await, 2);
    }

    #[tokio::test]
    async fn unsubscribing_everything_closes_idle_links_except_one() {
        let manager = manager_with_cap(1);
        manager.subscribe(&filter("a"), QoS::AtLeastOnce).await.unwrap();
        manager.subscribe(&filter("b"), QoS::AtLeastOnce).await.unwrap();
        assert_eq!(manager.link_count().await, 2);

        manager.unsubscribe(&filter("a")).await.unwrap();
        manager.unsubscribe(&filter("b")).await.unwrap();
        // Subscribing again drives the idle-link cleanup scan.
        manager.subscribe(&filter("c"), QoS::AtLeastOnce).await.unwrap();
        assert_eq!(manager.link_count().await, 1);
    }

    #[tokio::test]
    async fn closed_manager_rejects_further_operations() {
        let manager = manager_with_cap(50);
        manager.subscribe(&filter("a"), QoS::AtLeastOnce).await.unwrap();
        manager.close_all().await;
        let err = manager.subscribe(&filter("b"), QoS::AtLeastOnce).await.unwrap_err();
        assert_eq!(*err.kind(), ErrorKind::Closed);
    }

    #[tokio::test]
    async fn unrelated_config_change_does_not_reconnect() {
        let manager = manager_with_cap(50);
        manager.subscribe(&filter("a"), QoS::AtLeastOnce).await.unwrap();
        manager
            .configuration_changed(&ConfigChange::new(vec!["spooler.maxRetries".to_owned()]))
            .await;
        // No panic / no link replaced; count unchanged.
        assert_eq!(manager.link_count().await, 1);
    }
}
