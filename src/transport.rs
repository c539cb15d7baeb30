// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! The `CloudTransport` collaborator boundary.
//!
//! This crate never frames an MQTT control packet itself. Everything below
//! `Link` is delegated to a conforming MQTT 3.1.1 / MQTT 5 transport that the
//! embedder supplies. The trait is intentionally narrow: it only exposes the
//! operations the connection-manager layer needs to drive.

use async_trait::async_trait;

use crate::topic::Topic;

/// MQTT quality of service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }

    #[must_use]
    pub const fn is_at_least_once(self) -> bool {
        !matches!(self, QoS::AtMostOnce)
    }
}

/// MQTT-5 style reason codes, collapsed to the subset this crate treats
/// differently (retryable vs. not). A transport may map v3.1.1 outcomes onto
/// these too (e.g. a bare "connection lost" maps to `ServerBusy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    Success,
    QuotaExceeded,
    ServerBusy,
    ImplementationSpecificError,
    TopicNameInvalid,
    NotAuthorized,
    PacketTooLarge,
    PayloadFormatInvalid,
}

impl ReasonCode {
    /// Retryable reason codes represent transient cloud-side backpressure;
    /// non-retryable ones indicate the publish/subscribe can never succeed
    /// as framed and must not be retried (§4.C).
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            ReasonCode::QuotaExceeded
                | ReasonCode::ServerBusy
                | ReasonCode::ImplementationSpecificError
        )
    }
}

/// Outcome of a publish or subscribe acknowledged by the cloud.
#[derive(Debug, Clone, Copy)]
pub enum AckOutcome {
    Success,
    Failed(ReasonCode),
}

/// Result of attempting to (re)connect: whether the broker reports a prior
/// session still exists (§4.C "Re-subscribe policy on session resumption").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOutcome {
    pub session_present: bool,
}

/// A message delivered by the cloud broker to a subscribed link.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub topic: Topic,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// The external collaborator a [`crate::link::Link`] drives to actually speak
/// MQTT on the wire. Implementations own the TCP/TLS/WebSocket socket, framing,
/// keepalive ping scheduling and MQTT-5 property encoding; none of that is
/// this crate's concern.
#[async_trait]
pub trait CloudTransport: Send + Sync {
    /// Opens (or re-opens) the underlying network connection and performs
    /// the MQTT CONNECT/CONNACK handshake.
    async fn connect(&self) -> Result<ConnectOutcome, crate::Error>;

    /// Sends a SUBSCRIBE for `filter` at `qos` and awaits the SUBACK.
    async fn subscribe(&self, filter: &Topic, qos: QoS) -> Result<AckOutcome, crate::Error>;

    /// Sends an UNSUBSCRIBE for `filter`. Best-effort: the caller proceeds
    /// with local bookkeeping regardless of the outcome.
    async fn unsubscribe(&self, filter: &Topic) -> Result<(), crate::Error>;

    /// Publishes `payload` to `topic`. For QoS >= 1 this resolves once the
    /// matching PUBACK/PUBREC (or a failure reason code) is observed.
    async fn publish(
        &self,
        topic: &Topic,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<AckOutcome, crate::Error>;

    /// Closes the underlying connection. Idempotent.
    async fn disconnect(&self);

    /// Pulls the next message the broker has delivered on an active
    /// subscription, if any is buffered. Non-blocking: used by the link's
    /// demultiplexer loop.
    async fn try_recv(&self) -> Option<IncomingMessage>;
}
