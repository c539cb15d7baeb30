// Copyright (c) 2026 IoT Runtime Team. All rights reserved.
// Use of this source is governed by the Apache License, Version 2.0 that can
// be found in the LICENSE file.

//! Error types shared across every module in this crate.

use std::fmt::{self, Display};

use crate::transport::ReasonCode;

/// Represents the types of errors a caller can observe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Arguments failed validation (bad topic, oversized payload, ...).
    InvalidArguments,

    /// The authorization capability denied the operation.
    Unauthorized,

    /// The spooler has no room for this record and the caller must not
    /// silently drop it (QoS >= 1).
    Full,

    /// The payload or topic exceeded a configured size limit.
    TooLarge,

    /// QoS0 publish was rejected because the link is offline and
    /// `keep_qos0_when_offline` is false.
    Offline,

    /// A transport-reported failure that the pump should requeue.
    Retryable,

    /// A transport-reported failure that must not be retried.
    NonRetryable,

    /// An operation did not complete within its configured timeout.
    Timeout,

    /// The session, manager or link has been closed; callers must not retry.
    Closed,

    /// The link was interrupted mid-operation.
    Interrupted,

    /// An unclassified internal failure, surfaced rather than propagating an
    /// implementation detail to the caller (§6 "Consumer-facing operations").
    ServiceError,

    /// The caller referenced a handle, subscription or link id that no
    /// longer (or never did) exist (§6 "Consumer-facing operations").
    ResourceNotFound,
}

/// A crate-wide error: a classification plus a human-readable message.
#[derive(Clone, Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    reason: Option<ReasonCode>,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Error {
            kind,
            message: message.to_owned(),
            reason: None,
        }
    }

    #[must_use]
    pub fn from_string(kind: ErrorKind, message: String) -> Self {
        Error {
            kind,
            message,
            reason: None,
        }
    }

    #[must_use]
    pub fn retryable(reason: ReasonCode) -> Self {
        Error {
            kind: ErrorKind::Retryable,
            message: format!("retryable reason code: {reason:?}"),
            reason: Some(reason),
        }
    }

    #[must_use]
    pub fn non_retryable(reason: ReasonCode) -> Self {
        Error {
            kind: ErrorKind::NonRetryable,
            message: format!("non-retryable reason code: {reason:?}"),
            reason: Some(reason),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    #[must_use]
    pub const fn reason(&self) -> Option<ReasonCode> {
        self.reason
    }

    #[must_use]
    pub const fn closed() -> Self {
        Error {
            kind: ErrorKind::Closed,
            message: String::new(),
            reason: None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::from_string(ErrorKind::Closed, format!("channel closed: {err}"))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::from_string(ErrorKind::Closed, format!("reply channel dropped: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Error::from_string(ErrorKind::Timeout, format!("{err}"))
    }
}
