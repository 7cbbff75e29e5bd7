//! Error taxonomy shared by the device clients and the controller
//!
//! Device failures are folded into result structs (see `RoutingResult`,
//! `ControlResult`, ...) so orchestration code can branch on `success` and
//! `error_kind` instead of matching on error types. `ControlError` is the
//! typed source of those fields and is only returned as `Err` for invalid
//! arguments caught before any I/O.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// Refused, reset or unreachable
    #[error("connection error: {0}")]
    Connection(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The device answered with an explicit rejection (ERR, Error, Unavailable)
    #[error("device rejected command: {0}")]
    Protocol(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("connection closed before learning completed")]
    ClosedBeforeCompletion,

    #[error("learning session cancelled")]
    Cancelled,
}

/// Serializable discriminant of `ControlError` for result payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Timeout,
    Protocol,
    StateConflict,
    UnsupportedMethod,
    InvalidArgument,
    ClosedBeforeCompletion,
    Cancelled,
}

impl ControlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::StateConflict(_) => ErrorKind::StateConflict,
            Self::UnsupportedMethod(_) => ErrorKind::UnsupportedMethod,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::ClosedBeforeCompletion => ErrorKind::ClosedBeforeCompletion,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub(crate) fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Map a socket error to a connection error with context
    pub(crate) fn io(context: &str, err: &std::io::Error) -> Self {
        Self::Connection(format!("{}: {}", context, err))
    }
}
