// src/core/errors.rs

//! Defines the primary error type for the entire core.

use std::sync::Arc;
use thiserror::Error;

/// How a failure propagates through a session (see the per-statement
/// failure rules in `core::session`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The session may retry the statement against a fresh backend.
    Transient,
    /// The session surfaces the error to the client immediately.
    Permanent,
    /// An unrecoverable invariant was broken; not handled in-core.
    Fatal,
}

/// The main error enum, representing all possible failures within the core.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum ShuntError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Backend error (transient): {0}")]
    BackendTransient(String),

    #[error("Backend error (permanent): {0}")]
    BackendPermanent(String),

    #[error("No target available: {0}")]
    NoTargetAvailable(String),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Connection cap reached for target '{0}'")]
    ConnectionCapReached(String),

    #[error("Transaction aborted")]
    TransactionAborted,

    #[error("Session killed")]
    SessionKilled,

    #[error("Timed out waiting for a pooled connection to '{0}'")]
    WaiterTimeout(String),

    #[error("Operation not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShuntError {
    /// Classifies the error for the session failure rules: transient errors
    /// may be retried outside an open transaction, permanent errors surface
    /// to the client, fatal errors abort.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            ShuntError::Io(_)
            | ShuntError::BackendTransient(_)
            | ShuntError::ResourceBusy(_)
            | ShuntError::ConnectionCapReached(_)
            | ShuntError::WaiterTimeout(_) => ErrorSeverity::Transient,
            ShuntError::Internal(_) => ErrorSeverity::Fatal,
            _ => ErrorSeverity::Permanent,
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for ShuntError {
    fn clone(&self) -> Self {
        match self {
            ShuntError::Io(e) => ShuntError::Io(Arc::clone(e)),
            ShuntError::MalformedPacket(s) => ShuntError::MalformedPacket(s.clone()),
            ShuntError::AuthFailed(s) => ShuntError::AuthFailed(s.clone()),
            ShuntError::BackendTransient(s) => ShuntError::BackendTransient(s.clone()),
            ShuntError::BackendPermanent(s) => ShuntError::BackendPermanent(s.clone()),
            ShuntError::NoTargetAvailable(s) => ShuntError::NoTargetAvailable(s.clone()),
            ShuntError::ResourceBusy(s) => ShuntError::ResourceBusy(s.clone()),
            ShuntError::ConnectionCapReached(s) => ShuntError::ConnectionCapReached(s.clone()),
            ShuntError::TransactionAborted => ShuntError::TransactionAborted,
            ShuntError::SessionKilled => ShuntError::SessionKilled,
            ShuntError::WaiterTimeout(s) => ShuntError::WaiterTimeout(s.clone()),
            ShuntError::InvalidState(s) => ShuntError::InvalidState(s.clone()),
            ShuntError::Config(s) => ShuntError::Config(s.clone()),
            ShuntError::Internal(s) => ShuntError::Internal(s.clone()),
        }
    }
}

impl PartialEq for ShuntError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ShuntError::Io(e1), ShuntError::Io(e2)) => e1.to_string() == e2.to_string(),
            (ShuntError::MalformedPacket(s1), ShuntError::MalformedPacket(s2)) => s1 == s2,
            (ShuntError::AuthFailed(s1), ShuntError::AuthFailed(s2)) => s1 == s2,
            (ShuntError::BackendTransient(s1), ShuntError::BackendTransient(s2)) => s1 == s2,
            (ShuntError::BackendPermanent(s1), ShuntError::BackendPermanent(s2)) => s1 == s2,
            (ShuntError::NoTargetAvailable(s1), ShuntError::NoTargetAvailable(s2)) => s1 == s2,
            (ShuntError::ResourceBusy(s1), ShuntError::ResourceBusy(s2)) => s1 == s2,
            (ShuntError::ConnectionCapReached(s1), ShuntError::ConnectionCapReached(s2)) => {
                s1 == s2
            }
            (ShuntError::WaiterTimeout(s1), ShuntError::WaiterTimeout(s2)) => s1 == s2,
            (ShuntError::InvalidState(s1), ShuntError::InvalidState(s2)) => s1 == s2,
            (ShuntError::Config(s1), ShuntError::Config(s2)) => s1 == s2,
            (ShuntError::Internal(s1), ShuntError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ShuntError {
    fn from(e: std::io::Error) -> Self {
        ShuntError::Io(Arc::new(e))
    }
}

impl From<std::net::AddrParseError> for ShuntError {
    fn from(e: std::net::AddrParseError) -> Self {
        ShuntError::Config(format!("invalid address: {e}"))
    }
}
