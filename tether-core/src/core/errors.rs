//! Domain-specific error types for connection resilience
//!
//! Every failure that leaves a component is expressed in one taxonomy:
//! - **Timeout**: connection open exceeded its deadline (retryable)
//! - **Connection**: transport failure, silent data flow, subscription loss,
//!   shared-store failure (retryable, alerted before it propagates)
//! - **Fatal**: malformed required configuration, exhausted retry budget,
//!   invalid state transition (never retried)
//!
//! Transport-library errors are remapped into this taxonomy at the lifecycle
//! boundary and never leak past it.

use crate::core::state::ConnectionState;
use crate::resilience::backoff::BackoffType;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification used by retry and alerting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Deadline exceeded while opening a connection
    Timeout,
    /// Transport or data-flow failure
    Connection,
    /// Requires operator intervention
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Fatal => "fatal",
        }
    }
}

/// Errors raised by the connection-resilience subsystem
#[derive(Debug, Clone, Error)]
pub enum TetherError {
    /// Opening the transport exceeded `connection_timeout`
    #[error("{service}: connection attempt timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },

    /// Transport-level failure (remapped from the transport library)
    #[error("{service}: connection error: {reason}")]
    Connection { service: String, reason: String },

    /// The connection reports healthy but stopped delivering messages
    #[error("{service}: no messages for {silent_for:?} (threshold {threshold:?})")]
    SilentFailure {
        service: String,
        silent_for: Duration,
        threshold: Duration,
    },

    /// Malformed required configuration
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// Transition rejected by the state table
    #[error("{service}: invalid state transition {from} -> {to}")]
    InvalidTransition {
        service: String,
        from: ConnectionState,
        to: ConnectionState,
    },

    /// `should_retry` returned false for this (service, type) pair
    #[error("{service}: retry budget exhausted for {backoff_type} after {attempts} attempts")]
    RetriesExhausted {
        service: String,
        backoff_type: BackoffType,
        attempts: u32,
    },

    /// Shared key-value store operation failed
    #[error("store {operation} failed: {reason}")]
    Store { operation: String, reason: String },

    /// Shutdown was requested while the operation was in flight
    #[error("{service}: operation cancelled by shutdown")]
    Cancelled { service: String },
}

impl TetherError {
    pub fn connection(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connection {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn store(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Map the error onto the three-way taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } => ErrorClass::Timeout,
            Self::Connection { .. } | Self::SilentFailure { .. } | Self::Store { .. } => {
                ErrorClass::Connection
            }
            Self::Validation { .. }
            | Self::InvalidTransition { .. }
            | Self::RetriesExhausted { .. }
            | Self::Cancelled { .. } => ErrorClass::Fatal,
        }
    }

    /// Whether a caller may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Timeout | ErrorClass::Connection)
    }
}

/// Result alias for the library
pub type TetherResult<T> = std::result::Result<T, TetherError>;
