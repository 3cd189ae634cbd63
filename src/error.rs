//! # Adapter Error Types
//!
//! Crate-level error taxonomy for the inbound delivery engine using thiserror
//! for structured error types instead of `Box<dyn Error>` patterns.
//!
//! The taxonomy mirrors the recovery semantics of each failure class:
//! configuration errors are fatal at deployment, pool exhaustion is local to
//! one acquirer, delivery failures feed the retry loop, and shutdown errors
//! are always swallowed after logging.

use crate::xa::XaError;
use thiserror::Error;

/// Errors surfaced by the inbound delivery engine
#[derive(Error, Debug)]
pub enum AdapterError {
    /// Invalid activation configuration - fatal at deployment validation
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Timed out waiting for a pooled delivery resource
    #[error("Resource pool exhausted: no resource became free within {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// The pool was stopped or destroyed while the caller was waiting
    #[error("Resource pool destroyed")]
    PoolDestroyed,

    /// Endpoint invocation failed and redelivery attempts are exhausted
    #[error("Delivery failed: {message}")]
    Delivery { message: String },

    /// Dead-letter handoff failed
    #[error("Dead-letter send failed: {message}")]
    DeadLetter { message: String },

    /// Backend connection failure - handled by the reconnect supervisor
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Teardown failure during stop/destroy - always caught and logged
    #[error("Shutdown error: {message}")]
    Shutdown { message: String },

    /// Backend provider operation failed
    #[error("Backend operation failed: {operation}: {message}")]
    Backend { operation: String, message: String },

    /// Two-phase-commit fault from a transaction branch
    #[error("XA error: {0}")]
    Xa(#[from] XaError),
}

impl AdapterError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a delivery error
    pub fn delivery(message: impl Into<String>) -> Self {
        Self::Delivery {
            message: message.into(),
        }
    }

    /// Create a dead-letter error
    pub fn dead_letter(message: impl Into<String>) -> Self {
        Self::DeadLetter {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a shutdown error
    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::Shutdown {
            message: message.into(),
        }
    }

    /// Create a backend operation error
    pub fn backend(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether this error should trigger the reconnect supervisor
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
