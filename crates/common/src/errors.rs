//! Error types for the Warden control plane
//!
//! This module defines the common error type used throughout the platform,
//! with a focus on clear failure modes and operational visibility. The
//! variants map onto how callers are expected to react: validation errors
//! are rejected before side effects, infrastructure errors may be retried,
//! protocol errors are terminal for the attempt, and lock contention is a
//! skip signal rather than a failure.

use thiserror::Error;

/// Main error type for Warden operations
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Input validation errors, rejected before any side effect
    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Transient infrastructure errors (network, remote API availability)
    #[error("Infrastructure error during {operation}: {message}")]
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Protocol or state errors, terminal for the current attempt
    #[error("Protocol error during {operation}: {message}")]
    Protocol { operation: String, message: String },

    /// Certificate generation or signing errors
    #[error("Certificate error: {message}")]
    Certificate {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A named lock could not be acquired within its timeout
    #[error("Lock '{name}' not acquired after {waited_ms}ms")]
    LockContended { name: String, waited_ms: u64 },

    /// Timeout errors
    #[error("Timeout: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        path: Option<String>,
        #[source]
        source: std::io::Error,
    },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type alias for Warden operations
pub type WardenResult<T> = Result<T, WardenError>;

impl WardenError {
    /// Determine if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Infrastructure { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            Self::Io { .. } => true,
            _ => false,
        }
    }

    /// Determine if this error signals lock contention (skip, not fail)
    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockContended { .. })
    }

    /// Create a validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a non-retryable infrastructure error
    pub fn infrastructure(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Infrastructure {
            operation: operation.into(),
            message: message.into(),
            retryable: false,
            source: None,
        }
    }

    /// Create a retryable infrastructure error
    pub fn infrastructure_retryable(
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Infrastructure {
            operation: operation.into(),
            message: message.into(),
            retryable: true,
            source: None,
        }
    }

    /// Create a protocol error
    pub fn protocol(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a certificate error
    pub fn certificate(message: impl Into<String>) -> Self {
        Self::Certificate {
            message: message.into(),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    /// Create an IO error with the path that was being accessed
    pub fn io_at(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: source.to_string(),
            path: Some(path.into()),
            source,
        }
    }
}

/// Helper for converting IO errors
impl From<std::io::Error> for WardenError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            path: None,
            source: err,
        }
    }
}
