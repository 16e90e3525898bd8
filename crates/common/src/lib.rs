//! Common utilities and shared components for the Warden control plane
//!
//! This crate provides shared functionality used across all Warden
//! components: error types, validated identifiers, the retry combinator,
//! and the cross-process lock primitive.
//!
//! # Module Organization
//!
//! - [`ids`]: Type-safe identifier newtypes (AgentId, TransactionId, BackendName)
//! - [`errors`]: Error types and result aliases
//! - [`retry`]: Bounded retry with exponential backoff
//! - [`lock`]: Named advisory file locks with RAII release

pub mod errors;
pub mod ids;
pub mod lock;
pub mod retry;

// Re-export error types
pub use errors::{WardenError, WardenResult};

// Re-export identifier types
pub use ids::{AgentId, BackendName, TransactionId};

// Re-export locking primitives
pub use lock::{LockGuard, NamedLock};

// Re-export retry primitives
pub use retry::{RetryPolicy, Retryable};

impl Retryable for WardenError {
    fn is_retryable(&self) -> bool {
        WardenError::is_retryable(self)
    }
}
