//! Transactional route reconciliation against the proxy
//!
//! Routes traffic for each agent's subdomain (HTTP) or database domain
//! (MongoDB over TLS) to the right backend by mutating the proxy's
//! configuration through its remote API.
//!
//! # Architecture
//!
//! - [`DataplaneApi`] - Typed client trait for the configuration API,
//!   with [`HttpDataplaneClient`] as the real implementation
//! - [`TransactionCoordinator`] - Begin/commit/abort discipline, stale
//!   transaction reaping, pre-mutation backup
//! - [`RouteManager`] - One method per reconciliation intent, each a
//!   bounded-retry wrapper around one transaction
//! - [`RouteCache`] - Managed-route cache, rebuilt from the live
//!   configuration and updated only after commits
//!
//! # Atomicity
//!
//! Every multi-step change (backend, server, routing rule) happens
//! inside one transaction. A failure anywhere aborts the transaction on
//! the remote side before the error propagates, and the cache is only
//! touched after a successful commit, so neither the proxy nor the cache
//! ever sees a half-applied route.

mod api;
mod cache;
mod manager;
mod transaction;

pub use api::{
    Backend, DataplaneApi, HttpDataplaneClient, HttpRequestRule, Server, TransactionInfo,
};
pub use cache::{RouteCache, RouteCacheEntry, RouteKind};
pub use manager::RouteManager;
pub use transaction::TransactionCoordinator;
