//! Warden control plane
//!
//! Certificate lifecycle and transactional route reconciliation for a
//! multi-tenant reverse-proxy front:
//!
//! - [`pki`] - Private CA and per-agent mTLS leaf certificates
//! - [`acme`] - Public wildcard certificate over ACME with DNS-01
//! - [`renewal`] - Lock-serialized periodic renewal checks
//! - [`routes`] - Transactional route mutations on the proxy's
//!   configuration API
//! - [`reload`] - Proxy reload signal after TLS-changing commits
//!
//! The `warden` binary wires these together from
//! [`warden_config::Settings`]; shared error, identifier, retry and
//! locking primitives live in `warden_common`.

pub mod acme;
pub mod pki;
pub mod reload;
pub mod renewal;
pub mod routes;
