//! Private PKI for agent mTLS
//!
//! Owns the internal trust chain used for per-agent MongoDB connections:
//! a long-lived private root plus one-year leaf certificates bound to
//! `<agent>.<mongo domain>`.
//!
//! # Architecture
//!
//! - [`keys`] - Key generation, PEM persistence, X.509 expiry parsing
//! - [`CertificateAuthority`] - Root key pair and certificate, generated
//!   lazily and loaded on every start
//! - [`AgentCertIssuer`] - Leaf issuance with a `(agent, target)` keyed
//!   cache, revocation and renewal scanning
//!
//! # Issuance Flow
//!
//! 1. [`CertificateAuthority::ensure`] loads or creates the root pair
//! 2. [`AgentCertIssuer::issue`] builds the SAN set for the agent's
//!    domain and signs a fresh leaf on cache miss
//! 3. Key, certificate and combined bundle are persisted under
//!    `agents/<agent>/`, and the returned [`LeafBundle`] carries all PEM
//!    content plus the CA certificate for one-shot distribution

mod authority;
mod issuer;
pub mod keys;

pub use authority::{CertificateAuthority, CA_CERT_FILE, CA_KEY_FILE};
pub use issuer::{AgentCertIssuer, DueLeaf, LeafBundle, AGENTS_DIR, LEAF_BUNDLE_FILE, LEAF_CERT_FILE, LEAF_KEY_FILE};
