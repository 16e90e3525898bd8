//! Public wildcard certificate automation
//!
//! Obtains and renews the deployment's one wildcard certificate from a
//! public CA over ACME, validating control of the domain with DNS-01
//! challenges.
//!
//! # Architecture
//!
//! - [`AcmeClient`] - Wrapper around `instant-acme` for protocol
//!   operations (account, order, finalize)
//! - [`AcmeStorage`] - Persistence for account credentials and installed
//!   certificate material
//! - [`dns`] - DNS-01 challenge solving with pluggable providers
//! - [`WildcardCertManager`] - Drives the whole lifecycle and decides
//!   when renewal is due
//!
//! # Issuance Flow
//!
//! 1. [`WildcardCertManager`] ensures an ACME account exists (stored
//!    credentials are reused across runs)
//! 2. [`AcmeClient`] opens an order for the apex domain and its wildcard
//! 3. [`dns::ChallengeSolver`] creates one `_acme-challenge` TXT record
//!    per authorization and waits out propagation
//! 4. [`AcmeClient`] triggers validation and polls the order
//! 5. The finalized chain and key are installed through [`AcmeStorage`],
//!    bundle included, and the challenge records are removed
//!
//! Record cleanup runs even when issuance fails partway; stale records
//! would poison later validation attempts.

mod client;
pub mod dns;
mod error;
mod manager;
mod storage;

pub use client::{AcmeClient, DnsChallenge};
pub use error::{AcmeError, StorageError};
pub use manager::{RenewalOutcome, WildcardCertManager, WildcardState};
pub use storage::{AcmeStorage, WildcardCertificate};
