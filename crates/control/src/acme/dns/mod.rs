//! DNS-01 challenge support
//!
//! Wildcard certificates can only be validated over DNS-01, so this is
//! the sole challenge type the wildcard manager uses.
//!
//! # Architecture
//!
//! - [`DnsProvider`] - Trait the solver drives record operations through
//! - [`ChallengeSolver`] - Creates, waits on and removes challenge records
//! - [`credentials`] - API token resolution from config, env or file
//!
//! # Providers
//!
//! - [`CloudflareProvider`] - Cloudflare v4 API
//!
//! # Example
//!
//! ```toml
//! [dns]
//! provider = "cloudflare"
//! credentials_file = "/etc/warden/secrets/cloudflare.json"
//! timeout_secs = 30
//! ```

pub mod credentials;
mod provider;
mod providers;
mod solver;

pub use provider::{
    challenge_record_fqdn, normalize_domain, DnsProvider, DnsProviderError, DnsResult,
    ACME_CHALLENGE_RECORD, CHALLENGE_TTL,
};
pub use providers::{create_provider, CloudflareProvider};
pub use solver::ChallengeSolver;

#[cfg(test)]
pub(crate) use provider::testing;
