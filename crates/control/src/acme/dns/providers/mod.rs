//! DNS provider implementations
//!
//! Available providers:
//! - [`CloudflareProvider`] - Cloudflare v4 API

mod cloudflare;

pub use cloudflare::CloudflareProvider;

use std::sync::Arc;
use std::time::Duration;

use warden_config::{DnsConfig, DnsProviderKind};

use super::credentials;
use super::provider::{DnsProvider, DnsResult};

/// Create a DNS provider from configuration
pub fn create_provider(config: &DnsConfig) -> DnsResult<Arc<dyn DnsProvider>> {
    let token = credentials::resolve_token(config)?;
    let timeout = Duration::from_secs(config.timeout_secs);

    match config.provider {
        DnsProviderKind::Cloudflare => {
            let provider = CloudflareProvider::new(&token, timeout)?;
            Ok(Arc::new(provider))
        }
    }
}
