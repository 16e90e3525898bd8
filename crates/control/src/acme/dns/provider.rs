//! DNS provider interface for DNS-01 challenges
//!
//! The solver talks to the provider exclusively through [`DnsProvider`],
//! so challenge orchestration stays independent of any one vendor API.

use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;

use warden_common::Retryable;

/// Result type for DNS operations
pub type DnsResult<T> = Result<T, DnsProviderError>;

/// Errors from DNS provider operations
#[derive(Debug, Error)]
pub enum DnsProviderError {
    /// Authentication failed with the DNS provider
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// No zone owns the domain
    #[error("Zone not found for domain '{domain}'")]
    ZoneNotFound { domain: String },

    /// Record creation failed
    #[error("Failed to create TXT record '{record_name}': {message}")]
    RecordCreation { record_name: String, message: String },

    /// Record deletion failed
    #[error("Failed to delete TXT record '{record_id}': {message}")]
    RecordDeletion { record_id: String, message: String },

    /// API request failed
    #[error("API request failed: {0}")]
    ApiRequest(String),

    /// Rate limited by the provider
    #[error("Rate limited by DNS provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Request timed out
    #[error("Request timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    /// Invalid provider configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Credential loading failed
    #[error("Failed to load credentials: {0}")]
    Credentials(String),
}

impl Retryable for DnsProviderError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            DnsProviderError::ApiRequest(_)
                | DnsProviderError::Timeout { .. }
                | DnsProviderError::RateLimited { .. }
                | DnsProviderError::RecordCreation { .. }
                | DnsProviderError::RecordDeletion { .. }
        )
    }
}

/// A DNS provider that can manage challenge TXT records.
///
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait DnsProvider: Send + Sync + Debug {
    /// Provider name for logging (e.g. "cloudflare")
    fn name(&self) -> &'static str;

    /// Create a TXT record `{record_name}.{domain}` with the given value
    /// and a short TTL. Returns the provider's record ID for cleanup.
    async fn create_txt_record(
        &self,
        domain: &str,
        record_name: &str,
        record_value: &str,
    ) -> DnsResult<String>;

    /// Delete a TXT record by ID.
    ///
    /// A record that no longer exists is not an error; cleanup runs after
    /// failed validations too and must tolerate already-gone records.
    async fn delete_txt_record(&self, domain: &str, record_id: &str) -> DnsResult<()>;

    /// Find the IDs of all TXT records named `{record_name}.{domain}`.
    ///
    /// Used for cleanup when the record ID from creation is no longer
    /// known (e.g. after a process restart left records behind).
    async fn find_txt_records(&self, domain: &str, record_name: &str) -> DnsResult<Vec<String>>;
}

/// Challenge record name prefix mandated by the ACME DNS-01 method
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// TTL for challenge records; short, they live minutes
pub const CHALLENGE_TTL: u32 = 60;

/// Strip a leading wildcard label.
///
/// `*.example.com` and `example.com` validate against the same record.
pub fn normalize_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// Full challenge record name for a domain.
///
/// `example.com` and `*.example.com` both map to
/// `_acme-challenge.example.com`.
pub fn challenge_record_fqdn(domain: &str) -> String {
    format!("{}.{}", ACME_CHALLENGE_RECORD, normalize_domain(domain))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    #[derive(Debug, Clone)]
    pub struct MockRecord {
        pub id: String,
        pub domain: String,
        pub name: String,
        pub value: String,
    }

    /// In-memory provider for solver and manager tests
    #[derive(Debug, Default)]
    pub struct MockDnsProvider {
        records: Mutex<Vec<MockRecord>>,
        next_id: AtomicU64,
        fail_creates_remaining: AtomicU32,
        fail_all_creates: bool,
        fail_all_deletes: bool,
    }

    impl MockDnsProvider {
        pub fn new() -> Self {
            Self::default()
        }

        /// Every create fails
        pub fn with_failure_on_create(mut self) -> Self {
            self.fail_all_creates = true;
            self
        }

        /// Every delete fails
        pub fn with_failure_on_delete(mut self) -> Self {
            self.fail_all_deletes = true;
            self
        }

        /// The first `n` creates fail, later ones succeed
        pub fn failing_first_creates(self, n: u32) -> Self {
            self.fail_creates_remaining.store(n, Ordering::SeqCst);
            self
        }

        pub fn record_count(&self) -> usize {
            self.records.lock().len()
        }

        pub fn values_for(&self, domain: &str, name: &str) -> Vec<String> {
            self.records
                .lock()
                .iter()
                .filter(|r| r.domain == domain && r.name == name)
                .map(|r| r.value.clone())
                .collect()
        }
    }

    #[async_trait]
    impl DnsProvider for MockDnsProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn create_txt_record(
            &self,
            domain: &str,
            record_name: &str,
            record_value: &str,
        ) -> DnsResult<String> {
            if self.fail_all_creates {
                return Err(DnsProviderError::ApiRequest("simulated outage".to_string()));
            }
            let remaining = self.fail_creates_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_creates_remaining
                    .store(remaining - 1, Ordering::SeqCst);
                return Err(DnsProviderError::ApiRequest(
                    "simulated transient failure".to_string(),
                ));
            }

            let id = format!("record-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.records.lock().push(MockRecord {
                id: id.clone(),
                domain: domain.to_string(),
                name: record_name.to_string(),
                value: record_value.to_string(),
            });
            Ok(id)
        }

        async fn delete_txt_record(&self, _domain: &str, record_id: &str) -> DnsResult<()> {
            if self.fail_all_deletes {
                return Err(DnsProviderError::RecordDeletion {
                    record_id: record_id.to_string(),
                    message: "simulated failure".to_string(),
                });
            }
            self.records.lock().retain(|r| r.id != record_id);
            Ok(())
        }

        async fn find_txt_records(
            &self,
            domain: &str,
            record_name: &str,
        ) -> DnsResult<Vec<String>> {
            Ok(self
                .records
                .lock()
                .iter()
                .filter(|r| r.domain == domain && r.name == record_name)
                .map(|r| r.id.clone())
                .collect())
        }
    }
}
