//! DNS-01 challenge solving
//!
//! Creates the `_acme-challenge` TXT records a certificate order needs,
//! waits out propagation, and removes the records afterwards. Removal
//! runs after failed validations too; stale challenge records poison
//! future attempts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use warden_common::RetryPolicy;

use super::provider::{
    challenge_record_fqdn, normalize_domain, DnsProvider, DnsResult, ACME_CHALLENGE_RECORD,
};

/// Creates and removes challenge TXT records through a [`DnsProvider`].
#[derive(Debug)]
pub struct ChallengeSolver {
    provider: Arc<dyn DnsProvider>,
    retry: RetryPolicy,
    propagation_wait: Duration,
    /// Domain (as ordered, wildcards included) -> created record ID
    records: Mutex<HashMap<String, String>>,
}

impl ChallengeSolver {
    pub fn new(provider: Arc<dyn DnsProvider>, propagation_wait: Duration) -> Self {
        Self {
            provider,
            retry: RetryPolicy::default(),
            propagation_wait,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Override the retry policy (tests use a fast one)
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// DNS-01 challenge value: base64url-encoded SHA-256 digest of the
    /// key authorization.
    pub fn compute_challenge_value(key_authorization: &str) -> String {
        let digest = Sha256::digest(key_authorization.as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }

    /// Create the challenge TXT record for a domain.
    ///
    /// Retried with backoff; provider APIs are not always immediately
    /// consistent. The created record ID is tracked for later removal.
    pub async fn create_challenge_record(
        &self,
        domain: &str,
        key_authorization: &str,
    ) -> DnsResult<String> {
        let value = Self::compute_challenge_value(key_authorization);
        let normalized = normalize_domain(domain);

        info!(
            domain,
            record = %challenge_record_fqdn(domain),
            provider = self.provider.name(),
            "Creating DNS-01 challenge record"
        );

        let record_id = self
            .retry
            .run("create challenge record", || {
                self.provider
                    .create_txt_record(normalized, ACME_CHALLENGE_RECORD, &value)
            })
            .await?;

        self.records
            .lock()
            .insert(domain.to_string(), record_id.clone());

        debug!(domain, record_id, "Challenge record created");
        Ok(record_id)
    }

    /// Wait a fixed interval for DNS propagation.
    ///
    /// No resolver is polled; the wait can both under- and over-shoot
    /// depending on the provider, and is configurable for that reason.
    pub async fn wait_for_propagation(&self) {
        info!(
            wait_secs = self.propagation_wait.as_secs(),
            "Waiting for DNS propagation"
        );
        tokio::time::sleep(self.propagation_wait).await;
    }

    /// Remove the challenge record for a domain.
    ///
    /// Uses the tracked record ID when available, otherwise looks the
    /// record up by name, so cleanup also catches records left behind by
    /// an earlier run. A record that is already gone is not an error.
    pub async fn remove_challenge_record(&self, domain: &str) -> DnsResult<()> {
        let normalized = normalize_domain(domain);

        let ids = match self.records.lock().remove(domain) {
            Some(id) => vec![id],
            None => {
                self.provider
                    .find_txt_records(normalized, ACME_CHALLENGE_RECORD)
                    .await?
            }
        };

        if ids.is_empty() {
            debug!(domain, "No challenge record to remove");
            return Ok(());
        }

        let mut last_error = None;
        for id in ids {
            let result = self
                .retry
                .run("delete challenge record", || {
                    self.provider.delete_txt_record(normalized, &id)
                })
                .await;
            if let Err(e) = result {
                warn!(domain, record_id = %id, error = %e, "Failed to remove challenge record");
                last_error = Some(e);
            } else {
                debug!(domain, record_id = %id, "Challenge record removed");
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Remove every tracked challenge record, logging failures instead of
    /// returning them. Returns the number of records removed.
    pub async fn cleanup_all(&self) -> usize {
        let tracked: Vec<(String, String)> = self.records.lock().drain().collect();
        let mut removed = 0;

        for (domain, id) in tracked {
            let normalized = normalize_domain(&domain);
            match self.provider.delete_txt_record(normalized, &id).await {
                Ok(()) => {
                    debug!(domain, record_id = %id, "Challenge record removed");
                    removed += 1;
                }
                Err(e) => {
                    warn!(domain, record_id = %id, error = %e, "Failed to remove challenge record")
                }
            }
        }

        removed
    }

    /// Number of records created but not yet removed
    pub fn pending_records(&self) -> usize {
        self.records.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::provider::testing::MockDnsProvider;
    use super::*;

    fn fast_solver(provider: Arc<MockDnsProvider>) -> ChallengeSolver {
        ChallengeSolver::new(provider, Duration::from_millis(0)).with_retry_policy(RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
        })
    }

    #[test]
    fn test_challenge_value_shape() {
        let value = ChallengeSolver::compute_challenge_value("token.thumbprint");

        // base64url of a 32-byte digest, unpadded
        assert_eq!(value.len(), 43);
        assert!(!value.contains('='));
        assert!(!value.contains('+'));
        assert!(!value.contains('/'));

        // Deterministic, and input-sensitive
        assert_eq!(
            value,
            ChallengeSolver::compute_challenge_value("token.thumbprint")
        );
        assert_ne!(
            value,
            ChallengeSolver::compute_challenge_value("other.thumbprint")
        );
    }

    #[tokio::test]
    async fn test_create_tracks_and_stores_value() {
        let provider = Arc::new(MockDnsProvider::new());
        let solver = fast_solver(provider.clone());

        solver
            .create_challenge_record("*.example.com", "key-auth")
            .await
            .unwrap();

        assert_eq!(solver.pending_records(), 1);
        let values = provider.values_for("example.com", ACME_CHALLENGE_RECORD);
        assert_eq!(
            values,
            vec![ChallengeSolver::compute_challenge_value("key-auth")]
        );
    }

    #[tokio::test]
    async fn test_create_retries_transient_failures() {
        let provider = Arc::new(MockDnsProvider::new().failing_first_creates(2));
        let solver = fast_solver(provider.clone());

        solver
            .create_challenge_record("example.com", "key-auth")
            .await
            .unwrap();

        assert_eq!(provider.record_count(), 1);
    }

    #[tokio::test]
    async fn test_create_gives_up_after_bounded_attempts() {
        let provider = Arc::new(MockDnsProvider::new().failing_first_creates(10));
        let solver = fast_solver(provider.clone());

        assert!(solver
            .create_challenge_record("example.com", "key-auth")
            .await
            .is_err());
        assert_eq!(provider.record_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_deletes_tracked_record() {
        let provider = Arc::new(MockDnsProvider::new());
        let solver = fast_solver(provider.clone());

        solver
            .create_challenge_record("example.com", "key-auth")
            .await
            .unwrap();
        solver.remove_challenge_record("example.com").await.unwrap();

        assert_eq!(provider.record_count(), 0);
        assert_eq!(solver.pending_records(), 0);
    }

    #[tokio::test]
    async fn test_remove_finds_untracked_records() {
        let provider = Arc::new(MockDnsProvider::new());

        // Created by an earlier run, so this solver has no tracked ID
        provider
            .create_txt_record("example.com", ACME_CHALLENGE_RECORD, "stale")
            .await
            .unwrap();

        let solver = fast_solver(provider.clone());
        solver.remove_challenge_record("example.com").await.unwrap();

        assert_eq!(provider.record_count(), 0);
    }

    #[tokio::test]
    async fn test_remove_without_records_is_ok() {
        let provider = Arc::new(MockDnsProvider::new());
        let solver = fast_solver(provider);

        solver.remove_challenge_record("example.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_all_after_failed_validation() {
        let provider = Arc::new(MockDnsProvider::new());
        let solver = fast_solver(provider.clone());

        // Wildcard orders create one record per authorization, both under
        // the same name
        solver
            .create_challenge_record("example.com", "auth-1")
            .await
            .unwrap();
        solver
            .create_challenge_record("*.example.com", "auth-2")
            .await
            .unwrap();
        assert_eq!(provider.record_count(), 2);

        // Validation failed upstream; cleanup must still clear everything
        let removed = solver.cleanup_all().await;
        assert_eq!(removed, 2);
        assert_eq!(provider.record_count(), 0);
        assert_eq!(solver.pending_records(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_all_logs_failures_without_propagating() {
        let provider = Arc::new(MockDnsProvider::new().with_failure_on_delete());
        let solver = fast_solver(provider.clone());

        solver
            .create_challenge_record("example.com", "auth")
            .await
            .unwrap();

        let removed = solver.cleanup_all().await;
        assert_eq!(removed, 0);
        // Tracked entries are drained even when deletion failed
        assert_eq!(solver.pending_records(), 0);
    }
}
