//! Wildcard certificate lifecycle
//!
//! Owns the one public wildcard certificate: obtains it over ACME with
//! DNS-01 validation, decides when renewal is due, and reissues. The
//! certificate moves through `Absent -> Issuing -> Valid -> Renewing ->
//! Valid`; a failed issuance falls back to the prior state and never
//! installs partial material.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use warden_config::AcmeConfig;

use super::client::AcmeClient;
use super::dns::{ChallengeSolver, DnsProvider};
use super::error::AcmeError;
use super::storage::{AcmeStorage, WildcardCertificate};

/// Lifecycle state of the wildcard certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WildcardState {
    Absent,
    Issuing,
    Valid,
    Renewing,
}

/// Result of a renewal check
#[derive(Debug)]
pub enum RenewalOutcome {
    /// A certificate was issued or reissued
    Renewed(WildcardCertificate),
    /// The installed certificate still has enough validity
    NotDue { days_left: i64 },
}

/// Manages the public wildcard certificate end to end.
pub struct WildcardCertManager {
    client: AcmeClient,
    solver: ChallengeSolver,
    storage: Arc<AcmeStorage>,
    config: AcmeConfig,
    state: Mutex<WildcardState>,
}

impl WildcardCertManager {
    pub fn new(
        config: AcmeConfig,
        storage: Arc<AcmeStorage>,
        provider: Arc<dyn DnsProvider>,
    ) -> Self {
        let client = AcmeClient::new(config.clone(), storage.clone());
        let solver = ChallengeSolver::new(
            provider,
            std::time::Duration::from_secs(config.propagation_wait_secs),
        );

        let initial = match storage.load_wildcard() {
            Ok(Some(_)) => WildcardState::Valid,
            _ => WildcardState::Absent,
        };

        Self {
            client,
            solver,
            storage,
            config,
            state: Mutex::new(initial),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> WildcardState {
        *self.state.lock()
    }

    /// Load or register the ACME account
    pub async fn ensure_account(&self) -> Result<(), AcmeError> {
        self.client.ensure_account().await
    }

    /// Whether the installed certificate is within the renewal threshold.
    ///
    /// A missing or unreadable certificate counts as due.
    pub fn needs_renewal(&self) -> Result<bool, AcmeError> {
        match self.storage.installed_expiry()? {
            None => Ok(true),
            Some(not_after) => {
                let days_left = (not_after - Utc::now()).num_days();
                Ok(days_left < self.config.renew_before_days)
            }
        }
    }

    /// Renew when due; otherwise report remaining validity.
    ///
    /// Safe to call arbitrarily often; this is the scheduler's entry
    /// point.
    pub async fn renew_if_needed(&self) -> Result<RenewalOutcome, AcmeError> {
        if self.needs_renewal()? {
            let certificate = self.issue_certificate().await?;
            return Ok(RenewalOutcome::Renewed(certificate));
        }

        let days_left = self
            .storage
            .installed_expiry()?
            .map(|not_after| (not_after - Utc::now()).num_days())
            .unwrap_or(0);
        debug!(days_left, "Wildcard certificate not due for renewal");
        Ok(RenewalOutcome::NotDue { days_left })
    }

    /// Run the full issuance exchange and install the result.
    ///
    /// Challenge records are removed afterwards whether or not the
    /// exchange succeeded; stale records poison future validations.
    pub async fn issue_certificate(&self) -> Result<WildcardCertificate, AcmeError> {
        let prior = {
            let mut state = self.state.lock();
            match *state {
                WildcardState::Issuing | WildcardState::Renewing => {
                    return Err(AcmeError::Protocol(
                        "wildcard issuance already in progress".to_string(),
                    ));
                }
                WildcardState::Absent => {
                    *state = WildcardState::Issuing;
                    WildcardState::Absent
                }
                WildcardState::Valid => {
                    *state = WildcardState::Renewing;
                    WildcardState::Valid
                }
            }
        };

        info!(
            domain = %self.config.public_domain,
            renewing = matches!(prior, WildcardState::Valid),
            "Obtaining wildcard certificate"
        );

        let result = self.run_issuance().await;

        let removed = self.solver.cleanup_all().await;
        if removed > 0 {
            info!(removed, "Cleaned up challenge records");
        }

        let mut state = self.state.lock();
        match result {
            Ok(certificate) => {
                *state = WildcardState::Valid;
                Ok(certificate)
            }
            Err(e) => {
                warn!(error = %e, "Wildcard issuance failed");
                *state = prior;
                Err(e)
            }
        }
    }

    async fn run_issuance(&self) -> Result<WildcardCertificate, AcmeError> {
        self.client.ensure_account().await?;

        let (mut order, challenges) = self.client.create_dns_order().await?;

        for challenge in &challenges {
            self.solver
                .create_challenge_record(&challenge.domain, &challenge.key_authorization)
                .await?;
        }

        if !challenges.is_empty() {
            self.solver.wait_for_propagation().await;
        }

        for challenge in &challenges {
            self.client
                .trigger_validation(&mut order, &challenge.url)
                .await?;
        }

        self.client.wait_for_order_ready(&mut order).await?;

        let (chain_pem, key_pem, _not_after) = self.client.finalize_order(&mut order).await?;

        let certificate =
            self.storage
                .store_wildcard(&self.config.public_domain, &chain_pem, &key_pem)?;
        Ok(certificate)
    }
}

impl std::fmt::Debug for WildcardCertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WildcardCertManager")
            .field("domain", &self.config.public_domain)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
