//! Periodic renewal checks
//!
//! Wakes on a fixed interval, asks the certificate layers what is due,
//! and reissues. Checks are serialized across every control-plane
//! instance by a named file lock; a check that cannot take the lock is
//! skipped, not queued, so concurrent instances never run overlapping
//! renewals.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use warden_common::{NamedLock, WardenResult};
use warden_config::RenewalConfig;

use crate::acme::{RenewalOutcome, WildcardCertManager};
use crate::pki::AgentCertIssuer;
use crate::reload::ProxyReloader;

/// Delay before the first check, letting dependent services stabilize
const STARTUP_DELAY: Duration = Duration::from_secs(10);

/// Lock name used in logs and contention errors
const LOCK_NAME: &str = "warden-renewal";

/// Result of one renewal check
#[derive(Debug)]
pub enum CheckOutcome {
    /// Another instance held the lock; nothing was checked
    Skipped { waited_ms: u64 },
    /// The check ran to completion
    Completed {
        wildcard_renewed: bool,
        agents_renewed: usize,
        failures: usize,
    },
}

/// Schedules and runs renewal checks.
pub struct RenewalScheduler {
    config: RenewalConfig,
    threshold_days: i64,
    lock: NamedLock,
    wildcard: Arc<WildcardCertManager>,
    issuer: Arc<AgentCertIssuer>,
    reloader: Arc<ProxyReloader>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RenewalScheduler {
    pub fn new(
        config: RenewalConfig,
        threshold_days: i64,
        wildcard: Arc<WildcardCertManager>,
        issuer: Arc<AgentCertIssuer>,
        reloader: Arc<ProxyReloader>,
    ) -> Self {
        let lock = NamedLock::new(LOCK_NAME, &config.lock_path);
        Self {
            config,
            threshold_days,
            lock,
            wildcard,
            issuer,
            reloader,
            task: Mutex::new(None),
        }
    }

    /// Start the recurring check.
    ///
    /// Idempotent: calling `start` again cancels the previous timer task
    /// before installing a new one.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let interval = Duration::from_secs(self.config.check_interval_minutes * 60);
        info!(
            interval_minutes = self.config.check_interval_minutes,
            "Renewal scheduler started"
        );

        let scheduler = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            tokio::time::sleep(STARTUP_DELAY).await;
            loop {
                match scheduler.perform_renewal_check().await {
                    Ok(CheckOutcome::Skipped { waited_ms }) => {
                        info!(waited_ms, "Renewal check skipped, lock held elsewhere");
                    }
                    Ok(CheckOutcome::Completed {
                        wildcard_renewed,
                        agents_renewed,
                        failures,
                    }) => {
                        info!(wildcard_renewed, agents_renewed, failures, "Renewal check done");
                    }
                    Err(e) => error!(error = %e, "Renewal check failed"),
                }
                tokio::time::sleep(interval).await;
            }
        }));
    }

    /// Cancel the recurring check
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!("Renewal scheduler stopped");
        }
    }

    /// Run one renewal check under the cross-process lock.
    ///
    /// Contention is a skip, not a failure. Per-certificate failures are
    /// counted and logged but do not stop the run; the lock is released
    /// by the guard on every path.
    pub async fn perform_renewal_check(&self) -> WardenResult<CheckOutcome> {
        let timeout = Duration::from_secs(self.config.lock_timeout_secs);
        let _guard = match self.lock.acquire(timeout).await {
            Ok(guard) => guard,
            Err(e) if e.is_lock_contention() => {
                let waited_ms = match &e {
                    warden_common::WardenError::LockContended { waited_ms, .. } => *waited_ms,
                    _ => 0,
                };
                return Ok(CheckOutcome::Skipped { waited_ms });
            }
            Err(e) => return Err(e),
        };

        debug!(threshold_days = self.threshold_days, "Starting renewal check");
        let mut failures = 0;

        let wildcard_renewed = match self.wildcard.renew_if_needed().await {
            Ok(RenewalOutcome::Renewed(certificate)) => {
                info!(
                    domain = %certificate.domain,
                    not_after = %certificate.not_after,
                    "Wildcard certificate renewed"
                );
                true
            }
            Ok(RenewalOutcome::NotDue { days_left }) => {
                debug!(days_left, "Wildcard certificate not due");
                false
            }
            Err(e) => {
                error!(error = %e, "Wildcard renewal failed");
                failures += 1;
                false
            }
        };

        let due = match self.issuer.certificates_due(self.threshold_days) {
            Ok(due) => due,
            Err(e) => {
                warn!(error = %e, "Agent certificate scan failed");
                failures += 1;
                Vec::new()
            }
        };

        let mut agents_renewed = 0;
        for leaf in due {
            match self
                .issuer
                .renew(&leaf.agent, leaf.target_address.as_deref())
            {
                Ok(bundle) => {
                    info!(
                        agent = %leaf.agent,
                        expires_at = %bundle.expires_at,
                        "Agent certificate renewed"
                    );
                    agents_renewed += 1;
                }
                Err(e) => {
                    error!(agent = %leaf.agent, error = %e, "Agent certificate renewal failed");
                    failures += 1;
                }
            }
        }

        if wildcard_renewed || agents_renewed > 0 {
            if let Err(e) = self.reloader.reload().await {
                warn!(error = %e, "Proxy reload after renewal failed");
            }
        }

        Ok(CheckOutcome::Completed {
            wildcard_renewed,
            agents_renewed,
            failures,
        })
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("threshold_days", &self.threshold_days)
            .field("lock", &self.lock.name())
            .field("running", &self.task.lock().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::dns::testing::MockDnsProvider;
    use crate::acme::AcmeStorage;
    use crate::pki::{keys, CertificateAuthority, AGENTS_DIR, LEAF_CERT_FILE};
    use chrono::{Datelike, Utc};
    use std::fs;
    use std::path::Path;
    use warden_config::AcmeConfig;

    fn acme_config() -> AcmeConfig {
        AcmeConfig {
            public_domain: "proxy.example".to_string(),
            email: "ops@example.com".to_string(),
            staging: true,
            renew_before_days: 30,
            propagation_wait_secs: 0,
        }
    }

    /// Install a wildcard certificate with the given days of validity
    fn install_wildcard(dir: &Path, validity_days: i64) {
        let storage = AcmeStorage::new(dir);
        let key = keys::generate_key_pair().unwrap();
        let mut params =
            rcgen::CertificateParams::new(vec!["*.proxy.example".to_string()]).unwrap();
        let until = Utc::now() + chrono::Duration::days(validity_days);
        params.not_after = rcgen::date_time_ymd(
            until.date_naive().year(),
            until.date_naive().month() as u8,
            until.date_naive().day() as u8,
        );
        let cert = params.self_signed(&key).unwrap();
        storage
            .store_wildcard("proxy.example", &cert.pem(), &key.serialize_pem())
            .unwrap();
    }

    fn scheduler_in(dir: &Path, lock_timeout_secs: u64) -> Arc<RenewalScheduler> {
        let authority = Arc::new(CertificateAuthority::ensure(dir, "Example Corp").unwrap());
        let issuer = Arc::new(AgentCertIssuer::new(authority, "mongo.example"));
        let storage = Arc::new(AcmeStorage::new(dir));
        let wildcard = Arc::new(WildcardCertManager::new(
            acme_config(),
            storage,
            Arc::new(MockDnsProvider::new()),
        ));
        let config = RenewalConfig {
            check_interval_minutes: 1,
            lock_path: dir.join("renewal.lock"),
            lock_timeout_secs,
        };
        Arc::new(RenewalScheduler::new(
            config,
            30,
            wildcard,
            issuer,
            Arc::new(ProxyReloader::disabled()),
        ))
    }

    #[tokio::test]
    async fn test_contended_lock_skips_without_touching_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(dir.path(), 0);

        // Another instance is mid-run
        let other = NamedLock::new(LOCK_NAME, dir.path().join("renewal.lock"));
        let _held = other.try_acquire().unwrap().expect("lock must be free");

        match scheduler.perform_renewal_check().await.unwrap() {
            CheckOutcome::Skipped { .. } => {}
            other => panic!("expected Skipped, got {:?}", other),
        }
        // The absent wildcard would have triggered issuance had the check run
        assert!(!dir.path().join("wildcard.crt").exists());
    }

    #[tokio::test]
    async fn test_check_runs_once_lock_is_free() {
        let dir = tempfile::tempdir().unwrap();
        install_wildcard(dir.path(), 60);
        let scheduler = scheduler_in(dir.path(), 1);

        match scheduler.perform_renewal_check().await.unwrap() {
            CheckOutcome::Completed {
                wildcard_renewed,
                agents_renewed,
                failures,
            } => {
                assert!(!wildcard_renewed);
                assert_eq!(agents_renewed, 0);
                assert_eq!(failures, 0);
            }
            other => panic!("expected Completed, got {:?}", other),
        }

        // The lock was released by the guard; a second check also runs
        assert!(matches!(
            scheduler.perform_renewal_check().await.unwrap(),
            CheckOutcome::Completed { .. }
        ));
    }

    #[tokio::test]
    async fn test_due_agent_certificates_are_reissued() {
        let dir = tempfile::tempdir().unwrap();
        install_wildcard(dir.path(), 60);

        // Handcraft an agent certificate expiring in 10 days
        let agent_dir = dir.path().join(AGENTS_DIR).join("stale-agent");
        fs::create_dir_all(&agent_dir).unwrap();
        let key = keys::generate_key_pair().unwrap();
        let mut params =
            rcgen::CertificateParams::new(vec!["stale-agent.mongo.example".to_string()]).unwrap();
        let soon = Utc::now() + chrono::Duration::days(10);
        params.not_after = rcgen::date_time_ymd(
            soon.date_naive().year(),
            soon.date_naive().month() as u8,
            soon.date_naive().day() as u8,
        );
        let cert = params.self_signed(&key).unwrap();
        fs::write(agent_dir.join(LEAF_CERT_FILE), cert.pem()).unwrap();

        let scheduler = scheduler_in(dir.path(), 1);
        match scheduler.perform_renewal_check().await.unwrap() {
            CheckOutcome::Completed {
                agents_renewed,
                failures,
                ..
            } => {
                assert_eq!(agents_renewed, 1);
                assert_eq!(failures, 0);
            }
            other => panic!("expected Completed, got {:?}", other),
        }

        // The reissued certificate has a fresh year of validity
        let pem = fs::read_to_string(agent_dir.join(LEAF_CERT_FILE)).unwrap();
        assert!(keys::days_until_expiry(&pem).unwrap() > 300);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_cancels() {
        let dir = tempfile::tempdir().unwrap();
        install_wildcard(dir.path(), 60);
        let scheduler = scheduler_in(dir.path(), 1);

        scheduler.start();
        scheduler.start();
        assert!(scheduler.task.lock().is_some());

        scheduler.stop();
        assert!(scheduler.task.lock().is_none());

        // stop on a stopped scheduler is fine
        scheduler.stop();
    }
}
