//! Transactional mutation of the proxy configuration
//!
//! Every multi-step route change runs inside one remote transaction:
//! begin against the current configuration version, mutate, then commit
//! or abort as a unit. The coordinator also reaps transactions left
//! behind by dead processes and takes a best-effort configuration backup
//! before mutating.
//!
//! At most one transaction is current per coordinator instance; a
//! previous one that was never resolved is aborted before a new one
//! opens, so a failed call can never block future calls.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use warden_common::{TransactionId, WardenResult};

use super::api::DataplaneApi;

/// Remote transactions older than this are reaped before a new one opens
const STALE_AFTER_MINUTES: i64 = 10;

/// Opens, commits and aborts dataplane transactions.
///
/// The remote API does not report when a transaction was opened, so the
/// coordinator journals the first time it sees each id; the staleness
/// rule is applied against that journal. Ids opened by this coordinator
/// enter the journal at begin time.
pub struct TransactionCoordinator {
    api: Arc<dyn DataplaneApi>,
    backup_dir: Option<PathBuf>,
    stale_after: Duration,
    current: Mutex<Option<TransactionId>>,
    /// Transaction id -> when it was first observed
    observed: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TransactionCoordinator {
    pub fn new(api: Arc<dyn DataplaneApi>, backup_dir: Option<PathBuf>) -> Self {
        Self {
            api,
            backup_dir,
            stale_after: Duration::minutes(STALE_AFTER_MINUTES),
            current: Mutex::new(None),
            observed: Mutex::new(HashMap::new()),
        }
    }

    /// Override the staleness threshold (tests use a short one)
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// The transaction currently open through this coordinator, if any
    pub fn current(&self) -> Option<TransactionId> {
        self.current.lock().clone()
    }

    /// Run `f` inside a transaction.
    ///
    /// On success the transaction is committed; on any error it is
    /// aborted on the remote side before the error propagates. The
    /// current-transaction pointer is cleared on every path.
    pub async fn with_transaction<T, F, Fut>(&self, f: F) -> WardenResult<T>
    where
        F: FnOnce(TransactionId) -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        self.resolve_previous().await;
        self.reap_stale().await;
        self.backup_configuration().await;

        let version = self.api.configuration_version().await?;
        let info = self.api.begin_transaction(version).await?;
        let tx = TransactionId::new(info.id.clone());
        *self.current.lock() = Some(tx.clone());
        self.observed.lock().insert(info.id, Utc::now());

        let outcome = match f(tx.clone()).await {
            Ok(value) => match self.api.commit_transaction(&tx).await {
                Ok(()) => {
                    info!(transaction = %tx, "Configuration change committed");
                    Ok(value)
                }
                Err(commit_error) => {
                    warn!(transaction = %tx, error = %commit_error, "Commit failed, aborting");
                    if let Err(e) = self.api.abort_transaction(&tx).await {
                        warn!(transaction = %tx, error = %e, "Abort after failed commit also failed");
                    }
                    Err(commit_error)
                }
            },
            Err(error) => {
                info!(transaction = %tx, error = %error, "Mutation failed, aborting transaction");
                if let Err(e) = self.api.abort_transaction(&tx).await {
                    warn!(transaction = %tx, error = %e, "Failed to abort transaction");
                }
                Err(error)
            }
        };

        *self.current.lock() = None;
        self.observed.lock().remove(tx.as_str());
        outcome
    }

    /// Abort a transaction a previous call left unresolved
    async fn resolve_previous(&self) {
        let previous = self.current.lock().take();
        if let Some(tx) = previous {
            warn!(transaction = %tx, "Resolving leftover transaction before opening a new one");
            if let Err(e) = self.api.abort_transaction(&tx).await {
                warn!(transaction = %tx, error = %e, "Failed to abort leftover transaction");
            }
            self.observed.lock().remove(tx.as_str());
        }
    }

    /// Delete remote transactions that have been open past the staleness
    /// threshold.
    ///
    /// Listing failures are logged, not escalated; reaping is a hygiene
    /// step, not a precondition.
    async fn reap_stale(&self) {
        let listed = match self.api.list_transactions().await {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "Could not list transactions for stale reaping");
                return;
            }
        };

        let now = Utc::now();
        let stale: Vec<TransactionId> = {
            let mut observed = self.observed.lock();
            // Ids no longer reported remotely are gone; forget them
            observed.retain(|id, _| listed.iter().any(|t| &t.id == id));

            listed
                .iter()
                .filter(|t| {
                    let first_seen = *observed.entry(t.id.clone()).or_insert(now);
                    now - first_seen > self.stale_after
                })
                .map(|t| TransactionId::new(t.id.clone()))
                .collect()
        };

        for tx in stale {
            info!(transaction = %tx, "Reaping stale transaction");
            match self.api.abort_transaction(&tx).await {
                Ok(()) => {
                    self.observed.lock().remove(tx.as_str());
                }
                Err(e) => warn!(transaction = %tx, error = %e, "Failed to reap stale transaction"),
            }
        }
    }

    /// Write the live configuration to the backup directory.
    ///
    /// Best effort: a failed backup never blocks the mutation.
    async fn backup_configuration(&self) {
        let Some(dir) = &self.backup_dir else {
            return;
        };

        let raw = match self.api.raw_configuration().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Could not read configuration for backup");
                return;
            }
        };

        if let Err(e) = fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "Could not create backup directory");
            return;
        }
        let path = dir.join(format!("haproxy-{}.cfg", Utc::now().format("%Y%m%dT%H%M%S")));
        match fs::write(&path, raw) {
            Ok(()) => debug!(path = %path.display(), "Configuration backed up"),
            Err(e) => warn!(path = %path.display(), error = %e, "Configuration backup failed"),
        }
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("current", &self.current.lock())
            .field("backup_dir", &self.backup_dir)
            .finish_non_exhaustive()
    }
}
