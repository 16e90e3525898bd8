//! Persistence for ACME account credentials and the wildcard certificate
//!
//! Everything lives under the certs directory:
//!
//! - `acme-account.json` - account credentials (0600)
//! - `wildcard.key` - wildcard private key (0600)
//! - `wildcard.crt` - full certificate chain (0644)
//! - `mongodb.pem` - combined chain+key bundle for the proxy (0600)
//! - `wildcard.json` - installed-certificate record (0644)
//!
//! Artifacts are written to a temporary name and renamed into place, so a
//! crash mid-write never leaves a half-written certificate installed. The
//! record file is written last; it only ever describes fully installed
//! material.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use instant_acme::AccountCredentials;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::pki::keys;

use super::error::StorageError;

/// Account credentials file name
pub const ACCOUNT_FILE: &str = "acme-account.json";
/// Wildcard private key file name
pub const WILDCARD_KEY_FILE: &str = "wildcard.key";
/// Wildcard full-chain file name
pub const WILDCARD_CERT_FILE: &str = "wildcard.crt";
/// Combined chain+key bundle consumed by the proxy
pub const WILDCARD_BUNDLE_FILE: &str = "mongodb.pem";
/// Installed-certificate record file name
const WILDCARD_STATE_FILE: &str = "wildcard.json";

const MODE_PRIVATE: u32 = 0o600;
const MODE_PUBLIC: u32 = 0o644;

/// The installed wildcard certificate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WildcardCertificate {
    pub domain: String,
    pub chain_path: PathBuf,
    pub key_path: PathBuf,
    pub bundle_path: PathBuf,
    pub issued_at: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// File-backed storage for ACME state
#[derive(Debug, Clone)]
pub struct AcmeStorage {
    certs_dir: PathBuf,
}

impl AcmeStorage {
    pub fn new(certs_dir: impl Into<PathBuf>) -> Self {
        Self {
            certs_dir: certs_dir.into(),
        }
    }

    /// Load stored account credentials.
    ///
    /// A missing file returns `None`. An unreadable file is also treated
    /// as absent, forcing re-registration; the account key is
    /// replaceable, certificates already issued stay valid.
    pub fn load_account_credentials(&self) -> Result<Option<AccountCredentials>, StorageError> {
        let path = self.account_path();
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&path)?;
        match serde_json::from_str(&raw) {
            Ok(credentials) => {
                debug!(path = %path.display(), "Loaded ACME account credentials");
                Ok(Some(credentials))
            }
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Stored ACME account credentials are unreadable, will re-register"
                );
                Ok(None)
            }
        }
    }

    /// Persist account credentials with owner-only permissions
    pub fn store_account_credentials(
        &self,
        credentials: &AccountCredentials,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(credentials)?;
        write_atomic(&self.account_path(), &json, MODE_PRIVATE)?;
        info!(path = %self.account_path().display(), "Stored ACME account credentials");
        Ok(())
    }

    /// Install a freshly issued wildcard certificate.
    ///
    /// Writes key, chain and the combined bundle, then the record file.
    pub fn store_wildcard(
        &self,
        domain: &str,
        chain_pem: &str,
        key_pem: &str,
    ) -> Result<WildcardCertificate, StorageError> {
        let not_after = keys::certificate_expiry(chain_pem)
            .map_err(|e| StorageError::Serialization(format!("chain does not parse: {}", e)))?;

        let certificate = WildcardCertificate {
            domain: domain.to_string(),
            chain_path: self.chain_path(),
            key_path: self.wildcard_key_path(),
            bundle_path: self.bundle_path(),
            issued_at: Utc::now(),
            not_after,
        };

        write_atomic(&certificate.key_path, key_pem, MODE_PRIVATE)?;
        write_atomic(&certificate.chain_path, chain_pem, MODE_PUBLIC)?;
        let bundle = format!("{}{}", chain_pem, key_pem);
        write_atomic(&certificate.bundle_path, &bundle, MODE_PRIVATE)?;

        let record = serde_json::to_string_pretty(&certificate)?;
        write_atomic(&self.state_path(), &record, MODE_PUBLIC)?;

        info!(
            domain,
            chain = %certificate.chain_path.display(),
            not_after = %not_after,
            "Wildcard certificate installed"
        );
        Ok(certificate)
    }

    /// Load the installed wildcard certificate record, if any.
    ///
    /// The record only counts while the material it describes is still on
    /// disk; a stale record left behind after the chain or key was removed
    /// is treated as no certificate at all.
    pub fn load_wildcard(&self) -> Result<Option<WildcardCertificate>, StorageError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let certificate: WildcardCertificate = match serde_json::from_str(&raw) {
            Ok(certificate) => certificate,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Wildcard record is unreadable");
                return Ok(None);
            }
        };

        if !certificate.chain_path.exists() || !certificate.key_path.exists() {
            warn!(
                path = %path.display(),
                chain = %certificate.chain_path.display(),
                "Wildcard record describes missing material, treating as not installed"
            );
            return Ok(None);
        }
        Ok(Some(certificate))
    }

    /// Expiry of the installed wildcard certificate.
    ///
    /// Prefers the record file; falls back to parsing the chain when the
    /// record is missing. Returns `None` when no certificate is
    /// installed at all.
    pub fn installed_expiry(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        if let Some(certificate) = self.load_wildcard()? {
            return Ok(Some(certificate.not_after));
        }

        let chain_path = self.chain_path();
        if !chain_path.exists() || !self.wildcard_key_path().exists() {
            return Ok(None);
        }
        let chain_pem = fs::read_to_string(&chain_path)?;
        match keys::certificate_expiry(&chain_pem) {
            Ok(not_after) => Ok(Some(not_after)),
            Err(e) => {
                warn!(path = %chain_path.display(), error = %e, "Installed chain does not parse");
                Ok(None)
            }
        }
    }

    pub fn account_path(&self) -> PathBuf {
        self.certs_dir.join(ACCOUNT_FILE)
    }

    pub fn chain_path(&self) -> PathBuf {
        self.certs_dir.join(WILDCARD_CERT_FILE)
    }

    pub fn wildcard_key_path(&self) -> PathBuf {
        self.certs_dir.join(WILDCARD_KEY_FILE)
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.certs_dir.join(WILDCARD_BUNDLE_FILE)
    }

    fn state_path(&self) -> PathBuf {
        self.certs_dir.join(WILDCARD_STATE_FILE)
    }
}

/// Write a file via a temporary name and rename, setting the mode before
/// the rename so the final path never exists half-written or with open
/// permissions.
fn write_atomic(path: &Path, content: &str, mode: u32) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    let tmp = path.with_file_name(format!("{}.tmp", file_name));

    fs::write(&tmp, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    fs::rename(&tmp, path)?;
    Ok(())
}
