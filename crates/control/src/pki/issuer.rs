//! Per-agent leaf certificate issuance
//!
//! Issues mTLS leaf certificates bound to `<agent>.<mongo domain>`, signed
//! by the private CA. Issued material lives under
//! `<certsDir>/agents/<agent>/` as `server.key`, `server.crt` and a
//! combined `server.pem` bundle, alongside a `meta.json` record used by
//! the renewal scan.
//!
//! An in-memory cache keyed by `(agent, target address)` avoids repeated
//! signing for the same identity. Cache entries are only trusted while the
//! on-disk certificate still exists; an externally deleted file triggers a
//! fresh issuance instead of returning stale material.

use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use parking_lot::RwLock;
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyUsagePurpose, SanType, SerialNumber,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use warden_common::{AgentId, WardenError, WardenResult};

use super::authority::CertificateAuthority;
use super::keys;

/// Leaf certificate validity in days
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Directory under the certs dir holding per-agent material
pub const AGENTS_DIR: &str = "agents";
/// Leaf private key file name
pub const LEAF_KEY_FILE: &str = "server.key";
/// Leaf certificate file name
pub const LEAF_CERT_FILE: &str = "server.crt";
/// Combined key+cert bundle file name
pub const LEAF_BUNDLE_FILE: &str = "server.pem";
/// Issuance record file name
const LEAF_RECORD_FILE: &str = "meta.json";

/// A complete issued leaf: PEM content of all artifacts plus the CA
/// certificate, so callers can hand out a full trust bundle without a
/// second disk read.
#[derive(Debug, Clone)]
pub struct LeafBundle {
    pub agent: AgentId,
    pub domain: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub bundle_pem: String,
    pub ca_certificate_pem: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub bundle_path: PathBuf,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A leaf certificate within the renewal threshold
#[derive(Debug, Clone)]
pub struct DueLeaf {
    pub agent: AgentId,
    pub target_address: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub days_left: i64,
}

/// On-disk issuance record, used to replay the original target address
/// when the renewal scan reissues a certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LeafRecord {
    agent: String,
    target_address: Option<String>,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Subject-alternative-name form of a target address
enum TargetSan {
    Ip(IpAddr),
    Dns(String),
}

type CacheKey = (String, Option<String>);

/// Issues and caches per-agent leaf certificates.
pub struct AgentCertIssuer {
    authority: Arc<CertificateAuthority>,
    mongo_domain: String,
    cache: RwLock<HashMap<CacheKey, LeafBundle>>,
}

impl AgentCertIssuer {
    pub fn new(authority: Arc<CertificateAuthority>, mongo_domain: impl Into<String>) -> Self {
        Self {
            authority,
            mongo_domain: mongo_domain.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Issue (or return a cached) leaf certificate for `agent`.
    ///
    /// A cache hit is returned only while its certificate and key files
    /// still exist on disk; otherwise the entry is dropped and a fresh
    /// certificate is issued.
    pub fn issue(&self, agent: &AgentId, target_address: Option<&str>) -> WardenResult<LeafBundle> {
        let key = Self::cache_key(agent, target_address);

        // Clone out of the read guard before the body runs: the `if let`
        // scrutinee's temporary guard would otherwise live across the
        // `cache.write()` below and deadlock.
        let cached = self.cache.read().get(&key).cloned();
        if let Some(cached) = cached {
            if cached.cert_path.exists() && cached.key_path.exists() {
                debug!(agent = %agent, "Certificate cache hit");
                return Ok(cached);
            }
            warn!(
                agent = %agent,
                cert = %cached.cert_path.display(),
                "Cached certificate no longer on disk, reissuing"
            );
            self.cache.write().remove(&key);
        }

        let bundle = self.issue_fresh(agent, target_address)?;
        self.cache.write().insert(key, bundle.clone());
        Ok(bundle)
    }

    /// Reissue a leaf certificate unconditionally, replacing any cached
    /// entry for the same identity.
    pub fn renew(&self, agent: &AgentId, target_address: Option<&str>) -> WardenResult<LeafBundle> {
        let bundle = self.issue_fresh(agent, target_address)?;
        self.cache
            .write()
            .insert(Self::cache_key(agent, target_address), bundle.clone());
        info!(agent = %agent, expires_at = %bundle.expires_at, "Renewed agent certificate");
        Ok(bundle)
    }

    /// Delete the agent's certificate directory and purge every cache
    /// entry for that agent, regardless of target address.
    ///
    /// A directory that does not exist is not an error.
    pub fn revoke(&self, agent: &AgentId) -> WardenResult<()> {
        let dir = self.agent_dir(agent);
        match fs::remove_dir_all(&dir) {
            Ok(()) => info!(agent = %agent, dir = %dir.display(), "Revoked agent certificate"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(agent = %agent, "No certificate directory to revoke");
            }
            Err(e) => return Err(WardenError::io_at(dir.display().to_string(), e)),
        }

        self.cache.write().retain(|(id, _), _| id != agent.as_str());
        Ok(())
    }

    /// Scan issued certificates and return those with fewer than
    /// `threshold_days` of validity remaining.
    ///
    /// Unreadable entries are logged and skipped rather than failing the
    /// whole scan.
    pub fn certificates_due(&self, threshold_days: i64) -> WardenResult<Vec<DueLeaf>> {
        let agents_dir = self.agents_dir();
        if !agents_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&agents_dir)
            .map_err(|e| WardenError::io_at(agents_dir.display().to_string(), e))?;

        let mut due = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| WardenError::io_at(agents_dir.display().to_string(), e))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let agent: AgentId = match name.parse() {
                Ok(agent) => agent,
                Err(e) => {
                    warn!(dir = %path.display(), error = %e, "Skipping unrecognized agent directory");
                    continue;
                }
            };

            let cert_path = path.join(LEAF_CERT_FILE);
            let cert_pem = match fs::read_to_string(&cert_path) {
                Ok(pem) => pem,
                Err(e) => {
                    warn!(cert = %cert_path.display(), error = %e, "Skipping unreadable certificate");
                    continue;
                }
            };
            let expires_at = match keys::certificate_expiry(&cert_pem) {
                Ok(when) => when,
                Err(e) => {
                    warn!(cert = %cert_path.display(), error = %e, "Skipping unparseable certificate");
                    continue;
                }
            };

            let days_left = (expires_at - Utc::now()).num_days();
            if days_left < threshold_days {
                let target_address = self.read_record(&path).and_then(|r| r.target_address);
                due.push(DueLeaf {
                    agent,
                    target_address,
                    expires_at,
                    days_left,
                });
            }
        }

        Ok(due)
    }

    /// Number of live cache entries
    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }

    fn issue_fresh(
        &self,
        agent: &AgentId,
        target_address: Option<&str>,
    ) -> WardenResult<LeafBundle> {
        let domain = agent.domain_under(&self.mongo_domain);
        info!(agent = %agent, domain, "Issuing agent certificate");

        let leaf_key = keys::generate_key_pair()?;
        let params = self.leaf_params(&domain, target_address)?;
        let cert = self.authority.sign(params, &leaf_key)?;
        let cert_pem = cert.pem();
        let key_pem = leaf_key.serialize_pem();
        let bundle_pem = format!("{}{}", cert_pem, key_pem);

        let dir = self.agent_dir(agent);
        let key_path = dir.join(LEAF_KEY_FILE);
        let cert_path = dir.join(LEAF_CERT_FILE);
        let bundle_path = dir.join(LEAF_BUNDLE_FILE);

        keys::write_pem_restricted(&key_path, &key_pem)?;
        keys::write_pem_public(&cert_path, &cert_pem)?;
        keys::write_pem_restricted(&bundle_path, &bundle_pem)?;

        let issued_at = Utc::now();
        let expires_at = keys::certificate_expiry(&cert_pem)?;

        let record = LeafRecord {
            agent: agent.to_string(),
            target_address: target_address.map(str::to_string),
            issued_at,
            expires_at,
        };
        let record_json = serde_json::to_string_pretty(&record).map_err(|e| {
            WardenError::certificate(format!("Failed to encode issuance record: {}", e))
        })?;
        let record_path = dir.join(LEAF_RECORD_FILE);
        fs::write(&record_path, record_json)
            .map_err(|e| WardenError::io_at(record_path.display().to_string(), e))?;

        info!(agent = %agent, cert = %cert_path.display(), expires_at = %expires_at, "Agent certificate written");

        Ok(LeafBundle {
            agent: agent.clone(),
            domain,
            certificate_pem: cert_pem,
            private_key_pem: key_pem,
            bundle_pem,
            ca_certificate_pem: self.authority.certificate_pem().to_string(),
            cert_path,
            key_path,
            bundle_path,
            issued_at,
            expires_at,
        })
    }

    fn leaf_params(
        &self,
        domain: &str,
        target_address: Option<&str>,
    ) -> WardenResult<CertificateParams> {
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, domain);

        params.subject_alt_names = vec![
            SanType::DnsName(keys::san_ia5(domain)?),
            SanType::DnsName(keys::san_ia5(&format!("*.{}", domain))?),
            SanType::DnsName(keys::san_ia5("localhost")?),
            SanType::IpAddress(IpAddr::from([127, 0, 0, 1])),
        ];
        if let Some(raw) = target_address {
            match classify_target(raw) {
                Some(TargetSan::Ip(ip)) => params.subject_alt_names.push(SanType::IpAddress(ip)),
                Some(TargetSan::Dns(host)) => params
                    .subject_alt_names
                    .push(SanType::DnsName(keys::san_ia5(&host)?)),
                None => debug!(target = raw, "Target address not routable, omitting from SANs"),
            }
        }

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;

        let not_before = Utc::now();
        let not_after = not_before + Duration::days(LEAF_VALIDITY_DAYS);
        params.not_before = rcgen::date_time_ymd(
            not_before.date_naive().year(),
            not_before.date_naive().month() as u8,
            not_before.date_naive().day() as u8,
        );
        params.not_after = rcgen::date_time_ymd(
            not_after.date_naive().year(),
            not_after.date_naive().month() as u8,
            not_after.date_naive().day() as u8,
        );

        let serial = self.authority.next_serial();
        params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));

        Ok(params)
    }

    fn cache_key(agent: &AgentId, target_address: Option<&str>) -> CacheKey {
        (
            agent.as_str().to_string(),
            target_address.map(str::to_string),
        )
    }

    fn agents_dir(&self) -> PathBuf {
        self.authority.certs_dir().join(AGENTS_DIR)
    }

    fn agent_dir(&self, agent: &AgentId) -> PathBuf {
        self.agents_dir().join(agent.as_str())
    }

    fn read_record(&self, agent_dir: &Path) -> Option<LeafRecord> {
        let path = agent_dir.join(LEAF_RECORD_FILE);
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

impl std::fmt::Debug for AgentCertIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCertIssuer")
            .field("mongo_domain", &self.mongo_domain)
            .field("cached", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

/// Classify a target address for SAN inclusion.
///
/// Loopback addresses and unix socket paths are excluded; the loopback
/// names are already part of every leaf's SAN set. A trailing `:port` is
/// stripped before classification.
fn classify_target(raw: &str) -> Option<TargetSan> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('/') {
        return None;
    }

    if let Ok(sock) = trimmed.parse::<SocketAddr>() {
        return routable_ip(sock.ip());
    }

    let host = match trimmed.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty() && !host.contains(':') && port.parse::<u16>().is_ok() =>
        {
            host
        }
        _ => trimmed,
    };

    if let Ok(ip) = host.parse::<IpAddr>() {
        return routable_ip(ip);
    }
    if host.eq_ignore_ascii_case("localhost") {
        return None;
    }
    Some(TargetSan::Dns(host.to_string()))
}

fn routable_ip(ip: IpAddr) -> Option<TargetSan> {
    if ip.is_loopback() {
        None
    } else {
        Some(TargetSan::Ip(ip))
    }
}
