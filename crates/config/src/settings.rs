//! Configuration types for the Warden control plane
//!
//! Settings are loaded from a TOML file, with secrets (DNS API token,
//! dataplane password) overridable from environment variables so they can
//! stay out of the config file in deployments.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use validator::Validate;

// ============================================================================
// Certificate Storage Configuration
// ============================================================================

/// Certificate directory and identity configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CertsConfig {
    /// Directory holding the CA pair, agent certificates, and the wildcard
    /// bundle
    pub dir: PathBuf,

    /// Organization name, used as `CN = "<organization> CA"` on the root
    #[validate(length(min = 1))]
    pub organization: String,

    /// Base domain for agent mTLS certificates (`<agentId>.<mongo_domain>`)
    #[validate(length(min = 1))]
    pub mongo_domain: String,
}

// ============================================================================
// ACME Configuration
// ============================================================================

/// Public wildcard certificate (ACME) configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AcmeConfig {
    /// Public apex domain; the certificate covers it and `*.<public_domain>`
    #[validate(length(min = 1))]
    pub public_domain: String,

    /// Contact email registered with the ACME account
    #[validate(email)]
    pub email: String,

    /// Use the staging directory instead of production
    #[serde(default)]
    pub staging: bool,

    /// Renew when remaining validity drops below this many days
    #[serde(default = "default_renew_before_days")]
    #[validate(range(min = 1, max = 89))]
    pub renew_before_days: i64,

    /// Fixed wait after creating challenge records, before asking the CA to
    /// validate. A constant wait is a documented approximation of DNS
    /// propagation; tune per provider.
    #[serde(default = "default_propagation_wait_secs")]
    pub propagation_wait_secs: u64,
}

// ============================================================================
// DNS Provider Configuration
// ============================================================================

/// DNS provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsProviderKind {
    Cloudflare,
}

/// DNS provider API configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DnsConfig {
    /// Which provider implementation to use
    pub provider: DnsProviderKind,

    /// API token, inline. Prefer `credentials_file` or the
    /// `WARDEN_DNS_API_TOKEN` environment variable in deployments.
    #[serde(default)]
    pub api_token: Option<String>,

    /// File holding the API token (plain, or JSON `{"api_token": "..."}`)
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,

    /// Request timeout against the provider API
    #[serde(default = "default_dns_timeout_secs")]
    pub timeout_secs: u64,
}

// ============================================================================
// Dataplane API Configuration
// ============================================================================

/// Remote proxy-configuration API (HAProxy Data Plane style)
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DataplaneConfig {
    /// Base URL of the dataplane API, e.g. `http://127.0.0.1:5555`
    #[validate(url)]
    pub base_url: String,

    /// Basic-auth username
    #[validate(length(min = 1))]
    pub username: String,

    /// Basic-auth password. Overridable via `WARDEN_DATAPLANE_PASSWORD`.
    #[serde(default)]
    pub password: String,

    /// Frontend receiving public HTTPS traffic; host-routing rules attach
    /// here
    #[serde(default = "default_http_frontend")]
    pub http_frontend: String,

    /// Request timeout against the dataplane API
    #[serde(default = "default_dataplane_timeout_secs")]
    pub timeout_secs: u64,

    /// Directory for best-effort configuration backups taken before
    /// mutations
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
}

// ============================================================================
// Renewal Scheduler Configuration
// ============================================================================

/// Renewal scheduling and cross-process locking
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RenewalConfig {
    /// Interval between renewal checks, in minutes
    #[serde(default = "default_check_interval_minutes")]
    #[validate(range(min = 1))]
    pub check_interval_minutes: u64,

    /// Lock file serializing renewal runs across processes
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    /// How long a check waits for the lock before skipping the run
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            check_interval_minutes: default_check_interval_minutes(),
            lock_path: default_lock_path(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

// ============================================================================
// Proxy Reload Configuration
// ============================================================================

/// External reload signal issued after commits that changed TLS material
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ReloadConfig {
    /// Command to spawn (e.g. `docker`); absent means log-only
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments for the command (e.g. `["kill", "-s", "HUP", "proxy"]`)
    #[serde(default)]
    pub args: Vec<String>,
}

// ============================================================================
// Root Settings
// ============================================================================

/// Root of the Warden configuration tree
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct Settings {
    #[validate(nested)]
    pub certs: CertsConfig,

    #[validate(nested)]
    pub acme: AcmeConfig,

    #[validate(nested)]
    pub dns: DnsConfig,

    #[validate(nested)]
    pub dataplane: DataplaneConfig,

    #[serde(default)]
    #[validate(nested)]
    pub renewal: RenewalConfig,

    #[serde(default)]
    #[validate(nested)]
    pub reload: ReloadConfig,
}

// ============================================================================
// Defaults
// ============================================================================

pub(crate) fn default_renew_before_days() -> i64 {
    30
}

pub(crate) fn default_propagation_wait_secs() -> u64 {
    60
}

pub(crate) fn default_dns_timeout_secs() -> u64 {
    30
}

pub(crate) fn default_dataplane_timeout_secs() -> u64 {
    15
}

pub(crate) fn default_http_frontend() -> String {
    "https-in".to_string()
}

pub(crate) fn default_check_interval_minutes() -> u64 {
    1440
}

pub(crate) fn default_lock_path() -> PathBuf {
    PathBuf::from("/var/lock/warden-renewal.lock")
}

pub(crate) fn default_lock_timeout_secs() -> u64 {
    30
}
