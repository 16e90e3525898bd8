//! Configuration loading for the Warden control plane
//!
//! Settings come from a TOML file plus environment overrides for secrets.
//! Validation runs at load time so a misconfigured instance fails before
//! touching certificates or the proxy.

use std::path::Path;

use validator::Validate;

use warden_common::{WardenError, WardenResult};

pub mod settings;

pub use settings::{
    AcmeConfig, CertsConfig, DataplaneConfig, DnsConfig, DnsProviderKind, ReloadConfig,
    RenewalConfig, Settings,
};

/// Environment variable overriding `dns.api_token`
pub const ENV_DNS_API_TOKEN: &str = "WARDEN_DNS_API_TOKEN";
/// Environment variable overriding `dataplane.password`
pub const ENV_DATAPLANE_PASSWORD: &str = "WARDEN_DATAPLANE_PASSWORD";

impl Settings {
    /// Load configuration from a TOML file
    ///
    /// Applies environment overrides and validates before returning.
    pub fn from_file(path: impl AsRef<Path>) -> WardenResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| WardenError::Config {
            message: format!("Failed to read config file {}", path.display()),
            source: Some(Box::new(e)),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML content
    pub fn from_toml(content: &str) -> WardenResult<Self> {
        let mut settings: Settings = toml::from_str(content).map_err(|e| WardenError::Config {
            message: "Failed to parse TOML configuration".to_string(),
            source: Some(Box::new(e)),
        })?;

        settings.apply_env_overrides();
        settings.validated()?;
        Ok(settings)
    }

    /// Pull secrets from the environment when present
    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var(ENV_DNS_API_TOKEN) {
            if !token.is_empty() {
                self.dns.api_token = Some(token);
            }
        }
        if let Ok(password) = std::env::var(ENV_DATAPLANE_PASSWORD) {
            if !password.is_empty() {
                self.dataplane.password = password;
            }
        }
    }

    /// Validate the configuration
    pub fn validated(&self) -> WardenResult<()> {
        Validate::validate(self).map_err(|e| WardenError::Config {
            message: format!("Configuration validation failed: {}", e),
            source: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [certs]
            dir = "/etc/warden/certs"
            organization = "Example Corp"
            mongo_domain = "mongo.example"

            [acme]
            public_domain = "edge.example"
            email = "ops@example.com"
            staging = true

            [dns]
            provider = "cloudflare"
            api_token = "cf-token"

            [dataplane]
            base_url = "http://127.0.0.1:5555"
            username = "admin"
            password = "adminpwd"
        "#
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let settings = Settings::from_toml(minimal_toml()).unwrap();
        assert_eq!(settings.acme.renew_before_days, 30);
        assert_eq!(settings.acme.propagation_wait_secs, 60);
        assert_eq!(settings.renewal.check_interval_minutes, 1440);
        assert_eq!(settings.renewal.lock_timeout_secs, 30);
        assert_eq!(settings.dataplane.http_frontend, "https-in");
        assert!(settings.reload.command.is_none());
        assert!(settings.acme.staging);
    }

    #[test]
    fn test_invalid_email_rejected() {
        let toml = minimal_toml().replace("ops@example.com", "not-an-email");
        assert!(Settings::from_toml(&toml).is_err());
    }

    #[test]
    fn test_check_interval_must_be_positive() {
        let toml = format!("{}\n[renewal]\ncheck_interval_minutes = 0\n", minimal_toml());
        assert!(Settings::from_toml(&toml).is_err());
    }

    #[test]
    fn test_reload_section_parses() {
        let toml = format!(
            "{}\n[reload]\ncommand = \"docker\"\nargs = [\"kill\", \"-s\", \"HUP\", \"proxy\"]\n",
            minimal_toml()
        );
        let settings = Settings::from_toml(&toml).unwrap();
        assert_eq!(settings.reload.command.as_deref(), Some("docker"));
        assert_eq!(settings.reload.args.len(), 4);
    }

    #[test]
    fn test_from_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, minimal_toml().as_bytes()).unwrap();
        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.certs.mongo_domain, "mongo.example");
    }
}
