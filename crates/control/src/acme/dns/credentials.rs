//! DNS credential resolution
//!
//! The API token comes from, in order: the inline config value (which the
//! config layer already overrides from the environment), then a
//! credentials file. Files may be plain text (the whole content is the
//! token) or JSON with a `token` or `api_token` key.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use warden_config::DnsConfig;

use super::provider::DnsProviderError;

/// Resolve the DNS API token from configuration
pub fn resolve_token(config: &DnsConfig) -> Result<String, DnsProviderError> {
    if let Some(token) = config.api_token.as_deref() {
        let trimmed = token.trim();
        if !trimmed.is_empty() {
            debug!("Using inline DNS API token");
            return Ok(trimmed.to_string());
        }
    }

    if let Some(path) = &config.credentials_file {
        return load_token_file(path);
    }

    Err(DnsProviderError::Credentials(
        "No DNS API token configured. Set dns.api_token, the WARDEN_DNS_API_TOKEN \
         environment variable, or dns.credentials_file"
            .to_string(),
    ))
}

/// Load a token from a credentials file
pub fn load_token_file(path: &Path) -> Result<String, DnsProviderError> {
    warn_if_world_readable(path);

    let content = fs::read_to_string(path).map_err(|e| {
        DnsProviderError::Credentials(format!(
            "Failed to read credentials file '{}': {}",
            path.display(),
            e
        ))
    })?;

    parse_token(&content, path)
}

fn parse_token(content: &str, path: &Path) -> Result<String, DnsProviderError> {
    let trimmed = content.trim();

    if trimmed.is_empty() {
        return Err(DnsProviderError::Credentials(format!(
            "Credentials file '{}' is empty",
            path.display()
        )));
    }

    if trimmed.starts_with('{') {
        #[derive(Deserialize)]
        struct TokenFile {
            token: Option<String>,
            api_token: Option<String>,
        }

        let parsed: TokenFile = serde_json::from_str(trimmed).map_err(|e| {
            DnsProviderError::Credentials(format!(
                "Credentials file '{}' is not valid JSON: {}",
                path.display(),
                e
            ))
        })?;

        return parsed
            .token
            .or(parsed.api_token)
            .filter(|t| !t.trim().is_empty())
            .map(|t| t.trim().to_string())
            .ok_or_else(|| {
                DnsProviderError::Credentials(format!(
                    "Credentials file '{}' has no 'token' or 'api_token' key",
                    path.display()
                ))
            });
    }

    debug!(path = %path.display(), "Loaded credentials as plain text token");
    Ok(trimmed.to_string())
}

/// Warn when the credentials file is readable by group or others
fn warn_if_world_readable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(path) {
            let mode = metadata.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                warn!(
                    path = %path.display(),
                    mode = format!("{:o}", mode),
                    "Credentials file should be readable by owner only (0600 or 0400)"
                );
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use warden_config::DnsProviderKind;

    fn config_with(api_token: Option<&str>, file: Option<&Path>) -> DnsConfig {
        DnsConfig {
            provider: DnsProviderKind::Cloudflare,
            api_token: api_token.map(str::to_string),
            credentials_file: file.map(Path::to_path_buf),
            timeout_secs: 30,
        }
    }

    #[test]
    fn test_inline_token_wins() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "file-token").unwrap();

        let config = config_with(Some("inline-token"), Some(file.path()));
        assert_eq!(resolve_token(&config).unwrap(), "inline-token");
    }

    #[test]
    fn test_blank_inline_token_falls_through_to_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "file-token").unwrap();

        let config = config_with(Some("   "), Some(file.path()));
        assert_eq!(resolve_token(&config).unwrap(), "file-token");
    }

    #[test]
    fn test_no_source_is_an_error() {
        let config = config_with(None, None);
        assert!(resolve_token(&config).is_err());
    }

    #[test]
    fn test_plain_text_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  plain-token  ").unwrap();

        assert_eq!(load_token_file(file.path()).unwrap(), "plain-token");
    }

    #[test]
    fn test_json_token_key() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"token": "json-token"}}"#).unwrap();

        assert_eq!(load_token_file(file.path()).unwrap(), "json-token");
    }

    #[test]
    fn test_json_api_token_key() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"api_token": "api-json-token", "zone": "ignored"}}"#).unwrap();

        assert_eq!(load_token_file(file.path()).unwrap(), "api-json-token");
    }

    #[test]
    fn test_json_without_token_key_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"email": "a@b.c"}}"#).unwrap();

        assert!(load_token_file(file.path()).is_err());
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"token": "unclosed"#).unwrap();

        assert!(load_token_file(file.path()).is_err());
    }

    #[test]
    fn test_empty_file_is_an_error() {
        let file = NamedTempFile::new().unwrap();
        assert!(load_token_file(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_token_file(Path::new("/nonexistent/creds.json")).is_err());
    }
}
