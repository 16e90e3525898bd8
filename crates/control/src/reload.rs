//! Proxy reload signal
//!
//! The proxy only picks up new TLS material on reload, not on live
//! configuration push, so a reload is signaled after any commit or
//! renewal that changed certificates. The signal is an external command
//! (typically a container signal like `docker kill -s HUP proxy`); with
//! no command configured the reload is log-only, for deployments where
//! the proxy watches the certificate files itself.

use tokio::process::Command;
use tracing::{debug, info, warn};

use warden_common::{WardenError, WardenResult};
use warden_config::ReloadConfig;

/// Spawns the configured reload command.
#[derive(Debug, Clone)]
pub struct ProxyReloader {
    command: Option<String>,
    args: Vec<String>,
}

impl ProxyReloader {
    pub fn new(config: &ReloadConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
        }
    }

    /// A reloader that never spawns anything (log-only)
    pub fn disabled() -> Self {
        Self {
            command: None,
            args: Vec::new(),
        }
    }

    /// Signal the proxy to reload.
    ///
    /// # Errors
    ///
    /// Returns an infrastructure error when the command cannot be spawned
    /// or exits nonzero. With no command configured this is a no-op.
    pub async fn reload(&self) -> WardenResult<()> {
        let Some(command) = &self.command else {
            debug!("No reload command configured, skipping proxy reload");
            return Ok(());
        };

        info!(command, args = ?self.args, "Signaling proxy reload");
        let status = Command::new(command)
            .args(&self.args)
            .status()
            .await
            .map_err(|e| {
                WardenError::infrastructure(
                    "proxy reload",
                    format!("Failed to spawn '{}': {}", command, e),
                )
            })?;

        if status.success() {
            info!("Proxy reload signaled");
            Ok(())
        } else {
            warn!(command, %status, "Reload command failed");
            Err(WardenError::infrastructure(
                "proxy reload",
                format!("'{}' exited with {}", command, status),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reloader(command: &str, args: &[&str]) -> ProxyReloader {
        ProxyReloader {
            command: Some(command.to_string()),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_disabled_reload_is_a_no_op() {
        ProxyReloader::disabled().reload().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_command() {
        reloader("true", &[]).reload().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_command_is_an_error() {
        assert!(reloader("false", &[]).reload().await.is_err());
    }

    #[tokio::test]
    async fn test_missing_command_is_an_error() {
        assert!(reloader("/nonexistent/warden-reload", &[])
            .reload()
            .await
            .is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_arguments_are_passed_through() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reloaded");

        reloader("touch", &[marker.to_str().unwrap()])
            .reload()
            .await
            .unwrap();
        assert!(marker.exists());
    }
}
