//! ACME client wrapper around instant-acme
//!
//! Drives the protocol exchange for the wildcard certificate: account
//! bootstrap, order creation with DNS-01 challenges, validation
//! triggering, and finalization.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt, NewAccount, NewOrder,
    Order, OrderStatus,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace};

use warden_config::AcmeConfig;

use crate::pki::keys;

use super::error::AcmeError;
use super::storage::AcmeStorage;

/// Let's Encrypt production directory URL
const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
/// Let's Encrypt staging directory URL
const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Timeout while waiting for certificate issuance
const ISSUANCE_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout while waiting for challenge validation
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(120);

/// A DNS-01 challenge the solver must answer
#[derive(Debug, Clone)]
pub struct DnsChallenge {
    /// Domain the authorization covers, wildcard prefix included
    pub domain: String,
    /// Key authorization; the TXT record value is derived from this
    pub key_authorization: String,
    /// Challenge URL used to trigger validation
    pub url: String,
}

/// ACME protocol driver for the public wildcard certificate
pub struct AcmeClient {
    /// ACME account, initialized on first use
    account: Arc<RwLock<Option<Account>>>,
    config: AcmeConfig,
    storage: Arc<AcmeStorage>,
}

impl AcmeClient {
    pub fn new(config: AcmeConfig, storage: Arc<AcmeStorage>) -> Self {
        Self {
            account: Arc::new(RwLock::new(None)),
            config,
            storage,
        }
    }

    /// The names the wildcard order covers: the apex and its wildcard
    pub fn domains(&self) -> Vec<String> {
        vec![
            self.config.public_domain.clone(),
            format!("*.{}", self.config.public_domain),
        ]
    }

    fn directory_url(&self) -> &str {
        if self.config.staging {
            LETSENCRYPT_STAGING
        } else {
            LETSENCRYPT_PRODUCTION
        }
    }

    /// Load the stored ACME account or register a new one.
    ///
    /// The account key is persisted on first registration and reused for
    /// every later operation. Losing it does not invalidate issued
    /// certificates; it only forces re-registration.
    pub async fn ensure_account(&self) -> Result<(), AcmeError> {
        let mut guard = self.account.write().await;
        if guard.is_some() {
            return Ok(());
        }

        if let Some(credentials) = self.storage.load_account_credentials()? {
            info!("Loading existing ACME account from storage");

            let account = Account::builder()
                .map_err(|e| AcmeError::AccountCreation(e.to_string()))?
                .from_credentials(credentials)
                .await
                .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;

            *guard = Some(account);
            info!("ACME account loaded");
            return Ok(());
        }

        info!(
            email = %self.config.email,
            directory = self.directory_url(),
            "Registering new ACME account"
        );

        let directory = if self.config.staging {
            LetsEncrypt::Staging
        } else {
            LetsEncrypt::Production
        };

        let (account, credentials) = Account::builder()
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?
            .create(
                &NewAccount {
                    contact: &[&format!("mailto:{}", self.config.email)],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                directory.url().to_owned(),
                None,
            )
            .await
            .map_err(|e| AcmeError::AccountCreation(e.to_string()))?;

        self.storage.store_account_credentials(&credentials)?;

        *guard = Some(account);
        info!("ACME account registered");
        Ok(())
    }

    /// Create a wildcard certificate order.
    ///
    /// Returns the order plus one DNS-01 challenge per pending
    /// authorization. Authorizations that are already valid are skipped.
    pub async fn create_dns_order(&self) -> Result<(Order, Vec<DnsChallenge>), AcmeError> {
        self.ensure_account().await?;
        let guard = self.account.read().await;
        let account = guard.as_ref().ok_or_else(|| {
            AcmeError::AccountCreation("account initialization did not complete".to_string())
        })?;

        let domains = self.domains();
        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|d: &String| Identifier::Dns(d.clone()))
            .collect();

        info!(domains = ?domains, "Creating certificate order");

        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| AcmeError::OrderCreation(e.to_string()))?;

        let mut authorizations = order.authorizations();
        let mut challenges = Vec::new();

        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| {
                AcmeError::OrderCreation(format!("Failed to get authorization: {}", e))
            })?;

            let identifier = authz.identifier();
            let domain = match &identifier.identifier {
                Identifier::Dns(domain) => domain.clone(),
                _ => continue,
            };

            debug!(domain = %domain, status = ?authz.status, "Processing authorization");

            if authz.status == AuthorizationStatus::Valid {
                debug!(domain = %domain, "Authorization already valid");
                continue;
            }

            let challenge = authz
                .challenge(ChallengeType::Dns01)
                .ok_or_else(|| AcmeError::NoDns01Challenge(domain.clone()))?;

            let key_authorization = challenge.key_authorization();

            challenges.push(DnsChallenge {
                domain,
                key_authorization: key_authorization.as_str().to_string(),
                url: challenge.url.clone(),
            });
        }

        Ok((order, challenges))
    }

    /// Tell the ACME server a challenge's record is in place.
    ///
    /// Finds the challenge by URL across the order's authorizations and
    /// marks it ready for validation.
    pub async fn trigger_validation(
        &self,
        order: &mut Order,
        challenge_url: &str,
    ) -> Result<(), AcmeError> {
        debug!(challenge_url, "Setting challenge ready");

        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| AcmeError::ChallengeValidation {
                domain: "unknown".to_string(),
                message: format!("Failed to get authorization: {}", e),
            })?;

            let matching_type = authz
                .challenges
                .iter()
                .find(|c| c.url == challenge_url)
                .map(|c| c.r#type.clone());

            if let Some(challenge_type) = matching_type {
                if let Some(mut challenge) = authz.challenge(challenge_type) {
                    challenge
                        .set_ready()
                        .await
                        .map_err(|e| AcmeError::ChallengeValidation {
                            domain: "unknown".to_string(),
                            message: e.to_string(),
                        })?;
                    return Ok(());
                }
            }
        }

        Err(AcmeError::ChallengeValidation {
            domain: "unknown".to_string(),
            message: format!("Challenge not found for URL: {}", challenge_url),
        })
    }

    /// Poll until every challenge is validated and the order is ready
    pub async fn wait_for_order_ready(&self, order: &mut Order) -> Result<(), AcmeError> {
        let deadline = tokio::time::Instant::now() + CHALLENGE_TIMEOUT;

        loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| AcmeError::OrderCreation(format!("Failed to refresh order: {}", e)))?;

            match state.status {
                OrderStatus::Ready => {
                    info!("Order is ready for finalization");
                    return Ok(());
                }
                OrderStatus::Invalid => {
                    error!("Order became invalid");
                    return Err(AcmeError::ChallengeValidation {
                        domain: self.config.public_domain.clone(),
                        message: "order became invalid during validation".to_string(),
                    });
                }
                OrderStatus::Valid => {
                    info!("Order is already valid");
                    return Ok(());
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout(
                            "Timed out waiting for order to become ready".to_string(),
                        ));
                    }
                    trace!(status = ?state.status, "Order not ready yet, waiting");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    /// Finalize the order and download the issued chain.
    ///
    /// Returns `(chain_pem, private_key_pem, not_after)`.
    pub async fn finalize_order(
        &self,
        order: &mut Order,
    ) -> Result<(String, String, DateTime<Utc>), AcmeError> {
        info!("Finalizing certificate order");

        let cert_key = rcgen::KeyPair::generate()
            .map_err(|e| AcmeError::Finalization(format!("Failed to generate key: {}", e)))?;

        let params = rcgen::CertificateParams::new(self.domains())
            .map_err(|e| AcmeError::Finalization(format!("Failed to create CSR params: {}", e)))?;
        let csr = params
            .serialize_request(&cert_key)
            .map_err(|e| AcmeError::Finalization(format!("Failed to serialize CSR: {}", e)))?
            .der()
            .to_vec();

        order
            .finalize_csr(&csr)
            .await
            .map_err(|e| AcmeError::Finalization(format!("Failed to finalize order: {}", e)))?;

        let deadline = tokio::time::Instant::now() + ISSUANCE_TIMEOUT;
        let chain_pem = loop {
            let state = order
                .refresh()
                .await
                .map_err(|e| AcmeError::Finalization(format!("Failed to refresh order: {}", e)))?;

            match state.status {
                OrderStatus::Valid => {
                    let chain = order.certificate().await.map_err(|e| {
                        AcmeError::Finalization(format!("Failed to get certificate: {}", e))
                    })?;
                    break chain.ok_or_else(|| {
                        AcmeError::Finalization("No certificate in response".to_string())
                    })?;
                }
                OrderStatus::Invalid => {
                    return Err(AcmeError::Finalization("Order became invalid".to_string()));
                }
                _ => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(AcmeError::Timeout(
                            "Timed out waiting for certificate".to_string(),
                        ));
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        let key_pem = cert_key.serialize_pem();
        let not_after = keys::certificate_expiry(&chain_pem)
            .map_err(|e| AcmeError::CertificateParse(e.to_string()))?;

        info!(
            domains = ?self.domains(),
            expires = %not_after,
            "Certificate issued"
        );

        Ok((chain_pem, key_pem, not_after))
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("domain", &self.config.public_domain)
            .field("staging", &self.config.staging)
            .field(
                "has_account",
                &self
                    .account
                    .try_read()
                    .map(|a| a.is_some())
                    .unwrap_or(false),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(staging: bool) -> AcmeClient {
        let config = AcmeConfig {
            public_domain: "proxy.example".to_string(),
            email: "ops@example.com".to_string(),
            staging,
            renew_before_days: 30,
            propagation_wait_secs: 60,
        };
        let dir = tempfile::tempdir().unwrap();
        AcmeClient::new(config, Arc::new(AcmeStorage::new(dir.path())))
    }

    #[test]
    fn test_order_covers_apex_and_wildcard() {
        let client = client(true);
        assert_eq!(client.domains(), vec!["proxy.example", "*.proxy.example"]);
    }

    #[test]
    fn test_directory_selection() {
        assert!(client(true).directory_url().contains("staging"));
        assert!(!client(false).directory_url().contains("staging"));
    }
}
