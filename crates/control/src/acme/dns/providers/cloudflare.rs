//! Cloudflare DNS provider
//!
//! Manages challenge TXT records through the Cloudflare v4 API.
//! API documentation: <https://developers.cloudflare.com/api/>

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::super::provider::{
    normalize_domain, DnsProvider, DnsProviderError, DnsResult, CHALLENGE_TTL,
};

/// Cloudflare API base URL
const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare DNS provider
#[derive(Debug)]
pub struct CloudflareProvider {
    client: Client,
    token: String,
    base_url: String,
    timeout_secs: u64,
    /// Cache of normalized domain -> owning zone
    zone_cache: RwLock<HashMap<String, Zone>>,
}

impl CloudflareProvider {
    /// Create a provider against the public Cloudflare API
    pub fn new(token: &str, timeout: Duration) -> DnsResult<Self> {
        Self::with_base_url(token, timeout, CLOUDFLARE_API_BASE)
    }

    /// Create a provider against an alternate API endpoint.
    ///
    /// Integration tests point this at a local mock server.
    pub fn with_base_url(token: &str, timeout: Duration, base_url: &str) -> DnsResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            DnsProviderError::Configuration(format!("Failed to create HTTP client: {}", e))
        })?;

        Ok(Self {
            client,
            token: token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs: timeout.as_secs(),
            zone_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Resolve the zone owning a domain, walking up parent names.
    ///
    /// `a.b.example.com` tries `a.b.example.com`, `b.example.com`,
    /// `example.com` in order, querying zones by exact name.
    async fn zone_for(&self, domain: &str) -> DnsResult<Zone> {
        let normalized = normalize_domain(domain);

        if let Some(zone) = self.zone_cache.read().get(normalized) {
            trace!(domain, zone_id = %zone.id, "Zone found in cache");
            return Ok(zone.clone());
        }

        for candidate in zone_candidates(normalized) {
            let mut zones: Vec<Zone> = self
                .get_json(&format!("{}/zones?name={}", self.base_url, candidate), "list zones")
                .await?;
            if let Some(zone) = zones.pop() {
                debug!(domain, zone_id = %zone.id, zone_name = %zone.name, "Found zone for domain");
                self.zone_cache
                    .write()
                    .insert(normalized.to_string(), zone.clone());
                return Ok(zone);
            }
        }

        Err(DnsProviderError::ZoneNotFound {
            domain: normalized.to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        what: &str,
    ) -> DnsResult<T> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| self.transport_error(e, what))?;
        self.read_envelope(response, what).await
    }

    /// Check the HTTP status, then decode the Cloudflare response
    /// envelope and unwrap its `result`.
    async fn read_envelope<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
        what: &str,
    ) -> DnsResult<T> {
        let status = response.status();
        self.check_status(status, &response, what)?;

        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(e, what))?;

        if !status.is_success() {
            return Err(DnsProviderError::ApiRequest(format!(
                "Failed to {}: HTTP {} - {}",
                what, status, body
            )));
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&body).map_err(|e| {
            DnsProviderError::ApiRequest(format!("Failed to parse {} response: {}", what, e))
        })?;

        if !envelope.success {
            return Err(DnsProviderError::ApiRequest(format!(
                "Failed to {}: {}",
                what,
                join_errors(&envelope.errors)
            )));
        }

        envelope.result.ok_or_else(|| {
            DnsProviderError::ApiRequest(format!("{} response carried no result", what))
        })
    }

    fn check_status(
        &self,
        status: StatusCode,
        response: &reqwest::Response,
        what: &str,
    ) -> DnsResult<()> {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(
                DnsProviderError::Authentication(format!("Cloudflare rejected the API token ({})", what)),
            ),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60);
                Err(DnsProviderError::RateLimited { retry_after_secs })
            }
            _ => Ok(()),
        }
    }

    fn transport_error(&self, e: reqwest::Error, what: &str) -> DnsProviderError {
        if e.is_timeout() {
            DnsProviderError::Timeout {
                elapsed_secs: self.timeout_secs,
            }
        } else {
            DnsProviderError::ApiRequest(format!("Failed to {}: {}", what, e))
        }
    }
}

#[async_trait]
impl DnsProvider for CloudflareProvider {
    fn name(&self) -> &'static str {
        "cloudflare"
    }

    async fn create_txt_record(
        &self,
        domain: &str,
        record_name: &str,
        record_value: &str,
    ) -> DnsResult<String> {
        let zone = self.zone_for(domain).await?;
        // Cloudflare takes the fully qualified record name
        let fqdn = format!("{}.{}", record_name, normalize_domain(domain));

        debug!(domain, zone_id = %zone.id, record = %fqdn, "Creating TXT record");

        let request = CreateRecordRequest {
            r#type: "TXT",
            name: fqdn.clone(),
            content: record_value,
            ttl: CHALLENGE_TTL,
        };

        let response = self
            .client
            .post(format!("{}/zones/{}/dns_records", self.base_url, zone.id))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e, "create record"))?;

        let record: DnsRecord = self
            .read_envelope(response, "create record")
            .await
            .map_err(|e| match e {
                DnsProviderError::ApiRequest(message) => DnsProviderError::RecordCreation {
                    record_name: fqdn.clone(),
                    message,
                },
                other => other,
            })?;

        debug!(record_id = %record.id, "TXT record created");
        Ok(record.id)
    }

    async fn delete_txt_record(&self, domain: &str, record_id: &str) -> DnsResult<()> {
        let zone = self.zone_for(domain).await?;

        debug!(record_id, "Deleting TXT record");

        let response = self
            .client
            .delete(format!(
                "{}/zones/{}/dns_records/{}",
                self.base_url, zone.id, record_id
            ))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| self.transport_error(e, "delete record"))?;

        // Already gone is fine; cleanup runs after failed validations too
        if response.status() == StatusCode::NOT_FOUND {
            debug!(record_id, "Record already deleted");
            return Ok(());
        }

        let _: DnsRecord = self
            .read_envelope(response, "delete record")
            .await
            .map_err(|e| match e {
                DnsProviderError::ApiRequest(message) => DnsProviderError::RecordDeletion {
                    record_id: record_id.to_string(),
                    message,
                },
                other => other,
            })?;

        debug!(record_id, "TXT record deleted");
        Ok(())
    }

    async fn find_txt_records(&self, domain: &str, record_name: &str) -> DnsResult<Vec<String>> {
        let zone = self.zone_for(domain).await?;
        let fqdn = format!("{}.{}", record_name, normalize_domain(domain));

        let records: Vec<DnsRecord> = self
            .get_json(
                &format!(
                    "{}/zones/{}/dns_records?type=TXT&name={}",
                    self.base_url, zone.id, fqdn
                ),
                "list records",
            )
            .await?;

        Ok(records.into_iter().map(|r| r.id).collect())
    }
}

/// Candidate zone names for a domain, most specific first.
///
/// Single-label names are not valid zones and are skipped.
fn zone_candidates(domain: &str) -> Vec<String> {
    let mut candidates = Vec::new();
    let mut current = domain;
    loop {
        if current.contains('.') {
            candidates.push(current.to_string());
        } else {
            break;
        }
        match current.split_once('.') {
            Some((_, rest)) => current = rest,
            None => break,
        }
    }
    candidates
}

fn join_errors(errors: &[ApiError]) -> String {
    if errors.is_empty() {
        return "unknown API error".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{} (code {})", e.message, e.code))
        .collect::<Vec<_>>()
        .join("; ")
}

// Cloudflare API types

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    r#type: &'a str,
    name: String,
    content: &'a str,
    ttl: u32,
}
