//! Typed client for the proxy configuration API
//!
//! All route mutations go through the remote dataplane API: transactions
//! are opened against a configuration version, mutations reference the
//! transaction, and a commit applies them as one unit. The
//! [`DataplaneApi`] trait is the seam the transaction coordinator and
//! route manager are tested against; [`HttpDataplaneClient`] is the real
//! HTTP implementation.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use warden_common::{TransactionId, WardenError, WardenResult};
use warden_config::DataplaneConfig;

/// Path prefix every endpoint lives under
const API_PREFIX: &str = "/v3/services/haproxy";

/// An open transaction as reported by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub id: String,
    #[serde(rename = "_version")]
    pub version: u64,
    pub status: String,
}

/// A backend definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub name: String,
    /// "http" or "tcp"
    pub mode: String,
}

/// A server attached to a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub address: String,
    pub port: u16,
    /// "enabled" to speak TLS to the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl: Option<String>,
    /// "required" or "none"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<String>,
    /// CA bundle used to verify the backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_cafile: Option<String>,
}

/// A routing rule attached to the HTTP frontend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestRule {
    pub index: i64,
    #[serde(rename = "type")]
    pub rule_type: String,
    pub backend: String,
    pub cond: String,
    pub cond_test: String,
}

/// Remote configuration API surface.
///
/// Deletions of objects that do not exist succeed; mutation callers rely
/// on that for idempotent re-registration.
#[async_trait]
pub trait DataplaneApi: Send + Sync + std::fmt::Debug {
    /// Current configuration version; transactions are opened against it
    async fn configuration_version(&self) -> WardenResult<u64>;

    /// The live configuration as raw text, for backups
    async fn raw_configuration(&self) -> WardenResult<String>;

    async fn list_transactions(&self) -> WardenResult<Vec<TransactionInfo>>;
    async fn begin_transaction(&self, version: u64) -> WardenResult<TransactionInfo>;
    async fn commit_transaction(&self, id: &TransactionId) -> WardenResult<()>;
    async fn abort_transaction(&self, id: &TransactionId) -> WardenResult<()>;

    async fn get_backend(&self, name: &str) -> WardenResult<Option<Backend>>;
    async fn list_backends(&self) -> WardenResult<Vec<Backend>>;
    async fn create_backend(&self, tx: &TransactionId, backend: &Backend) -> WardenResult<()>;
    async fn delete_backend(&self, tx: &TransactionId, name: &str) -> WardenResult<()>;

    async fn list_servers(&self, backend: &str) -> WardenResult<Vec<Server>>;
    async fn create_server(
        &self,
        tx: &TransactionId,
        backend: &str,
        server: &Server,
    ) -> WardenResult<()>;

    async fn list_http_request_rules(&self, frontend: &str) -> WardenResult<Vec<HttpRequestRule>>;
    async fn create_http_request_rule(
        &self,
        tx: &TransactionId,
        frontend: &str,
        rule: &HttpRequestRule,
    ) -> WardenResult<()>;
    async fn delete_http_request_rule(
        &self,
        tx: &TransactionId,
        frontend: &str,
        index: i64,
    ) -> WardenResult<()>;
}

/// Responses for configuration objects arrive wrapped
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// HTTP implementation against the proxy's dataplane endpoint
#[derive(Debug)]
pub struct HttpDataplaneClient {
    client: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpDataplaneClient {
    pub fn new(config: &DataplaneConfig) -> WardenResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                WardenError::infrastructure("dataplane client", format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> WardenResult<reqwest::Response> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    WardenError::infrastructure_retryable(operation, e.to_string())
                } else {
                    WardenError::infrastructure(operation, e.to_string())
                }
            })?;
        trace!(operation, status = %response.status(), "Dataplane response");
        Ok(response)
    }

    /// Map error statuses; version conflicts and server errors are
    /// retryable, the rest are not.
    async fn check(
        &self,
        response: reqwest::Response,
        operation: &'static str,
    ) -> WardenResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(WardenError::protocol(
                operation,
                "dataplane rejected the configured credentials",
            )),
            StatusCode::CONFLICT => Err(WardenError::infrastructure_retryable(
                operation,
                format!("configuration version conflict: {}", body),
            )),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => Err(
                WardenError::infrastructure_retryable(operation, format!("HTTP {}: {}", s, body)),
            ),
            s => Err(WardenError::protocol(
                operation,
                format!("HTTP {}: {}", s, body),
            )),
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
        operation: &'static str,
    ) -> WardenResult<T> {
        response
            .json()
            .await
            .map_err(|e| WardenError::protocol(operation, format!("unexpected response body: {}", e)))
    }
}

#[async_trait]
impl DataplaneApi for HttpDataplaneClient {
    async fn configuration_version(&self) -> WardenResult<u64> {
        let operation = "get configuration version";
        let request = self.client.get(self.url("/configuration/version"));
        let response = self.check(self.send(request, operation).await?, operation).await?;
        self.parse(response, operation).await
    }

    async fn raw_configuration(&self) -> WardenResult<String> {
        let operation = "get raw configuration";
        let request = self.client.get(self.url("/configuration/raw"));
        let response = self.check(self.send(request, operation).await?, operation).await?;
        let envelope: Envelope<String> = self.parse(response, operation).await?;
        Ok(envelope.data)
    }

    async fn list_transactions(&self) -> WardenResult<Vec<TransactionInfo>> {
        let operation = "list transactions";
        let request = self.client.get(self.url("/transactions"));
        let response = self.check(self.send(request, operation).await?, operation).await?;
        self.parse(response, operation).await
    }

    async fn begin_transaction(&self, version: u64) -> WardenResult<TransactionInfo> {
        let operation = "begin transaction";
        let request = self
            .client
            .post(format!("{}?version={}", self.url("/transactions"), version));
        let response = self.check(self.send(request, operation).await?, operation).await?;
        let info: TransactionInfo = self.parse(response, operation).await?;
        debug!(transaction = %info.id, version, "Transaction opened");
        Ok(info)
    }

    async fn commit_transaction(&self, id: &TransactionId) -> WardenResult<()> {
        let operation = "commit transaction";
        let request = self
            .client
            .put(format!("{}/{}", self.url("/transactions"), id));
        self.check(self.send(request, operation).await?, operation).await?;
        debug!(transaction = %id, "Transaction committed");
        Ok(())
    }

    async fn abort_transaction(&self, id: &TransactionId) -> WardenResult<()> {
        let operation = "abort transaction";
        let request = self
            .client
            .delete(format!("{}/{}", self.url("/transactions"), id));
        let response = self.send(request, operation).await?;

        // Already resolved on the remote side is fine
        if response.status() == StatusCode::NOT_FOUND {
            debug!(transaction = %id, "Transaction already gone");
            return Ok(());
        }
        self.check(response, operation).await?;
        debug!(transaction = %id, "Transaction aborted");
        Ok(())
    }

    async fn get_backend(&self, name: &str) -> WardenResult<Option<Backend>> {
        let operation = "get backend";
        let request = self
            .client
            .get(format!("{}/{}", self.url("/configuration/backends"), name));
        let response = self.send(request, operation).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = self.check(response, operation).await?;
        let envelope: Envelope<Backend> = self.parse(response, operation).await?;
        Ok(Some(envelope.data))
    }

    async fn list_backends(&self) -> WardenResult<Vec<Backend>> {
        let operation = "list backends";
        let request = self.client.get(self.url("/configuration/backends"));
        let response = self.check(self.send(request, operation).await?, operation).await?;
        let envelope: Envelope<Vec<Backend>> = self.parse(response, operation).await?;
        Ok(envelope.data)
    }

    async fn create_backend(&self, tx: &TransactionId, backend: &Backend) -> WardenResult<()> {
        let operation = "create backend";
        let request = self
            .client
            .post(format!(
                "{}?transaction_id={}",
                self.url("/configuration/backends"),
                tx
            ))
            .json(backend);
        self.check(self.send(request, operation).await?, operation).await?;
        Ok(())
    }

    async fn delete_backend(&self, tx: &TransactionId, name: &str) -> WardenResult<()> {
        let operation = "delete backend";
        let request = self.client.delete(format!(
            "{}/{}?transaction_id={}",
            self.url("/configuration/backends"),
            name,
            tx
        ));
        let response = self.send(request, operation).await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(backend = name, "Backend already absent");
            return Ok(());
        }
        self.check(response, operation).await?;
        Ok(())
    }

    async fn list_servers(&self, backend: &str) -> WardenResult<Vec<Server>> {
        let operation = "list servers";
        let request = self.client.get(format!(
            "{}?backend={}",
            self.url("/configuration/servers"),
            backend
        ));
        let response = self.check(self.send(request, operation).await?, operation).await?;
        let envelope: Envelope<Vec<Server>> = self.parse(response, operation).await?;
        Ok(envelope.data)
    }

    async fn create_server(
        &self,
        tx: &TransactionId,
        backend: &str,
        server: &Server,
    ) -> WardenResult<()> {
        let operation = "create server";
        let request = self
            .client
            .post(format!(
                "{}?backend={}&transaction_id={}",
                self.url("/configuration/servers"),
                backend,
                tx
            ))
            .json(server);
        self.check(self.send(request, operation).await?, operation).await?;
        Ok(())
    }

    async fn list_http_request_rules(&self, frontend: &str) -> WardenResult<Vec<HttpRequestRule>> {
        let operation = "list http request rules";
        let request = self.client.get(format!(
            "{}?parent_type=frontend&parent_name={}",
            self.url("/configuration/http_request_rules"),
            frontend
        ));
        let response = self.check(self.send(request, operation).await?, operation).await?;
        let envelope: Envelope<Vec<HttpRequestRule>> = self.parse(response, operation).await?;
        Ok(envelope.data)
    }

    async fn create_http_request_rule(
        &self,
        tx: &TransactionId,
        frontend: &str,
        rule: &HttpRequestRule,
    ) -> WardenResult<()> {
        let operation = "create http request rule";
        let request = self
            .client
            .post(format!(
                "{}?parent_type=frontend&parent_name={}&transaction_id={}",
                self.url("/configuration/http_request_rules"),
                frontend,
                tx
            ))
            .json(rule);
        self.check(self.send(request, operation).await?, operation).await?;
        Ok(())
    }

    async fn delete_http_request_rule(
        &self,
        tx: &TransactionId,
        frontend: &str,
        index: i64,
    ) -> WardenResult<()> {
        let operation = "delete http request rule";
        let request = self.client.delete(format!(
            "{}/{}?parent_type=frontend&parent_name={}&transaction_id={}",
            self.url("/configuration/http_request_rules"),
            index,
            frontend,
            tx
        ));
        let response = self.send(request, operation).await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        self.check(response, operation).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// In-memory dataplane with call recording and failure injection
    #[derive(Debug, Default)]
    pub struct MockDataplane {
        calls: Mutex<Vec<String>>,
        backends: Mutex<HashMap<String, Backend>>,
        servers: Mutex<HashMap<String, Vec<Server>>>,
        rules: Mutex<Vec<HttpRequestRule>>,
        open_transactions: Mutex<Vec<TransactionInfo>>,
        next_tx: AtomicU64,
        /// Operations that always fail with a terminal error
        fail_ops: Mutex<HashSet<String>>,
        /// Operations that fail with a retryable error N more times
        transient_failures: Mutex<HashMap<String, u32>>,
    }

    impl MockDataplane {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_on(&self, op: &str) {
            self.fail_ops.lock().insert(op.to_string());
        }

        pub fn fail_transiently(&self, op: &str, times: u32) {
            self.transient_failures.lock().insert(op.to_string(), times);
        }

        /// Pretend another process left a transaction open remotely
        pub fn seed_transaction(&self, id: &str) {
            self.open_transactions.lock().push(TransactionInfo {
                id: id.to_string(),
                version: 1,
                status: "in_progress".to_string(),
            });
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub fn call_count(&self, prefix: &str) -> usize {
            self.calls
                .lock()
                .iter()
                .filter(|c| c.starts_with(prefix))
                .count()
        }

        pub fn has_backend(&self, name: &str) -> bool {
            self.backends.lock().contains_key(name)
        }

        pub fn open_transaction_count(&self) -> usize {
            self.open_transactions.lock().len()
        }

        fn hit(&self, call: String, op: &str) -> WardenResult<()> {
            self.calls.lock().push(call);

            if self.fail_ops.lock().contains(op) {
                return Err(WardenError::protocol("dataplane", "injected failure"));
            }

            let mut transient = self.transient_failures.lock();
            if let Some(remaining) = transient.get_mut(op) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(WardenError::infrastructure_retryable(
                        "dataplane",
                        "injected transient failure",
                    ));
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DataplaneApi for MockDataplane {
        async fn configuration_version(&self) -> WardenResult<u64> {
            self.hit("version".to_string(), "version")?;
            Ok(7)
        }

        async fn raw_configuration(&self) -> WardenResult<String> {
            self.hit("raw".to_string(), "raw")?;
            Ok("global\n  daemon\n".to_string())
        }

        async fn list_transactions(&self) -> WardenResult<Vec<TransactionInfo>> {
            self.hit("list_transactions".to_string(), "list_transactions")?;
            Ok(self.open_transactions.lock().clone())
        }

        async fn begin_transaction(&self, version: u64) -> WardenResult<TransactionInfo> {
            self.hit(format!("begin:v{}", version), "begin")?;
            let info = TransactionInfo {
                id: format!("tx-{}", self.next_tx.fetch_add(1, Ordering::SeqCst)),
                version,
                status: "in_progress".to_string(),
            };
            self.open_transactions.lock().push(info.clone());
            Ok(info)
        }

        async fn commit_transaction(&self, id: &TransactionId) -> WardenResult<()> {
            self.hit(format!("commit:{}", id), "commit")?;
            self.open_transactions
                .lock()
                .retain(|t| t.id != id.as_str());
            Ok(())
        }

        async fn abort_transaction(&self, id: &TransactionId) -> WardenResult<()> {
            self.hit(format!("abort:{}", id), "abort")?;
            self.open_transactions
                .lock()
                .retain(|t| t.id != id.as_str());
            Ok(())
        }

        async fn get_backend(&self, name: &str) -> WardenResult<Option<Backend>> {
            self.hit(format!("get_backend:{}", name), "get_backend")?;
            Ok(self.backends.lock().get(name).cloned())
        }

        async fn list_backends(&self) -> WardenResult<Vec<Backend>> {
            self.hit("list_backends".to_string(), "list_backends")?;
            let mut backends: Vec<Backend> = self.backends.lock().values().cloned().collect();
            backends.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(backends)
        }

        async fn create_backend(&self, _tx: &TransactionId, backend: &Backend) -> WardenResult<()> {
            self.hit(format!("create_backend:{}", backend.name), "create_backend")?;
            self.backends
                .lock()
                .insert(backend.name.clone(), backend.clone());
            Ok(())
        }

        async fn delete_backend(&self, _tx: &TransactionId, name: &str) -> WardenResult<()> {
            self.hit(format!("delete_backend:{}", name), "delete_backend")?;
            self.backends.lock().remove(name);
            self.servers.lock().remove(name);
            Ok(())
        }

        async fn list_servers(&self, backend: &str) -> WardenResult<Vec<Server>> {
            self.hit(format!("list_servers:{}", backend), "list_servers")?;
            Ok(self.servers.lock().get(backend).cloned().unwrap_or_default())
        }

        async fn create_server(
            &self,
            _tx: &TransactionId,
            backend: &str,
            server: &Server,
        ) -> WardenResult<()> {
            self.hit(format!("create_server:{}:{}", backend, server.name), "create_server")?;
            self.servers
                .lock()
                .entry(backend.to_string())
                .or_default()
                .push(server.clone());
            Ok(())
        }

        async fn list_http_request_rules(
            &self,
            frontend: &str,
        ) -> WardenResult<Vec<HttpRequestRule>> {
            self.hit(format!("list_rules:{}", frontend), "list_rules")?;
            Ok(self.rules.lock().clone())
        }

        async fn create_http_request_rule(
            &self,
            _tx: &TransactionId,
            frontend: &str,
            rule: &HttpRequestRule,
        ) -> WardenResult<()> {
            self.hit(format!("create_rule:{}:{}", frontend, rule.backend), "create_rule")?;
            self.rules.lock().push(rule.clone());
            Ok(())
        }

        async fn delete_http_request_rule(
            &self,
            _tx: &TransactionId,
            frontend: &str,
            index: i64,
        ) -> WardenResult<()> {
            self.hit(format!("delete_rule:{}:{}", frontend, index), "delete_rule")?;
            self.rules.lock().retain(|r| r.index != index);
            Ok(())
        }
    }
}
