//! High-level route operations
//!
//! One method per reconciliation intent: route a subdomain's HTTP traffic
//! to an agent, route MongoDB traffic to an agent over TLS, or remove an
//! agent's routes. Each runs as one transaction wrapped in a bounded
//! retry, because transient failures against the configuration API are
//! expected and should not surface as permanent errors.
//!
//! Mutations are idempotent: a backend of the same name is deleted inside
//! the transaction before being recreated, so repeated registration of
//! the same agent converges.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use warden_common::{AgentId, BackendName, RetryPolicy, WardenError, WardenResult};

use crate::reload::ProxyReloader;

use super::api::{Backend, DataplaneApi, HttpRequestRule, Server};
use super::cache::{RouteCache, RouteCacheEntry, RouteKind};
use super::transaction::TransactionCoordinator;

/// Default port when an HTTP target has none
const DEFAULT_HTTP_PORT: u16 = 80;
/// Default port when a MongoDB target has none
const DEFAULT_MONGO_PORT: u16 = 27017;
/// Server name inside each managed backend (one server per backend)
const SERVER_NAME: &str = "srv1";

/// Reconciles routes on the proxy through transactional mutations.
pub struct RouteManager {
    api: Arc<dyn DataplaneApi>,
    coordinator: TransactionCoordinator,
    cache: Arc<RouteCache>,
    reloader: Arc<ProxyReloader>,
    http_frontend: String,
    public_domain: String,
    mongo_domain: String,
    retry: RetryPolicy,
}

impl RouteManager {
    pub fn new(
        api: Arc<dyn DataplaneApi>,
        coordinator: TransactionCoordinator,
        cache: Arc<RouteCache>,
        reloader: Arc<ProxyReloader>,
        http_frontend: impl Into<String>,
        public_domain: impl Into<String>,
        mongo_domain: impl Into<String>,
    ) -> Self {
        Self {
            api,
            coordinator,
            cache,
            reloader,
            http_frontend: http_frontend.into(),
            public_domain: public_domain.into(),
            mongo_domain: mongo_domain.into(),
            retry: RetryPolicy::with_max_attempts(3),
        }
    }

    /// Override the retry policy (tests use a fast one)
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Route HTTP traffic for `<subdomain>.<public domain>` to the
    /// agent's backend at `target`.
    pub async fn add_http_route(
        &self,
        agent: &AgentId,
        subdomain: &str,
        target: &str,
    ) -> WardenResult<()> {
        validate_subdomain(subdomain)?;
        let (address, port) = split_target(target, DEFAULT_HTTP_PORT)?;
        let host = format!("{}.{}", subdomain, self.public_domain);
        let backend = backend_name(agent, RouteKind::Http);

        self.retry
            .run("add http route", || {
                self.apply_http_route(&backend, &host, &address, port)
            })
            .await?;

        self.cache.insert(RouteCacheEntry {
            kind: RouteKind::Http,
            agent: agent.clone(),
            host: host.clone(),
            backend: backend.clone(),
            target_address: format!("{}:{}", address, port),
            last_updated: Utc::now(),
        });
        info!(agent = %agent, host, backend = %backend, "HTTP route installed");
        Ok(())
    }

    /// Route MongoDB traffic for the agent's database domain to `target`
    /// over TLS, verifying the backend against `ca_file`.
    pub async fn add_mongo_route(
        &self,
        agent: &AgentId,
        target: &str,
        ca_file: &Path,
    ) -> WardenResult<()> {
        let (address, port) = split_target(target, DEFAULT_MONGO_PORT)?;
        let backend = backend_name(agent, RouteKind::Mongo);

        self.retry
            .run("add mongo route", || {
                self.apply_mongo_route(&backend, &address, port, ca_file)
            })
            .await?;

        self.cache.insert(RouteCacheEntry {
            kind: RouteKind::Mongo,
            agent: agent.clone(),
            host: agent.domain_under(&self.mongo_domain),
            backend: backend.clone(),
            target_address: format!("{}:{}", address, port),
            last_updated: Utc::now(),
        });
        info!(agent = %agent, backend = %backend, "MongoDB route installed");

        // The committed change referenced TLS material
        if let Err(e) = self.reloader.reload().await {
            warn!(error = %e, "Proxy reload after route commit failed");
        }
        Ok(())
    }

    /// Remove every route for the agent.
    ///
    /// Backends or rules that are already absent are not errors; removal
    /// of an unknown agent is a no-op.
    pub async fn remove_route(&self, agent: &AgentId) -> WardenResult<()> {
        self.retry
            .run("remove route", || self.apply_remove_route(agent))
            .await?;

        let removed = self.cache.remove_agent(agent);
        info!(agent = %agent, removed = removed.len(), "Routes removed");

        if removed.iter().any(|e| e.kind == RouteKind::Mongo) {
            if let Err(e) = self.reloader.reload().await {
                warn!(error = %e, "Proxy reload after route removal failed");
            }
        }
        Ok(())
    }

    /// Rebuild the route cache from the proxy's live configuration.
    ///
    /// Only backends following this manager's naming convention are
    /// picked up; everything else in the proxy configuration is ignored.
    /// Returns the number of routes found.
    pub async fn rebuild_cache(&self) -> WardenResult<usize> {
        let backends = self.api.list_backends().await?;
        let rules = self.api.list_http_request_rules(&self.http_frontend).await?;

        let mut entries = Vec::new();
        for backend in backends {
            let Some((agent, kind)) = parse_backend_name(&backend.name) else {
                continue;
            };

            let servers = self.api.list_servers(&backend.name).await?;
            let target_address = match servers.first() {
                Some(server) => format!("{}:{}", server.address, server.port),
                None => {
                    warn!(backend = %backend.name, "Managed backend has no server, skipping");
                    continue;
                }
            };

            let host = match kind {
                RouteKind::Http => rules
                    .iter()
                    .find(|r| r.backend == backend.name)
                    .and_then(|r| host_from_cond(&r.cond_test))
                    .unwrap_or_else(|| format!("{}.{}", agent, self.public_domain)),
                RouteKind::Mongo => agent.domain_under(&self.mongo_domain),
            };

            entries.push(RouteCacheEntry {
                kind,
                agent,
                host,
                backend: BackendName::new(backend.name),
                target_address,
                last_updated: Utc::now(),
            });
        }

        let count = entries.len();
        self.cache.replace_all(entries);
        info!(routes = count, "Route cache rebuilt from live configuration");
        Ok(count)
    }

    async fn apply_http_route(
        &self,
        backend: &BackendName,
        host: &str,
        address: &str,
        port: u16,
    ) -> WardenResult<()> {
        self.coordinator
            .with_transaction(|tx| async move {
                self.ensure_backend(&tx, backend, "http").await?;
                self.api
                    .create_server(
                        &tx,
                        backend.as_str(),
                        &Server {
                            name: SERVER_NAME.to_string(),
                            address: address.to_string(),
                            port,
                            ssl: None,
                            verify: None,
                            ssl_cafile: None,
                        },
                    )
                    .await?;
                self.replace_host_rule(&tx, backend, host).await
            })
            .await
    }

    async fn apply_mongo_route(
        &self,
        backend: &BackendName,
        address: &str,
        port: u16,
        ca_file: &Path,
    ) -> WardenResult<()> {
        self.coordinator
            .with_transaction(|tx| async move {
                self.ensure_backend(&tx, backend, "tcp").await?;
                self.api
                    .create_server(
                        &tx,
                        backend.as_str(),
                        &Server {
                            name: SERVER_NAME.to_string(),
                            address: address.to_string(),
                            port,
                            ssl: Some("enabled".to_string()),
                            verify: Some("required".to_string()),
                            ssl_cafile: Some(ca_file.display().to_string()),
                        },
                    )
                    .await
            })
            .await
    }

    async fn apply_remove_route(&self, agent: &AgentId) -> WardenResult<()> {
        let http_backend = backend_name(agent, RouteKind::Http);
        let mongo_backend = backend_name(agent, RouteKind::Mongo);

        self.coordinator
            .with_transaction(|tx| async move {
                self.delete_rules_for(&tx, &http_backend).await?;
                self.api.delete_backend(&tx, http_backend.as_str()).await?;
                self.api.delete_backend(&tx, mongo_backend.as_str()).await?;
                Ok(())
            })
            .await
    }

    /// Delete-then-create a backend so repeated registration converges
    async fn ensure_backend(
        &self,
        tx: &warden_common::TransactionId,
        backend: &BackendName,
        mode: &str,
    ) -> WardenResult<()> {
        self.api.delete_backend(tx, backend.as_str()).await?;
        self.api
            .create_backend(
                tx,
                &Backend {
                    name: backend.as_str().to_string(),
                    mode: mode.to_string(),
                },
            )
            .await
    }

    /// Delete every frontend rule pointing at a backend
    async fn delete_rules_for(
        &self,
        tx: &warden_common::TransactionId,
        backend: &BackendName,
    ) -> WardenResult<()> {
        let rules = self
            .api
            .list_http_request_rules(&self.http_frontend)
            .await?;

        // Descending so earlier deletions do not shift later indexes
        let mut stale: Vec<i64> = rules
            .iter()
            .filter(|r| r.backend == backend.as_str())
            .map(|r| r.index)
            .collect();
        stale.sort_unstable_by(|a, b| b.cmp(a));
        for index in stale {
            debug!(backend = %backend, index, "Deleting existing host rule");
            self.api
                .delete_http_request_rule(tx, &self.http_frontend, index)
                .await?;
        }
        Ok(())
    }

    /// Replace the frontend's host rule for a backend
    async fn replace_host_rule(
        &self,
        tx: &warden_common::TransactionId,
        backend: &BackendName,
        host: &str,
    ) -> WardenResult<()> {
        self.delete_rules_for(tx, backend).await?;

        self.api
            .create_http_request_rule(
                tx,
                &self.http_frontend,
                &HttpRequestRule {
                    index: 0,
                    rule_type: "use_backend".to_string(),
                    backend: backend.as_str().to_string(),
                    cond: "if".to_string(),
                    cond_test: format!("{{ hdr(host) -i {} }}", host),
                },
            )
            .await
    }
}

impl std::fmt::Debug for RouteManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteManager")
            .field("http_frontend", &self.http_frontend)
            .field("public_domain", &self.public_domain)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

/// Backend name for an agent and route kind
fn backend_name(agent: &AgentId, kind: RouteKind) -> BackendName {
    let suffix = match kind {
        RouteKind::Http => "http",
        RouteKind::Mongo => "mongo",
    };
    BackendName::new(format!("agent-{}-{}", agent, suffix))
}

/// Recover `(agent, kind)` from a backend following the naming convention
fn parse_backend_name(name: &str) -> Option<(AgentId, RouteKind)> {
    let rest = name.strip_prefix("agent-")?;
    if let Some(id) = rest.strip_suffix("-http") {
        return id.parse().ok().map(|agent| (agent, RouteKind::Http));
    }
    if let Some(id) = rest.strip_suffix("-mongo") {
        return id.parse().ok().map(|agent| (agent, RouteKind::Mongo));
    }
    None
}

/// Extract the host from a `{ hdr(host) -i <host> }` condition
fn host_from_cond(cond_test: &str) -> Option<String> {
    let mut tokens = cond_test
        .trim_matches(|c| c == '{' || c == '}' || c == ' ')
        .split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "-i" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}

fn validate_subdomain(subdomain: &str) -> WardenResult<()> {
    if subdomain.is_empty() {
        return Err(WardenError::validation("subdomain", "must not be empty"));
    }
    if !subdomain
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        || subdomain.starts_with('-')
        || subdomain.ends_with('-')
    {
        return Err(WardenError::validation(
            "subdomain",
            format!("'{}' is not a valid DNS label", subdomain),
        ));
    }
    Ok(())
}

/// Split a `host[:port]` target, applying the default port when absent.
///
/// Rejected before any side effect when empty or carrying an unparseable
/// port.
fn split_target(target: &str, default_port: u16) -> WardenResult<(String, u16)> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err(WardenError::validation("target", "must not be empty"));
    }

    if let Ok(sock) = trimmed.parse::<SocketAddr>() {
        return Ok((sock.ip().to_string(), sock.port()));
    }

    if let Some((host, port)) = trimmed.rsplit_once(':') {
        if !host.is_empty() && !host.contains(':') {
            let port: u16 = port.parse().map_err(|_| {
                WardenError::validation("target", format!("'{}' is not a valid port", port))
            })?;
            return Ok((host.to_string(), port));
        }
    }

    Ok((trimmed.to_string(), default_port))
}

#[cfg(test)]
mod tests {
    use super::super::api::testing::MockDataplane;
    use super::*;

    fn manager_with(api: Arc<MockDataplane>, cache: Arc<RouteCache>) -> RouteManager {
        RouteManager::new(
            api.clone(),
            TransactionCoordinator::new(api, None),
            cache,
            Arc::new(ProxyReloader::disabled()),
            "https-in",
            "proxy.example",
            "mongo.example",
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
        })
    }

    fn agent(id: &str) -> AgentId {
        id.parse().unwrap()
    }

    #[tokio::test]
    async fn test_add_http_route_commits_and_caches() {
        let api = Arc::new(MockDataplane::new());
        let cache = Arc::new(RouteCache::new());
        let manager = manager_with(api.clone(), cache.clone());

        manager
            .add_http_route(&agent("acme-1"), "acme-1", "10.0.0.5:8080")
            .await
            .unwrap();

        assert!(api.has_backend("agent-acme-1-http"));
        assert_eq!(api.call_count("commit"), 1);

        let entry = cache.get(&agent("acme-1"), RouteKind::Http).unwrap();
        assert_eq!(entry.host, "acme-1.proxy.example");
        assert_eq!(entry.target_address, "10.0.0.5:8080");

        // Backend recreation happens inside the transaction
        let calls = api.calls();
        let delete = calls
            .iter()
            .position(|c| c == "delete_backend:agent-acme-1-http")
            .unwrap();
        let create = calls
            .iter()
            .position(|c| c == "create_backend:agent-acme-1-http")
            .unwrap();
        assert!(delete < create);
    }

    #[tokio::test]
    async fn test_add_http_route_is_idempotent() {
        let api = Arc::new(MockDataplane::new());
        let cache = Arc::new(RouteCache::new());
        let manager = manager_with(api.clone(), cache.clone());

        manager
            .add_http_route(&agent("acme-1"), "acme-1", "10.0.0.5:8080")
            .await
            .unwrap();
        manager
            .add_http_route(&agent("acme-1"), "acme-1", "10.0.0.6:8080")
            .await
            .unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(
            cache
                .get(&agent("acme-1"), RouteKind::Http)
                .unwrap()
                .target_address,
            "10.0.0.6:8080"
        );
    }

    #[tokio::test]
    async fn test_mid_mutation_failure_aborts_and_skips_cache() {
        let api = Arc::new(MockDataplane::new());
        api.fail_on("create_rule");
        let cache = Arc::new(RouteCache::new());
        let manager = manager_with(api.clone(), cache.clone());

        let result = manager
            .add_http_route(&agent("acme-1"), "acme-1", "10.0.0.5:8080")
            .await;

        assert!(result.is_err());
        assert_eq!(api.call_count("commit"), 0);
        assert!(api.call_count("abort") >= 1);
        assert!(cache.is_empty(), "cache must never lead the commit");
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_in_a_new_transaction() {
        let api = Arc::new(MockDataplane::new());
        api.fail_transiently("create_backend", 1);
        let cache = Arc::new(RouteCache::new());
        let manager = manager_with(api.clone(), cache.clone());

        manager
            .add_http_route(&agent("acme-1"), "acme-1", "10.0.0.5:8080")
            .await
            .unwrap();

        assert_eq!(api.call_count("begin"), 2);
        assert_eq!(api.call_count("abort"), 1);
        assert_eq!(api.call_count("commit"), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_add_mongo_route_configures_tls_server() {
        let api = Arc::new(MockDataplane::new());
        let cache = Arc::new(RouteCache::new());
        let manager = manager_with(api.clone(), cache.clone());

        manager
            .add_mongo_route(
                &agent("acme-1"),
                "10.0.0.5",
                Path::new("/etc/warden/certs/ca.crt"),
            )
            .await
            .unwrap();

        let servers = api
            .list_servers("agent-acme-1-mongo")
            .await
            .unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].port, 27017);
        assert_eq!(servers[0].ssl.as_deref(), Some("enabled"));
        assert_eq!(servers[0].verify.as_deref(), Some("required"));
        assert_eq!(
            servers[0].ssl_cafile.as_deref(),
            Some("/etc/warden/certs/ca.crt")
        );

        let entry = cache.get(&agent("acme-1"), RouteKind::Mongo).unwrap();
        assert_eq!(entry.host, "acme-1.mongo.example");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mongo_commit_signals_proxy_reload() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("reloaded");
        let api = Arc::new(MockDataplane::new());
        let reloader = ProxyReloader::new(&warden_config::ReloadConfig {
            command: Some("touch".to_string()),
            args: vec![marker.display().to_string()],
        });

        let manager = RouteManager::new(
            api.clone(),
            TransactionCoordinator::new(api, None),
            Arc::new(RouteCache::new()),
            Arc::new(reloader),
            "https-in",
            "proxy.example",
            "mongo.example",
        );

        manager
            .add_mongo_route(&agent("acme-1"), "10.0.0.5", Path::new("/tmp/ca.crt"))
            .await
            .unwrap();
        assert!(marker.exists(), "reload command must run after the commit");
    }

    #[tokio::test]
    async fn test_remove_route_deletes_backends_and_cache() {
        let api = Arc::new(MockDataplane::new());
        let cache = Arc::new(RouteCache::new());
        let manager = manager_with(api.clone(), cache.clone());

        manager
            .add_http_route(&agent("acme-1"), "acme-1", "10.0.0.5:8080")
            .await
            .unwrap();
        manager
            .add_mongo_route(&agent("acme-1"), "10.0.0.5", Path::new("/tmp/ca.crt"))
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);

        manager.remove_route(&agent("acme-1")).await.unwrap();

        assert!(!api.has_backend("agent-acme-1-http"));
        assert!(!api.has_backend("agent-acme-1-mongo"));
        assert!(cache.is_empty());

        // Removing an unknown agent converges quietly
        manager.remove_route(&agent("ghost")).await.unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_cache_from_live_configuration() {
        let api = Arc::new(MockDataplane::new());
        let seed_cache = Arc::new(RouteCache::new());
        let seeder = manager_with(api.clone(), seed_cache);

        seeder
            .add_http_route(&agent("acme-1"), "acme-1", "10.0.0.5:8080")
            .await
            .unwrap();
        seeder
            .add_mongo_route(&agent("acme-2"), "10.0.0.6", Path::new("/tmp/ca.crt"))
            .await
            .unwrap();

        // Fresh manager, empty cache: startup path
        let cache = Arc::new(RouteCache::new());
        let manager = manager_with(api, cache.clone());
        let count = manager.rebuild_cache().await.unwrap();

        assert_eq!(count, 2);
        let http = cache.get(&agent("acme-1"), RouteKind::Http).unwrap();
        assert_eq!(http.host, "acme-1.proxy.example");
        assert_eq!(http.target_address, "10.0.0.5:8080");
        let mongo = cache.get(&agent("acme-2"), RouteKind::Mongo).unwrap();
        assert_eq!(mongo.target_address, "10.0.0.6:27017");
    }

    #[tokio::test]
    async fn test_malformed_inputs_rejected_before_side_effects() {
        let api = Arc::new(MockDataplane::new());
        let cache = Arc::new(RouteCache::new());
        let manager = manager_with(api.clone(), cache);

        assert!(manager
            .add_http_route(&agent("acme-1"), "Bad_Label", "10.0.0.5")
            .await
            .is_err());
        assert!(manager
            .add_http_route(&agent("acme-1"), "acme-1", "")
            .await
            .is_err());
        assert!(manager
            .add_http_route(&agent("acme-1"), "acme-1", "host:notaport")
            .await
            .is_err());
        assert!(api.calls().is_empty(), "no API call before validation");
    }

    #[test]
    fn test_backend_name_round_trip() {
        let id = agent("acme-1");
        for kind in [RouteKind::Http, RouteKind::Mongo] {
            let name = backend_name(&id, kind);
            let (parsed, parsed_kind) = parse_backend_name(name.as_str()).unwrap();
            assert_eq!(parsed, id);
            assert_eq!(parsed_kind, kind);
        }
        assert!(parse_backend_name("static-assets").is_none());
        assert!(parse_backend_name("agent-x-tcp").is_none());
    }

    #[test]
    fn test_host_from_cond() {
        assert_eq!(
            host_from_cond("{ hdr(host) -i acme-1.proxy.example }").as_deref(),
            Some("acme-1.proxy.example")
        );
        assert!(host_from_cond("{ path_beg /api }").is_none());
    }

    #[test]
    fn test_split_target_forms() {
        assert_eq!(
            split_target("10.0.0.5:8080", 80).unwrap(),
            ("10.0.0.5".to_string(), 8080)
        );
        assert_eq!(
            split_target("10.0.0.5", 27017).unwrap(),
            ("10.0.0.5".to_string(), 27017)
        );
        assert_eq!(
            split_target("db.internal:27018", 27017).unwrap(),
            ("db.internal".to_string(), 27018)
        );
        assert_eq!(
            split_target("2001:db8::7", 27017).unwrap(),
            ("2001:db8::7".to_string(), 27017)
        );
        assert_eq!(
            split_target("[2001:db8::7]:443", 80).unwrap(),
            ("2001:db8::7".to_string(), 443)
        );
        assert!(split_target("", 80).is_err());
        assert!(split_target("host:99999", 80).is_err());
    }
}
