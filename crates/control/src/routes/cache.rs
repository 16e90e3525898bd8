//! Read-through cache of the routes this control plane manages
//!
//! The proxy's live configuration is the source of truth; the cache is
//! rebuilt from it at startup and only ever updated after a successful
//! commit, so it never reflects state that was not durably applied.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use warden_common::{AgentId, BackendName};

/// Kind of traffic a route carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    /// HTTP, host-routed on the public frontend
    Http,
    /// MongoDB over TLS to the agent's backend
    Mongo,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Mongo => "mongodb",
        }
    }
}

/// One managed route
#[derive(Debug, Clone)]
pub struct RouteCacheEntry {
    pub kind: RouteKind,
    pub agent: AgentId,
    /// Host the route answers for: `<subdomain>.<public domain>` for HTTP,
    /// `<agent>.<mongo domain>` for MongoDB
    pub host: String,
    pub backend: BackendName,
    pub target_address: String,
    pub last_updated: DateTime<Utc>,
}

type CacheKey = (String, RouteKind);

/// Keyed container for managed routes, `(agent, kind)` -> entry.
#[derive(Debug, Default)]
pub struct RouteCache {
    entries: RwLock<HashMap<CacheKey, RouteCacheEntry>>,
}

impl RouteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: RouteCacheEntry) {
        let key = (entry.agent.as_str().to_string(), entry.kind);
        self.entries.write().insert(key, entry);
    }

    pub fn get(&self, agent: &AgentId, kind: RouteKind) -> Option<RouteCacheEntry> {
        self.entries
            .read()
            .get(&(agent.as_str().to_string(), kind))
            .cloned()
    }

    /// Remove every entry for an agent; returns the removed entries
    pub fn remove_agent(&self, agent: &AgentId) -> Vec<RouteCacheEntry> {
        let mut entries = self.entries.write();
        let keys: Vec<CacheKey> = entries
            .keys()
            .filter(|(id, _)| id == agent.as_str())
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| entries.remove(&key))
            .collect()
    }

    /// Replace the whole cache with freshly read entries
    pub fn replace_all(&self, new_entries: Vec<RouteCacheEntry>) {
        let mut entries = self.entries.write();
        entries.clear();
        for entry in new_entries {
            entries.insert((entry.agent.as_str().to_string(), entry.kind), entry);
        }
    }

    pub fn entries(&self) -> Vec<RouteCacheEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(agent: &str, kind: RouteKind) -> RouteCacheEntry {
        RouteCacheEntry {
            kind,
            agent: agent.parse().unwrap(),
            host: format!("{}.proxy.example", agent),
            backend: BackendName::new(format!("agent-{}-{}", agent, kind.as_str())),
            target_address: "10.0.0.5:8080".to_string(),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_insert_and_get_by_kind() {
        let cache = RouteCache::new();
        cache.insert(entry("acme-1", RouteKind::Http));
        cache.insert(entry("acme-1", RouteKind::Mongo));

        assert_eq!(cache.len(), 2);
        let agent: AgentId = "acme-1".parse().unwrap();
        assert!(cache.get(&agent, RouteKind::Http).is_some());
        assert!(cache.get(&agent, RouteKind::Mongo).is_some());

        let other: AgentId = "acme-2".parse().unwrap();
        assert!(cache.get(&other, RouteKind::Http).is_none());
    }

    #[test]
    fn test_insert_replaces_same_identity() {
        let cache = RouteCache::new();
        cache.insert(entry("acme-1", RouteKind::Http));
        let mut updated = entry("acme-1", RouteKind::Http);
        updated.target_address = "10.0.0.9:8080".to_string();
        cache.insert(updated);

        assert_eq!(cache.len(), 1);
        let agent: AgentId = "acme-1".parse().unwrap();
        assert_eq!(
            cache.get(&agent, RouteKind::Http).unwrap().target_address,
            "10.0.0.9:8080"
        );
    }

    #[test]
    fn test_remove_agent_clears_all_kinds() {
        let cache = RouteCache::new();
        cache.insert(entry("acme-1", RouteKind::Http));
        cache.insert(entry("acme-1", RouteKind::Mongo));
        cache.insert(entry("acme-2", RouteKind::Http));

        let removed = cache.remove_agent(&"acme-1".parse().unwrap());
        assert_eq!(removed.len(), 2);
        assert_eq!(cache.len(), 1);

        // Idempotent
        assert!(cache.remove_agent(&"acme-1".parse().unwrap()).is_empty());
    }

    #[test]
    fn test_replace_all_discards_previous_state() {
        let cache = RouteCache::new();
        cache.insert(entry("stale", RouteKind::Http));

        cache.replace_all(vec![entry("acme-1", RouteKind::Http)]);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&"stale".parse().unwrap(), RouteKind::Http).is_none());
    }
}
