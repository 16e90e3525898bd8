//! Type-safe identifier newtypes for the Warden control plane.
//!
//! These types provide compile-time safety for identifiers, preventing
//! accidental mixing of different ID types (e.g., passing a backend name
//! where an agent ID is expected).
//!
//! [`AgentId`] is validating: agent identifiers become DNS labels
//! (`<agentId>.<mongoDomain>`) and directory names on disk, so malformed
//! input is rejected here, before any side effect can occur.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::WardenError;

/// Maximum length of a DNS label, which bounds agent identifiers
const MAX_AGENT_ID_LEN: usize = 63;

/// Agent identifier.
///
/// Identifies an onboarded backend agent. The identifier is used as a DNS
/// label and as a filesystem directory name, so it is restricted to
/// lowercase alphanumerics and interior hyphens, at most 63 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub struct AgentId(String);

impl AgentId {
    /// Create a validated agent identifier
    ///
    /// # Errors
    ///
    /// Returns a validation error when the identifier is empty, longer
    /// than 63 characters, contains anything outside `[a-z0-9-]`, or
    /// starts or ends with a hyphen.
    pub fn new(id: impl Into<String>) -> Result<Self, WardenError> {
        let id = id.into();
        if id.is_empty() {
            return Err(WardenError::validation("agent_id", "must not be empty"));
        }
        if id.len() > MAX_AGENT_ID_LEN {
            return Err(WardenError::validation(
                "agent_id",
                format!("must be at most {} characters", MAX_AGENT_ID_LEN),
            ));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(WardenError::validation(
                "agent_id",
                format!("'{}' contains characters outside [a-z0-9-]", id),
            ));
        }
        if id.starts_with('-') || id.ends_with('-') {
            return Err(WardenError::validation(
                "agent_id",
                "must not start or end with a hyphen",
            ));
        }
        Ok(Self(id))
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The agent's fully qualified domain under the given base domain
    pub fn domain_under(&self, base_domain: &str) -> String {
        format!("{}.{}", self.0, base_domain)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for AgentId {
    type Error = WardenError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl std::str::FromStr for AgentId {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Proxy configuration transaction identifier.
///
/// Opaque value assigned by the remote configuration API when a
/// transaction is opened; valid until committed or aborted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend pool name on the proxy.
///
/// Identifies a configured backend in the proxy's configuration. Backends
/// are created and deleted as a unit by the route transaction layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendName(String);

impl BackendName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
