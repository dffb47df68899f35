//! The fleet registry: every named host or service that gets a leaf
//! certificate. Built once from configuration and handed to components
//! by reference; runtime enrollment goes through [`FleetRegistry::enroll`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// A named fleet member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    /// Address used to reach the host over SSH and for listener probes.
    pub address: String,
    /// Subject-Alternative-Name entries. Empty means "name + address".
    #[serde(default)]
    pub sans: Vec<String>,
}

impl Identity {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            sans: Vec::new(),
        }
    }

    pub fn with_sans(mut self, sans: &[&str]) -> Self {
        self.sans = sans.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Effective SAN set. Always covers the name and the address a client
    /// uses to reach this identity, without duplicates.
    pub fn effective_sans(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(self.sans.len() + 2);
        let candidates = std::iter::once(self.name.as_str())
            .chain(std::iter::once(self.address.as_str()))
            .chain(self.sans.iter().map(String::as_str));
        for san in candidates {
            let san = san.trim();
            if !san.is_empty() && !out.iter().any(|s| s == san) {
                out.push(san.to_string());
            }
        }
        out
    }
}

/// Name → identity table, ordered by name so every report is stable.
#[derive(Debug, Clone, Default)]
pub struct FleetRegistry {
    identities: BTreeMap<String, Identity>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_identities(
        identities: impl IntoIterator<Item = Identity>,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for identity in identities {
            registry.enroll(identity)?;
        }
        Ok(registry)
    }

    /// Add a new fleet member. Names are unique.
    pub fn enroll(&mut self, identity: Identity) -> Result<(), ConfigError> {
        if self.identities.contains_key(&identity.name) {
            return Err(ConfigError::DuplicateIdentity(identity.name));
        }
        tracing::debug!(identity = %identity.name, address = %identity.address, "Identity enrolled");
        self.identities.insert(identity.name.clone(), identity);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Identity> {
        self.identities.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Identity, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::UnknownIdentity(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.identities.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.identities.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_sans_include_name_and_address_once() {
        let id = Identity::new("redis", "10.0.0.5").with_sans(&["redis.internal", "10.0.0.5"]);
        assert_eq!(
            id.effective_sans(),
            vec!["redis", "10.0.0.5", "redis.internal"]
        );
    }

    #[test]
    fn effective_sans_skip_blank_entries() {
        let id = Identity::new("api", "api.lan").with_sans(&["", "  "]);
        assert_eq!(id.effective_sans(), vec!["api", "api.lan"]);
    }

    #[test]
    fn enroll_rejects_duplicates() {
        let mut registry = FleetRegistry::new();
        registry.enroll(Identity::new("redis", "10.0.0.5")).unwrap();
        let err = registry
            .enroll(Identity::new("redis", "10.0.0.6"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateIdentity(name) if name == "redis"));
    }

    #[test]
    fn names_are_sorted() {
        let registry = FleetRegistry::from_identities(vec![
            Identity::new("worker", "10.0.0.9"),
            Identity::new("backend", "10.0.0.2"),
            Identity::new("redis", "10.0.0.5"),
        ])
        .unwrap();
        assert_eq!(registry.names(), vec!["backend", "redis", "worker"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn require_reports_unknown_identity() {
        let registry = FleetRegistry::new();
        assert!(matches!(
            registry.require("ghost"),
            Err(ConfigError::UnknownIdentity(_))
        ));
    }
}
