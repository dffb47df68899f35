//! `config.toml` schema, defaults, loading, and validation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use heron_common::paths;

use crate::fleet::{FleetRegistry, Identity};
use crate::ConfigError;

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "HERON_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeronConfig {
    #[serde(default)]
    pub pki: PkiSettings,
    #[serde(default)]
    pub remote: RemoteSettings,
    #[serde(default, rename = "identity")]
    pub identities: Vec<Identity>,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceSpec>,
    #[serde(default, rename = "advisory")]
    pub advisories: Vec<AdvisorySpec>,
    #[serde(default)]
    pub migration: MigrationSettings,
}

/// Key algorithm for the CA and every leaf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    #[default]
    EcdsaP256,
    EcdsaP384,
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EcdsaP256 => f.write_str("ecdsa-p256"),
            Self::EcdsaP384 => f.write_str("ecdsa-p384"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PkiSettings {
    pub cert_dir: Option<PathBuf>,
    pub key_algorithm: KeyAlgorithm,
    pub ca_validity_days: u32,
    pub leaf_validity_days: u32,
    pub renewal_threshold_days: u32,
    pub organization: String,
    pub country: String,
    pub ca_common_name: String,
}

impl Default for PkiSettings {
    fn default() -> Self {
        Self {
            cert_dir: None,
            key_algorithm: KeyAlgorithm::default(),
            ca_validity_days: 3650,
            leaf_validity_days: 365,
            renewal_threshold_days: 30,
            organization: "heron".to_string(),
            country: "US".to_string(),
            ca_common_name: "heron fleet CA".to_string(),
        }
    }
}

impl PkiSettings {
    /// Local certificate directory, falling back to `<data_dir>/certs`.
    pub fn cert_dir(&self) -> PathBuf {
        self.cert_dir
            .clone()
            .unwrap_or_else(paths::heron_certs_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub user: String,
    pub private_key: PathBuf,
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub remote_cert_dir: String,
    pub owner: String,
    pub group: String,
    pub use_sudo: bool,
    /// Host keys are checked strictly against this file.
    pub known_hosts: PathBuf,
    /// Accept host keys missing from `known_hosts`. A key that contradicts
    /// a recorded one is refused regardless.
    pub accept_unknown_host_keys: bool,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            user: "deploy".to_string(),
            private_key: PathBuf::from("~/.ssh/id_ed25519"),
            port: 22,
            connect_timeout_secs: 10,
            remote_cert_dir: "/etc/heron/tls".to_string(),
            owner: "root".to_string(),
            group: "root".to_string(),
            use_sudo: true,
            known_hosts: PathBuf::from("~/.ssh/known_hosts"),
            accept_unknown_host_keys: false,
        }
    }
}

impl RemoteSettings {
    /// Private key path with a leading `~` expanded.
    pub fn private_key_path(&self) -> PathBuf {
        expand_home(&self.private_key)
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        expand_home(&self.known_hosts)
    }
}

/// A service heron is allowed to reconfigure (Redis dialect).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub identity: String,
    /// systemd unit restarted after config edits.
    pub unit: String,
    pub config_path: String,
    #[serde(default = "default_plaintext_port")]
    pub plaintext_port: u16,
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,
    #[serde(default = "default_password_directive")]
    pub password_directive: String,
    /// Environment variable holding the legacy shared secret.
    #[serde(default)]
    pub password_env: Option<String>,
}

impl ServiceSpec {
    /// The legacy shared secret, if the named variable is set.
    pub fn legacy_password(&self) -> Option<String> {
        self.password_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
    }
}

fn default_plaintext_port() -> u16 {
    6379
}

fn default_tls_port() -> u16 {
    6380
}

fn default_password_directive() -> String {
    "requirepass".to_string()
}

/// A service heron only writes advice for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisorySpec {
    pub name: String,
    pub identity: String,
    pub listen_port: u16,
    /// `[[service]]` this one connects to as a client.
    #[serde(default)]
    pub upstream: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    pub service: String,
    pub advisory: Vec<String>,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            service: "redis".to_string(),
            advisory: Vec::new(),
        }
    }
}

impl HeronConfig {
    /// Config path from `HERON_CONFIG`, else `<data_dir>/config.toml`.
    pub fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(paths::heron_config_path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(
            path = %path.display(),
            identities = config.identities.len(),
            services = config.services.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check cross-references and numeric constraints. Every problem is
    /// reported at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let mut names = BTreeSet::new();
        for identity in &self.identities {
            if identity.name.trim().is_empty() {
                problems.push("identity with empty name".to_string());
            } else if !names.insert(identity.name.as_str()) {
                problems.push(format!("identity '{}' is defined twice", identity.name));
            }
            if identity.name.contains(['/', '\\']) || identity.name == ".." {
                problems.push(format!(
                    "identity '{}' is not usable as a directory name",
                    identity.name
                ));
            }
            if identity.address.trim().is_empty() {
                problems.push(format!("identity '{}' has no address", identity.name));
            }
        }

        let pki = &self.pki;
        if pki.leaf_validity_days == 0 {
            problems.push("pki.leaf_validity_days must be positive".to_string());
        }
        if pki.ca_validity_days <= pki.leaf_validity_days {
            problems.push(format!(
                "pki.ca_validity_days ({}) must exceed pki.leaf_validity_days ({})",
                pki.ca_validity_days, pki.leaf_validity_days
            ));
        }
        if pki.renewal_threshold_days >= pki.leaf_validity_days {
            problems.push(format!(
                "pki.renewal_threshold_days ({}) must be below pki.leaf_validity_days ({})",
                pki.renewal_threshold_days, pki.leaf_validity_days
            ));
        }
        if self.remote.port == 0 {
            problems.push("remote.port must be non-zero".to_string());
        }
        if !self.remote.remote_cert_dir.starts_with('/') {
            problems.push("remote.remote_cert_dir must be an absolute path".to_string());
        }

        let mut service_names = BTreeSet::new();
        for service in &self.services {
            if !service_names.insert(service.name.as_str()) {
                problems.push(format!("service '{}' is defined twice", service.name));
            }
            if !names.contains(service.identity.as_str()) {
                problems.push(format!(
                    "service '{}' references unknown identity '{}'",
                    service.name, service.identity
                ));
            }
            if service.plaintext_port == 0 || service.tls_port == 0 {
                problems.push(format!("service '{}' ports must be non-zero", service.name));
            } else if service.plaintext_port == service.tls_port {
                problems.push(format!(
                    "service '{}' plaintext_port and tls_port must differ",
                    service.name
                ));
            }
        }

        for advisory in &self.advisories {
            if !names.contains(advisory.identity.as_str()) {
                problems.push(format!(
                    "advisory '{}' references unknown identity '{}'",
                    advisory.name, advisory.identity
                ));
            }
            if advisory.listen_port == 0 {
                problems.push(format!("advisory '{}' listen_port must be non-zero", advisory.name));
            }
            if let Some(upstream) = &advisory.upstream {
                if !service_names.contains(upstream.as_str()) {
                    problems.push(format!(
                        "advisory '{}' references unknown upstream service '{upstream}'",
                        advisory.name
                    ));
                }
            }
        }

        for name in &self.migration.advisory {
            if self.advisory(name).is_none() {
                problems.push(format!("migration.advisory lists unknown advisory '{name}'"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Build the fleet registry. Validation is expected to have run first.
    pub fn fleet(&self) -> Result<FleetRegistry, ConfigError> {
        FleetRegistry::from_identities(self.identities.iter().cloned())
    }

    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn require_service(&self, name: &str) -> Result<&ServiceSpec, ConfigError> {
        self.service(name)
            .ok_or_else(|| ConfigError::UnknownService(name.to_string()))
    }

    pub fn advisory(&self, name: &str) -> Option<&AdvisorySpec> {
        self.advisories.iter().find(|a| a.name == name)
    }

    /// Services whose certificate belongs to `identity`.
    pub fn services_for<'a>(&'a self, identity: &'a str) -> impl Iterator<Item = &'a ServiceSpec> + 'a {
        self.services.iter().filter(move |s| s.identity == identity)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[pki]
cert_dir = "/tmp/heron-certs"
key_algorithm = "ecdsa-p384"
renewal_threshold_days = 21

[remote]
user = "ops"
private_key = "/keys/ops"

[[identity]]
name = "redis"
address = "10.0.0.5"
sans = ["redis.internal"]

[[identity]]
name = "backend"
address = "10.0.0.2"

[[service]]
name = "redis"
identity = "redis"
unit = "redis-server"
config_path = "/etc/redis/redis.conf"
password_env = "REDIS_PASSWORD"

[[advisory]]
name = "backend"
identity = "backend"
listen_port = 8443
upstream = "redis"

[migration]
advisory = ["backend"]
"#;

    #[test]
    fn sample_parses_with_defaults() {
        let config = HeronConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.pki.key_algorithm, KeyAlgorithm::EcdsaP384);
        assert_eq!(config.pki.renewal_threshold_days, 21);
        assert_eq!(config.pki.leaf_validity_days, 365);
        assert_eq!(config.pki.cert_dir(), PathBuf::from("/tmp/heron-certs"));
        assert_eq!(config.remote.port, 22);
        assert_eq!(config.remote.remote_cert_dir, "/etc/heron/tls");
        assert!(config.remote.use_sudo);
        assert_eq!(config.remote.known_hosts, PathBuf::from("~/.ssh/known_hosts"));
        assert!(!config.remote.accept_unknown_host_keys);

        let redis = config.service("redis").unwrap();
        assert_eq!(redis.plaintext_port, 6379);
        assert_eq!(redis.tls_port, 6380);
        assert_eq!(redis.password_directive, "requirepass");
        assert_eq!(config.migration.service, "redis");
        config.validate().unwrap();
    }

    #[test]
    fn fleet_is_built_from_identities() {
        let config = HeronConfig::from_toml_str(SAMPLE).unwrap();
        let fleet = config.fleet().unwrap();
        assert_eq!(fleet.names(), vec!["backend", "redis"]);
        assert_eq!(fleet.require("redis").unwrap().address, "10.0.0.5");
    }

    #[test]
    fn validation_reports_every_problem() {
        let raw = r#"
[pki]
ca_validity_days = 100
leaf_validity_days = 365
renewal_threshold_days = 400

[[identity]]
name = "redis"
address = "10.0.0.5"

[[identity]]
name = "redis"
address = "10.0.0.6"

[[service]]
name = "redis"
identity = "ghost"
unit = "redis-server"
config_path = "/etc/redis/redis.conf"
tls_port = 6379
"#;
        let config = HeronConfig::from_toml_str(raw).unwrap();
        let ConfigError::Invalid(problems) = config.validate().unwrap_err() else {
            panic!("expected Invalid");
        };
        assert!(problems.iter().any(|p| p.contains("defined twice")));
        assert!(problems.iter().any(|p| p.contains("ca_validity_days")));
        assert!(problems.iter().any(|p| p.contains("renewal_threshold_days")));
        assert!(problems.iter().any(|p| p.contains("unknown identity 'ghost'")));
        assert!(problems.iter().any(|p| p.contains("must differ")));
    }

    #[test]
    fn unknown_upstream_is_rejected() {
        let raw = r#"
[[identity]]
name = "backend"
address = "10.0.0.2"

[[advisory]]
name = "backend"
identity = "backend"
listen_port = 8443
upstream = "redis"
"#;
        let config = HeronConfig::from_toml_str(raw).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unknown upstream service 'redis'"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            HeronConfig::from_toml_str("[pki"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn home_prefix_is_expanded() {
        let remote = RemoteSettings::default();
        let expanded = remote.private_key_path();
        if std::env::var_os("HOME").is_some() {
            assert!(!expanded.starts_with("~"));
            assert!(expanded.ends_with(".ssh/id_ed25519"));
        }
    }

    #[test]
    fn services_for_filters_by_identity() {
        let config = HeronConfig::from_toml_str(SAMPLE).unwrap();
        let names: Vec<_> = config.services_for("redis").map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["redis"]);
        assert_eq!(config.services_for("backend").count(), 0);
    }
}
