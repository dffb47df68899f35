//! heron data directory initialization.
//!
//! Ensures the data directory structure exists and contains a commented
//! default `config.toml` if not already present. Called once per CLI run.

use heron_common::paths;

/// Default content for a freshly created config.toml.
pub const DEFAULT_CONFIG_TOML: &str = r#"# heron configuration
#
# Every fleet member that needs a leaf certificate is an [[identity]].
# Services heron may reconfigure are [[service]] entries; services it only
# writes advice for are [[advisory]] entries.

# [pki]
# cert_dir = "/var/lib/heron/certs"
# key_algorithm = "ecdsa-p256"        # or "ecdsa-p384"
# ca_validity_days = 3650
# leaf_validity_days = 365
# renewal_threshold_days = 30
# organization = "heron"
# country = "US"
# ca_common_name = "heron fleet CA"

# [remote]
# user = "deploy"
# private_key = "~/.ssh/id_ed25519"
# port = 22
# connect_timeout_secs = 10
# remote_cert_dir = "/etc/heron/tls"
# owner = "root"
# group = "root"
# use_sudo = true
# known_hosts = "~/.ssh/known_hosts"
# accept_unknown_host_keys = false

# [[identity]]
# name = "redis"
# address = "10.0.0.5"
# sans = ["redis.internal"]

# [[service]]
# name = "redis"
# identity = "redis"
# unit = "redis-server"
# config_path = "/etc/redis/redis.conf"
# plaintext_port = 6379
# tls_port = 6380
# password_directive = "requirepass"
# password_env = "REDIS_PASSWORD"

# [[advisory]]
# name = "backend"
# identity = "backend"
# listen_port = 8443
# upstream = "redis"

# [migration]
# service = "redis"
# advisory = ["backend"]
"#;

/// Ensure the heron data directory structure exists.
///
/// Creates:
/// - the data directory itself
/// - `config.toml` (if not already present)
/// - `certs/`, `state/`, `logs/`
///
/// Errors are logged but not fatal; commands that need a directory report
/// their own error when they touch it.
pub fn ensure_data_dir() {
    let data_dir = paths::heron_data_dir();

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::warn!(
            path = %data_dir.display(),
            error = %e,
            "Could not create data directory"
        );
        return;
    }

    for subdir in &["certs", "state", "logs"] {
        let path = data_dir.join(subdir);
        if let Err(e) = std::fs::create_dir_all(&path) {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not create subdirectory"
            );
        }
    }

    let config_path = data_dir.join("config.toml");
    if !config_path.exists() {
        match std::fs::write(&config_path, DEFAULT_CONFIG_TOML) {
            Ok(()) => tracing::debug!(path = %config_path.display(), "Created default config"),
            Err(e) => tracing::warn!(
                path = %config_path.display(),
                error = %e,
                "Could not write default config"
            ),
        }
    }

    tracing::debug!(path = %data_dir.display(), "Data directory ready");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeronConfig;

    #[test]
    fn default_config_is_valid_toml() {
        let parsed: Result<toml::Value, _> = DEFAULT_CONFIG_TOML.parse();
        assert!(parsed.is_ok(), "Default config.toml should be valid TOML");
    }

    #[test]
    fn uncommented_template_parses() {
        let uncommented: String = DEFAULT_CONFIG_TOML
            .lines()
            .filter(|l| l.starts_with("# [") || (l.starts_with("# ") && l.contains(" = ")))
            .map(|l| l.trim_start_matches("# "))
            .map(|l| l.split("  #").next().unwrap_or(l))
            .collect::<Vec<_>>()
            .join("\n");
        let config = HeronConfig::from_toml_str(&uncommented).unwrap();
        assert_eq!(config.identities.len(), 1);
        assert_eq!(config.services.len(), 1);
    }
}
