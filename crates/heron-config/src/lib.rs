//! heron configuration.
//!
//! A single `config.toml` describes the fleet (identities and their
//! addresses), the remote-access credential, cryptographic parameters, the
//! services heron may edit, and the services it only advises on.

pub mod dirs;
pub mod fleet;
pub mod settings;

pub use fleet::{FleetRegistry, Identity};
pub use settings::{
    AdvisorySpec, HeronConfig, KeyAlgorithm, MigrationSettings, PkiSettings, RemoteSettings,
    ServiceSpec,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config.toml: {0}")]
    Parse(String),

    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),

    #[error("duplicate identity: {0}")]
    DuplicateIdentity(String),

    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("unknown service: {0}")]
    UnknownService(String),
}
