//! PKI domain error types.

use heron_config::ConfigError;
use heron_remote::RemoteError;

#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("prerequisite failed: {0}")]
    Prerequisite(String),

    #[error("CA not initialized, run `heron setup` first")]
    CaMissing,

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
