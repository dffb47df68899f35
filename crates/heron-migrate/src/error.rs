//! Migration error types.

use heron_config::ConfigError;
use heron_pki::PkiError;

use crate::phase::MigrationPhase;
use crate::report::PhaseReport;

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("`{action}` is not allowed from phase {phase}{hint}")]
    InvalidPhase {
        action: &'static str,
        phase: MigrationPhase,
        hint: &'static str,
    },

    #[error("migration for {identity} is locked by {holder}; remove the lock file only if that run is gone")]
    Locked { identity: String, holder: String },

    #[error("cutover gate closed")]
    GateClosed(Box<PhaseReport>),

    #[error("confirmation phrase does not match, nothing was changed")]
    Confirmation,

    #[error("confirmation was issued for service '{0}'")]
    WrongService(String),

    #[error("migration state {path} unreadable: {reason}")]
    State { path: String, reason: String },

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
