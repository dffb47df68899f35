//! Migration phases and their persisted state.
//!
//! ```text
//! dual-auth-pending ─▶ dual-auth-active ─▶ verified-ready ─▶ cutover-complete
//!        │                  ▲    │              │
//!        └── aborted ◀──────┴────┴──────────────┘        (any) ─▶ rolled-back
//! ```
//!
//! Nothing advances on its own; every transition is an operator action.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MigrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationPhase {
    DualAuthPending,
    DualAuthActive,
    VerifiedReady,
    CutoverComplete,
    RolledBack,
    Aborted,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DualAuthPending => "dual-auth-pending",
            Self::DualAuthActive => "dual-auth-active",
            Self::VerifiedReady => "verified-ready",
            Self::CutoverComplete => "cutover-complete",
            Self::RolledBack => "rolled-back",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

impl MigrationPhase {
    pub fn allows_dual_auth(self) -> bool {
        self != Self::CutoverComplete
    }

    pub fn allows_verify(self) -> bool {
        matches!(self, Self::DualAuthActive | Self::VerifiedReady)
    }

    pub fn allows_cutover(self) -> bool {
        self == Self::VerifiedReady
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: MigrationPhase,
    pub to: MigrationPhase,
    pub action: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Persisted at `<state_dir>/migration-<service>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationState {
    pub service: String,
    pub identity: String,
    pub phase: MigrationPhase,
    /// Pre-cutover config copy on the host, once one exists.
    pub backup_path: Option<String>,
    pub history: Vec<PhaseTransition>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationState {
    pub fn new(service: &str, identity: &str) -> Self {
        Self {
            service: service.to_string(),
            identity: identity.to_string(),
            phase: MigrationPhase::DualAuthPending,
            backup_path: None,
            history: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn path(state_dir: &Path, service: &str) -> PathBuf {
        state_dir.join(format!("migration-{service}.json"))
    }

    /// Stored state, or a fresh `dual-auth-pending` one.
    pub fn load_or_new(state_dir: &Path, service: &str, identity: &str) -> Result<Self, MigrationError> {
        let path = Self::path(state_dir, service);
        let stored: Option<Self> = heron_common::persist::read_json_if_exists(&path)
            .map_err(|e| MigrationError::State {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(stored.unwrap_or_else(|| Self::new(service, identity)))
    }

    pub fn save(&self, state_dir: &Path) -> Result<(), MigrationError> {
        heron_common::persist::write_json_pretty(&Self::path(state_dir, &self.service), self)?;
        Ok(())
    }

    pub fn transition(&mut self, to: MigrationPhase, action: &str, note: Option<String>) {
        let now = Utc::now();
        tracing::info!(service = %self.service, from = %self.phase, %to, action, "Migration phase change");
        self.history.push(PhaseTransition {
            from: self.phase,
            to,
            action: action.to_string(),
            at: now,
            note,
        });
        self.phase = to;
        self.updated_at = now;
    }
}
