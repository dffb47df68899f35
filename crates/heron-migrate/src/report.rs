//! Per-phase reports: a step-by-step trace plus the facts an operator
//! needs next.

use serde::Serialize;

use crate::phase::MigrationPhase;

/// Printed with every cutover outcome.
pub const ROLLBACK_COMMAND: &str = "heron migrate --rollback redis-full";

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: String,
    pub service: String,
    pub success: bool,
    pub state: Option<MigrationPhase>,
    pub steps: Vec<StepResult>,
    /// Established plaintext connections, when the phase counted them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plaintext_connections: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_command: Option<String>,
}

impl PhaseReport {
    pub fn new(phase: &str, service: &str) -> Self {
        Self {
            phase: phase.to_string(),
            service: service.to_string(),
            success: false,
            state: None,
            steps: Vec::new(),
            plaintext_connections: None,
            advisories: Vec::new(),
            next: None,
            rollback_command: None,
        }
    }

    /// Record a step. Returns `ok` so callers can stop on the first failure.
    pub fn step(&mut self, name: &str, ok: bool, detail: impl Into<String>) -> bool {
        let detail = detail.into();
        if ok {
            tracing::info!(phase = %self.phase, step = name, %detail, "Step passed");
        } else {
            tracing::warn!(phase = %self.phase, step = name, %detail, "Step failed");
        }
        self.steps.push(StepResult {
            name: name.to_string(),
            ok,
            detail,
        });
        ok
    }

    pub fn all_ok(&self) -> bool {
        self.steps.iter().all(|s| s.ok)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|s| !s.ok)
    }

    pub(crate) fn with_rollback_command(mut self) -> Self {
        self.rollback_command = Some(ROLLBACK_COMMAND.to_string());
        self
    }
}
