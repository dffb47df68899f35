//! Heron migrate: staged cutover from shared-secret auth to mTLS.
//!
//! Phases are explicit operator actions over a persisted state machine
//! ([`phase`]). The irreversible step needs a [`confirm::CutoverGate`],
//! which only exists after both readiness gates passed, traded for a
//! [`confirm::CutoverConfirmation`] with the exact phrase.

pub mod confirm;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod phase;
pub mod report;

pub use confirm::{CutoverConfirmation, CutoverGate, CONFIRMATION_PHRASE};
pub use error::MigrationError;
pub use orchestrator::{MigrationOrchestrator, RollbackKind};
pub use phase::{MigrationPhase, MigrationState};
pub use report::{PhaseReport, StepResult, ROLLBACK_COMMAND};
