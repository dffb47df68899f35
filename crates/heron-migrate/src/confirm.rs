//! Cutover confirmation capability.
//!
//! [`CutoverGate`] exists only after both pre-mutation gates passed and
//! holds the migration lock. Trading it for a [`CutoverConfirmation`]
//! takes the exact phrase; the confirmation is the only way to call
//! `disable_password`. Neither type can be built outside this crate.
//!
//! Obtaining the phrase is the caller's business. The CLI waits on stdin
//! with no timeout, so an operator is never hurried into the irreversible
//! step; a caller that needs a deadline has to impose its own.

use chrono::{DateTime, Utc};

use crate::error::MigrationError;
use crate::lock::MigrationLock;
use crate::report::PhaseReport;

pub const CONFIRMATION_PHRASE: &str = "DISABLE PASSWORD AUTH";

#[derive(Debug)]
pub struct CutoverGate {
    pub(crate) service: String,
    pub(crate) identity: String,
    pub(crate) plaintext_connections: u32,
    pub(crate) opened_at: DateTime<Utc>,
    pub(crate) report: PhaseReport,
    pub(crate) lock: MigrationLock,
}

impl CutoverGate {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn plaintext_connections(&self) -> u32 {
        self.plaintext_connections
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Gate checks that passed.
    pub fn report(&self) -> &PhaseReport {
        &self.report
    }

    /// Exchange the gate for a confirmation. Anything but the exact phrase
    /// drops the gate and its lock.
    pub fn confirm(self, token: &str) -> Result<CutoverConfirmation, MigrationError> {
        if token != CONFIRMATION_PHRASE {
            tracing::warn!(service = %self.service, "Cutover confirmation refused");
            return Err(MigrationError::Confirmation);
        }
        tracing::info!(service = %self.service, "Cutover confirmed by operator");
        Ok(CutoverConfirmation { gate: self })
    }
}

#[derive(Debug)]
pub struct CutoverConfirmation {
    pub(crate) gate: CutoverGate,
}

impl CutoverConfirmation {
    pub fn service(&self) -> &str {
        &self.gate.service
    }
}
