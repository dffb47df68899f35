//! Tagged result of one orchestration step.
//!
//! Components report expected per-identity failures as data; only the
//! caller decides whether they are warnings or abort the run.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityFailure {
    pub identity: String,
    pub reason: String,
}

impl IdentityFailure {
    pub fn new(identity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for IdentityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.identity, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Ok,
    Partial(Vec<IdentityFailure>),
    Fatal(String),
}

impl StepOutcome {
    /// `Ok` when nothing failed, `Partial` otherwise.
    pub fn from_failures(failures: Vec<IdentityFailure>) -> Self {
        if failures.is_empty() {
            Self::Ok
        } else {
            Self::Partial(failures)
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn failures(&self) -> &[IdentityFailure] {
        match self {
            Self::Partial(failures) => failures,
            _ => &[],
        }
    }
}
