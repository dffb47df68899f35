//! Heron PKI: fleet CA, leaf issuance, distribution, and service TLS.
//!
//! A single self-signed CA on the operator host signs one leaf per fleet
//! identity. Leaves are pushed to their hosts over SSH, verified in place,
//! and wired into service configs as a dual-auth TLS listener. The
//! [`manager::PkiManager`] composes the pieces into staged setup and
//! renewal runs.

pub mod audit;
pub mod ca;
pub mod certfiles;
pub mod configurator;
pub mod distributor;
pub mod error;
pub mod fingerprint;
pub mod generator;
pub mod inspect;
pub mod manager;
pub mod outcome;
pub mod stanza;

pub use audit::AuditLog;
pub use configurator::{ConfigurationResult, ServiceConfigurator};
pub use distributor::{CertificateDistributor, DistributionResult, RemoteVerification};
pub use error::PkiError;
pub use generator::{CertificateGenerator, GenerationReport};
pub use inspect::{CaStatus, CertificateStatus};
pub use manager::{PkiManager, PkiMode, PkiStage, PkiStatus, SetupOptions};
pub use outcome::{IdentityFailure, StepOutcome};
pub use stanza::ClientAuthMode;
