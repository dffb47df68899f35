//! Certificate Generator.
//!
//! Creates the CA and one leaf per fleet identity on the operator host.
//! Idempotent: material that still verifies is left alone unless forced.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use heron_config::{FleetRegistry, Identity, PkiSettings};
use heron_remote::TlsMaterial;

use crate::audit::AuditLog;
use crate::ca::{self, CertificateAuthority, IssuedLeaf};
use crate::certfiles::{self, CertLayout};
use crate::error::PkiError;
use crate::inspect::{self, CaStatus, CertificateStatus};
use crate::outcome::{IdentityFailure, StepOutcome};

/// What one generation pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationReport {
    pub ca_created: bool,
    pub issued: Vec<String>,
    pub unchanged: Vec<String>,
    pub failures: Vec<IdentityFailure>,
}

impl GenerationReport {
    pub fn outcome(&self) -> StepOutcome {
        StepOutcome::from_failures(self.failures.clone())
    }
}

pub struct CertificateGenerator {
    settings: PkiSettings,
    layout: CertLayout,
    fleet: Arc<FleetRegistry>,
    audit: AuditLog,
}

impl CertificateGenerator {
    pub fn new(settings: PkiSettings, fleet: Arc<FleetRegistry>, audit: AuditLog) -> Self {
        let layout = CertLayout::new(settings.cert_dir());
        Self {
            settings,
            layout,
            fleet,
            audit,
        }
    }

    pub fn layout(&self) -> &CertLayout {
        &self.layout
    }

    pub fn settings(&self) -> &PkiSettings {
        &self.settings
    }

    /// Generate whatever is missing or no longer verifies.
    ///
    /// A CA failure is an error; per-identity failures are collected in the
    /// report and never stop sibling identities. A newly created CA forces
    /// every leaf to be reissued.
    pub fn generate_all(&self, force: bool) -> Result<GenerationReport, PkiError> {
        let now = Utc::now();
        let mut report = GenerationReport::default();

        let (ca, ca_created) = self.ensure_ca(force, now)?;
        report.ca_created = ca_created;

        for identity in self.fleet.iter() {
            if !force && !ca_created {
                let status = self.leaf_status(&identity.name, Some(ca.cert_der()), now);
                if status.valid {
                    report.unchanged.push(identity.name.clone());
                    continue;
                }
                tracing::info!(
                    identity = %identity.name,
                    reason = status.reason.as_deref().unwrap_or("unknown"),
                    "Leaf needs (re)issue"
                );
            }
            match self.issue(&ca, identity) {
                Ok(_) => report.issued.push(identity.name.clone()),
                Err(e) => {
                    tracing::warn!(identity = %identity.name, error = %e, "Leaf issuance failed");
                    report
                        .failures
                        .push(IdentityFailure::new(&identity.name, e.to_string()));
                }
            }
        }

        tracing::info!(
            ca_created = report.ca_created,
            issued = report.issued.len(),
            unchanged = report.unchanged.len(),
            failed = report.failures.len(),
            "Generation finished"
        );
        Ok(report)
    }

    /// Force-reissue the named leaves with the existing CA.
    pub fn reissue(&self, names: &[String]) -> Result<GenerationReport, PkiError> {
        let ca = CertificateAuthority::load(&self.layout)?;
        let mut report = GenerationReport::default();
        for name in names {
            let Some(identity) = self.fleet.get(name) else {
                report
                    .failures
                    .push(IdentityFailure::new(name, "unknown identity"));
                continue;
            };
            match self.issue(&ca, identity) {
                Ok(_) => report.issued.push(name.clone()),
                Err(e) => report.failures.push(IdentityFailure::new(name, e.to_string())),
            }
        }
        Ok(report)
    }

    fn ensure_ca(
        &self,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<(CertificateAuthority, bool), PkiError> {
        if !force {
            match CertificateAuthority::load(&self.layout) {
                Ok(ca) => {
                    let status = self.ca_status_at(now);
                    if status.valid {
                        return Ok((ca, false));
                    }
                    tracing::warn!(
                        reason = status.reason.as_deref().unwrap_or("unknown"),
                        "Existing CA no longer valid, regenerating"
                    );
                }
                Err(PkiError::CaMissing) => {}
                Err(e) => tracing::warn!(error = %e, "Existing CA unreadable, regenerating"),
            }
        }

        let ca = CertificateAuthority::generate(&self.settings)
            .map_err(|e| PkiError::Generation(format!("CA: {e}")))?;
        ca.save(&self.layout)
            .map_err(|e| PkiError::Generation(format!("writing CA: {e}")))?;

        let fingerprint = ca.fingerprint();
        let algorithm = self.settings.key_algorithm.to_string();
        self.audit.record(
            "ca_created",
            &[("fingerprint", fingerprint.as_str()), ("algorithm", algorithm.as_str())],
        );
        tracing::info!(fingerprint = %fingerprint, "CA created");
        Ok((ca, true))
    }

    fn issue(&self, ca: &CertificateAuthority, identity: &Identity) -> Result<IssuedLeaf, PkiError> {
        let leaf = ca.issue_leaf(identity, &self.settings)?;
        certfiles::write_private(&self.layout.leaf_key(&identity.name), &leaf.key_pem)?;
        certfiles::write_public(&self.layout.leaf_cert(&identity.name), &leaf.cert_pem)?;

        let expires = leaf.not_after.to_rfc3339();
        self.audit.record(
            "leaf_issued",
            &[
                ("identity", identity.name.as_str()),
                ("fingerprint", leaf.fingerprint.as_str()),
                ("expires", expires.as_str()),
            ],
        );
        tracing::info!(identity = %identity.name, expires = %expires, "Leaf issued");
        Ok(leaf)
    }

    pub fn ca_status(&self) -> CaStatus {
        self.ca_status_at(Utc::now())
    }

    pub fn ca_status_at(&self, now: DateTime<Utc>) -> CaStatus {
        inspect::inspect_ca(
            read_optional(&self.layout.ca_cert()).as_deref(),
            read_optional(&self.layout.ca_key()).as_deref(),
            now,
        )
    }

    pub fn status_of(&self, name: &str) -> Result<CertificateStatus, PkiError> {
        self.status_of_at(name, Utc::now())
    }

    pub fn status_of_at(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<CertificateStatus, PkiError> {
        if !self.fleet.contains(name) {
            return Err(PkiError::UnknownIdentity(name.to_string()));
        }
        let ca_der = self.local_ca_der();
        Ok(self.leaf_status(name, ca_der.as_deref(), now))
    }

    /// Status of every identity, in name order.
    pub fn all_statuses_at(&self, now: DateTime<Utc>) -> Vec<CertificateStatus> {
        let ca_der = self.local_ca_der();
        self.fleet
            .iter()
            .map(|identity| self.leaf_status(&identity.name, ca_der.as_deref(), now))
            .collect()
    }

    /// Identities whose leaf is within the renewal threshold (or expired).
    pub fn needs_renewal(&self) -> Vec<String> {
        self.needs_renewal_at(Utc::now())
    }

    pub fn needs_renewal_at(&self, now: DateTime<Utc>) -> Vec<String> {
        self.all_statuses_at(now)
            .into_iter()
            .filter(|s| s.needs_renewal)
            .map(|s| s.identity)
            .collect()
    }

    /// Client-side material for probing `name`'s listeners over mTLS.
    pub fn tls_material(&self, name: &str) -> Result<TlsMaterial, PkiError> {
        Ok(TlsMaterial {
            ca_pem: std::fs::read(self.layout.ca_cert())?,
            cert_pem: std::fs::read(self.layout.leaf_cert(name))?,
            key_pem: std::fs::read(self.layout.leaf_key(name))?,
        })
    }

    /// Confirm the crypto backend can produce keys of the configured kind.
    pub fn self_test(&self) -> Result<(), PkiError> {
        ca::generate_key(self.settings.key_algorithm).map(|_| ())
    }

    fn local_ca_der(&self) -> Option<Vec<u8>> {
        read_optional(&self.layout.ca_cert())
            .and_then(|pem| inspect::pem_to_der(pem.as_bytes()).ok())
    }

    fn leaf_status(
        &self,
        name: &str,
        ca_der: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> CertificateStatus {
        inspect::inspect_leaf(
            name,
            read_optional(&self.layout.leaf_cert(name)).as_deref(),
            read_optional(&self.layout.leaf_key(name)).as_deref(),
            ca_der,
            self.settings.renewal_threshold_days,
            now,
        )
    }
}

fn read_optional(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Could not read certificate file");
            None
        }
    }
}
