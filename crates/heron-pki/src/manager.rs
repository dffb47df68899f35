//! PKI Manager: staged setup and renewal.
//!
//! Stages run INIT → VALIDATION → GENERATION → DISTRIBUTION →
//! CONFIGURATION → VERIFICATION → COMPLETE. Validation and generation
//! problems end the run in FAILED; rollout problems are warnings, so a run
//! can complete while parts of the fleet are offline. Callers check
//! `warnings` to know whether the fleet converged.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use heron_config::{FleetRegistry, HeronConfig, ServiceSpec};
use heron_remote::Connector;

use crate::audit::AuditLog;
use crate::certfiles::RemoteLayout;
use crate::configurator::ServiceConfigurator;
use crate::distributor::CertificateDistributor;
use crate::error::PkiError;
use crate::generator::CertificateGenerator;
use crate::inspect::CertificateStatus;
use crate::outcome::{IdentityFailure, StepOutcome};
use crate::stanza::{self, ClientAuthMode};

const STATUS_FILENAME: &str = "pki-status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PkiStage {
    Init,
    Validation,
    Generation,
    Distribution,
    Configuration,
    Verification,
    Complete,
    Failed,
}

impl fmt::Display for PkiStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Validation => "VALIDATION",
            Self::Generation => "GENERATION",
            Self::Distribution => "DISTRIBUTION",
            Self::Configuration => "CONFIGURATION",
            Self::Verification => "VERIFICATION",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// How the last run was invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PkiMode {
    #[default]
    Idle,
    Full,
    SkipDistribution,
    SkipConfiguration,
    GenerateOnly,
    Renewal,
}

impl fmt::Display for PkiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Full => "full",
            Self::SkipDistribution => "skip_distribution",
            Self::SkipConfiguration => "skip_configuration",
            Self::GenerateOnly => "generate_only",
            Self::Renewal => "renewal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetupOptions {
    pub force: bool,
    pub skip_distribution: bool,
    pub skip_configuration: bool,
}

impl SetupOptions {
    pub fn mode(&self) -> PkiMode {
        match (self.skip_distribution, self.skip_configuration) {
            (false, false) => PkiMode::Full,
            (true, false) => PkiMode::SkipDistribution,
            (false, true) => PkiMode::SkipConfiguration,
            (true, true) => PkiMode::GenerateOnly,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: PkiStage,
    pub at: DateTime<Utc>,
}

/// What a run did. This part of [`PkiStatus`] is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub stage: PkiStage,
    pub mode: PkiMode,
    pub run_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub certs_generated: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub history: Vec<StageEntry>,
}

impl Default for RunRecord {
    fn default() -> Self {
        Self {
            stage: PkiStage::Init,
            mode: PkiMode::Idle,
            run_id: None,
            started_at: None,
            finished_at: None,
            certs_generated: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            history: Vec::new(),
        }
    }
}

impl RunRecord {
    fn begin(mode: PkiMode) -> Self {
        let now = Utc::now();
        Self {
            stage: PkiStage::Init,
            mode,
            run_id: Some(uuid::Uuid::new_v4().to_string()),
            started_at: Some(now),
            history: vec![StageEntry {
                stage: PkiStage::Init,
                at: now,
            }],
            ..Self::default()
        }
    }

    fn enter(&mut self, stage: PkiStage) {
        tracing::info!(run = self.run_id.as_deref().unwrap_or("-"), %stage, "PKI stage");
        self.stage = stage;
        self.history.push(StageEntry {
            stage,
            at: Utc::now(),
        });
    }

    fn warn(&mut self, warning: impl Into<String>) {
        let warning = warning.into();
        tracing::warn!(%warning, "PKI run warning");
        self.warnings.push(warning);
    }

    fn error(&mut self, error: impl Into<String>) {
        let error = error.into();
        tracing::error!(%error, "PKI run error");
        self.errors.push(error);
    }

    /// Generation must be clean. Returns whether the run may continue.
    fn absorb_generation(&mut self, outcome: StepOutcome) -> bool {
        match outcome {
            StepOutcome::Ok => true,
            StepOutcome::Partial(failures) => {
                for failure in failures {
                    self.error(format!("generation {failure}"));
                }
                false
            }
            StepOutcome::Fatal(reason) => {
                self.error(reason);
                false
            }
        }
    }

    /// Rollout problems never stop the run.
    fn absorb_rollout(&mut self, step: &str, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Ok => {}
            StepOutcome::Partial(failures) => {
                for failure in failures {
                    self.warn(format!("{step} {failure}"));
                }
            }
            StepOutcome::Fatal(reason) => self.warn(format!("{step}: {reason}")),
        }
    }
}

/// Status for callers and dashboards. CA and certificate fields are always
/// computed fresh; the rest describes the last run.
#[derive(Debug, Clone, Serialize)]
pub struct PkiStatus {
    pub stage: PkiStage,
    pub mode: PkiMode,
    pub run_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub ca_exists: bool,
    pub ca_valid: bool,
    pub certs_generated: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub identities: Vec<CertificateStatus>,
    pub history: Vec<StageEntry>,
}

pub struct PkiManager {
    fleet: Arc<FleetRegistry>,
    services: Vec<ServiceSpec>,
    connector: Arc<dyn Connector>,
    generator: CertificateGenerator,
    distributor: CertificateDistributor,
    configurator: ServiceConfigurator,
    audit: AuditLog,
    status_path: PathBuf,
    last_run: tokio::sync::Mutex<RunRecord>,
}

impl PkiManager {
    /// Build from configuration. `state_dir` holds the last-run record.
    pub fn new(
        config: &HeronConfig,
        connector: Arc<dyn Connector>,
        audit: AuditLog,
        state_dir: &Path,
    ) -> Result<Self, PkiError> {
        let fleet = Arc::new(config.fleet()?);
        let generator = CertificateGenerator::new(config.pki.clone(), fleet.clone(), audit.clone());
        let distributor = CertificateDistributor::new(
            connector.clone(),
            fleet.clone(),
            generator.layout().clone(),
            &config.remote,
            audit.clone(),
        );
        let configurator = ServiceConfigurator::new(
            connector.clone(),
            fleet.clone(),
            RemoteLayout::new(&config.remote.remote_cert_dir),
            audit.clone(),
        );

        let status_path = state_dir.join(STATUS_FILENAME);
        let last_run = match heron_common::persist::read_json_if_exists(&status_path) {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(path = %status_path.display(), error = %e, "Ignoring unreadable PKI status");
                RunRecord::default()
            }
        };

        Ok(Self {
            fleet,
            services: config.services.clone(),
            connector,
            generator,
            distributor,
            configurator,
            audit,
            status_path,
            last_run: tokio::sync::Mutex::new(last_run),
        })
    }

    pub fn fleet(&self) -> &Arc<FleetRegistry> {
        &self.fleet
    }

    pub fn generator(&self) -> &CertificateGenerator {
        &self.generator
    }

    pub fn distributor(&self) -> &CertificateDistributor {
        &self.distributor
    }

    pub fn configurator(&self) -> &ServiceConfigurator {
        &self.configurator
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Run setup. `true` unless validation or generation failed; rollout
    /// problems land in `warnings`.
    pub async fn setup(&self, options: SetupOptions) -> bool {
        let mut run = RunRecord::begin(options.mode());

        run.enter(PkiStage::Validation);
        if let Err(e) = self.validate() {
            run.error(e.to_string());
            return self.finish(run, PkiStage::Failed).await;
        }

        run.enter(PkiStage::Generation);
        let generated = match self.generator.generate_all(options.force) {
            Ok(report) => {
                run.certs_generated = report.issued.len();
                report.outcome()
            }
            Err(e) => StepOutcome::Fatal(e.to_string()),
        };
        if !run.absorb_generation(generated) {
            return self.finish(run, PkiStage::Failed).await;
        }

        let mut undistributed = BTreeSet::new();
        if !options.skip_distribution {
            run.enter(PkiStage::Distribution);
            let failures: Vec<IdentityFailure> = self
                .distributor
                .distribute_all(&[])
                .await
                .into_values()
                .filter(|r| !r.success)
                .map(|r| IdentityFailure::new(r.identity, r.message))
                .collect();
            undistributed.extend(failures.iter().map(|f| f.identity.clone()));
            run.absorb_rollout("distribution", StepOutcome::from_failures(failures));
        }

        if !options.skip_configuration {
            run.enter(PkiStage::Configuration);
            let configured = self.configure_services(&undistributed).await;
            run.absorb_rollout("configuration", configured);
        }

        if !options.skip_distribution {
            run.enter(PkiStage::Verification);
            let failures = self.distributor.verification_failures().await;
            run.absorb_rollout("verification", StepOutcome::from_failures(failures));
        }

        self.finish(run, PkiStage::Complete).await
    }

    /// Dual-auth TLS on every managed service whose certificates arrived.
    /// Failures are keyed by service name.
    async fn configure_services(&self, undistributed: &BTreeSet<String>) -> StepOutcome {
        let mut failures = Vec::new();
        for service in &self.services {
            if undistributed.contains(&service.identity) {
                failures.push(IdentityFailure::new(
                    &service.name,
                    format!("skipped, certificates not on {}", service.identity),
                ));
                continue;
            }
            let result = self
                .configurator
                .configure_service_tls(service, ClientAuthMode::Optional, false)
                .await;
            if !result.success {
                failures.push(IdentityFailure::new(&service.name, result.message));
                continue;
            }
            if result.restart_required {
                if let Err(e) = self
                    .configurator
                    .restart_service(&service.identity, &service.unit)
                    .await
                {
                    failures.push(IdentityFailure::new(&service.name, format!("restart failed: {e}")));
                }
            }
        }
        StepOutcome::from_failures(failures)
    }

    /// Local prerequisites. Nothing has been mutated when this fails.
    pub fn validate(&self) -> Result<(), PkiError> {
        if self.fleet.is_empty() {
            return Err(PkiError::Prerequisite(
                "no identities configured, add [[identity]] entries".to_string(),
            ));
        }
        self.generator
            .self_test()
            .map_err(|e| PkiError::Prerequisite(format!("crypto backend: {e}")))?;
        self.connector
            .preflight()
            .map_err(|e| PkiError::Prerequisite(format!("remote credential: {e}")))?;
        check_writable(self.generator.layout().root())
    }

    pub async fn status(&self) -> PkiStatus {
        self.status_at(Utc::now()).await
    }

    pub async fn status_at(&self, now: DateTime<Utc>) -> PkiStatus {
        let run = self.last_run.lock().await.clone();
        let ca = self.generator.ca_status_at(now);
        PkiStatus {
            stage: run.stage,
            mode: run.mode,
            run_id: run.run_id,
            started_at: run.started_at,
            finished_at: run.finished_at,
            ca_exists: ca.exists,
            ca_valid: ca.valid,
            certs_generated: run.certs_generated,
            errors: run.errors,
            warnings: run.warnings,
            identities: self.generator.all_statuses_at(now),
            history: run.history,
        }
    }

    pub fn needs_renewal(&self) -> bool {
        !self.generator.needs_renewal().is_empty()
    }

    /// Reissue, redistribute, and reload. An empty list renews whatever is
    /// inside the renewal window.
    pub async fn renew(&self, names: &[String]) -> bool {
        let mut run = RunRecord::begin(PkiMode::Renewal);
        let names = if names.is_empty() {
            self.generator.needs_renewal()
        } else {
            names.to_vec()
        };
        if names.is_empty() {
            tracing::info!("No certificate needs renewal");
            return self.finish(run, PkiStage::Complete).await;
        }

        run.enter(PkiStage::Generation);
        let (reissued, outcome) = match self.generator.reissue(&names) {
            Ok(report) => {
                run.certs_generated = report.issued.len();
                let outcome = report.outcome();
                (report.issued, outcome)
            }
            Err(e) => (Vec::new(), StepOutcome::Fatal(e.to_string())),
        };
        if !run.absorb_generation(outcome) {
            return self.finish(run, PkiStage::Failed).await;
        }

        run.enter(PkiStage::Distribution);
        let mut delivered = BTreeSet::new();
        let mut failures = Vec::new();
        for (name, result) in self.distributor.distribute_many(&reissued).await {
            if result.success {
                delivered.insert(name);
            } else {
                failures.push(IdentityFailure::new(name, result.message));
            }
        }
        run.absorb_rollout("distribution", StepOutcome::from_failures(failures));

        run.enter(PkiStage::Configuration);
        let mut failures = Vec::new();
        for service in self
            .services
            .iter()
            .filter(|s| delivered.contains(&s.identity))
        {
            if let Err(reason) = self.reload_if_tls(service).await {
                failures.push(IdentityFailure::new(&service.name, reason));
            }
        }
        run.absorb_rollout("reload", StepOutcome::from_failures(failures));

        self.finish(run, PkiStage::Complete).await
    }

    /// Restart a service so it picks up new material, if it serves TLS.
    async fn reload_if_tls(&self, service: &ServiceSpec) -> Result<(), String> {
        let config = self
            .configurator
            .read_config(service)
            .await
            .map_err(|e| format!("reading config: {e}"))?;
        if !stanza::has_tls(&config) {
            tracing::debug!(service = %service.name, "No TLS listener, not restarting");
            return Ok(());
        }
        self.configurator
            .restart_service(&service.identity, &service.unit)
            .await
            .map_err(|e| format!("restart failed: {e}"))
    }

    async fn finish(&self, mut run: RunRecord, stage: PkiStage) -> bool {
        run.enter(stage);
        run.finished_at = Some(Utc::now());

        if let Err(e) = heron_common::persist::write_json_pretty(&self.status_path, &run) {
            tracing::warn!(path = %self.status_path.display(), error = %e, "Failed to persist PKI status");
        }

        let event = match run.mode {
            PkiMode::Renewal => "renewal_finished",
            _ => "setup_finished",
        };
        let warnings = run.warnings.len().to_string();
        let errors = run.errors.len().to_string();
        let stage_name = stage.to_string();
        self.audit.record(
            event,
            &[
                ("run", run.run_id.as_deref().unwrap_or("-")),
                ("stage", stage_name.as_str()),
                ("warnings", warnings.as_str()),
                ("errors", errors.as_str()),
            ],
        );

        *self.last_run.lock().await = run;
        stage == PkiStage::Complete
    }
}

fn check_writable(dir: &Path) -> Result<(), PkiError> {
    std::fs::create_dir_all(dir).map_err(|e| {
        PkiError::Prerequisite(format!("certificate directory {}: {e}", dir.display()))
    })?;
    let probe = dir.join(".heron-write-test");
    std::fs::write(&probe, b"ok")
        .and_then(|_| std::fs::remove_file(&probe))
        .map_err(|e| {
            PkiError::Prerequisite(format!("certificate directory {} not writable: {e}", dir.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_options_pick_mode() {
        let mut options = SetupOptions::default();
        assert_eq!(options.mode(), PkiMode::Full);
        options.skip_distribution = true;
        assert_eq!(options.mode(), PkiMode::SkipDistribution);
        options.skip_configuration = true;
        assert_eq!(options.mode(), PkiMode::GenerateOnly);
        options.skip_distribution = false;
        assert_eq!(options.mode(), PkiMode::SkipConfiguration);
    }

    #[test]
    fn stages_are_ordered() {
        assert!(PkiStage::Init < PkiStage::Validation);
        assert!(PkiStage::Verification < PkiStage::Complete);
        assert_eq!(PkiStage::Configuration.to_string(), "CONFIGURATION");
    }

    #[test]
    fn run_record_serializes_stage_names() {
        let mut run = RunRecord::begin(PkiMode::Full);
        run.enter(PkiStage::Validation);
        let json = serde_json::to_string(&run).unwrap();
        assert!(json.contains("\"VALIDATION\""));
        assert!(json.contains("\"full\""));
        let back: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.history.len(), 2);
    }

    #[test]
    fn partial_generation_fails_the_run() {
        let mut run = RunRecord::begin(PkiMode::Full);
        let outcome = StepOutcome::Partial(vec![IdentityFailure::new("api", "disk full")]);
        assert!(!run.absorb_generation(outcome));
        assert_eq!(run.errors, vec!["generation api: disk full".to_string()]);
        assert!(run.absorb_generation(StepOutcome::Ok));
    }

    #[test]
    fn rollout_failures_become_warnings() {
        let mut run = RunRecord::begin(PkiMode::Full);
        let outcome = StepOutcome::Partial(vec![IdentityFailure::new("api", "no route to host")]);
        run.absorb_rollout("distribution", outcome);
        assert_eq!(run.warnings, vec!["distribution api: no route to host".to_string()]);
        assert!(run.errors.is_empty());
    }

    #[test]
    fn unwritable_cert_dir_is_a_prerequisite_error() {
        let dir = heron_common::test::temp_dir("manager-writable");
        let file = dir.join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(check_writable(&file), Err(PkiError::Prerequisite(_))));
        assert!(check_writable(&dir.join("certs")).is_ok());
    }
}
