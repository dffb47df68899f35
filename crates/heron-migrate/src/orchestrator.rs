//! Migration Orchestrator.
//!
//! Runs one managed service from shared-secret auth to enforced mTLS:
//! dual-auth, advisory backend TLS, verify, then the gated and
//! irreversible password cutover. Every remote-mutating phase holds the
//! identity's lock and persists its phase change.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use heron_config::{AdvisorySpec, HeronConfig, ServiceSpec};
use heron_pki::stanza::{self, ClientAuthMode};
use heron_pki::PkiManager;
use heron_remote::{ListenerProbe, ProbeOutcome, ProbeTarget};

use crate::confirm::{CutoverConfirmation, CutoverGate};
use crate::error::MigrationError;
use crate::lock::MigrationLock;
use crate::phase::{MigrationPhase, MigrationState};
use crate::report::{PhaseReport, ROLLBACK_COMMAND};

pub const PHASE_DUAL_AUTH: &str = "redis-dual-auth";
pub const PHASE_BACKEND_TLS: &str = "backend-tls";
pub const PHASE_VERIFY: &str = "verify";
pub const PHASE_DISABLE_PASSWORD: &str = "disable-password";

const BACKUP_STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackKind {
    /// Strip the TLS stanza and return to plaintext plus password.
    /// Certificates stay on the host.
    Partial,
    /// Restore the pre-cutover backup, or rebuild a plaintext-only config.
    Full,
}

impl RollbackKind {
    pub fn action(self) -> &'static str {
        match self {
            Self::Partial => "rollback-redis",
            Self::Full => "rollback-redis-full",
        }
    }
}

pub struct MigrationOrchestrator {
    manager: Arc<PkiManager>,
    probe: Arc<dyn ListenerProbe>,
    service: ServiceSpec,
    advisories: Vec<(AdvisorySpec, Option<ServiceSpec>)>,
    state_dir: PathBuf,
    password: Option<String>,
}

impl MigrationOrchestrator {
    /// Target `[migration].service`. Advisories are those listed under
    /// `[migration].advisory`, or every `[[advisory]]` when the list is empty.
    pub fn new(
        config: &HeronConfig,
        manager: Arc<PkiManager>,
        probe: Arc<dyn ListenerProbe>,
        state_dir: impl Into<PathBuf>,
    ) -> Result<Self, MigrationError> {
        let service = config.require_service(&config.migration.service)?.clone();
        manager.fleet().require(&service.identity)?;

        let chosen: Vec<&AdvisorySpec> = if config.migration.advisory.is_empty() {
            config.advisories.iter().collect()
        } else {
            config
                .migration
                .advisory
                .iter()
                .filter_map(|name| config.advisory(name))
                .collect()
        };
        let advisories = chosen
            .into_iter()
            .map(|a| {
                let upstream = a.upstream.as_deref().and_then(|u| config.service(u)).cloned();
                (a.clone(), upstream)
            })
            .collect();

        let password = service.legacy_password();
        Ok(Self {
            manager,
            probe,
            service,
            advisories,
            state_dir: state_dir.into(),
            password,
        })
    }

    /// Override the legacy secret used by probes while it is still required.
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    pub fn service(&self) -> &ServiceSpec {
        &self.service
    }

    pub fn state(&self) -> Result<MigrationState, MigrationError> {
        MigrationState::load_or_new(&self.state_dir, &self.service.name, &self.service.identity)
    }

    /// Read-only: the CA and every identity's leaf.
    pub fn check_certs(&self) -> PhaseReport {
        let mut report = PhaseReport::new("check-certs", &self.service.name);
        let names = self.manager.fleet().names();
        self.cert_steps(&mut report, &names);
        report.success = report.all_ok();
        report
    }

    /// Phase 1: distribute, add a dual-auth listener, and prove both
    /// listeners answer.
    pub async fn dual_auth(&self) -> Result<PhaseReport, MigrationError> {
        let _lock = self.lock()?;
        let mut state = self.state()?;
        if !state.phase.allows_dual_auth() {
            return Err(MigrationError::InvalidPhase {
                action: PHASE_DUAL_AUTH,
                phase: state.phase,
                hint: "; run `heron migrate --rollback redis-full` first",
            });
        }

        // A backup from an earlier cycle predates whatever changed since.
        state.backup_path = None;

        let mut report = PhaseReport::new(PHASE_DUAL_AUTH, &self.service.name);
        let ok = self.run_dual_auth(&mut report).await;
        let to = if ok {
            MigrationPhase::DualAuthActive
        } else {
            MigrationPhase::Aborted
        };
        self.settle(&mut state, &mut report, to, ok)?;
        if ok {
            report.next = Some(format!("heron migrate --phase {PHASE_VERIFY}"));
        }
        Ok(report)
    }

    async fn run_dual_auth(&self, report: &mut PhaseReport) -> bool {
        let identity = self.service.identity.clone();
        if !self.cert_steps(report, std::slice::from_ref(&identity)) {
            return false;
        }

        let distributed = self.manager.distributor().distribute_to(&identity).await;
        if !report.step("distribute certificates", distributed.success, distributed.message) {
            return false;
        }

        let configured = self
            .manager
            .configurator()
            .configure_service_tls(&self.service, ClientAuthMode::Optional, false)
            .await;
        if !report.step("configure dual-auth listener", configured.success, configured.message) {
            return false;
        }
        if configured.restart_required && !self.restart_step(report).await {
            return false;
        }

        let plaintext = self.probe_plaintext(self.password.as_deref()).await;
        let tls = self.probe_tls(self.password.as_deref()).await;
        let plaintext_ok = report.step("plaintext listener", plaintext.reachable, plaintext.detail);
        let tls_ok = report.step("TLS listener", tls.reachable, tls.detail);
        plaintext_ok && tls_ok
    }

    /// Phase 2: settings for services heron does not edit. Always succeeds.
    pub fn backend_tls(&self) -> PhaseReport {
        let mut report = PhaseReport::new(PHASE_BACKEND_TLS, &self.service.name);
        for (advisory, upstream) in &self.advisories {
            let text = self
                .manager
                .configurator()
                .generate_advisory_config(advisory, upstream.as_ref());
            report.step(
                &format!("advisory {}", advisory.name),
                true,
                "apply the settings below by hand",
            );
            report.advisories.push(text);
        }
        if self.advisories.is_empty() {
            report.step("advisories", true, "no advisory services configured");
        }
        report.success = true;
        report
    }

    /// Phase 3: the readiness gate. Changes nothing remotely.
    pub async fn verify(&self) -> Result<PhaseReport, MigrationError> {
        let _lock = self.lock()?;
        let mut state = self.state()?;
        if !state.phase.allows_verify() {
            return Err(MigrationError::InvalidPhase {
                action: PHASE_VERIFY,
                phase: state.phase,
                hint: "; run `heron migrate --phase redis-dual-auth` first",
            });
        }

        let mut report = PhaseReport::new(PHASE_VERIFY, &self.service.name);
        self.cert_steps(&mut report, &self.manager.fleet().names());

        let failures = self.manager.distributor().verification_failures().await;
        let detail = if failures.is_empty() {
            format!("all {} identities verified", self.manager.fleet().len())
        } else {
            failures
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        };
        report.step("fleet distribution", failures.is_empty(), detail);

        let tls = self.probe_tls(self.password.as_deref()).await;
        report.step("TLS-only connection", tls.reachable, tls.detail);
        self.plaintext_count_step(&mut report).await;

        let ready = report.all_ok();
        let to = if ready {
            MigrationPhase::VerifiedReady
        } else {
            MigrationPhase::DualAuthActive
        };
        self.settle(&mut state, &mut report, to, ready)?;
        if ready {
            report.next = Some(format!("heron migrate --phase {PHASE_DISABLE_PASSWORD}"));
        }
        Ok(report)
    }

    /// Phases 1 to 3. Never enters the cutover.
    pub async fn run_all(&self) -> Result<Vec<PhaseReport>, MigrationError> {
        let first = self.dual_auth().await?;
        if !first.success {
            return Ok(vec![first]);
        }
        let mut reports = vec![first, self.backend_tls()];
        let mut verified = self.verify().await?;
        if verified.success {
            verified.next = Some(format!(
                "heron migrate --phase {PHASE_DISABLE_PASSWORD}  (irreversible; recovery: {ROLLBACK_COMMAND})"
            ));
        }
        reports.push(verified);
        Ok(reports)
    }

    /// Phase 4, first half: both gates, no remote writes. The returned
    /// gate holds the lock until it is confirmed and consumed, or dropped.
    pub async fn prepare_cutover(&self) -> Result<CutoverGate, MigrationError> {
        let lock = self.lock()?;
        let mut state = self.state()?;
        if !state.phase.allows_cutover() {
            return Err(MigrationError::InvalidPhase {
                action: PHASE_DISABLE_PASSWORD,
                phase: state.phase,
                hint: "; run `heron migrate --phase verify` until it reports ready",
            });
        }

        let mut report = PhaseReport::new(PHASE_DISABLE_PASSWORD, &self.service.name)
            .with_rollback_command();
        let count = self.plaintext_count_step(&mut report).await;
        if count == Some(0) {
            let tls = self.probe_tls(self.password.as_deref()).await;
            report.step("TLS-only connection (second gate)", tls.reachable, tls.detail);
        }

        let Some(plaintext_connections) = count.filter(|_| report.all_ok()) else {
            self.settle(&mut state, &mut report, MigrationPhase::Aborted, false)?;
            return Err(MigrationError::GateClosed(Box::new(report)));
        };

        Ok(CutoverGate {
            service: self.service.name.clone(),
            identity: self.service.identity.clone(),
            plaintext_connections,
            opened_at: Utc::now(),
            report,
            lock,
        })
    }

    /// Phase 4, second half. Any failure after confirmation triggers a full
    /// rollback before this returns.
    pub async fn disable_password(
        &self,
        confirmation: CutoverConfirmation,
    ) -> Result<PhaseReport, MigrationError> {
        let gate = confirmation.gate;
        if gate.service != self.service.name {
            return Err(MigrationError::WrongService(gate.service));
        }
        let _lock = gate.lock;
        let mut report = gate.report;
        self.manager.audit().record(
            "cutover_confirmed",
            &[
                ("service", self.service.name.as_str()),
                ("identity", gate.identity.as_str()),
            ],
        );
        let mut state = self.state()?;

        match self.cutover(&mut report, &mut state).await {
            Ok(()) => {
                self.settle(&mut state, &mut report, MigrationPhase::CutoverComplete, true)?;
            }
            Err(reason) => {
                tracing::error!(service = %self.service.name, %reason, "Cutover failed, rolling back");
                let restored = self.full_rollback(&mut report, &state).await;
                report.step(
                    "automatic rollback",
                    restored,
                    if restored {
                        "plaintext listener restored".to_string()
                    } else {
                        format!("incomplete, run `{ROLLBACK_COMMAND}`")
                    },
                );
                let to = if restored {
                    state.backup_path = None;
                    MigrationPhase::RolledBack
                } else {
                    MigrationPhase::Aborted
                };
                self.settle(&mut state, &mut report, to, false)?;
            }
        }
        Ok(report)
    }

    async fn cutover(&self, report: &mut PhaseReport, state: &mut MigrationState) -> Result<(), String> {
        let configurator = self.manager.configurator();
        let stamp = Utc::now().format(BACKUP_STAMP_FORMAT).to_string();

        let backup = configurator
            .backup_config(&self.service, &stamp)
            .await
            .map_err(|e| e.to_string());
        let backup = require(report, "back up config", backup)?;
        state.backup_path = Some(backup);
        if let Err(e) = state.save(&self.state_dir) {
            tracing::warn!(error = %e, "Could not persist backup path");
        }

        let enforced = configurator.stanza_for(&self.service, ClientAuthMode::Required, true);
        let directive = self.service.password_directive.clone();
        let rewritten = configurator
            .rewrite_config(&self.service, move |config| {
                stanza::enforce_mtls(config, &enforced, &directive)
            })
            .await
            .map(|_| {
                format!(
                    "plaintext port disabled, client certificates required, `{}` removed",
                    self.service.password_directive
                )
            })
            .map_err(|e| e.to_string());
        require(report, "rewrite config", rewritten)?;

        let restarted = configurator
            .restart_service(&self.service.identity, &self.service.unit)
            .await
            .map(|_| format!("{} restarted", self.service.unit))
            .map_err(|e| e.to_string());
        require(report, "restart", restarted)?;

        let tls = self.probe_tls(None).await;
        require(report, "TLS-only client after restart", outcome_result(tls))?;

        let plaintext = self.probe_plaintext(None).await;
        let closed = if plaintext.reachable {
            Err(format!("plaintext port still answers: {}", plaintext.detail))
        } else {
            Ok(format!("plaintext port closed ({})", plaintext.detail))
        };
        require(report, "plaintext listener disabled", closed)?;
        Ok(())
    }

    /// Operator-requested rollback, from any phase.
    pub async fn rollback(&self, kind: RollbackKind) -> Result<PhaseReport, MigrationError> {
        let _lock = self.lock()?;
        let mut state = self.state()?;
        let mut report = PhaseReport::new(kind.action(), &self.service.name);
        let ok = match kind {
            RollbackKind::Partial => self.partial_rollback(&mut report, &state).await,
            RollbackKind::Full => self.full_rollback(&mut report, &state).await,
        };
        if ok {
            state.backup_path = None;
            self.settle(&mut state, &mut report, MigrationPhase::RolledBack, true)?;
        } else {
            // Phase stays put so the operator can retry.
            report.state = Some(state.phase);
            report.rollback_command = Some(ROLLBACK_COMMAND.to_string());
            self.audit(kind.action(), state.phase, false);
        }
        Ok(report)
    }

    async fn partial_rollback(&self, report: &mut PhaseReport, state: &MigrationState) -> bool {
        let configurator = self.manager.configurator();

        if state.phase == MigrationPhase::CutoverComplete {
            // The password directive is gone; only the backup has it.
            let backup = match self.usable_backup(state).await {
                Ok(Some(backup)) => backup,
                Ok(None) => {
                    return report.step(
                        "restore pre-cutover config",
                        false,
                        format!("no backup with the password exists, use `{ROLLBACK_COMMAND}`"),
                    );
                }
                Err(e) => return report.step("check backup", false, e),
            };
            let restored = configurator
                .restore_config(&self.service, &backup)
                .await
                .map(|_| format!("restored {backup}"))
                .map_err(|e| e.to_string());
            if require(report, "restore pre-cutover config", restored).is_err() {
                return false;
            }
        }

        let current = match configurator.read_config(&self.service).await {
            Ok(config) => config,
            Err(e) => return report.step("read config", false, e.to_string()),
        };
        let (stripped, found) = stanza::strip(&current);
        if found {
            let written = configurator
                .rewrite_config(&self.service, move |_| stripped)
                .await
                .map(|_| "TLS stanza removed, certificates left in place".to_string())
                .map_err(|e| e.to_string());
            if require(report, "strip TLS stanza", written).is_err() {
                return false;
            }
        } else {
            report.step("strip TLS stanza", true, "no managed TLS stanza present");
        }

        if !self.restart_step(report).await {
            return false;
        }
        let plaintext = self.probe_plaintext(self.password.as_deref()).await;
        report.step("plaintext listener", plaintext.reachable, plaintext.detail)
    }

    async fn full_rollback(&self, report: &mut PhaseReport, state: &MigrationState) -> bool {
        let configurator = self.manager.configurator();

        let backup = match self.usable_backup(state).await {
            Ok(backup) => backup,
            Err(e) => return report.step("check backup", false, e),
        };
        let restored = match backup {
            Some(backup) => configurator
                .restore_config(&self.service, &backup)
                .await
                .map(|_| (format!("restored {backup}"), true)),
            None => {
                let port = self.service.plaintext_port;
                let directive = self.service.password_directive.clone();
                configurator
                    .rewrite_config(&self.service, move |config| {
                        stanza::reconstruct_plaintext(config, port, &directive)
                    })
                    .await
                    .map(|rebuilt| {
                        let directive = &self.service.password_directive;
                        if stanza::directive_value(&rebuilt, directive).is_some() {
                            ("no backup; rebuilt a plaintext-only config".to_string(), true)
                        } else {
                            (
                                format!("no backup; rebuilt a plaintext-only config, set `{directive}` again by hand"),
                                false,
                            )
                        }
                    })
            }
        };
        let password_back = match restored {
            Ok((detail, password_back)) => {
                report.step("restore config", true, detail);
                password_back
            }
            Err(e) => return report.step("restore config", false, e.to_string()),
        };
        if !self.restart_step(report).await {
            return false;
        }

        let password = if password_back {
            self.password.as_deref()
        } else {
            None
        };
        let plaintext = self.probe_plaintext(password).await;
        report.step("plaintext listener", plaintext.reachable, plaintext.detail)
    }

    /// The recorded backup, if it is still on the host. A host that cannot
    /// answer is an error, not a missing backup.
    async fn usable_backup(&self, state: &MigrationState) -> Result<Option<String>, String> {
        let Some(backup) = state.backup_path.as_ref() else {
            return Ok(None);
        };
        match self
            .manager
            .configurator()
            .file_exists(&self.service.identity, backup)
            .await
        {
            Ok(true) => Ok(Some(backup.clone())),
            Ok(false) => {
                tracing::warn!(%backup, "Recorded backup is missing on the host");
                Ok(None)
            }
            Err(e) => Err(format!("checking for {backup}: {e}")),
        }
    }

    fn cert_steps(&self, report: &mut PhaseReport, identities: &[String]) -> bool {
        let generator = self.manager.generator();
        let ca = generator.ca_status();
        let ca_detail = if ca.valid {
            format!("valid, {} days left", ca.days_until_expiry.unwrap_or_default())
        } else {
            ca.reason.clone().unwrap_or_else(|| "missing".to_string())
        };
        let mut ok = report.step("CA", ca.valid, ca_detail);

        for name in identities {
            let (valid, detail) = match generator.status_of(name) {
                Ok(status) if status.valid => {
                    let days = status.days_until_expiry.unwrap_or_default();
                    let due = if status.needs_renewal {
                        ", renewal due: `heron renew`"
                    } else {
                        ""
                    };
                    (true, format!("valid, {days} days left{due}"))
                }
                Ok(status) => (
                    false,
                    status.reason.unwrap_or_else(|| "not valid".to_string()),
                ),
                Err(e) => (false, e.to_string()),
            };
            ok &= report.step(&format!("certificate {name}"), valid, detail);
        }
        ok
    }

    async fn restart_step(&self, report: &mut PhaseReport) -> bool {
        let restarted = self
            .manager
            .configurator()
            .restart_service(&self.service.identity, &self.service.unit)
            .await
            .map(|_| format!("{} restarted", self.service.unit))
            .map_err(|e| e.to_string());
        require(report, "restart", restarted).is_ok()
    }

    /// Count plaintext connections; a passing step needs exactly zero.
    async fn plaintext_count_step(&self, report: &mut PhaseReport) -> Option<u32> {
        let port = self.service.plaintext_port;
        match self
            .manager
            .configurator()
            .established_connections(&self.service.identity, port)
            .await
        {
            Ok(count) => {
                report.plaintext_connections = Some(count);
                report.step(
                    "plaintext connections",
                    count == 0,
                    format!("{count} established on port {port}"),
                );
                Some(count)
            }
            Err(e) => {
                report.step("plaintext connections", false, e.to_string());
                None
            }
        }
    }

    async fn probe_plaintext(&self, password: Option<&str>) -> ProbeOutcome {
        match self.probe_target(self.service.plaintext_port, password) {
            Ok(target) => self.probe.plaintext(&target).await,
            Err(e) => ProbeOutcome::failed(e.to_string()),
        }
    }

    /// Connect over TLS presenting the service identity's own leaf.
    async fn probe_tls(&self, password: Option<&str>) -> ProbeOutcome {
        let target = match self.probe_target(self.service.tls_port, password) {
            Ok(target) => target,
            Err(e) => return ProbeOutcome::failed(e.to_string()),
        };
        match self.manager.generator().tls_material(&self.service.identity) {
            Ok(material) => self.probe.tls(&target, &material).await,
            Err(e) => ProbeOutcome::failed(format!("client material: {e}")),
        }
    }

    fn probe_target(&self, port: u16, password: Option<&str>) -> Result<ProbeTarget, MigrationError> {
        let identity = self.manager.fleet().require(&self.service.identity)?;
        Ok(ProbeTarget {
            identity: identity.name.clone(),
            address: identity.address.clone(),
            port,
            password: password.map(String::from),
        })
    }

    fn lock(&self) -> Result<MigrationLock, MigrationError> {
        MigrationLock::acquire(&self.state_dir, &self.service.identity)
    }

    /// Record the phase change, persist it, and stamp the report.
    fn settle(
        &self,
        state: &mut MigrationState,
        report: &mut PhaseReport,
        to: MigrationPhase,
        success: bool,
    ) -> Result<(), MigrationError> {
        let note = report
            .failed_steps()
            .next()
            .map(|s| format!("{}: {}", s.name, s.detail));
        state.transition(to, &report.phase, note);
        state.save(&self.state_dir)?;
        report.success = success;
        report.state = Some(to);
        self.audit(&report.phase, to, success);
        Ok(())
    }

    fn audit(&self, action: &str, phase: MigrationPhase, success: bool) {
        let event = match action {
            PHASE_DISABLE_PASSWORD if success => "cutover_complete",
            PHASE_DISABLE_PASSWORD => "cutover_failed",
            a if a.starts_with("rollback") => "rollback",
            _ => "migration_phase",
        };
        let phase = phase.to_string();
        self.manager.audit().record(
            event,
            &[
                ("service", self.service.name.as_str()),
                ("action", action),
                ("phase", phase.as_str()),
                ("result", if success { "ok" } else { "failed" }),
            ],
        );
    }
}

/// Record `result` as a step and pass the failure on.
fn require(report: &mut PhaseReport, name: &str, result: Result<String, String>) -> Result<String, String> {
    match result {
        Ok(detail) => {
            report.step(name, true, detail.clone());
            Ok(detail)
        }
        Err(e) => {
            report.step(name, false, e.clone());
            Err(format!("{name}: {e}"))
        }
    }
}

fn outcome_result(outcome: ProbeOutcome) -> Result<String, String> {
    if outcome.reachable {
        Ok(outcome.detail)
    } else {
        Err(outcome.detail)
    }
}
