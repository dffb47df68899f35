use std::path::PathBuf;
use std::sync::Arc;

use heron_config::HeronConfig;
use heron_migrate::{
    MigrationError, MigrationOrchestrator, MigrationPhase, RollbackKind, CONFIRMATION_PHRASE,
    ROLLBACK_COMMAND,
};
use heron_pki::stanza;
use heron_pki::{AuditLog, PkiManager, SetupOptions};
use heron_remote::fake::{FakeFleet, FakeProbe};
use heron_remote::{ListenerProbe, ProbeTarget};

const FLEET: &str = r#"
[[identity]]
name = "redis"
address = "10.0.0.5"

[[identity]]
name = "api"
address = "10.0.0.6"

[[service]]
name = "redis"
identity = "redis"
unit = "redis-server"
config_path = "/etc/redis/redis.conf"

[[advisory]]
name = "api"
identity = "api"
listen_port = 8443
upstream = "redis"
"#;

const CONF_PATH: &str = "/etc/redis/redis.conf";
const REDIS_CONF: &str = "bind 0.0.0.0\nport 6379\nrequirepass s3cret\n";
const PASSWORD: &str = "s3cret";

struct Harness {
    dir: PathBuf,
    config: HeronConfig,
    fake: FakeFleet,
    manager: Arc<PkiManager>,
    orchestrator: MigrationOrchestrator,
}

impl Harness {
    fn new(prefix: &str) -> Self {
        let dir = heron_common::test::temp_dir(prefix);
        let mut config = HeronConfig::from_toml_str(FLEET).unwrap();
        config.pki.cert_dir = Some(dir.join("certs"));
        config.validate().unwrap();

        let fake = FakeFleet::new();
        fake.add_host("redis", "10.0.0.5");
        fake.add_host("api", "10.0.0.6");
        fake.add_service("redis", "redis-server", CONF_PATH, REDIS_CONF);

        let manager = Arc::new(
            PkiManager::new(
                &config,
                Arc::new(fake.connector()),
                AuditLog::at(dir.join("audit.log")),
                &dir.join("state"),
            )
            .unwrap(),
        );
        let orchestrator = MigrationOrchestrator::new(
            &config,
            manager.clone(),
            Arc::new(fake.probe()),
            dir.join("state"),
        )
        .unwrap()
        .with_password(Some(PASSWORD.to_string()));

        Self {
            dir,
            config,
            fake,
            manager,
            orchestrator,
        }
    }

    /// Certificates generated locally only; hosts untouched.
    async fn with_certificates(prefix: &str) -> Self {
        let h = Self::new(prefix);
        let local = SetupOptions {
            skip_distribution: true,
            skip_configuration: true,
            ..SetupOptions::default()
        };
        assert!(h.manager.setup(local).await);
        h
    }

    /// Full PKI setup, dual-auth, and a passing verify.
    async fn verified(prefix: &str) -> Self {
        let h = Self::new(prefix);
        assert!(h.manager.setup(SetupOptions::default()).await);
        assert!(h.orchestrator.dual_auth().await.unwrap().success);
        let verified = h.orchestrator.verify().await.unwrap();
        assert!(verified.success, "{:?}", verified.steps);
        h
    }

    /// A second orchestrator over the same state, probing with `password`.
    fn orchestrator_with_password(&self, password: &str) -> MigrationOrchestrator {
        MigrationOrchestrator::new(
            &self.config,
            self.manager.clone(),
            Arc::new(self.fake.probe()),
            self.dir.join("state"),
        )
        .unwrap()
        .with_password(Some(password.to_string()))
    }

    fn probe(&self) -> FakeProbe {
        self.fake.probe()
    }

    fn target(&self, port: u16, password: Option<&str>) -> ProbeTarget {
        ProbeTarget {
            identity: "redis".into(),
            address: "10.0.0.5".into(),
            port,
            password: password.map(String::from),
        }
    }

    async fn plaintext_answers(&self, password: Option<&str>) -> bool {
        self.probe().plaintext(&self.target(6379, password)).await.reachable
    }

    async fn tls_answers(&self, password: Option<&str>) -> bool {
        let material = self.manager.generator().tls_material("redis").unwrap();
        self.probe().tls(&self.target(6380, password), &material).await.reachable
    }

    fn phase(&self) -> MigrationPhase {
        self.orchestrator.state().unwrap().phase
    }

    fn config_text(&self) -> String {
        self.fake.file_text("redis", CONF_PATH).unwrap()
    }
}

#[tokio::test]
async fn dual_auth_leaves_both_listeners_answering() {
    let h = Harness::with_certificates("migrate-dual-auth").await;

    let report = h.orchestrator.dual_auth().await.unwrap();

    assert!(report.success, "{:?}", report.steps);
    assert_eq!(report.state, Some(MigrationPhase::DualAuthActive));
    assert_eq!(h.phase(), MigrationPhase::DualAuthActive);
    assert!(h.plaintext_answers(Some(PASSWORD)).await);
    assert!(h.tls_answers(Some(PASSWORD)).await);
    assert_eq!(
        stanza::directive_value(&h.config_text(), "tls-auth-clients").as_deref(),
        Some("optional")
    );
    assert_eq!(report.next.as_deref(), Some("heron migrate --phase verify"));
}

#[tokio::test]
async fn dual_auth_against_unreachable_host_aborts() {
    let h = Harness::with_certificates("migrate-dual-auth-down").await;
    h.fake.set_reachable("redis", false);

    let report = h.orchestrator.dual_auth().await.unwrap();

    assert!(!report.success);
    assert_eq!(h.phase(), MigrationPhase::Aborted);
    let failed: Vec<_> = report.failed_steps().map(|s| s.name.as_str()).collect();
    assert_eq!(failed, vec!["distribute certificates"]);
    assert_eq!(h.fake.total_mutations(), 0);
}

#[tokio::test]
async fn dual_auth_without_certificates_stops_before_touching_hosts() {
    let h = Harness::new("migrate-dual-auth-nocerts");

    let report = h.orchestrator.dual_auth().await.unwrap();

    assert!(!report.success);
    assert_eq!(report.steps[0].name, "CA");
    assert_eq!(h.fake.sessions_opened(), 0);
}

#[tokio::test]
async fn verify_with_plaintext_clients_is_not_ready() {
    let h = Harness::new("migrate-verify-busy");
    assert!(h.manager.setup(SetupOptions::default()).await);
    assert!(h.orchestrator.dual_auth().await.unwrap().success);
    h.fake.set_established("redis", 6379, 3);

    let report = h.orchestrator.verify().await.unwrap();

    assert!(!report.success);
    assert_eq!(report.plaintext_connections, Some(3));
    let failed: Vec<_> = report.failed_steps().map(|s| s.detail.clone()).collect();
    assert_eq!(failed, vec!["3 established on port 6379".to_string()]);
    assert_eq!(h.phase(), MigrationPhase::DualAuthActive);
    assert!(report.next.is_none());
}

#[tokio::test]
async fn verify_checks_every_identity_certificate() {
    let h = Harness::new("migrate-verify-fleet");
    assert!(h.manager.setup(SetupOptions::default()).await);
    assert!(h.orchestrator.dual_auth().await.unwrap().success);
    std::fs::remove_file(h.dir.join("certs").join("api").join("server-cert.pem")).unwrap();

    let report = h.orchestrator.verify().await.unwrap();

    assert!(!report.success);
    let names: Vec<_> = report.steps.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"certificate redis"));
    let failed: Vec<_> = report.failed_steps().map(|s| s.name.as_str()).collect();
    assert!(failed.contains(&"certificate api"), "{failed:?}");
    assert_eq!(h.phase(), MigrationPhase::DualAuthActive);
}

#[tokio::test]
async fn verify_requires_dual_auth_first() {
    let h = Harness::with_certificates("migrate-verify-early").await;
    match h.orchestrator.verify().await {
        Err(MigrationError::InvalidPhase { phase, .. }) => {
            assert_eq!(phase, MigrationPhase::DualAuthPending)
        }
        other => panic!("expected InvalidPhase, got {other:?}"),
    }
}

#[tokio::test]
async fn confirmed_cutover_enforces_mtls() {
    let h = Harness::verified("migrate-cutover").await;

    let gate = h.orchestrator.prepare_cutover().await.unwrap();
    assert_eq!(gate.plaintext_connections(), 0);
    let confirmation = gate.confirm(CONFIRMATION_PHRASE).unwrap();
    let report = h.orchestrator.disable_password(confirmation).await.unwrap();

    assert!(report.success, "{:?}", report.steps);
    assert_eq!(report.rollback_command.as_deref(), Some(ROLLBACK_COMMAND));
    assert_eq!(h.phase(), MigrationPhase::CutoverComplete);
    assert!(!h.plaintext_answers(None).await);
    assert!(!h.plaintext_answers(Some(PASSWORD)).await);
    assert!(h.tls_answers(None).await);

    let config = h.config_text();
    assert_eq!(stanza::directive_value(&config, "requirepass"), None);
    assert_eq!(stanza::directive_value(&config, "port").as_deref(), Some("0"));
    assert_eq!(stanza::directive_value(&config, "tls-auth-clients").as_deref(), Some("yes"));

    let state = h.orchestrator.state().unwrap();
    let backup = state.backup_path.unwrap();
    assert!(backup.starts_with("/etc/redis/redis.conf.pre-mtls."));
    assert!(h.fake.file("redis", &backup).is_some());
    assert_eq!(h.fake.file("redis", CONF_PATH).unwrap().mode, 0o640);

    let audit = h.manager.audit().read().unwrap();
    assert!(audit.contains("| cutover_confirmed | service=redis"));
    assert!(audit.contains("| cutover_complete | service=redis"));
}

#[tokio::test]
async fn gate_with_live_plaintext_clients_writes_nothing() {
    let h = Harness::verified("migrate-gate").await;
    h.fake.set_established("redis", 6379, 2);
    let before = h.fake.total_mutations();

    match h.orchestrator.prepare_cutover().await {
        Err(MigrationError::GateClosed(report)) => {
            assert!(!report.success);
            assert_eq!(report.plaintext_connections, Some(2));
            assert_eq!(report.rollback_command.as_deref(), Some(ROLLBACK_COMMAND));
        }
        other => panic!("expected GateClosed, got {other:?}"),
    }

    assert_eq!(h.fake.total_mutations(), before);
    assert_eq!(h.phase(), MigrationPhase::Aborted);
    assert!(h.plaintext_answers(Some(PASSWORD)).await);
}

#[tokio::test]
async fn wrong_phrase_changes_nothing() {
    let h = Harness::verified("migrate-phrase").await;
    let before = h.fake.total_mutations();

    let gate = h.orchestrator.prepare_cutover().await.unwrap();
    assert!(matches!(gate.confirm("yes"), Err(MigrationError::Confirmation)));

    assert_eq!(h.fake.total_mutations(), before);
    assert_eq!(h.phase(), MigrationPhase::VerifiedReady);
    // The dropped gate released the lock.
    assert!(h.orchestrator.prepare_cutover().await.is_ok());
}

#[tokio::test]
async fn restart_failure_mid_cutover_rolls_back_to_plaintext() {
    let h = Harness::verified("migrate-cutover-fail").await;
    let gate = h.orchestrator.prepare_cutover().await.unwrap();
    let confirmation = gate.confirm(CONFIRMATION_PHRASE).unwrap();
    h.fake.fail_next_restarts("redis", 1);

    let report = h.orchestrator.disable_password(confirmation).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.rollback_command.as_deref(), Some(ROLLBACK_COMMAND));
    let names: Vec<_> = report.steps.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"automatic rollback"));
    assert_eq!(h.phase(), MigrationPhase::RolledBack);
    assert!(h.fake.is_running("redis", "redis-server"));
    assert!(h.plaintext_answers(Some(PASSWORD)).await);
    assert_eq!(
        stanza::directive_value(&h.config_text(), "requirepass").as_deref(),
        Some(PASSWORD)
    );
}

#[tokio::test]
async fn cutover_requires_verified_ready() {
    let h = Harness::with_certificates("migrate-cutover-early").await;
    assert!(h.orchestrator.dual_auth().await.unwrap().success);
    assert!(matches!(
        h.orchestrator.prepare_cutover().await,
        Err(MigrationError::InvalidPhase { .. })
    ));
}

#[tokio::test]
async fn partial_rollback_strips_tls_and_keeps_certificates() {
    let h = Harness::with_certificates("migrate-partial").await;
    assert!(h.orchestrator.dual_auth().await.unwrap().success);

    let report = h.orchestrator.rollback(RollbackKind::Partial).await.unwrap();

    assert!(report.success, "{:?}", report.steps);
    assert_eq!(h.phase(), MigrationPhase::RolledBack);
    assert_eq!(h.config_text(), REDIS_CONF);
    assert!(h.plaintext_answers(Some(PASSWORD)).await);
    assert!(!h.tls_answers(Some(PASSWORD)).await);
    assert!(h.fake.file("redis", "/etc/heron/tls/redis/server-cert.pem").is_some());

    // A later retry starts from rolled-back.
    assert!(h.orchestrator.dual_auth().await.unwrap().success);
}

#[tokio::test]
async fn full_rollback_after_cutover_restores_backup() {
    let h = Harness::verified("migrate-full").await;
    let gate = h.orchestrator.prepare_cutover().await.unwrap();
    let confirmation = gate.confirm(CONFIRMATION_PHRASE).unwrap();
    assert!(h.orchestrator.disable_password(confirmation).await.unwrap().success);

    let report = h.orchestrator.rollback(RollbackKind::Full).await.unwrap();

    assert!(report.success, "{:?}", report.steps);
    assert_eq!(h.phase(), MigrationPhase::RolledBack);
    assert!(h.plaintext_answers(Some(PASSWORD)).await);
    assert!(report.steps[0].detail.starts_with("restored /etc/redis/redis.conf.pre-mtls."));
}

#[tokio::test]
async fn repeated_full_rollback_keeps_later_operator_edits() {
    let h = Harness::verified("migrate-full-twice").await;
    let gate = h.orchestrator.prepare_cutover().await.unwrap();
    let confirmation = gate.confirm(CONFIRMATION_PHRASE).unwrap();
    assert!(h.orchestrator.disable_password(confirmation).await.unwrap().success);
    assert!(h.orchestrator.rollback(RollbackKind::Full).await.unwrap().success);
    assert_eq!(h.orchestrator.state().unwrap().backup_path, None);

    // The operator rotates the secret by hand.
    let rotated = h.config_text().replace("requirepass s3cret", "requirepass rotated");
    h.fake.put_file("redis", CONF_PATH, rotated.as_bytes(), 0o640);

    let report = h
        .orchestrator_with_password("rotated")
        .rollback(RollbackKind::Full)
        .await
        .unwrap();

    assert!(report.success, "{:?}", report.steps);
    assert_eq!(report.steps[0].detail, "no backup; rebuilt a plaintext-only config");
    assert_eq!(
        stanza::directive_value(&h.config_text(), "requirepass").as_deref(),
        Some("rotated")
    );
}

#[tokio::test]
async fn new_dual_auth_cycle_forgets_the_old_backup() {
    let h = Harness::verified("migrate-new-cycle").await;
    let gate = h.orchestrator.prepare_cutover().await.unwrap();
    let confirmation = gate.confirm(CONFIRMATION_PHRASE).unwrap();
    h.fake.fail_next_restarts("redis", 1);
    h.orchestrator.disable_password(confirmation).await.unwrap();
    assert_eq!(h.phase(), MigrationPhase::RolledBack);
    assert_eq!(h.orchestrator.state().unwrap().backup_path, None);

    assert!(h.orchestrator.dual_auth().await.unwrap().success);
    assert_eq!(h.orchestrator.state().unwrap().backup_path, None);
}

#[tokio::test]
async fn unanswered_backup_check_is_not_a_missing_backup() {
    let h = Harness::verified("migrate-backup-unreachable").await;
    let gate = h.orchestrator.prepare_cutover().await.unwrap();
    let confirmation = gate.confirm(CONFIRMATION_PHRASE).unwrap();
    assert!(h.orchestrator.disable_password(confirmation).await.unwrap().success);
    h.fake.set_reachable("redis", false);

    let report = h.orchestrator.rollback(RollbackKind::Full).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].name, "check backup");
    assert_eq!(h.phase(), MigrationPhase::CutoverComplete);
    assert!(h.orchestrator.state().unwrap().backup_path.is_some());
}

#[tokio::test]
async fn full_rollback_without_backup_rebuilds_plaintext_config() {
    let h = Harness::with_certificates("migrate-full-nobackup").await;
    assert!(h.orchestrator.dual_auth().await.unwrap().success);

    let report = h.orchestrator.rollback(RollbackKind::Full).await.unwrap();

    assert!(report.success, "{:?}", report.steps);
    let config = h.config_text();
    assert!(!stanza::has_tls(&config));
    assert_eq!(stanza::directive_value(&config, "port").as_deref(), Some("6379"));
    assert_eq!(report.steps[0].detail, "no backup; rebuilt a plaintext-only config");
    assert_eq!(stanza::directive_value(&config, "requirepass").as_deref(), Some(PASSWORD));
    assert!(h.plaintext_answers(Some(PASSWORD)).await);
}

#[tokio::test]
async fn run_all_stops_before_cutover() {
    let h = Harness::new("migrate-all");
    assert!(h.manager.setup(SetupOptions::default()).await);

    let reports = h.orchestrator.run_all().await.unwrap();

    let phases: Vec<_> = reports.iter().map(|r| r.phase.as_str()).collect();
    assert_eq!(phases, vec!["redis-dual-auth", "backend-tls", "verify"]);
    assert!(reports.iter().all(|r| r.success));
    assert_eq!(h.phase(), MigrationPhase::VerifiedReady);
    assert!(reports[1].advisories[0].contains("rediss://10.0.0.5:6380"));
    assert!(reports[2]
        .next
        .as_deref()
        .is_some_and(|n| n.contains("--phase disable-password") && n.contains(ROLLBACK_COMMAND)));
    assert!(h.plaintext_answers(Some(PASSWORD)).await);
}

#[tokio::test]
async fn held_lock_fails_fast() {
    let h = Harness::with_certificates("migrate-locked").await;
    let _held = heron_migrate::lock::MigrationLock::acquire(&h.dir.join("state"), "redis").unwrap();

    match h.orchestrator.dual_auth().await {
        Err(MigrationError::Locked { identity, .. }) => assert_eq!(identity, "redis"),
        other => panic!("expected Locked, got {other:?}"),
    }
    assert_eq!(h.fake.sessions_opened(), 0);
}

#[test]
fn check_certs_reports_every_identity() {
    let h = Harness::new("migrate-check-certs");
    let report = h.orchestrator.check_certs();
    assert!(!report.success);
    assert_eq!(report.steps.len(), 3);
}
