use std::path::PathBuf;
use std::sync::Arc;

use heron_config::HeronConfig;
use heron_pki::{AuditLog, PkiManager, PkiMode, PkiStage, SetupOptions};
use heron_remote::fake::FakeFleet;
use heron_remote::{ListenerProbe, ProbeTarget};

const FLEET: &str = r#"
[[identity]]
name = "redis"
address = "10.0.0.5"
sans = ["redis.internal"]

[[identity]]
name = "api"
address = "10.0.0.6"

[[identity]]
name = "worker"
address = "10.0.0.7"

[[service]]
name = "redis"
identity = "redis"
unit = "redis-server"
config_path = "/etc/redis/redis.conf"
"#;

const REDIS_CONF: &str = "bind 0.0.0.0\nport 6379\nrequirepass s3cret\n";

struct Harness {
    dir: PathBuf,
    config: HeronConfig,
    fake: FakeFleet,
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
        fake.add_host("worker", "10.0.0.7");
        fake.add_service("redis", "redis-server", "/etc/redis/redis.conf", REDIS_CONF);
        Self { dir, config, fake }
    }

    fn manager(&self) -> PkiManager {
        PkiManager::new(
            &self.config,
            Arc::new(self.fake.connector()),
            AuditLog::at(self.dir.join("audit.log")),
            &self.dir.join("state"),
        )
        .unwrap()
    }

    fn fingerprints(&self, manager: &PkiManager) -> Vec<Option<String>> {
        manager
            .generator()
            .all_statuses_at(chrono::Utc::now())
            .into_iter()
            .map(|s| s.fingerprint)
            .collect()
    }
}

fn redis_target(port: u16, password: Option<&str>) -> ProbeTarget {
    ProbeTarget {
        identity: "redis".into(),
        address: "10.0.0.5".into(),
        port,
        password: password.map(String::from),
    }
}

#[tokio::test]
async fn setup_from_empty_environment_issues_valid_material_everywhere() {
    let h = Harness::new("pki-setup-empty");
    let manager = h.manager();

    assert!(manager.setup(SetupOptions::default()).await);

    let status = manager.status().await;
    assert_eq!(status.stage, PkiStage::Complete);
    assert_eq!(status.mode, PkiMode::Full);
    assert!(status.ca_exists && status.ca_valid);
    assert_eq!(status.certs_generated, 3);
    assert!(status.errors.is_empty());
    assert!(status.warnings.is_empty(), "{:?}", status.warnings);
    assert_eq!(status.identities.len(), 3);
    for identity in &status.identities {
        assert!(identity.exists && identity.valid, "{identity:?}");
        assert!(!identity.needs_renewal);
    }

    for host in ["redis", "api", "worker"] {
        let key = h
            .fake
            .file(host, &format!("/etc/heron/tls/{host}/server-key.pem"))
            .unwrap();
        assert_eq!(key.mode, 0o600);
        assert_eq!(key.owner, "root");
        let ca = h.fake.file(host, "/etc/heron/tls/ca-cert.pem").unwrap();
        assert_eq!(ca.mode, 0o644);
        assert!(h.fake.file(host, "/etc/heron/tls/ca-key.pem").is_none());
    }

    assert_eq!(h.fake.restarts("redis"), vec!["redis-server".to_string()]);
    let probe = h.fake.probe();
    assert!(probe.plaintext(&redis_target(6379, Some("s3cret"))).await.reachable);
    let material = manager.generator().tls_material("redis").unwrap();
    assert!(probe.tls(&redis_target(6380, Some("s3cret")), &material).await.reachable);

    let audit = manager.audit().read().unwrap();
    assert!(audit.contains("ca_created"));
    assert!(audit.contains("setup_finished"));
}

#[tokio::test]
async fn second_setup_keeps_fingerprints() {
    let h = Harness::new("pki-setup-idempotent");
    let manager = h.manager();

    assert!(manager.setup(SetupOptions::default()).await);
    let first = h.fingerprints(&manager);
    let config_after_first = h.fake.file_text("redis", "/etc/redis/redis.conf");

    assert!(manager.setup(SetupOptions::default()).await);
    assert_eq!(h.fingerprints(&manager), first);
    assert_eq!(manager.status().await.certs_generated, 0);
    assert_eq!(h.fake.file_text("redis", "/etc/redis/redis.conf"), config_after_first);
    assert_eq!(h.fake.restarts("redis").len(), 1);
}

#[tokio::test]
async fn unreachable_host_is_a_warning_not_a_failure() {
    let h = Harness::new("pki-setup-partial");
    h.fake.set_reachable("api", false);
    let manager = h.manager();

    assert!(manager.setup(SetupOptions::default()).await);

    let status = manager.status().await;
    assert_eq!(status.stage, PkiStage::Complete);
    assert!(status.warnings.iter().any(|w| w.starts_with("distribution api")));
    assert!(status.warnings.iter().any(|w| w.starts_with("verification api")));
    assert!(h.fake.file("redis", "/etc/heron/tls/redis/server-cert.pem").is_some());
    assert!(h.fake.file("worker", "/etc/heron/tls/worker/server-cert.pem").is_some());

    let verified = manager.distributor().verify_distribution().await;
    assert_eq!(verified.get("redis"), Some(&true));
    assert_eq!(verified.get("worker"), Some(&true));
    assert_eq!(verified.get("api"), Some(&false));
}

#[tokio::test]
async fn last_run_survives_a_new_process() {
    let h = Harness::new("pki-setup-persist");
    h.fake.set_reachable("worker", false);
    let run_id = {
        let manager = h.manager();
        assert!(manager.setup(SetupOptions::default()).await);
        manager.status().await.run_id
    };

    let status = h.manager().status().await;
    assert_eq!(status.run_id, run_id);
    assert_eq!(status.stage, PkiStage::Complete);
    assert!(!status.warnings.is_empty());
    assert!(status.history.len() >= 6);
}

#[tokio::test]
async fn generate_only_touches_no_host() {
    let h = Harness::new("pki-setup-local");
    let manager = h.manager();
    let options = SetupOptions {
        skip_distribution: true,
        skip_configuration: true,
        ..SetupOptions::default()
    };

    assert!(manager.setup(options).await);
    let status = manager.status().await;
    assert_eq!(status.mode, PkiMode::GenerateOnly);
    assert!(status.history.iter().all(|e| e.stage != PkiStage::Distribution));
    assert_eq!(h.fake.sessions_opened(), 0);
    assert_eq!(h.fake.total_mutations(), 0);
}

#[tokio::test]
async fn empty_fleet_fails_validation_before_generating() {
    let h = Harness::new("pki-setup-empty-fleet");
    let mut config = h.config.clone();
    config.identities.clear();
    config.services.clear();
    let manager = PkiManager::new(
        &config,
        Arc::new(h.fake.connector()),
        AuditLog::at(h.dir.join("audit.log")),
        &h.dir.join("state"),
    )
    .unwrap();

    assert!(!manager.setup(SetupOptions::default()).await);
    let status = manager.status().await;
    assert_eq!(status.stage, PkiStage::Failed);
    assert!(status.errors[0].contains("no identities"));
    assert!(!status.ca_exists);
}

#[tokio::test]
async fn forced_setup_replaces_every_leaf() {
    let h = Harness::new("pki-setup-force");
    let manager = h.manager();
    assert!(manager.setup(SetupOptions::default()).await);
    let before = h.fingerprints(&manager);

    let forced = SetupOptions {
        force: true,
        ..SetupOptions::default()
    };
    assert!(manager.setup(forced).await);
    let after = h.fingerprints(&manager);
    for (old, new) in before.iter().zip(&after) {
        assert_ne!(old, new);
    }
    assert_eq!(manager.distributor().verify_distribution().await.values().filter(|ok| **ok).count(), 3);
}

#[tokio::test]
async fn renew_reissues_only_named_identity_and_reloads_its_service() {
    let h = Harness::new("pki-renew");
    let manager = h.manager();
    assert!(manager.setup(SetupOptions::default()).await);
    let before = h.fingerprints(&manager);
    assert!(!manager.needs_renewal());

    assert!(manager.renew(&["redis".to_string()]).await);

    let after = h.fingerprints(&manager);
    // Name order: api, redis, worker.
    assert_eq!(before[0], after[0]);
    assert_ne!(before[1], after[1]);
    assert_eq!(before[2], after[2]);
    assert_eq!(h.fake.restarts("redis").len(), 2);

    let status = manager.status().await;
    assert_eq!(status.mode, PkiMode::Renewal);
    assert_eq!(status.certs_generated, 1);
    assert_eq!(manager.distributor().verify_distribution().await.get("redis"), Some(&true));
}

#[tokio::test]
async fn renew_unknown_identity_fails() {
    let h = Harness::new("pki-renew-unknown");
    let manager = h.manager();
    assert!(manager.setup(SetupOptions::default()).await);

    assert!(!manager.renew(&["ghost".to_string()]).await);
    let status = manager.status().await;
    assert_eq!(status.stage, PkiStage::Failed);
    assert!(status.errors[0].contains("ghost"));
}

#[tokio::test]
async fn renew_with_nothing_due_is_a_no_op() {
    let h = Harness::new("pki-renew-none");
    let manager = h.manager();
    assert!(manager.setup(SetupOptions::default()).await);
    let sessions = h.fake.sessions_opened();

    assert!(manager.renew(&[]).await);
    assert_eq!(h.fake.sessions_opened(), sessions);
}
