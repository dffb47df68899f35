//! Builds the runtime object graph from the config file.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use heron_config::HeronConfig;
use heron_migrate::MigrationOrchestrator;
use heron_pki::{AuditLog, PkiManager};
use heron_remote::{RespProbe, SshConnector};

pub struct Runtime {
    pub config: HeronConfig,
    pub manager: Arc<PkiManager>,
}

impl Runtime {
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        heron_config::dirs::ensure_data_dir();

        let path = config_path
            .map(Path::to_path_buf)
            .unwrap_or_else(HeronConfig::default_path);
        let config = HeronConfig::load(&path)
            .with_context(|| format!("loading {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;

        let connector = Arc::new(SshConnector::from_settings(&config.remote));
        let audit = AuditLog::at(heron_common::paths::heron_log_dir().join("heron-audit.log"));
        let manager = PkiManager::new(
            &config,
            connector,
            audit,
            &heron_common::paths::heron_state_dir(),
        )
        .context("initialising PKI manager")?;

        Ok(Self {
            config,
            manager: Arc::new(manager),
        })
    }

    pub fn orchestrator(&self) -> anyhow::Result<MigrationOrchestrator> {
        let probe = Arc::new(RespProbe::new(Duration::from_secs(
            self.config.remote.connect_timeout_secs,
        )));
        MigrationOrchestrator::new(
            &self.config,
            self.manager.clone(),
            probe,
            heron_common::paths::heron_state_dir(),
        )
        .context("preparing migration")
    }
}
