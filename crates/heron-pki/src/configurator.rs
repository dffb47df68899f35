//! Service Configurator.
//!
//! Edits the TLS stanza of managed service configs on their hosts and
//! restarts units. Advisory services are never touched remotely; they get a
//! rendered settings block to apply by hand.
//!
//! Every public operation opens its own session and closes it before
//! returning.

use std::sync::Arc;

use serde::Serialize;

use heron_config::{AdvisorySpec, FleetRegistry, ServiceSpec};
use heron_remote::{Connector, HostTarget, RemoteSession};

use crate::audit::AuditLog;
use crate::certfiles::RemoteLayout;
use crate::error::PkiError;
use crate::stanza::{self, ClientAuthMode, TlsStanza};

#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationResult {
    pub service: String,
    pub identity: String,
    pub success: bool,
    pub message: String,
    pub restart_required: bool,
    /// Remote files changed.
    pub files: Vec<String>,
}

impl ConfigurationResult {
    fn failed(service: &ServiceSpec, message: impl Into<String>) -> Self {
        Self {
            service: service.name.clone(),
            identity: service.identity.clone(),
            success: false,
            message: message.into(),
            restart_required: false,
            files: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct ServiceConfigurator {
    connector: Arc<dyn Connector>,
    fleet: Arc<FleetRegistry>,
    remote: RemoteLayout,
    audit: AuditLog,
}

impl ServiceConfigurator {
    pub fn new(
        connector: Arc<dyn Connector>,
        fleet: Arc<FleetRegistry>,
        remote: RemoteLayout,
        audit: AuditLog,
    ) -> Self {
        Self {
            connector,
            fleet,
            remote,
            audit,
        }
    }

    pub fn remote_layout(&self) -> &RemoteLayout {
        &self.remote
    }

    /// The stanza `service` gets for a client-auth mode.
    pub fn stanza_for(
        &self,
        service: &ServiceSpec,
        mode: ClientAuthMode,
        disable_plaintext: bool,
    ) -> TlsStanza {
        TlsStanza {
            tls_port: service.tls_port,
            plaintext_port: (!disable_plaintext).then_some(service.plaintext_port),
            cert_file: self.remote.leaf_cert(&service.identity),
            key_file: self.remote.leaf_key(&service.identity),
            ca_file: self.remote.ca_cert(),
            client_auth: mode,
        }
    }

    /// Append the TLS stanza unless TLS is already configured.
    ///
    /// A config that already carries TLS is reported as success with no
    /// restart. The certificate files must already be on the host.
    pub async fn configure_service_tls(
        &self,
        service: &ServiceSpec,
        mode: ClientAuthMode,
        disable_plaintext: bool,
    ) -> ConfigurationResult {
        let mut session = match self.open(&service.identity).await {
            Ok(session) => session,
            Err(e) => return ConfigurationResult::failed(service, e.to_string()),
        };
        let result = self
            .apply_stanza(session.as_mut(), service, mode, disable_plaintext)
            .await;
        session.close().await;

        match result {
            Ok(result) => {
                if result.restart_required {
                    self.audit.record(
                        "service_configured",
                        &[
                            ("service", service.name.as_str()),
                            ("identity", service.identity.as_str()),
                            ("client_auth", mode.directive_value()),
                        ],
                    );
                    tracing::info!(service = %service.name, client_auth = %mode, "TLS stanza written");
                }
                result
            }
            Err(e) => {
                tracing::warn!(service = %service.name, error = %e, "TLS configuration failed");
                ConfigurationResult::failed(service, e.to_string())
            }
        }
    }

    async fn apply_stanza(
        &self,
        session: &mut dyn RemoteSession,
        service: &ServiceSpec,
        mode: ClientAuthMode,
        disable_plaintext: bool,
    ) -> Result<ConfigurationResult, PkiError> {
        let current = read_text(session, &service.config_path).await?;
        if stanza::has_tls(&current) {
            tracing::debug!(service = %service.name, "TLS already present, leaving config alone");
            return Ok(ConfigurationResult {
                service: service.name.clone(),
                identity: service.identity.clone(),
                success: true,
                message: "TLS already configured".to_string(),
                restart_required: false,
                files: Vec::new(),
            });
        }

        let tls = self.stanza_for(service, mode, disable_plaintext);
        for path in [&tls.cert_file, &tls.key_file, &tls.ca_file] {
            if !session.file_exists(path).await? {
                return Err(PkiError::Prerequisite(format!(
                    "{path} is not on {}; distribute certificates first",
                    service.identity
                )));
            }
        }

        let updated = stanza::append(&current, &tls);
        session
            .replace_file(&service.config_path, updated.as_bytes())
            .await?;
        Ok(ConfigurationResult {
            service: service.name.clone(),
            identity: service.identity.clone(),
            success: true,
            message: format!("TLS on port {} (client auth {mode})", service.tls_port),
            restart_required: true,
            files: vec![service.config_path.clone()],
        })
    }

    pub async fn restart_service(&self, identity: &str, unit: &str) -> Result<(), PkiError> {
        let mut session = self.open(identity).await?;
        let result = session.restart_service(unit).await;
        session.close().await;
        result?;
        self.audit
            .record("service_restarted", &[("identity", identity), ("unit", unit)]);
        tracing::info!(identity, unit, "Service restarted");
        Ok(())
    }

    /// Settings block for an advisory service. Nothing is written anywhere.
    pub fn generate_advisory_config(
        &self,
        advisory: &AdvisorySpec,
        upstream: Option<&ServiceSpec>,
    ) -> String {
        let mut out = format!(
            "# {name} (identity {identity}): apply by hand, heron does not edit this service\n\
             [tls]\n\
             listen_port = {port}\n\
             cert_file = \"{cert}\"\n\
             key_file = \"{key}\"\n\
             ca_file = \"{ca}\"\n\
             client_auth = \"optional\"\n",
            name = advisory.name,
            identity = advisory.identity,
            port = advisory.listen_port,
            cert = self.remote.leaf_cert(&advisory.identity),
            key = self.remote.leaf_key(&advisory.identity),
            ca = self.remote.ca_cert(),
        );

        if let Some(upstream) = upstream {
            let address = self
                .fleet
                .get(&upstream.identity)
                .map(|i| i.address.as_str())
                .unwrap_or(upstream.identity.as_str());
            out.push_str(&format!(
                "\n[upstream.{name}]\n\
                 url = \"rediss://{address}:{port}\"\n\
                 client_cert_file = \"{cert}\"\n\
                 client_key_file = \"{key}\"\n\
                 ca_file = \"{ca}\"\n",
                name = upstream.name,
                port = upstream.tls_port,
                cert = self.remote.leaf_cert(&advisory.identity),
                key = self.remote.leaf_key(&advisory.identity),
                ca = self.remote.ca_cert(),
            ));
        }
        out
    }

    pub async fn read_config(&self, service: &ServiceSpec) -> Result<String, PkiError> {
        let mut session = self.open(&service.identity).await?;
        let result = read_text(session.as_mut(), &service.config_path).await;
        session.close().await;
        result
    }

    /// Copy the live config to `<config>.pre-mtls.<stamp>`; returns the path.
    pub async fn backup_config(&self, service: &ServiceSpec, stamp: &str) -> Result<String, PkiError> {
        let backup = format!("{}.pre-mtls.{stamp}", service.config_path);
        let mut session = self.open(&service.identity).await?;
        let result = session.copy_file(&service.config_path, &backup).await;
        session.close().await;
        result?;
        self.audit.record(
            "config_backed_up",
            &[("service", service.name.as_str()), ("backup", backup.as_str())],
        );
        Ok(backup)
    }

    /// Read, transform, and write back in one session. Mode and owner of
    /// the config are kept. Returns the new text.
    pub async fn rewrite_config<F>(&self, service: &ServiceSpec, transform: F) -> Result<String, PkiError>
    where
        F: FnOnce(&str) -> String + Send,
    {
        let mut session = self.open(&service.identity).await?;
        let result = async {
            let current = read_text(session.as_mut(), &service.config_path).await?;
            let updated = transform(&current);
            session
                .replace_file(&service.config_path, updated.as_bytes())
                .await?;
            Ok::<_, PkiError>(updated)
        }
        .await;
        session.close().await;
        let updated = result?;
        self.audit
            .record("config_rewritten", &[("service", service.name.as_str())]);
        Ok(updated)
    }

    pub async fn restore_config(&self, service: &ServiceSpec, backup: &str) -> Result<(), PkiError> {
        let mut session = self.open(&service.identity).await?;
        let result = session.copy_file(backup, &service.config_path).await;
        session.close().await;
        result?;
        self.audit.record(
            "config_restored",
            &[("service", service.name.as_str()), ("backup", backup)],
        );
        Ok(())
    }

    pub async fn file_exists(&self, identity: &str, path: &str) -> Result<bool, PkiError> {
        let mut session = self.open(identity).await?;
        let result = session.file_exists(path).await;
        session.close().await;
        Ok(result?)
    }

    pub async fn established_connections(&self, identity: &str, port: u16) -> Result<u32, PkiError> {
        let mut session = self.open(identity).await?;
        let result = session.established_connections(port).await;
        session.close().await;
        Ok(result?)
    }

    async fn open(&self, identity: &str) -> Result<Box<dyn RemoteSession>, PkiError> {
        let identity = self
            .fleet
            .get(identity)
            .ok_or_else(|| PkiError::UnknownIdentity(identity.to_string()))?;
        Ok(self.connector.connect(&HostTarget::from(identity)).await?)
    }
}

async fn read_text(session: &mut dyn RemoteSession, path: &str) -> Result<String, PkiError> {
    let bytes = session.read_file(path).await?;
    String::from_utf8(bytes).map_err(|_| PkiError::Parse(format!("{path} is not UTF-8")))
}
