//! Certificate Distributor.
//!
//! Pushes the CA certificate and each identity's leaf to its host, proves
//! the copy by reading it back, and only then hands ownership to the
//! service account. One task per identity; every task runs to completion
//! and a failure in one never cancels the others.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use heron_config::{FleetRegistry, Identity, RemoteSettings};
use heron_remote::{Connector, HostTarget, RemoteSession};

use crate::audit::AuditLog;
use crate::certfiles::{CertLayout, RemoteLayout, PRIVATE_MODE, PUBLIC_MODE};
use crate::fingerprint;
use crate::inspect;
use crate::outcome::IdentityFailure;

#[derive(Debug, Clone, Serialize)]
pub struct DistributionResult {
    pub identity: String,
    pub success: bool,
    pub message: String,
    /// Remote paths written.
    pub files: Vec<String>,
}

impl DistributionResult {
    fn failed(identity: &str, message: impl Into<String>) -> Self {
        Self {
            identity: identity.to_string(),
            success: false,
            message: message.into(),
            files: Vec::new(),
        }
    }
}

/// Per-identity outcome of a read-only remote check.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteVerification {
    pub identity: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Clone)]
pub struct CertificateDistributor {
    connector: Arc<dyn Connector>,
    fleet: Arc<FleetRegistry>,
    local: CertLayout,
    remote: RemoteLayout,
    owner: String,
    group: String,
    audit: AuditLog,
}

impl CertificateDistributor {
    pub fn new(
        connector: Arc<dyn Connector>,
        fleet: Arc<FleetRegistry>,
        local: CertLayout,
        remote: &RemoteSettings,
        audit: AuditLog,
    ) -> Self {
        Self {
            connector,
            fleet,
            local,
            remote: RemoteLayout::new(&remote.remote_cert_dir),
            owner: remote.owner.clone(),
            group: remote.group.clone(),
            audit,
        }
    }

    pub fn remote_layout(&self) -> &RemoteLayout {
        &self.remote
    }

    /// Distribute to every identity not in `exclude`.
    pub async fn distribute_all(&self, exclude: &[String]) -> BTreeMap<String, DistributionResult> {
        let names: Vec<String> = self
            .fleet
            .names()
            .into_iter()
            .filter(|n| !exclude.contains(n))
            .collect();
        self.distribute_many(&names).await
    }

    /// Distribute to the named identities concurrently and gather every result.
    pub async fn distribute_many(&self, names: &[String]) -> BTreeMap<String, DistributionResult> {
        let handles: Vec<_> = names
            .iter()
            .map(|name| {
                let this = self.clone();
                let name = name.clone();
                tokio::spawn(async move { this.distribute_to(&name).await })
            })
            .collect();

        let joined = futures::future::join_all(handles).await;

        let mut results = BTreeMap::new();
        for (name, joined) in names.iter().zip(joined) {
            let result = joined.unwrap_or_else(|e| {
                tracing::error!(identity = %name, error = %e, "Distribution task panicked");
                DistributionResult::failed(name, format!("distribution task failed: {e}"))
            });
            results.insert(name.clone(), result);
        }
        results
    }

    /// Distribute to one identity. Never returns an error: every failure is
    /// a failed result with a readable message.
    pub async fn distribute_to(&self, name: &str) -> DistributionResult {
        let Some(identity) = self.fleet.get(name) else {
            return DistributionResult::failed(name, "unknown identity");
        };

        let material = match self.local_material(name) {
            Ok(material) => material,
            Err(e) => return DistributionResult::failed(name, e),
        };

        let mut session = match self.connector.connect(&HostTarget::from(identity)).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(identity = %name, error = %e, "Distribution: connection failed");
                return DistributionResult::failed(name, format!("connection failed: {e}"));
            }
        };

        let pushed = self.push(session.as_mut(), identity, &material).await;
        session.close().await;

        match pushed {
            Ok(files) => {
                self.audit.record(
                    "distributed",
                    &[
                        ("identity", name),
                        ("fingerprint", material.cert_fingerprint.as_str()),
                    ],
                );
                tracing::info!(identity = %name, files = files.len(), "Certificates distributed");
                DistributionResult {
                    identity: name.to_string(),
                    success: true,
                    message: format!("installed and verified under {}", self.remote.root()),
                    files,
                }
            }
            Err(message) => {
                tracing::warn!(identity = %name, error = %message, "Distribution failed");
                DistributionResult::failed(name, message)
            }
        }
    }

    async fn push(
        &self,
        session: &mut dyn RemoteSession,
        identity: &Identity,
        material: &LocalMaterial,
    ) -> Result<Vec<String>, String> {
        let name = identity.name.as_str();
        let ca_path = self.remote.ca_cert();
        let cert_path = self.remote.leaf_cert(name);
        let key_path = self.remote.leaf_key(name);

        for dir in [self.remote.root().to_string(), self.remote.identity_dir(name)] {
            session
                .ensure_dir(&dir)
                .await
                .map_err(|e| format!("creating {dir}: {e}"))?;
        }

        let writes = [
            (&ca_path, material.ca_pem.as_bytes(), PUBLIC_MODE),
            (&cert_path, material.cert_pem.as_bytes(), PUBLIC_MODE),
            (&key_path, material.key_pem.as_bytes(), PRIVATE_MODE),
        ];
        for (path, contents, mode) in writes {
            session
                .write_file(path, contents, mode)
                .await
                .map_err(|e| format!("transfer of {path} failed: {e}"))?;
        }

        // Prove what landed before handing it over.
        let remote_ca = session
            .read_file(&ca_path)
            .await
            .map_err(|e| format!("verification read failed: {e}"))?;
        let remote_cert = session
            .read_file(&cert_path)
            .await
            .map_err(|e| format!("verification read failed: {e}"))?;
        let remote_key = session
            .read_file(&key_path)
            .await
            .map_err(|e| format!("verification read failed: {e}"))?;
        verify_copy(material, &remote_ca, &remote_cert)
            .map_err(|e| format!("verification failed: {e}"))?;
        if !fingerprint::secrets_match(&remote_key, material.key_pem.as_bytes()) {
            return Err("verification failed: remote key differs from local key".to_string());
        }

        for path in [&ca_path, &cert_path, &key_path] {
            session
                .chown(path, &self.owner, &self.group)
                .await
                .map_err(|e| format!("setting ownership of {path} failed: {e}"))?;
        }

        Ok(vec![ca_path, cert_path, key_path])
    }

    /// Read-only check of every identity: `name -> ok`.
    pub async fn verify_distribution(&self) -> BTreeMap<String, bool> {
        self.verify_distribution_detailed()
            .await
            .into_iter()
            .map(|(name, v)| (name, v.ok))
            .collect()
    }

    pub async fn verify_distribution_detailed(&self) -> BTreeMap<String, RemoteVerification> {
        let names = self.fleet.names();
        let handles: Vec<_> = names
            .iter()
            .map(|name| {
                let this = self.clone();
                let name = name.clone();
                tokio::spawn(async move { this.verify_identity(&name).await })
            })
            .collect();

        let joined = futures::future::join_all(handles).await;
        collect_verifications(&names, joined)
    }

    /// Failures from [`Self::verify_distribution_detailed`] as identity failures.
    pub async fn verification_failures(&self) -> Vec<IdentityFailure> {
        self.verify_distribution_detailed()
            .await
            .into_values()
            .filter(|v| !v.ok)
            .map(|v| IdentityFailure::new(v.identity, v.detail))
            .collect()
    }

    /// Read-only: the remote files exist, match the local issue, chain to
    /// the CA, and the key is private.
    pub async fn verify_identity(&self, name: &str) -> Result<String, String> {
        let identity = self
            .fleet
            .get(name)
            .ok_or_else(|| "unknown identity".to_string())?;
        let material = self.local_material(name)?;

        let mut session = self
            .connector
            .connect(&HostTarget::from(identity))
            .await
            .map_err(|e| format!("connection failed: {e}"))?;
        let checked = self.check_remote(session.as_mut(), name, &material).await;
        session.close().await;
        checked
    }

    async fn check_remote(
        &self,
        session: &mut dyn RemoteSession,
        name: &str,
        material: &LocalMaterial,
    ) -> Result<String, String> {
        let ca_path = self.remote.ca_cert();
        let cert_path = self.remote.leaf_cert(name);
        let key_path = self.remote.leaf_key(name);

        for path in [&ca_path, &cert_path, &key_path] {
            match session.file_exists(path).await {
                Ok(true) => {}
                Ok(false) => return Err(format!("{path} missing")),
                Err(e) => return Err(format!("checking {path}: {e}")),
            }
        }
        let remote_ca = session
            .read_file(&ca_path)
            .await
            .map_err(|e| format!("reading {ca_path}: {e}"))?;
        let remote_cert = session
            .read_file(&cert_path)
            .await
            .map_err(|e| format!("reading {cert_path}: {e}"))?;
        verify_copy(material, &remote_ca, &remote_cert)?;

        let mode = session
            .file_mode(&key_path)
            .await
            .map_err(|e| format!("checking {key_path}: {e}"))?;
        if mode & 0o077 != 0 {
            return Err(format!("{key_path} has mode {mode:o}, expected 600"));
        }
        Ok(format!("chain verifies, fingerprint {}", &material.cert_fingerprint[..16]))
    }

    fn local_material(&self, name: &str) -> Result<LocalMaterial, String> {
        let read = |path: std::path::PathBuf| {
            std::fs::read_to_string(&path)
                .map_err(|e| format!("local material {} unreadable: {e}", path.display()))
        };
        let ca_pem = read(self.local.ca_cert())?;
        let cert_pem = read(self.local.leaf_cert(name))?;
        let key_pem = read(self.local.leaf_key(name))?;
        let ca_der = inspect::pem_to_der(ca_pem.as_bytes()).map_err(|e| e.to_string())?;
        let cert_der = inspect::pem_to_der(cert_pem.as_bytes()).map_err(|e| e.to_string())?;
        Ok(LocalMaterial {
            ca_fingerprint: fingerprint::fingerprint_sha256(&ca_der),
            cert_fingerprint: fingerprint::fingerprint_sha256(&cert_der),
            ca_pem,
            cert_pem,
            key_pem,
        })
    }
}

struct LocalMaterial {
    ca_pem: String,
    cert_pem: String,
    key_pem: String,
    ca_fingerprint: String,
    cert_fingerprint: String,
}

/// Remote copies equal the local issue and the leaf chains to the CA.
fn verify_copy(material: &LocalMaterial, remote_ca: &[u8], remote_cert: &[u8]) -> Result<(), String> {
    let ca_der = inspect::pem_to_der(remote_ca).map_err(|e| format!("remote CA: {e}"))?;
    let cert_der = inspect::pem_to_der(remote_cert).map_err(|e| format!("remote certificate: {e}"))?;

    if !fingerprint::fingerprints_match(
        &fingerprint::fingerprint_sha256(&ca_der),
        &material.ca_fingerprint,
    ) {
        return Err("remote CA differs from local CA".to_string());
    }
    if !fingerprint::fingerprints_match(
        &fingerprint::fingerprint_sha256(&cert_der),
        &material.cert_fingerprint,
    ) {
        return Err("remote certificate is stale".to_string());
    }
    inspect::verify_chain(&cert_der, &ca_der)
}

/// One entry per name; a task that died is a failed entry.
fn collect_verifications(
    names: &[String],
    joined: Vec<Result<Result<String, String>, tokio::task::JoinError>>,
) -> BTreeMap<String, RemoteVerification> {
    names
        .iter()
        .zip(joined)
        .map(|(name, joined)| {
            let outcome = joined.unwrap_or_else(|e| {
                tracing::error!(identity = %name, error = %e, "Verification task panicked");
                Err(format!("verification task failed: {e}"))
            });
            let verification = RemoteVerification {
                identity: name.clone(),
                ok: outcome.is_ok(),
                detail: outcome.unwrap_or_else(|e| e),
            };
            (name.clone(), verification)
        })
        .collect()
}
