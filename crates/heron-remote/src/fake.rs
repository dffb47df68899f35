//! In-memory fleet for tests and dry runs.
//!
//! Hosts hold files (contents, mode, owner), systemd-like units whose
//! running configuration is snapshotted at restart, and per-port
//! established-connection counts. [`FakeProbe`] answers listener probes
//! from the *running* configuration, so an edited but unrestarted config
//! changes nothing until the unit restarts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::probe::{ListenerProbe, ProbeOutcome, ProbeTarget, TlsMaterial};
use crate::{CommandOutput, Connector, HostTarget, RemoteError, RemoteSession};

/// Owner given to files written before any `chown`.
pub const TRANSFER_OWNER: &str = "deploy";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFile {
    pub contents: Vec<u8>,
    pub mode: u32,
    pub owner: String,
    pub group: String,
}

#[derive(Debug, Clone)]
struct FakeUnit {
    config_path: String,
    /// Config the unit was last started with; `None` when stopped.
    running: Option<String>,
}

#[derive(Debug, Clone)]
struct FakeHost {
    address: String,
    reachable: bool,
    files: BTreeMap<String, FakeFile>,
    dirs: BTreeSet<String>,
    units: BTreeMap<String, FakeUnit>,
    established: BTreeMap<u16, u32>,
    restarts: Vec<String>,
    fail_restarts: u32,
    mutations: usize,
    commands: Vec<String>,
}

impl FakeHost {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            reachable: true,
            files: BTreeMap::new(),
            dirs: BTreeSet::new(),
            units: BTreeMap::new(),
            established: BTreeMap::new(),
            restarts: Vec::new(),
            fail_restarts: 0,
            mutations: 0,
            commands: Vec::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct FakeFleet {
    hosts: Arc<Mutex<BTreeMap<String, FakeHost>>>,
    sessions: Arc<Mutex<usize>>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, FakeHost>> {
        self.hosts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_host<T>(&self, name: &str, f: impl FnOnce(&mut FakeHost) -> T) -> Option<T> {
        self.lock().get_mut(name).map(f)
    }

    pub fn add_host(&self, name: &str, address: &str) {
        self.lock().insert(name.to_string(), FakeHost::new(address));
    }

    /// Register a unit with its config file and start it.
    pub fn add_service(&self, host: &str, unit: &str, config_path: &str, config: &str) {
        self.with_host(host, |h| {
            h.files.insert(
                config_path.to_string(),
                FakeFile {
                    contents: config.as_bytes().to_vec(),
                    mode: 0o640,
                    owner: "redis".to_string(),
                    group: "redis".to_string(),
                },
            );
            h.units.insert(
                unit.to_string(),
                FakeUnit {
                    config_path: config_path.to_string(),
                    running: Some(config.to_string()),
                },
            );
        });
    }

    pub fn set_reachable(&self, host: &str, reachable: bool) {
        self.with_host(host, |h| h.reachable = reachable);
    }

    pub fn set_established(&self, host: &str, port: u16, count: u32) {
        self.with_host(host, |h| {
            h.established.insert(port, count);
        });
    }

    /// The next `count` restarts on `host` fail and leave the unit stopped.
    pub fn fail_next_restarts(&self, host: &str, count: u32) {
        self.with_host(host, |h| h.fail_restarts = count);
    }

    pub fn put_file(&self, host: &str, path: &str, contents: &[u8], mode: u32) {
        self.with_host(host, |h| {
            h.files.insert(
                path.to_string(),
                FakeFile {
                    contents: contents.to_vec(),
                    mode,
                    owner: TRANSFER_OWNER.to_string(),
                    group: TRANSFER_OWNER.to_string(),
                },
            );
        });
    }

    pub fn file(&self, host: &str, path: &str) -> Option<FakeFile> {
        self.with_host(host, |h| h.files.get(path).cloned()).flatten()
    }

    pub fn file_text(&self, host: &str, path: &str) -> Option<String> {
        self.file(host, path)
            .map(|f| String::from_utf8_lossy(&f.contents).into_owned())
    }

    /// Paths on `host` starting with `prefix`.
    pub fn paths_with_prefix(&self, host: &str, prefix: &str) -> Vec<String> {
        self.with_host(host, |h| {
            h.files
                .keys()
                .filter(|p| p.starts_with(prefix))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    /// Remote writes of any kind (files, dirs, ownership, restarts).
    pub fn mutations(&self, host: &str) -> usize {
        self.with_host(host, |h| h.mutations).unwrap_or(0)
    }

    pub fn total_mutations(&self) -> usize {
        self.lock().values().map(|h| h.mutations).sum()
    }

    pub fn restarts(&self, host: &str) -> Vec<String> {
        self.with_host(host, |h| h.restarts.clone())
            .unwrap_or_default()
    }

    pub fn is_running(&self, host: &str, unit: &str) -> bool {
        self.with_host(host, |h| {
            h.units.get(unit).is_some_and(|u| u.running.is_some())
        })
        .unwrap_or(false)
    }

    pub fn running_config(&self, host: &str, unit: &str) -> Option<String> {
        self.with_host(host, |h| h.units.get(unit).and_then(|u| u.running.clone()))
            .flatten()
    }

    /// Sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        *self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            fleet: self.clone(),
        }
    }

    pub fn probe(&self) -> FakeProbe {
        FakeProbe {
            fleet: self.clone(),
        }
    }
}

pub struct FakeConnector {
    fleet: FakeFleet,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, target: &HostTarget) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let reachable = self
            .fleet
            .with_host(&target.name, |h| h.reachable && h.address == target.address);
        match reachable {
            Some(true) => {
                *self.fleet.sessions.lock().unwrap_or_else(|e| e.into_inner()) += 1;
                Ok(Box::new(FakeSession {
                    fleet: self.fleet.clone(),
                    host: target.name.clone(),
                }))
            }
            _ => Err(RemoteError::Connect {
                host: target.name.clone(),
                reason: "no route to host".to_string(),
            }),
        }
    }

    fn preflight(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

pub struct FakeSession {
    fleet: FakeFleet,
    host: String,
}

impl FakeSession {
    fn host_op<T>(
        &self,
        f: impl FnOnce(&mut FakeHost) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        self.fleet
            .with_host(&self.host, f)
            .unwrap_or_else(|| {
                Err(RemoteError::Connect {
                    host: self.host.clone(),
                    reason: "host vanished".to_string(),
                })
            })
    }

    fn missing(&self, command: &str, path: &str) -> RemoteError {
        RemoteError::Command {
            host: self.host.clone(),
            command: format!("{command} {path}"),
            status: 1,
            stderr: format!("{path}: No such file or directory"),
        }
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn exec(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        self.host_op(|h| {
            h.commands.push(command.to_string());
            Ok(CommandOutput {
                status: 127,
                stdout: String::new(),
                stderr: "fake host runs no arbitrary commands".to_string(),
            })
        })
    }

    async fn ensure_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        self.host_op(|h| {
            if h.dirs.insert(path.to_string()) {
                h.mutations += 1;
            }
            Ok(())
        })
    }

    async fn write_file(
        &mut self,
        path: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<(), RemoteError> {
        self.host_op(|h| {
            h.mutations += 1;
            h.files.insert(
                path.to_string(),
                FakeFile {
                    contents: contents.to_vec(),
                    mode,
                    owner: TRANSFER_OWNER.to_string(),
                    group: TRANSFER_OWNER.to_string(),
                },
            );
            Ok(())
        })
    }

    async fn replace_file(&mut self, path: &str, contents: &[u8]) -> Result<(), RemoteError> {
        let missing = self.missing("test -f", path);
        self.host_op(|h| {
            let file = h.files.get_mut(path).ok_or(missing)?;
            file.contents = contents.to_vec();
            h.mutations += 1;
            Ok(())
        })
    }

    async fn read_file(&mut self, path: &str) -> Result<Vec<u8>, RemoteError> {
        let missing = self.missing("cat", path);
        self.host_op(|h| h.files.get(path).map(|f| f.contents.clone()).ok_or(missing))
    }

    async fn file_exists(&mut self, path: &str) -> Result<bool, RemoteError> {
        self.host_op(|h| Ok(h.files.contains_key(path) || h.dirs.contains(path)))
    }

    async fn file_mode(&mut self, path: &str) -> Result<u32, RemoteError> {
        let missing = self.missing("stat", path);
        self.host_op(|h| h.files.get(path).map(|f| f.mode).ok_or(missing))
    }

    async fn chown(&mut self, path: &str, owner: &str, group: &str) -> Result<(), RemoteError> {
        let missing = self.missing("chown", path);
        self.host_op(|h| {
            let file = h.files.get_mut(path).ok_or(missing)?;
            file.owner = owner.to_string();
            file.group = group.to_string();
            h.mutations += 1;
            Ok(())
        })
    }

    async fn copy_file(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        let missing = self.missing("cp", from);
        self.host_op(|h| {
            let file = h.files.get(from).cloned().ok_or(missing)?;
            h.files.insert(to.to_string(), file);
            h.mutations += 1;
            Ok(())
        })
    }

    async fn restart_service(&mut self, unit: &str) -> Result<(), RemoteError> {
        let host = self.host.clone();
        self.host_op(|h| {
            h.mutations += 1;
            h.restarts.push(unit.to_string());
            let fail = h.fail_restarts > 0;
            if fail {
                h.fail_restarts -= 1;
            }
            let config = h
                .units
                .get(unit)
                .and_then(|u| h.files.get(&u.config_path))
                .map(|f| String::from_utf8_lossy(&f.contents).into_owned());
            let Some(state) = h.units.get_mut(unit) else {
                return Err(RemoteError::Command {
                    host: host.clone(),
                    command: format!("systemctl restart {unit}"),
                    status: 5,
                    stderr: format!("Unit {unit}.service not found."),
                });
            };
            match config {
                Some(config) if !fail => {
                    state.running = Some(config);
                    Ok(())
                }
                _ => {
                    state.running = None;
                    Err(RemoteError::Command {
                        host: host.clone(),
                        command: format!("systemctl restart {unit}"),
                        status: 1,
                        stderr: format!("Job for {unit}.service failed."),
                    })
                }
            }
        })
    }

    async fn established_connections(&mut self, port: u16) -> Result<u32, RemoteError> {
        self.host_op(|h| Ok(h.established.get(&port).copied().unwrap_or(0)))
    }

    async fn close(&mut self) {}
}

/// Answers probes from the running configuration of the target host.
pub struct FakeProbe {
    fleet: FakeFleet,
}

impl FakeProbe {
    fn check(
        &self,
        target: &ProbeTarget,
        check: impl FnOnce(&FakeHost, &BTreeMap<String, String>) -> Result<(), String>,
        port_key: &str,
    ) -> ProbeOutcome {
        let result = self.fleet.with_host(&target.identity, |h| {
            if !h.reachable {
                return Err("connection refused: host unreachable".to_string());
            }
            let listener = h
                .units
                .values()
                .filter_map(|u| u.running.as_deref())
                .map(directives)
                .find(|d| {
                    d.get(port_key)
                        .and_then(|p| p.parse::<u16>().ok())
                        .is_some_and(|p| p != 0 && p == target.port)
                });
            let Some(directives) = listener else {
                return Err(format!("connection refused on port {}", target.port));
            };
            check(h, &directives)?;
            if let Some(required) = directives.get("requirepass") {
                if target.password.as_deref() != Some(required.as_str()) {
                    return Err("NOAUTH Authentication required".to_string());
                }
            }
            Ok(())
        });
        match result {
            Some(Ok(())) => ProbeOutcome::ok(format!("{}:{} answered PONG", target.address, target.port)),
            Some(Err(e)) => ProbeOutcome::failed(e),
            None => ProbeOutcome::failed(format!("unknown host {}", target.identity)),
        }
    }
}

#[async_trait]
impl ListenerProbe for FakeProbe {
    async fn plaintext(&self, target: &ProbeTarget) -> ProbeOutcome {
        self.check(target, |_, _| Ok(()), "port")
    }

    async fn tls(&self, target: &ProbeTarget, material: &TlsMaterial) -> ProbeOutcome {
        self.check(
            target,
            |host, d| {
                for key in ["tls-cert-file", "tls-key-file", "tls-ca-cert-file"] {
                    let path = d
                        .get(key)
                        .ok_or_else(|| format!("TLS listener has no {key}"))?;
                    if !host.files.contains_key(path) {
                        return Err(format!("{key} {path} is missing"));
                    }
                }
                let server_ca = d
                    .get("tls-ca-cert-file")
                    .and_then(|p| host.files.get(p))
                    .map(|f| f.contents.as_slice());
                if server_ca != Some(material.ca_pem.as_slice()) {
                    return Err("handshake: peer trusts a different CA".to_string());
                }
                Ok(())
            },
            "tls-port",
        )
    }
}

/// Last-wins `key value` directives, comments skipped.
fn directives(config: &str) -> BTreeMap<String, String> {
    config
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| {
            let mut parts = l.splitn(2, char::is_whitespace);
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or("").trim().trim_matches('"').to_string();
            Some((key, value))
        })
        .collect()
}
