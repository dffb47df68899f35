//! SSH-backed sessions (russh).
//!
//! Every structured operation becomes a single remote `sh -c` script, run
//! through `sudo -n` when `remote.use_sudo` is set. File contents travel on
//! the channel's stdin, never on the command line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{self, ssh_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect};

use heron_config::RemoteSettings;

use crate::{CommandOutput, Connector, HostTarget, RemoteError, RemoteSession};

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

pub struct SshConnector {
    user: String,
    private_key: PathBuf,
    port: u16,
    connect_timeout: Duration,
    use_sudo: bool,
    known_hosts: PathBuf,
    accept_unknown_host_keys: bool,
}

impl SshConnector {
    pub fn from_settings(settings: &RemoteSettings) -> Self {
        Self {
            user: settings.user.clone(),
            private_key: settings.private_key_path(),
            port: settings.port,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            use_sudo: settings.use_sudo,
            known_hosts: settings.known_hosts_path(),
            accept_unknown_host_keys: settings.accept_unknown_host_keys,
        }
    }

    fn load_key(&self) -> Result<ssh_key::PrivateKey, RemoteError> {
        keys::load_secret_key(&self.private_key, None).map_err(|e| {
            RemoteError::Credential(format!("{}: {e}", self.private_key.display()))
        })
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, target: &HostTarget) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let key = Arc::new(self.load_key()?);
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            ..Default::default()
        });
        let handler = HostKeyCheck {
            host: target.address.clone(),
            port: self.port,
            known_hosts: self.known_hosts.clone(),
            accept_unknown: self.accept_unknown_host_keys,
        };

        tracing::debug!(identity = %target.name, address = %target.address, port = self.port, "Opening SSH session");
        let connecting = client::connect(config, (target.address.as_str(), self.port), handler);
        let mut handle = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| RemoteError::Timeout {
                host: target.name.clone(),
                secs: self.connect_timeout.as_secs(),
            })?
            .map_err(|e| match e {
                russh::Error::UnknownKey => RemoteError::HostKey {
                    host: target.name.clone(),
                },
                other => RemoteError::Connect {
                    host: target.name.clone(),
                    reason: other.to_string(),
                },
            })?;

        let hash = handle
            .best_supported_rsa_hash()
            .await
            .map_err(protocol)?
            .flatten();
        let auth = handle
            .authenticate_publickey(&self.user, PrivateKeyWithHashAlg::new(key, hash))
            .await
            .map_err(protocol)?;
        if !auth.success() {
            return Err(RemoteError::Auth {
                host: target.name.clone(),
                user: self.user.clone(),
            });
        }

        Ok(Box::new(SshSession {
            host: target.name.clone(),
            handle,
            use_sudo: self.use_sudo,
        }))
    }

    fn preflight(&self) -> Result<(), RemoteError> {
        if !self.private_key.exists() {
            return Err(RemoteError::Credential(format!(
                "{} does not exist",
                self.private_key.display()
            )));
        }
        self.load_key().map(|_| ())
    }
}

struct HostKeyCheck {
    host: String,
    port: u16,
    known_hosts: PathBuf,
    accept_unknown: bool,
}

impl HostKeyCheck {
    /// A recorded key must match. An unrecorded host passes only when
    /// unknown keys are explicitly accepted.
    fn verify(&self, server_public_key: &ssh_key::PublicKey) -> bool {
        match keys::check_known_hosts_path(&self.host, self.port, server_public_key, &self.known_hosts) {
            Ok(true) => true,
            Ok(false) if self.accept_unknown => {
                tracing::warn!(host = %self.host, "Host key not in known_hosts, accepting as configured");
                true
            }
            Ok(false) => {
                tracing::warn!(host = %self.host, path = %self.known_hosts.display(), "Host key not in known_hosts");
                false
            }
            Err(e) => {
                tracing::warn!(host = %self.host, error = %e, "Host key check failed");
                false
            }
        }
    }
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self.verify(server_public_key))
    }
}

pub struct SshSession {
    host: String,
    handle: Handle<HostKeyCheck>,
    use_sudo: bool,
}

struct RawOutput {
    status: u32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl SshSession {
    async fn run(&mut self, command: &str, stdin: Option<&[u8]>) -> Result<RawOutput, RemoteError> {
        let mut channel = self.handle.channel_open_session().await.map_err(protocol)?;
        channel.exec(true, command).await.map_err(protocol)?;
        if let Some(data) = stdin {
            channel.data(data).await.map_err(protocol)?;
        }
        channel.eof().await.map_err(protocol)?;

        let mut out = RawOutput {
            status: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        };
        let mut status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => out.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                    out.stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                _ => {}
            }
        }
        out.status = status.ok_or_else(|| {
            RemoteError::Protocol(format!("no exit status from {} for `{command}`", self.host))
        })?;
        Ok(out)
    }

    /// Run a privileged script and fail on a non-zero exit.
    async fn check(&mut self, script: &str, stdin: Option<&[u8]>) -> Result<RawOutput, RemoteError> {
        let command = wrap(script, self.use_sudo);
        let out = self.run(&command, stdin).await?;
        if out.status != 0 {
            return Err(RemoteError::Command {
                host: self.host.clone(),
                command: script.to_string(),
                status: out.status,
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn exec(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        let out = self.run(command, None).await?;
        Ok(CommandOutput {
            status: out.status,
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }

    async fn ensure_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        self.check(&mkdir_script(path), None).await.map(|_| ())
    }

    async fn write_file(
        &mut self,
        path: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<(), RemoteError> {
        self.check(&write_script(path, mode), Some(contents))
            .await
            .map(|_| ())
    }

    async fn replace_file(&mut self, path: &str, contents: &[u8]) -> Result<(), RemoteError> {
        self.check(&replace_script(path), Some(contents))
            .await
            .map(|_| ())
    }

    async fn read_file(&mut self, path: &str) -> Result<Vec<u8>, RemoteError> {
        let script = format!("cat {}", quote(path));
        Ok(self.check(&script, None).await?.stdout)
    }

    async fn file_exists(&mut self, path: &str) -> Result<bool, RemoteError> {
        let command = wrap(&exists_script(path), self.use_sudo);
        let out = self.run(&command, None).await?;
        exists_from_output(&self.host, path, out)
    }

    async fn file_mode(&mut self, path: &str) -> Result<u32, RemoteError> {
        let out = self.check(&format!("stat -c %a {}", quote(path)), None).await?;
        let text = String::from_utf8_lossy(&out.stdout);
        u32::from_str_radix(text.trim(), 8)
            .map_err(|_| RemoteError::Protocol(format!("unexpected mode '{}'", text.trim())))
    }

    async fn chown(&mut self, path: &str, owner: &str, group: &str) -> Result<(), RemoteError> {
        let script = format!("chown {} {}", quote(&format!("{owner}:{group}")), quote(path));
        self.check(&script, None).await.map(|_| ())
    }

    async fn copy_file(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        let script = format!("cp -p {} {}", quote(from), quote(to));
        self.check(&script, None).await.map(|_| ())
    }

    async fn restart_service(&mut self, unit: &str) -> Result<(), RemoteError> {
        tracing::info!(host = %self.host, unit, "Restarting service");
        let script = format!("systemctl restart {}", quote(unit));
        self.check(&script, None).await.map(|_| ())
    }

    async fn established_connections(&mut self, port: u16) -> Result<u32, RemoteError> {
        let out = self.check(&established_script(port), None).await?;
        let text = String::from_utf8_lossy(&out.stdout);
        text.trim()
            .parse()
            .map_err(|_| RemoteError::Protocol(format!("unexpected count '{}'", text.trim())))
    }

    async fn close(&mut self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            tracing::debug!(host = %self.host, error = %e, "SSH disconnect failed");
        }
    }
}

fn protocol(e: russh::Error) -> RemoteError {
    RemoteError::Protocol(e.to_string())
}

/// Single-quote for POSIX sh.
pub(crate) fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn wrap(script: &str, use_sudo: bool) -> String {
    if use_sudo {
        format!("sudo -n sh -c {}", quote(script))
    } else {
        format!("sh -c {}", quote(script))
    }
}

fn mkdir_script(path: &str) -> String {
    format!("mkdir -p {p} && chmod 755 {p}", p = quote(path))
}

/// Write via a sibling temp file so a reader never sees a partial file.
fn write_script(path: &str, mode: u32) -> String {
    let tmp = quote(&format!("{path}.heron-tmp"));
    format!(
        "umask 077 && cat > {tmp} && chmod {mode:o} {tmp} && mv -f {tmp} {}",
        quote(path)
    )
}

fn replace_script(path: &str) -> String {
    let tmp = quote(&format!("{path}.heron-tmp"));
    let p = quote(path);
    format!(
        "test -f {p} && cat > {tmp} && chown --reference={p} {tmp} && chmod --reference={p} {tmp} && mv -f {tmp} {p}"
    )
}

/// Exit status of [`exists_script`] for a path that is not there. Anything
/// other than this or 0 (a failed `sudo -n`, a shell error) is a failure.
const MISSING_STATUS: u32 = 3;

fn exists_script(path: &str) -> String {
    format!("if test -e {}; then exit 0; else exit {MISSING_STATUS}; fi", quote(path))
}

fn exists_from_output(host: &str, path: &str, out: RawOutput) -> Result<bool, RemoteError> {
    match out.status {
        0 => Ok(true),
        MISSING_STATUS => Ok(false),
        status => Err(RemoteError::Command {
            host: host.to_string(),
            command: format!("test -e {path}"),
            status,
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        }),
    }
}

fn established_script(port: u16) -> String {
    format!("ss -Htn state established '( sport = :{port} )' | wc -l")
}
