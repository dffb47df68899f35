//! Listener probes: "does this service answer on this port?"
//!
//! The native probe speaks just enough RESP to authenticate and `PING`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

#[derive(Debug, Clone)]
pub struct ProbeTarget {
    /// Identity name, used to look up the host in logs and fakes.
    pub identity: String,
    /// Address dialed, also the TLS server name.
    pub address: String,
    pub port: u16,
    /// Legacy shared secret sent with `AUTH` when present.
    pub password: Option<String>,
}

/// Client-side material for an mTLS probe.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    pub reachable: bool,
    pub detail: String,
}

impl ProbeOutcome {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            reachable: true,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait ListenerProbe: Send + Sync {
    async fn plaintext(&self, target: &ProbeTarget) -> ProbeOutcome;

    async fn tls(&self, target: &ProbeTarget, material: &TlsMaterial) -> ProbeOutcome;
}

/// Native RESP probe over TCP or TLS.
pub struct RespProbe {
    timeout: Duration,
}

impl RespProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for RespProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl ListenerProbe for RespProbe {
    async fn plaintext(&self, target: &ProbeTarget) -> ProbeOutcome {
        let attempt = async {
            let mut stream = TcpStream::connect((target.address.as_str(), target.port))
                .await
                .map_err(|e| format!("connect: {e}"))?;
            ping(&mut stream, target.password.as_deref()).await
        };
        finish(target, "plaintext", timeout(self.timeout, attempt).await)
    }

    async fn tls(&self, target: &ProbeTarget, material: &TlsMaterial) -> ProbeOutcome {
        let attempt = async {
            let config = client_config(material)?;
            let server_name = ServerName::try_from(target.address.clone())
                .map_err(|e| format!("server name: {e}"))?;
            let tcp = TcpStream::connect((target.address.as_str(), target.port))
                .await
                .map_err(|e| format!("connect: {e}"))?;
            let mut stream = TlsConnector::from(Arc::new(config))
                .connect(server_name, tcp)
                .await
                .map_err(|e| format!("handshake: {e}"))?;
            ping(&mut stream, target.password.as_deref()).await
        };
        finish(target, "tls", timeout(self.timeout, attempt).await)
    }
}

fn finish(
    target: &ProbeTarget,
    kind: &str,
    result: Result<Result<(), String>, tokio::time::error::Elapsed>,
) -> ProbeOutcome {
    let outcome = match result {
        Ok(Ok(())) => ProbeOutcome::ok(format!("{kind} {}:{} answered PONG", target.address, target.port)),
        Ok(Err(e)) => ProbeOutcome::failed(format!("{kind} {}:{}: {e}", target.address, target.port)),
        Err(_) => ProbeOutcome::failed(format!("{kind} {}:{}: timed out", target.address, target.port)),
    };
    tracing::debug!(identity = %target.identity, kind, reachable = outcome.reachable, detail = %outcome.detail, "Listener probe");
    outcome
}

fn client_config(material: &TlsMaterial) -> Result<ClientConfig, String> {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut material.ca_pem.as_slice()) {
        let cert = cert.map_err(|e| format!("CA certificate: {e}"))?;
        roots.add(cert).map_err(|e| format!("CA certificate: {e}"))?;
    }
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut material.cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("client certificate: {e}"))?;
    let key = rustls_pemfile::private_key(&mut material.key_pem.as_slice())
        .map_err(|e| format!("client key: {e}"))?
        .ok_or_else(|| "client key: no private key found".to_string())?;

    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("TLS config: {e}"))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| format!("TLS config: {e}"))
}

async fn ping<S>(stream: &mut S, password: Option<&str>) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(password) = password {
        stream
            .write_all(&resp_command(&["AUTH", password]))
            .await
            .map_err(|e| format!("write: {e}"))?;
        let reply = read_line(stream).await?;
        if reply != "+OK" {
            return Err(format!("AUTH rejected: {reply}"));
        }
    }
    stream
        .write_all(&resp_command(&["PING"]))
        .await
        .map_err(|e| format!("write: {e}"))?;
    let reply = read_line(stream).await?;
    if reply == "+PONG" {
        Ok(())
    } else {
        Err(format!("unexpected reply: {reply}"))
    }
}

fn resp_command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one CRLF-terminated line. Replies are short, so byte-at-a-time is fine.
async fn read_line<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String, String> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await.map_err(|e| format!("read: {e}"))?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > 4096 {
            return Err("reply line too long".to_string());
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resp_command_encodes_bulk_strings() {
        assert_eq!(
            resp_command(&["AUTH", "s3cret"]),
            b"*2\r\n$4\r\nAUTH\r\n$6\r\ns3cret\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn ping_with_auth_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"*2\r\n$4\r\nAUTH"));
            server.write_all(b"+OK\r\n").await.unwrap();
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*1\r\n$4\r\nPING\r\n");
            server.write_all(b"+PONG\r\n").await.unwrap();
        });
        ping(&mut client, Some("s3cret")).await.unwrap();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn ping_reports_auth_rejection() {
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            let _ = server.read(&mut buf).await;
            let _ = server.write_all(b"-WRONGPASS invalid password\r\n").await;
        });
        let err = ping(&mut client, Some("nope")).await.unwrap_err();
        assert!(err.contains("WRONGPASS"));
    }

    #[tokio::test]
    async fn plaintext_probe_of_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = RespProbe::new(Duration::from_secs(2));
        let outcome = probe
            .plaintext(&ProbeTarget {
                identity: "redis".into(),
                address: "127.0.0.1".into(),
                port,
                password: None,
            })
            .await;
        assert!(!outcome.reachable);
    }

    #[test]
    fn client_config_rejects_missing_key() {
        let material = TlsMaterial {
            ca_pem: Vec::new(),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
        };
        let err = client_config(&material).unwrap_err();
        assert!(err.contains("no private key"));
    }
}
