//! TLS stanza rendering and config-file transforms (Redis dialect).
//!
//! The managed block is fenced by marker comments so it can be removed
//! exactly or replaced in place. Directives are last-wins, so a stanza
//! appended after the original `port` line overrides it.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const BEGIN_MARKER: &str = "# >>> heron tls (managed) >>>";
pub const END_MARKER: &str = "# <<< heron tls (managed) <<<";

/// Value that disables a listener port.
pub const DISABLED_PORT: u16 = 0;

/// Client-certificate requirement on the TLS listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAuthMode {
    /// Password or certificate; used during migration.
    Optional,
    /// Certificate mandatory.
    Required,
    None,
}

impl ClientAuthMode {
    pub fn directive_value(self) -> &'static str {
        match self {
            Self::Optional => "optional",
            Self::Required => "yes",
            Self::None => "no",
        }
    }
}

impl fmt::Display for ClientAuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Optional => f.write_str("optional"),
            Self::Required => f.write_str("required"),
            Self::None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsStanza {
    pub tls_port: u16,
    /// `None` renders the disabled sentinel.
    pub plaintext_port: Option<u16>,
    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,
    pub client_auth: ClientAuthMode,
}

impl TlsStanza {
    pub fn render(&self) -> String {
        let port = self.plaintext_port.unwrap_or(DISABLED_PORT);
        format!(
            "{BEGIN_MARKER}\n\
             tls-port {}\n\
             port {port}\n\
             tls-cert-file {}\n\
             tls-key-file {}\n\
             tls-ca-cert-file {}\n\
             tls-auth-clients {}\n\
             {END_MARKER}\n",
            self.tls_port,
            self.cert_file,
            self.key_file,
            self.ca_file,
            self.client_auth.directive_value(),
        )
    }
}

/// Last active value of `key`, ignoring comments.
pub fn directive_value(config: &str, key: &str) -> Option<String> {
    config
        .lines()
        .filter_map(|line| parse_directive(line))
        .filter(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.to_string())
        .last()
}

fn parse_directive(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.splitn(2, char::is_whitespace);
    let key = parts.next()?;
    let value = parts.next().unwrap_or("").trim().trim_matches('"');
    Some((key, value))
}

/// TLS already present: our block, or an active non-zero `tls-port`.
pub fn has_tls(config: &str) -> bool {
    config.lines().any(|l| l.trim() == BEGIN_MARKER)
        || directive_value(config, "tls-port").is_some_and(|v| v != "0")
}

pub fn append(config: &str, stanza: &TlsStanza) -> String {
    let mut out = config.to_string();
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(&stanza.render());
    out
}

/// Remove the managed block. Returns the new text and whether a block was found.
pub fn strip(config: &str) -> (String, bool) {
    let mut out = String::with_capacity(config.len());
    let mut inside = false;
    let mut found = false;
    for line in config.split_inclusive('\n') {
        let trimmed = line.trim();
        if trimmed == BEGIN_MARKER {
            inside = true;
            found = true;
            continue;
        }
        if inside {
            if trimmed == END_MARKER {
                inside = false;
            }
            continue;
        }
        out.push_str(line);
    }
    (out, found)
}

/// Drop every active line setting `key`.
pub fn remove_directive(config: &str, key: &str) -> String {
    config
        .split_inclusive('\n')
        .filter(|line| !parse_directive(line).is_some_and(|(k, _)| k.eq_ignore_ascii_case(key)))
        .collect()
}

/// Cutover rewrite: plaintext disabled, certificates mandatory, legacy
/// password directive gone.
pub fn enforce_mtls(config: &str, stanza: &TlsStanza, password_directive: &str) -> String {
    let (base, _) = strip(config);
    let base = remove_directive(&base, password_directive);
    let enforced = TlsStanza {
        plaintext_port: None,
        client_auth: ClientAuthMode::Required,
        ..stanza.clone()
    };
    append(&base, &enforced)
}

/// Fallback when no backup exists: a plaintext-only listener on
/// `plaintext_port` with every TLS directive removed. A password directive
/// removed at cutover is not recoverable; the config then carries a note
/// to provision it again by hand.
pub fn reconstruct_plaintext(config: &str, plaintext_port: u16, password_directive: &str) -> String {
    let (mut base, _) = strip(config);
    for key in [
        "port",
        "tls-port",
        "tls-cert-file",
        "tls-key-file",
        "tls-ca-cert-file",
        "tls-auth-clients",
    ] {
        base = remove_directive(&base, key);
    }
    if !base.is_empty() && !base.ends_with('\n') {
        base.push('\n');
    }
    if directive_value(&base, password_directive).is_none() {
        base.push_str(&format!(
            "# heron: plaintext listener restored without backup; set `{password_directive}` again\n"
        ));
    }
    base.push_str(&format!("port {plaintext_port}\n"));
    base
}
