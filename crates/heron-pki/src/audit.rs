//! Append-only audit log.
//!
//! Every certificate issuance, remote change, and migration step is logged
//! with a timestamp and key=value metadata. The log is human-readable and
//! append-only (no edits, no deletes).

use std::path::{Path, PathBuf};

use chrono::Utc;

const AUDIT_FILENAME: &str = "heron-audit.log";

/// Where the audit trail goes. Cheap to clone; tests point it at a temp dir.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::at(heron_common::paths::heron_log_dir().join(AUDIT_FILENAME))
    }
}

impl AuditLog {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event. A failed write is logged and otherwise ignored.
    pub fn record(&self, event: &str, fields: &[(&str, &str)]) {
        if let Err(e) = append_entry_to(&self.path, event, fields) {
            tracing::warn!(event, path = %self.path.display(), error = %e, "Audit log write failed");
        }
    }

    pub fn read(&self) -> Result<String, std::io::Error> {
        if self.path.exists() {
            std::fs::read_to_string(&self.path)
        } else {
            Ok(String::new())
        }
    }
}

/// Append an audit entry to a specific path.
///
/// Format: `2026-02-11T10:30:00Z | leaf_issued | identity=redis | fingerprint=ab12..`
pub fn append_entry_to(
    path: &Path,
    event: &str,
    fields: &[(&str, &str)],
) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let mut line = format!("{timestamp} | {event}");

    for (key, value) in fields {
        line.push_str(&format!(" | {key}={value}"));
    }
    line.push('\n');

    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;

    tracing::debug!(event, "Audit log entry written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use heron_common::test::temp_dir;

    #[test]
    fn append_and_read_entries() {
        let log = AuditLog::at(temp_dir("audit").join("logs").join("audit.log"));

        log.record("ca_created", &[("fingerprint", "ab12"), ("algorithm", "ecdsa-p256")]);
        log.record("leaf_issued", &[("identity", "redis")]);

        let content = log.read().unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(" | ca_created | fingerprint=ab12 | algorithm=ecdsa-p256"));
        assert!(lines[1].ends_with("| leaf_issued | identity=redis"));
    }

    #[test]
    fn missing_log_reads_empty() {
        let log = AuditLog::at(temp_dir("audit-missing").join("none.log"));
        assert_eq!(log.read().unwrap(), "");
    }

    #[test]
    fn unwritable_log_does_not_panic() {
        let dir = temp_dir("audit-unwritable");
        // The log path is a directory, so every append fails.
        AuditLog::at(&dir).record("rollback", &[("service", "redis")]);
    }
}
