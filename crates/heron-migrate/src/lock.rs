//! Per-identity migration lock.
//!
//! `<state_dir>/migration-<identity>.lock`, created exclusively. A second
//! run against the same identity fails fast and names the holder. The file
//! is removed when the guard drops.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::MigrationError;

#[derive(Debug)]
pub struct MigrationLock {
    path: PathBuf,
}

impl MigrationLock {
    pub fn path_for(state_dir: &Path, identity: &str) -> PathBuf {
        state_dir.join(format!("migration-{identity}.lock"))
    }

    pub fn acquire(state_dir: &Path, identity: &str) -> Result<Self, MigrationError> {
        std::fs::create_dir_all(state_dir)?;
        let path = Self::path_for(state_dir, identity);
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "an unknown process".to_string());
                return Err(MigrationError::Locked {
                    identity: identity.to_string(),
                    holder,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());
        writeln!(
            file,
            "pid {} on {host} since {}",
            std::process::id(),
            Utc::now().to_rfc3339()
        )?;
        tracing::debug!(path = %path.display(), "Migration lock acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release migration lock");
        }
    }
}
