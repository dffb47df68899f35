//! Certificate file layout and writing.
//!
//! Local and remote trees share one shape:
//!
//! ```text
//! <root>/ca-cert.pem
//! <root>/ca-key.pem                  (local only, 0600)
//! <root>/<identity>/server-cert.pem  (0644)
//! <root>/<identity>/server-key.pem   (0600)
//! ```

use std::path::{Path, PathBuf};

pub const CA_CERT_FILENAME: &str = "ca-cert.pem";
pub const CA_KEY_FILENAME: &str = "ca-key.pem";
pub const LEAF_CERT_FILENAME: &str = "server-cert.pem";
pub const LEAF_KEY_FILENAME: &str = "server-key.pem";

pub const PUBLIC_MODE: u32 = 0o644;
pub const PRIVATE_MODE: u32 = 0o600;

/// The operator host's certificate directory.
#[derive(Debug, Clone)]
pub struct CertLayout {
    root: PathBuf,
}

impl CertLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ca_cert(&self) -> PathBuf {
        self.root.join(CA_CERT_FILENAME)
    }

    pub fn ca_key(&self) -> PathBuf {
        self.root.join(CA_KEY_FILENAME)
    }

    pub fn identity_dir(&self, identity: &str) -> PathBuf {
        self.root.join(identity)
    }

    pub fn leaf_cert(&self, identity: &str) -> PathBuf {
        self.identity_dir(identity).join(LEAF_CERT_FILENAME)
    }

    pub fn leaf_key(&self, identity: &str) -> PathBuf {
        self.identity_dir(identity).join(LEAF_KEY_FILENAME)
    }
}

/// The mirrored tree on a fleet host. Always `/`-separated.
#[derive(Debug, Clone)]
pub struct RemoteLayout {
    root: String,
}

impl RemoteLayout {
    pub fn new(root: impl Into<String>) -> Self {
        let root: String = root.into();
        let trimmed = root.trim_end_matches('/');
        Self {
            root: if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() },
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn join(&self, rest: &str) -> String {
        if self.root == "/" {
            format!("/{rest}")
        } else {
            format!("{}/{rest}", self.root)
        }
    }

    pub fn ca_cert(&self) -> String {
        self.join(CA_CERT_FILENAME)
    }

    pub fn identity_dir(&self, identity: &str) -> String {
        self.join(identity)
    }

    pub fn leaf_cert(&self, identity: &str) -> String {
        self.join(&format!("{identity}/{LEAF_CERT_FILENAME}"))
    }

    pub fn leaf_key(&self, identity: &str) -> String {
        self.join(&format!("{identity}/{LEAF_KEY_FILENAME}"))
    }
}

/// Write a public PEM (certificate) at 0644.
pub fn write_public(path: &Path, pem: &str) -> Result<(), std::io::Error> {
    write_with_mode(path, pem, PUBLIC_MODE)
}

/// Write a private key PEM at 0600. The file is created with that mode, so
/// the key is never readable by others, not even briefly.
pub fn write_private(path: &Path, pem: &str) -> Result<(), std::io::Error> {
    write_with_mode(path, pem, PRIVATE_MODE)
}

fn write_with_mode(path: &Path, contents: &str, mode: u32) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("pem.tmp");
    let _ = std::fs::remove_file(&tmp);

    {
        use std::io::Write;
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }

    // The create mode is filtered by the umask; set it explicitly.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    std::fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), mode = %format!("{mode:o}"), "Certificate file written");
    Ok(())
}
