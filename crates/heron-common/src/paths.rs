use std::path::PathBuf;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "HERON_DATA_DIR";

/// Root data directory for heron.
///
/// Holds the default `config.toml`, the local certificate material,
/// migration state, and the audit log. All of it is operator-host local.
///
/// - `HERON_DATA_DIR` if set
/// - Linux: `~/.heron/`
/// - macOS: `~/Library/Application Support/heron/`
/// - Windows: `%LOCALAPPDATA%\heron\`
pub fn heron_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("heron");
        }
    }

    #[cfg(windows)]
    {
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            return PathBuf::from(local).join("heron");
        }
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".heron");
        }
    }

    PathBuf::from(".heron")
}

/// Migration and last-run state.
pub fn heron_state_dir() -> PathBuf {
    heron_data_dir().join("state")
}

/// Log directory (audit log lives here).
pub fn heron_log_dir() -> PathBuf {
    heron_data_dir().join("logs")
}

/// Default local certificate directory.
pub fn heron_certs_dir() -> PathBuf {
    heron_data_dir().join("certs")
}

/// Default configuration file.
pub fn heron_config_path() -> PathBuf {
    heron_data_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subdirectories_hang_off_the_data_dir() {
        let root = heron_data_dir();
        assert_eq!(heron_state_dir(), root.join("state"));
        assert_eq!(heron_log_dir(), root.join("logs"));
        assert_eq!(heron_certs_dir(), root.join("certs"));
        assert_eq!(heron_config_path(), root.join("config.toml"));
    }
}
