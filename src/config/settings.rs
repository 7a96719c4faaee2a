//! Settings File
//!
//! The CLI reads its settings from `~/.gateway-tunnel/settings.json`, or from
//! the path given with `--config`. A missing file means defaults. Nothing in
//! this crate writes the file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use super::types::{SettingsFile, CONFIG_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to determine home directory")]
    NoHomeDir,

    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed settings in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Settings version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// `~/.gateway-tunnel/settings.json`
pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    dirs::home_dir()
        .map(|home| home.join(".gateway-tunnel").join("settings.json"))
        .ok_or(SettingsError::NoHomeDir)
}

/// Read and validate the settings at `path`
pub async fn load_settings(path: &Path) -> Result<SettingsFile, SettingsError> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(SettingsFile::default());
        }
        Err(source) => {
            return Err(SettingsError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let settings: SettingsFile =
        serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    check(&settings)?;
    Ok(settings)
}

fn check(settings: &SettingsFile) -> Result<(), SettingsError> {
    if settings.version > CONFIG_VERSION {
        return Err(SettingsError::VersionTooNew {
            found: settings.version,
            supported: CONFIG_VERSION,
        });
    }
    if settings.connection.is_remote() && settings.connection.target.trim().is_empty() {
        return Err(SettingsError::Invalid(
            "remote mode needs connection.target".into(),
        ));
    }
    if settings.gateway_port == Some(0) {
        return Err(SettingsError::Invalid("gateway_port must not be 0".into()));
    }
    if settings.tunnel.ready_timeout_ms == 0 {
        return Err(SettingsError::Invalid(
            "tunnel.ready_timeout_ms must be positive".into(),
        ));
    }
    Ok(())
}
