use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Settings of the `ip4tc` binary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Table used when a command does not name one
    #[serde(default = "default_table")]
    pub default_table: String,
    /// Record every mutating command in the audit log
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_table: default_table(),
            audit_enabled: true,
        }
    }
}

fn default_table() -> String {
    "filter".to_string()
}

fn default_true() -> bool {
    true
}

fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join("config.json"))
}

/// Saves the config atomically: writes to a temporary file next to `path`
/// and renames it into place.
///
/// # Security
///
/// The file is created with mode 0o600 (user read/write only) before any
/// data is written.
pub fn save_config_to(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let json = serde_json::to_string_pretty(config)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(json.as_bytes())?;
    file.as_file().sync_all()?;

    file.persist(path).map_err(|e| {
        if e.error.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e.error
        }
    })?;
    Ok(())
}

/// Loads the config from the data directory. On first run the defaults are
/// written out so they can be edited; an unreadable file yields defaults.
pub fn load_or_init_config() -> std::io::Result<AppConfig> {
    match config_path() {
        Some(path) => load_or_init_config_from(&path),
        None => Ok(AppConfig::default()),
    }
}

pub fn load_or_init_config_from(path: &Path) -> std::io::Result<AppConfig> {
    if path.exists() {
        return Ok(load_config_from(path));
    }
    let config = AppConfig::default();
    save_config_to(&config, path)?;
    Ok(config)
}

/// Loads the config, or returns the default if missing or unreadable.
pub fn load_config_from(path: &Path) -> AppConfig {
    if let Ok(json) = std::fs::read_to_string(path)
        && let Ok(config) = serde_json::from_str::<AppConfig>(&json)
    {
        return config;
    }
    AppConfig::default()
}
