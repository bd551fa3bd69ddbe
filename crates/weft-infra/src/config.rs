//! Controller configuration loader.
//!
//! Reads `config.toml` (`~/.weft/config.toml` by default) into
//! [`ControllerConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::{Path, PathBuf};

use weft_types::config::ControllerConfig;

/// `~/.weft/config.toml`, or `./.weft/config.toml` when no home directory is known.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".weft")
        .join("config.toml")
}

/// Load controller configuration from `path`.
///
/// - If the file does not exist, returns [`ControllerConfig::default()`].
/// - If the file cannot be read or parsed, logs a warning and returns the default.
pub async fn load_controller_config(path: &Path) -> ControllerConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return ControllerConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return ControllerConfig::default();
        }
    };

    match toml::from_str::<ControllerConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            ControllerConfig::default()
        }
    }
}
