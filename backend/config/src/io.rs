//! Config file location, raw loading and atomic writes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::schema::EquaforgeConfig;

const CONFIG_FILE_NAME: &str = "config.yaml";

/// Rolling `config.yaml.bak.N` copies kept on write.
const MAX_BACKUPS: usize = 3;

/// `EQUAFORGE_CONFIG_DIR`, else `~/.equaforge`, else `./.equaforge`.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("EQUAFORGE_CONFIG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".equaforge"))
        .unwrap_or_else(|| PathBuf::from(".equaforge"))
}

pub fn config_file_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

/// Read the YAML document as an untyped tree so env references can be
/// resolved before typed parsing. A missing or empty file is an empty
/// mapping.
pub async fn load_raw(path: &Path) -> Result<Value> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        debug!(path = %path.display(), "Config file does not exist; using defaults");
        return Ok(Value::Object(Default::default()));
    }
    let raw = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    let value: Value = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config YAML at: {}", path.display()))?;
    if value.is_null() {
        return Ok(Value::Object(Default::default()));
    }
    info!(path = %path.display(), "Loaded config");
    Ok(value)
}

/// Load the typed config without env substitution or defaults.
pub async fn load_config(path: &Path) -> Result<EquaforgeConfig> {
    let value = load_raw(path).await?;
    serde_json::from_value(value)
        .with_context(|| format!("invalid config at: {}", path.display()))
}

/// Write the config atomically (temp file in the same directory, then
/// rename), keeping rolling backups of the previous file.
pub async fn write_config(config: &EquaforgeConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    if fs::try_exists(path).await.unwrap_or(false) {
        rotate_backups(path).await;
    }

    let yaml = serde_yaml::to_string(config).context("failed to serialize config to YAML")?;
    let tmp_path = path.with_extension("yaml.tmp");
    fs::write(&tmp_path, yaml.as_bytes())
        .await
        .with_context(|| format!("failed to write temp config: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("failed to move config into place: {}", path.display()))?;

    info!(path = %path.display(), "Wrote config");
    Ok(())
}

async fn rotate_backups(path: &Path) {
    for i in (1..MAX_BACKUPS).rev() {
        let older = path.with_extension(format!("yaml.bak.{i}"));
        let newer = path.with_extension(format!("yaml.bak.{}", i + 1));
        if fs::try_exists(&older).await.unwrap_or(false) {
            if let Err(e) = fs::rename(&older, &newer).await {
                warn!(backup = %older.display(), error = %e, "Failed to rotate config backup");
            }
        }
    }
    let first = path.with_extension("yaml.bak.1");
    if let Err(e) = fs::copy(path, &first).await {
        warn!(backup = %first.display(), error = %e, "Failed to back up config");
    }
}
