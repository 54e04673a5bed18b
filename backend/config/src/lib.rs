//! `equaforge-config`: runtime configuration for the equaforge workers.
//!
//! - Typed schema with per-field defaults
//! - YAML read and atomic write with backups
//! - `${ENV_VAR}` substitution
//! - Validation report

pub mod defaults;
pub mod env;
pub mod io;
pub mod schema;
pub mod validation;

pub use defaults::apply_all_defaults;
pub use env::{resolve_env_vars, resolve_env_vars_with, MissingEnvVarError};
pub use io::{config_dir, config_file_path, load_config, write_config};
pub use schema::{
    BrokerConfig, DisplayConfig, EquaforgeConfig, LoggingConfig, ModelConfig, QueuesConfig,
    StoreConfig, TrainerConfig, TrainingConfig, WorkersConfig,
};
pub use validation::{validate, ConfigValidationError, ValidationReport};

use std::path::Path;

use anyhow::{bail, Context, Result};

/// Load a config file, substitute env vars and apply defaults, without
/// validating.
pub async fn load_resolved(path: &Path) -> Result<EquaforgeConfig> {
    let raw = io::load_raw(path).await?;
    let value = resolve_env_vars(&raw).context("failed to resolve env vars in config")?;
    let config: EquaforgeConfig = serde_json::from_value(value)
        .with_context(|| format!("invalid config at: {}", path.display()))?;
    Ok(apply_all_defaults(config))
}

/// [`load_resolved`] followed by [`check`].
pub async fn load_and_prepare(path: &Path) -> Result<EquaforgeConfig> {
    let config = load_resolved(path).await?;
    check(&config)?;
    Ok(config)
}

/// Log the validation report and fail when it has errors.
pub fn check(config: &EquaforgeConfig) -> Result<()> {
    let report = validate(config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for error in &report.errors {
        tracing::error!(path = %error.path, message = %error.message, "Config error");
    }
    if !report.is_valid() {
        bail!(
            "config has {} error(s); first: {}",
            report.errors.len(),
            report.errors[0]
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepares_file_with_env_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::env::set_var("EQUAFORGE_TEST_QUEUE_PREFIX", "staging");
        std::fs::write(
            &path,
            "queues:\n  image: ${EQUAFORGE_TEST_QUEUE_PREFIX}-images\ntraining:\n  min_train_batch_size: 3\n",
        )
        .unwrap();

        let config = load_and_prepare(&path).await.unwrap();
        assert_eq!(config.queues.image(), "staging-images");
        assert_eq!(config.queues.result.as_deref(), Some("result-queue"));
        assert_eq!(config.training.min_train_batch_size, Some(3));
    }

    #[tokio::test]
    async fn validation_errors_abort() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "training:\n  min_train_batch_size: 1\n").unwrap();
        let err = load_and_prepare(&path).await.unwrap_err();
        assert!(err.to_string().contains("training.min_train_batch_size"));
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_and_prepare(&dir.path().join("absent.yaml")).await.unwrap();
        assert_eq!(config, apply_all_defaults(EquaforgeConfig::default()));
    }
}
