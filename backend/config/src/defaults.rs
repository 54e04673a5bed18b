//! Config defaults: fills every unset value so a loaded config is complete.

use std::path::PathBuf;

use crate::schema::EquaforgeConfig;

pub const DEFAULT_STORE_PATH: &str = "equaforge.db";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_BROKER_PATH: &str = "equaforge-broker.db";
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u64 = 1_800;

pub const DEFAULT_IMAGE_QUEUE: &str = "image-inference-queue";
pub const DEFAULT_RESULT_QUEUE: &str = "result-queue";
pub const DEFAULT_TRAINING_QUEUE: &str = "training-queue";

/// Corrections needed before a retrain job starts.
pub const DEFAULT_MIN_TRAIN_BATCH_SIZE: usize = 2;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 64;

pub const DEFAULT_ACTIVE_WEIGHTS_PATH: &str = "models/active.pth";
pub const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_WEIGHTS_EXTENSION: &str = "pth";

pub const DEFAULT_DISPLAY_INDEX_PATH: &str = "display_index.yaml";

pub const DEFAULT_INFERENCE_WORKERS: usize = 2;
pub const DEFAULT_RESULT_SINK_WORKERS: usize = 1;
pub const DEFAULT_COORDINATOR_WORKERS: usize = 2;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Apply all defaults to a freshly loaded config.
pub fn apply_all_defaults(config: EquaforgeConfig) -> EquaforgeConfig {
    let config = apply_storage_defaults(config);
    let config = apply_broker_defaults(config);
    let config = apply_pipeline_defaults(config);
    apply_process_defaults(config)
}

fn apply_storage_defaults(mut config: EquaforgeConfig) -> EquaforgeConfig {
    let store = &mut config.store;
    store
        .path
        .get_or_insert_with(|| PathBuf::from(DEFAULT_STORE_PATH));
    store.busy_timeout_ms.get_or_insert(DEFAULT_BUSY_TIMEOUT_MS);
    config
        .display
        .index_path
        .get_or_insert_with(|| PathBuf::from(DEFAULT_DISPLAY_INDEX_PATH));
    config
}

fn apply_broker_defaults(mut config: EquaforgeConfig) -> EquaforgeConfig {
    let broker = &mut config.broker;
    broker
        .path
        .get_or_insert_with(|| PathBuf::from(DEFAULT_BROKER_PATH));
    broker.connect_attempts.get_or_insert(DEFAULT_CONNECT_ATTEMPTS);
    broker
        .retry_base_delay_ms
        .get_or_insert(DEFAULT_RETRY_BASE_DELAY_MS);
    broker.poll_interval_ms.get_or_insert(DEFAULT_POLL_INTERVAL_MS);
    broker
        .visibility_timeout_secs
        .get_or_insert(DEFAULT_VISIBILITY_TIMEOUT_SECS);
    broker.max_redeliveries.get_or_insert(0);

    let queues = &mut config.queues;
    queues
        .image
        .get_or_insert_with(|| DEFAULT_IMAGE_QUEUE.to_string());
    queues
        .result
        .get_or_insert_with(|| DEFAULT_RESULT_QUEUE.to_string());
    queues
        .training
        .get_or_insert_with(|| DEFAULT_TRAINING_QUEUE.to_string());
    config
}

fn apply_pipeline_defaults(mut config: EquaforgeConfig) -> EquaforgeConfig {
    let training = &mut config.training;
    training
        .min_train_batch_size
        .get_or_insert(DEFAULT_MIN_TRAIN_BATCH_SIZE);
    training.max_batch_size.get_or_insert(DEFAULT_MAX_BATCH_SIZE);

    let model = &mut config.model;
    model
        .active_weights_path
        .get_or_insert_with(|| PathBuf::from(DEFAULT_ACTIVE_WEIGHTS_PATH));
    model.timeout_secs.get_or_insert(DEFAULT_MODEL_TIMEOUT_SECS);

    let trainer = &mut config.trainer;
    trainer
        .weights_extension
        .get_or_insert_with(|| DEFAULT_WEIGHTS_EXTENSION.to_string());
    trainer.timeout_secs.get_or_insert(0);
    config
}

fn apply_process_defaults(mut config: EquaforgeConfig) -> EquaforgeConfig {
    let workers = &mut config.workers;
    workers.inference.get_or_insert(DEFAULT_INFERENCE_WORKERS);
    workers.result_sink.get_or_insert(DEFAULT_RESULT_SINK_WORKERS);
    workers.coordinator.get_or_insert(DEFAULT_COORDINATOR_WORKERS);

    let logging = &mut config.logging;
    logging
        .level
        .get_or_insert_with(|| DEFAULT_LOG_LEVEL.to_string());
    logging.json.get_or_insert(false);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_every_unset_value() {
        let config = apply_all_defaults(EquaforgeConfig::default());
        assert_eq!(config.store.busy_timeout_ms, Some(DEFAULT_BUSY_TIMEOUT_MS));
        assert_eq!(config.broker.max_redeliveries, Some(0));
        assert_eq!(config.queues.image.as_deref(), Some(DEFAULT_IMAGE_QUEUE));
        assert_eq!(config.training.max_batch_size, Some(64));
        assert_eq!(config.trainer.weights_extension.as_deref(), Some("pth"));
        assert_eq!(config.workers.coordinator, Some(2));
        assert_eq!(config.logging.level.as_deref(), Some("info"));
        assert!(config.logging.dir.is_none());
        assert!(config.model.program.is_none());
    }

    #[test]
    fn keeps_explicit_values() {
        let mut config = EquaforgeConfig::default();
        config.training.min_train_batch_size = Some(16);
        config.queues.result = Some("results".into());
        let config = apply_all_defaults(config);
        assert_eq!(config.training.min_train_batch_size, Some(16));
        assert_eq!(config.queues.result(), "results");
    }

    #[test]
    fn defaulted_config_matches_accessors() {
        let bare = EquaforgeConfig::default();
        let full = apply_all_defaults(bare.clone());
        assert_eq!(full.store.path(), bare.store.path());
        assert_eq!(full.broker.visibility_timeout(), bare.broker.visibility_timeout());
        assert_eq!(full.model.timeout(), bare.model.timeout());
        assert_eq!(full.trainer.timeout(), bare.trainer.timeout());
    }
}
