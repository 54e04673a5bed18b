//! equaforge runtime configuration schema.
//!
//! Every field is optional in the file; [`crate::apply_all_defaults`] fills
//! the gaps and the accessors fall back to the same defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults::*;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EquaforgeConfig {
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub queues: QueuesConfig,
    pub training: TrainingConfig,
    pub model: ModelConfig,
    pub trainer: TrainerConfig,
    pub display: DisplayConfig,
    pub workers: WorkersConfig,
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy_timeout_ms: Option<u64>,
}

impl StoreConfig {
    pub fn path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS))
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Connection attempts before giving up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    /// Unacknowledged deliveries older than this are handed out again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility_timeout_secs: Option<u64>,
    /// 0 = redeliver forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_redeliveries: Option<u32>,
}

impl BrokerConfig {
    pub fn path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BROKER_PATH))
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.unwrap_or(DEFAULT_CONNECT_ATTEMPTS)
    }

    pub fn retry_base_delay_ms(&self) -> u64 {
        self.retry_base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS))
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(
            self.visibility_timeout_secs
                .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT_SECS),
        )
    }

    pub fn max_redeliveries(&self) -> u32 {
        self.max_redeliveries.unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Queue names
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueuesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub training: Option<String>,
}

impl QueuesConfig {
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE_QUEUE)
    }

    pub fn result(&self) -> &str {
        self.result.as_deref().unwrap_or(DEFAULT_RESULT_QUEUE)
    }

    pub fn training(&self) -> &str {
        self.training.as_deref().unwrap_or(DEFAULT_TRAINING_QUEUE)
    }
}

// ---------------------------------------------------------------------------
// Training thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_train_batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,
}

impl TrainingConfig {
    pub fn min_train_batch_size(&self) -> usize {
        self.min_train_batch_size
            .unwrap_or(DEFAULT_MIN_TRAIN_BATCH_SIZE)
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size.unwrap_or(DEFAULT_MAX_BATCH_SIZE)
    }
}

// ---------------------------------------------------------------------------
// External programs
// ---------------------------------------------------------------------------

/// OCR model program. Arguments may use `{image}` and `{weights}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_weights_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ModelConfig {
    pub fn active_weights_path(&self) -> PathBuf {
        self.active_weights_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ACTIVE_WEIGHTS_PATH))
    }

    pub fn timeout(&self) -> Option<Duration> {
        seconds_or_none(self.timeout_secs.unwrap_or(DEFAULT_MODEL_TIMEOUT_SECS))
    }
}

/// Training program. Arguments may use `{config}` and `{output}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights_extension: Option<String>,
    /// 0 = no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl TrainerConfig {
    pub fn weights_extension(&self) -> &str {
        self.weights_extension
            .as_deref()
            .unwrap_or(DEFAULT_WEIGHTS_EXTENSION)
    }

    pub fn timeout(&self) -> Option<Duration> {
        seconds_or_none(self.timeout_secs.unwrap_or(0))
    }
}

fn seconds_or_none(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

// ---------------------------------------------------------------------------
// Display index, process counts, logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DisplayConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_path: Option<PathBuf>,
}

impl DisplayConfig {
    pub fn index_path(&self) -> PathBuf {
        self.index_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DISPLAY_INDEX_PATH))
    }
}

/// Processes started per role by the launcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkersConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_sink: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<usize>,
}

impl WorkersConfig {
    pub fn inference(&self) -> usize {
        self.inference.unwrap_or(DEFAULT_INFERENCE_WORKERS)
    }

    pub fn result_sink(&self) -> usize {
        self.result_sink.unwrap_or(DEFAULT_RESULT_SINK_WORKERS)
    }

    pub fn coordinator(&self) -> usize {
        self.coordinator.unwrap_or(DEFAULT_COORDINATOR_WORKERS)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Directory for the rolling log file; console only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<bool>,
}

impl LoggingConfig {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn json(&self) -> bool {
        self.json.unwrap_or(false)
    }
}
