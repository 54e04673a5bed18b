//! Training thresholds and the in-memory batch handed to a retrain job.

use serde::{Deserialize, Serialize};

use crate::error::ForgeError;
use crate::id::RecordId;

/// Upper bound on the trainer's batch sizes.
pub const MAX_TRAINER_BATCH: usize = 64;

/// Batch sizing derived from the minimum training batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingPolicy {
    pub min_train_batch_size: usize,
    pub max_batch_size: usize,
}

impl Default for TrainingPolicy {
    fn default() -> Self {
        Self {
            min_train_batch_size: 2,
            max_batch_size: MAX_TRAINER_BATCH,
        }
    }
}

impl TrainingPolicy {
    pub fn new(min_train_batch_size: usize) -> Self {
        Self {
            min_train_batch_size,
            ..Default::default()
        }
    }

    /// `max(1, max(floor(0.2 * min), floor(min / 2)))`
    pub fn validation_size(&self) -> usize {
        let min = self.min_train_batch_size;
        let fifth = (0.2 * min as f64).floor() as usize;
        1.max(fifth.max(min / 2))
    }

    /// Pending corrections needed before a batch is cut.
    pub fn threshold(&self) -> usize {
        self.min_train_batch_size + self.validation_size()
    }

    pub fn batch_size(&self, batch: &TrainingBatch) -> usize {
        self.max_batch_size
            .min(batch.train.len().min(batch.validation.len()))
    }

    pub fn validation_batch_size(&self, batch: &TrainingBatch) -> usize {
        self.max_batch_size.min(batch.validation.len())
    }
}

/// Trim a corrected label and reject ones the trainer cannot take.
///
/// Trainers read one label per line, so a label must be a single
/// non-empty line.
pub fn clean_label(raw: &str) -> Result<&str, ForgeError> {
    let label = raw.trim();
    if label.is_empty() {
        return Err(ForgeError::codec("correction label is empty"));
    }
    if label.contains(['\n', '\r']) {
        return Err(ForgeError::codec(format!(
            "correction label {label:?} spans more than one line"
        )));
    }
    Ok(label)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub image_id: RecordId,
    pub label: String,
}

/// Disjoint train and validation partitions of one pending set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainingBatch {
    pub train: Vec<TrainingSample>,
    pub validation: Vec<TrainingSample>,
}

impl TrainingBatch {
    pub fn len(&self) -> usize {
        self.train.len() + self.validation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn train_ids(&self) -> Vec<RecordId> {
        self.train.iter().map(|s| s.image_id).collect()
    }

    /// Every image id in the batch, train partition first.
    pub fn all_ids(&self) -> Vec<RecordId> {
        self.train
            .iter()
            .chain(self.validation.iter())
            .map(|s| s.image_id)
            .collect()
    }
}
