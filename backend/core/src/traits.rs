use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ForgeError;
use crate::record::{CheckpointRecord, Stored};
use crate::training::TrainingBatch;

/// Black-box OCR model: image bytes in, equation text out.
#[async_trait]
pub trait OcrModel: Send + Sync {
    /// Human-readable name of this model.
    fn name(&self) -> &str;

    /// Recognise the equation in an encoded image.
    ///
    /// `Ok(None)` or an empty string means the model produced nothing.
    async fn recognize(&self, image: &[u8], filename: &str) -> Result<Option<String>, ForgeError>;
}

/// Builds an [`OcrModel`] from an optional weights file.
pub trait ModelLoader: Send + Sync {
    fn load(&self, weights: Option<&Path>) -> Result<Arc<dyn OcrModel>, ForgeError>;
}

/// Runs one retraining job and commits its checkpoint.
#[async_trait]
pub trait RetrainJob: Send + Sync {
    async fn run(&self, batch: &TrainingBatch) -> Result<Stored<CheckpointRecord>, ForgeError>;
}
