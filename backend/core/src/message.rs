use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ForgeError;
use crate::id::PackedId;
use crate::record::OriginType;

/// How a consumer settles a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Remove the message from the queue.
    Ack,
    /// Leave the message for redelivery.
    Requeue,
}

/// A payload carried over a durable queue.
pub trait QueueMessage: Serialize + DeserializeOwned + Send + Sync {
    fn encode(&self) -> Result<Vec<u8>, ForgeError> {
        serde_json::to_vec(self).map_err(ForgeError::codec)
    }

    fn decode(bytes: &[u8]) -> Result<Self, ForgeError> {
        serde_json::from_slice(bytes).map_err(ForgeError::codec)
    }
}

/// Upload → Inference Worker: an image is stored and ready for OCR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageReady {
    pub id: PackedId,
    pub origin: OriginType,
    pub equation_name: String,
    pub author: String,
    pub section: String,
}

/// Inference Worker → Result Sink: a result record was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultReady {
    pub result_id: PackedId,
    pub image_id: PackedId,
    pub predicted_text: String,
}

/// Presentation layer → Training Coordinator: a user-corrected label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRequest {
    pub result_id: PackedId,
    pub corrected_label: String,
}

impl QueueMessage for ImageReady {}
impl QueueMessage for ResultReady {}
impl QueueMessage for CorrectionRequest {}
