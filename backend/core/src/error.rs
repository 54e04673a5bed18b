use thiserror::Error;

use crate::message::Disposition;

/// Top-level error type for the equaforge pipeline.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("inference failed: {0}")]
    InferenceFailed(String),

    #[error("store write failed: {0}")]
    StoreWriteFailed(String),

    #[error("store read failed: {0}")]
    StoreReadFailed(String),

    #[error("training job failed: {0}")]
    TrainingJobFailed(String),

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("malformed payload: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForgeError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn write(err: impl std::fmt::Display) -> Self {
        Self::StoreWriteFailed(err.to_string())
    }

    pub fn read(err: impl std::fmt::Display) -> Self {
        Self::StoreReadFailed(err.to_string())
    }

    pub fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }

    /// How a consumer should settle the delivery that produced this error.
    ///
    /// A missing record or an undecodable payload will never succeed on
    /// redelivery, so those are acknowledged and dropped.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::NotFound(_) | Self::Codec(_) => Disposition::Ack,
            _ => Disposition::Requeue,
        }
    }
}
