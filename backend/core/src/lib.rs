pub mod error;
pub mod id;
pub mod message;
pub mod record;
pub mod training;
pub mod traits;

pub use error::ForgeError;
pub use id::{PackedId, RecordId};
pub use message::{CorrectionRequest, Disposition, ImageReady, QueueMessage, ResultReady};
pub use record::{
    BlobRef, CheckpointQuery, CheckpointRecord, Document, Filter, ImageQuery, ImageRecord,
    OriginType, Queryable, ResultQuery, ResultRecord, Stored, TrainingClaim,
};
pub use training::{clean_label, TrainingBatch, TrainingPolicy, TrainingSample};
pub use traits::{ModelLoader, OcrModel, RetrainJob};
