pub mod coordinator;
pub mod display;
pub mod fsutil;
pub mod inference;
pub mod ingest;
pub mod model;
pub mod process;
pub mod runner;
pub mod sink;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{
    partition_batch, CoordinatorState, CorrectionOutcome, TrainingCoordinator, DEFAULT_CLAIM_TTL,
};
pub use display::{DisplayEntry, DisplayIndex};
pub use inference::{InferenceOutcome, InferenceWorker};
pub use ingest::{Ingestor, UploadMetadata};
pub use model::{provision_active_weights, CommandModelLoader, CommandOcrModel};
pub use process::CommandSpec;
pub use runner::{RetrainJobRunner, TrainerJobConfig};
pub use sink::ResultSink;
