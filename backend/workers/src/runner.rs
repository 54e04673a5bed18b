//! Retrain Job Runner: exports a batch, drives the external trainer, commits
//! the produced weights as a checkpoint and deploys them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use equaforge_core::{
    CheckpointRecord, ForgeError, ImageRecord, RetrainJob, Stored, TrainingBatch,
    TrainingPolicy, TrainingSample,
};
use equaforge_store::RecordStore;

use crate::fsutil::{atomic_write, newest_file};
use crate::model::record_deployment;
use crate::process::CommandSpec;

/// File handed to the trainer through the `{config}` placeholder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainerJobConfig {
    pub name: String,
    pub batchsize: usize,
    pub valbatches: usize,
    pub train_images: PathBuf,
    pub train_labels: PathBuf,
    pub val_images: PathBuf,
    pub val_labels: PathBuf,
    pub model_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_chkpt: Option<PathBuf>,
}

pub struct RetrainJobRunner {
    store: RecordStore,
    trainer: CommandSpec,
    policy: TrainingPolicy,
    weights_extension: String,
    active_weights_path: PathBuf,
}

fn job_failed(context: &str, err: impl std::fmt::Display) -> ForgeError {
    ForgeError::TrainingJobFailed(format!("{context}: {err:#}"))
}

impl RetrainJobRunner {
    pub fn new(
        store: RecordStore,
        trainer: CommandSpec,
        policy: TrainingPolicy,
        weights_extension: impl Into<String>,
        active_weights_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            trainer,
            policy,
            weights_extension: weights_extension.into(),
            active_weights_path: active_weights_path.into(),
        }
    }

    /// Write each sample's image as `{index:07}.{ext}` plus a label file with
    /// one label per line, in sample order.
    async fn export(
        &self,
        samples: &[TrainingSample],
        dir: &Path,
        labels_name: &str,
    ) -> Result<PathBuf, ForgeError> {
        std::fs::create_dir_all(dir)?;
        let mut labels = Vec::with_capacity(samples.len());
        for (index, sample) in samples.iter().enumerate() {
            if sample.label.contains(['\n', '\r']) {
                return Err(job_failed(
                    "exporting labels",
                    format!("label for image {} spans more than one line", sample.image_id),
                ));
            }
            let image = self.store.require::<ImageRecord>(sample.image_id).await?;
            let blob = self.store.get_blob(image.record.blob).await?;
            let extension = Path::new(&image.record.filename)
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_else(|| "png".to_string());
            std::fs::write(dir.join(format!("{index:07}.{extension}")), &blob.data)?;
            labels.push(sample.label.as_str());
        }
        let labels_path = dir.join(labels_name);
        std::fs::write(&labels_path, labels.join("\n"))?;
        Ok(labels_path)
    }

    async fn commit(
        &self,
        weights_path: &Path,
        batch: &TrainingBatch,
    ) -> Result<Stored<CheckpointRecord>, ForgeError> {
        let data = std::fs::read(weights_path)?;
        let weights_filename = weights_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let weights = self.store.put_blob(&data, &weights_filename).await?;
        let record = CheckpointRecord {
            weights,
            weights_filename,
            created_at: Utc::now(),
            training_ids: batch.train_ids(),
        };
        let id = self.store.insert(&record).await?;

        atomic_write(&self.active_weights_path, &data)
            .map_err(|e| job_failed("deploying weights", e))?;
        record_deployment(&self.active_weights_path, id)?;
        info!(
            checkpoint = %id,
            filename = %record.weights_filename,
            active = ?self.active_weights_path,
            bytes = data.len(),
            "Checkpoint committed and deployed"
        );
        Ok(Stored { id, record })
    }
}

#[async_trait]
impl RetrainJob for RetrainJobRunner {
    async fn run(&self, batch: &TrainingBatch) -> Result<Stored<CheckpointRecord>, ForgeError> {
        if batch.train.is_empty() || batch.validation.is_empty() {
            return Err(ForgeError::TrainingJobFailed(format!(
                "batch needs both partitions (train={}, validation={})",
                batch.train.len(),
                batch.validation.len()
            )));
        }

        let workspace = tempfile::Builder::new()
            .prefix("equaforge-train-")
            .tempdir()?;
        let root = workspace.path();
        let train_dir = root.join("train");
        let val_dir = root.join("val");
        let output_dir = root.join("output");
        std::fs::create_dir_all(&output_dir)?;

        let train_labels = self.export(&batch.train, &train_dir, "train_labels.txt").await?;
        let val_labels = self.export(&batch.validation, &val_dir, "val_labels.txt").await?;

        let warm_start = self
            .active_weights_path
            .is_file()
            .then(|| self.active_weights_path.clone());
        let job = TrainerJobConfig {
            name: "equaforge".into(),
            batchsize: self.policy.batch_size(batch),
            valbatches: self.policy.validation_batch_size(batch),
            train_images: train_dir,
            train_labels,
            val_images: val_dir,
            val_labels,
            model_path: output_dir.clone(),
            load_chkpt: warm_start,
        };
        let config_path = root.join("trainer.yaml");
        let yaml = serde_yaml::to_string(&job).map_err(|e| job_failed("writing trainer config", e))?;
        std::fs::write(&config_path, yaml)?;

        info!(
            train = batch.train.len(),
            validation = batch.validation.len(),
            batch_size = job.batchsize,
            warm_start = job.load_chkpt.is_some(),
            "Starting retrain job"
        );
        let config_arg = config_path.to_string_lossy().to_string();
        let output_arg = output_dir.to_string_lossy().to_string();
        let output = self
            .trainer
            .run(&[("config", &config_arg), ("output", &output_arg)])
            .await
            .map_err(|e| job_failed("trainer", e))?;
        if !output.stderr.trim().is_empty() {
            warn!(stderr = %output.stderr.trim(), "Trainer wrote to stderr");
        }

        let weights = newest_file(&output_dir, &self.weights_extension)
            .map_err(|e| job_failed("scanning trainer output", e))?
            .ok_or_else(|| {
                ForgeError::TrainingJobFailed(format!(
                    "trainer produced no .{} file",
                    self.weights_extension
                ))
            })?;
        self.commit(&weights, batch).await
    }
}
