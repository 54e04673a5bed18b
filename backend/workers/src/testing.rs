//! Fixtures shared by the worker tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};

use equaforge_core::{
    BlobRef, CheckpointRecord, ForgeError, ImageRecord, OcrModel, OriginType, RecordId,
    RetrainJob, Stored, TrainingBatch,
};
use equaforge_store::RecordStore;

/// Always answers with the same text.
pub struct FixtureModel {
    answer: String,
    calls: Arc<AtomicUsize>,
}

impl FixtureModel {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl OcrModel for FixtureModel {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn recognize(&self, _image: &[u8], _filename: &str) -> Result<Option<String>, ForgeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(self.answer.clone()))
    }
}

/// Records every batch it is handed; fails on demand.
#[derive(Default)]
pub struct RecordingJob {
    pub batches: Mutex<Vec<TrainingBatch>>,
    pub fail: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl RetrainJob for RecordingJob {
    async fn run(&self, batch: &TrainingBatch) -> Result<Stored<CheckpointRecord>, ForgeError> {
        self.batches.lock().await.push(batch.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(ForgeError::TrainingJobFailed("trainer exited with 1".into()));
        }
        Ok(fixture_checkpoint(batch))
    }
}

/// Holds every run open until `release` is notified.
#[derive(Default)]
pub struct GatedJob {
    pub batches: Mutex<Vec<TrainingBatch>>,
    pub started: Notify,
    pub release: Notify,
}

#[async_trait]
impl RetrainJob for GatedJob {
    async fn run(&self, batch: &TrainingBatch) -> Result<Stored<CheckpointRecord>, ForgeError> {
        self.batches.lock().await.push(batch.clone());
        self.started.notify_one();
        self.release.notified().await;
        Ok(fixture_checkpoint(batch))
    }
}

fn fixture_checkpoint(batch: &TrainingBatch) -> Stored<CheckpointRecord> {
    Stored {
        id: RecordId::generate(),
        record: CheckpointRecord {
            weights: BlobRef(RecordId::generate()),
            weights_filename: "fixture.pth".into(),
            created_at: Utc::now(),
            training_ids: batch.train_ids(),
        },
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
    buf.into_inner()
}

/// Store a small image and its record, returning the image id.
pub async fn fixture_image(store: &RecordStore, equation_name: &str) -> RecordId {
    fixture_image_in(store, "algebra", equation_name).await
}

pub async fn fixture_image_in(store: &RecordStore, section: &str, equation_name: &str) -> RecordId {
    let filename = format!("{equation_name}.png");
    let blob = store.put_blob(&png_bytes(4, 2), &filename).await.unwrap();
    store
        .insert(&ImageRecord {
            blob,
            filename,
            width: 4,
            height: 2,
            color_mode: "rgb8".into(),
            origin: OriginType::Digital,
            equation_name: equation_name.into(),
            section: section.into(),
            author: "ada".into(),
            needs_train: false,
            train_label: None,
            training_claim: None,
        })
        .await
        .unwrap()
}
