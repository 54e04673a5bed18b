//! Result Sink: folds result-ready messages into the display index and
//! handles user deletes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use equaforge_core::{
    Disposition, ForgeError, ImageRecord, RecordId, ResultReady, ResultRecord, Stored,
};
use equaforge_queue::{ConsumeStats, MessageHandler, QueueClient};
use equaforge_store::RecordStore;

use crate::display::{DisplayEntry, DisplayIndex};
use crate::fsutil::modified_at;

pub struct ResultSink {
    store: RecordStore,
    index_path: PathBuf,
    /// Serializes read-modify-write cycles on the index file.
    index_lock: Mutex<()>,
}

impl ResultSink {
    pub fn new(store: RecordStore, index_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            index_path: index_path.into(),
            index_lock: Mutex::new(()),
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn load_index(&self) -> Result<DisplayIndex, ForgeError> {
        Ok(DisplayIndex::load(&self.index_path)?)
    }

    /// Add the leaf for one stored result.
    pub async fn record_result(&self, result_id: RecordId) -> Result<(), ForgeError> {
        let result = self.store.require::<ResultRecord>(result_id).await?;
        let Some(image) = self.store.get::<ImageRecord>(result.record.image_id).await? else {
            return Err(ForgeError::not_found(format!(
                "image {} for result {result_id} (orphaned result)",
                result.record.image_id
            )));
        };

        let _guard = self.index_lock.lock().await;
        let mut index = DisplayIndex::load(&self.index_path)?;
        index.upsert(
            &image.record.section,
            &image.record.equation_name,
            DisplayEntry {
                author: image.record.author.clone(),
                predicted_text: result.record.predicted_text.clone(),
                store_id: result_id.split(),
            },
        );
        index.save(&self.index_path)?;
        info!(
            result_id = %result_id,
            section = %image.record.section,
            equation = %image.record.equation_name,
            "Display index updated"
        );
        Ok(())
    }

    /// Remove a result from the display and delete it together with its
    /// image record and image blob.
    pub async fn delete_result(&self, result_id: RecordId) -> Result<(), ForgeError> {
        let result = self.store.require::<ResultRecord>(result_id).await?;
        {
            let _guard = self.index_lock.lock().await;
            let mut index = DisplayIndex::load(&self.index_path)?;
            let removed = index.remove_result(result_id);
            if !removed.is_empty() {
                index.save(&self.index_path)?;
            }
            debug!(result_id = %result_id, leaves = removed.len(), "Display leaves removed");
        }

        self.store.delete::<ResultRecord>(result_id).await?;
        let image_id = result.record.image_id;
        match self.store.get::<ImageRecord>(image_id).await? {
            Some(image) => {
                self.store.delete::<ImageRecord>(image_id).await?;
                if !self.store.delete_blob(image.record.blob).await? {
                    warn!(image_id = %image_id, blob = %image.record.blob, "Image blob already gone");
                }
            }
            None => warn!(image_id = %image_id, "Deleted result was orphaned"),
        }
        info!(result_id = %result_id, image_id = %image_id, "Result deleted");
        Ok(())
    }

    /// Rebuild the whole index from the store. Orphaned results are skipped;
    /// for each image only its latest result is shown.
    pub async fn rebuild_index(&self) -> Result<usize, ForgeError> {
        let results = self.store.find_all::<ResultRecord>().await?;
        let mut index = DisplayIndex::default();
        let mut orphans = 0usize;
        for Stored { id, record } in results {
            let Some(image) = self.store.get::<ImageRecord>(record.image_id).await? else {
                orphans += 1;
                continue;
            };
            index.upsert(
                &image.record.section,
                &image.record.equation_name,
                DisplayEntry {
                    author: image.record.author,
                    predicted_text: record.predicted_text,
                    store_id: id.split(),
                },
            );
        }

        let _guard = self.index_lock.lock().await;
        index.save(&self.index_path)?;
        if orphans > 0 {
            warn!(orphans, "Orphaned results excluded from display index");
        }
        info!(entries = index.len(), path = ?self.index_path, "Display index rebuilt");
        Ok(index.len())
    }

    /// True when the index file is older than the store's latest write.
    pub async fn index_is_stale(&self) -> Result<bool, ForgeError> {
        let Some(last_write) = self.store.last_write().await? else {
            return Ok(false);
        };
        Ok(match modified_at(&self.index_path)? {
            Some(modified) => modified < last_write,
            None => true,
        })
    }

    pub async fn run(
        &self,
        queue: &QueueClient,
        result_queue: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumeStats, ForgeError> {
        if self.index_is_stale().await? {
            info!(path = ?self.index_path, "Display index lags the store, rebuilding");
            self.rebuild_index().await?;
        }
        queue
            .consume::<ResultReady, _>(result_queue, self, shutdown)
            .await
    }
}

#[async_trait]
impl MessageHandler<ResultReady> for ResultSink {
    async fn handle(&self, message: ResultReady) -> Result<Disposition, ForgeError> {
        self.record_result(RecordId::join(message.result_id)).await?;
        Ok(Disposition::Ack)
    }
}
