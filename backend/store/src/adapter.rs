//! Typed access to the record store.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use equaforge_core::{
    BlobRef, CheckpointRecord, Document, Filter, ForgeError, Queryable, RecordId, ResultQuery,
    ResultRecord, Stored,
};

use crate::engine::{Blob, DocumentStore};
use crate::sqlite::SqliteDocumentStore;

/// Typed facade over a [`DocumentStore`]. Cheap to clone.
#[derive(Clone)]
pub struct RecordStore {
    engine: Arc<dyn DocumentStore>,
}

fn decode<T: Document>(id: RecordId, body: Value) -> Result<Stored<T>, ForgeError> {
    let record = serde_json::from_value(body).map_err(|e| {
        ForgeError::read(format!("{} {id} is malformed: {e}", T::COLLECTION))
    })?;
    Ok(Stored { id, record })
}

impl RecordStore {
    pub fn new(engine: Arc<dyn DocumentStore>) -> Self {
        Self { engine }
    }

    pub fn open_sqlite(path: impl AsRef<Path>, busy_timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self::new(Arc::new(SqliteDocumentStore::open(
            path,
            busy_timeout,
        )?)))
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(Arc::new(SqliteDocumentStore::in_memory()?)))
    }

    // ── Blobs ────────────────────────────────────────────────

    pub async fn put_blob(&self, data: &[u8], name: &str) -> Result<BlobRef, ForgeError> {
        self.engine.put_blob(name, data).await
    }

    pub async fn get_blob(&self, blob: BlobRef) -> Result<Blob, ForgeError> {
        self.engine
            .get_blob(blob)
            .await?
            .ok_or_else(|| ForgeError::not_found(format!("blob {blob}")))
    }

    pub async fn delete_blob(&self, blob: BlobRef) -> Result<bool, ForgeError> {
        self.engine.delete_blob(blob).await
    }

    // ── Records ──────────────────────────────────────────────

    pub async fn insert<T: Document>(&self, record: &T) -> Result<RecordId, ForgeError> {
        let body = serde_json::to_value(record).map_err(ForgeError::write)?;
        self.engine.insert(T::COLLECTION, body).await
    }

    pub async fn get<T: Document>(&self, id: RecordId) -> Result<Option<Stored<T>>, ForgeError> {
        match self.engine.get(T::COLLECTION, id).await? {
            Some(body) => decode(id, body).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but a missing record is [`ForgeError::NotFound`].
    pub async fn require<T: Document>(&self, id: RecordId) -> Result<Stored<T>, ForgeError> {
        self.get(id)
            .await?
            .ok_or_else(|| ForgeError::not_found(format!("{} {id}", T::COLLECTION)))
    }

    pub async fn find<Q: Queryable>(
        &self,
        query: &Q,
    ) -> Result<Vec<Stored<Q::Target>>, ForgeError> {
        let filter = query.as_filter()?;
        self.find_filtered::<Q::Target>(&filter).await
    }

    pub async fn find_all<T: Document>(&self) -> Result<Vec<Stored<T>>, ForgeError> {
        self.find_filtered::<T>(&Filter::new()).await
    }

    async fn find_filtered<T: Document>(
        &self,
        filter: &Filter,
    ) -> Result<Vec<Stored<T>>, ForgeError> {
        self.engine
            .find(T::COLLECTION, filter)
            .await?
            .into_iter()
            .map(|(id, body)| decode(id, body))
            .collect()
    }

    pub async fn count<Q: Queryable>(&self, query: &Q) -> Result<usize, ForgeError> {
        let filter = query.as_filter()?;
        self.engine
            .count(<Q::Target as Document>::COLLECTION, &filter)
            .await
    }

    /// Merge `patch` into one record. A missing record is [`ForgeError::NotFound`].
    pub async fn update_fields<T: Document>(
        &self,
        id: RecordId,
        patch: Value,
    ) -> Result<(), ForgeError> {
        if self.engine.update_fields(T::COLLECTION, id, patch).await? {
            Ok(())
        } else {
            Err(ForgeError::not_found(format!("{} {id}", T::COLLECTION)))
        }
    }

    /// Merge `patch` into one record if it still matches `expected`.
    /// A missing record counts as a mismatch.
    pub async fn update_fields_if<T: Document>(
        &self,
        id: RecordId,
        expected: &Filter,
        patch: Value,
    ) -> Result<bool, ForgeError> {
        self.engine
            .update_fields_if(T::COLLECTION, id, expected, patch)
            .await
    }

    pub async fn delete<T: Document>(&self, id: RecordId) -> Result<bool, ForgeError> {
        self.engine.delete(T::COLLECTION, id).await
    }

    pub async fn last_write(&self) -> Result<Option<DateTime<Utc>>, ForgeError> {
        self.engine.last_write().await
    }

    // ── Domain lookups ───────────────────────────────────────

    /// The most recently created checkpoint, ties broken by id.
    pub async fn latest_checkpoint(&self) -> Result<Option<Stored<CheckpointRecord>>, ForgeError> {
        let checkpoints = self.find_all::<CheckpointRecord>().await?;
        Ok(checkpoints
            .into_iter()
            .max_by(|a, b| {
                a.record
                    .created_at
                    .cmp(&b.record.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            }))
    }

    /// The result record produced for an image, if inference already ran.
    pub async fn result_for_image(
        &self,
        image_id: RecordId,
    ) -> Result<Option<Stored<ResultRecord>>, ForgeError> {
        let mut results = self.find(&ResultQuery::for_image(image_id)).await?;
        if results.len() > 1 {
            warn!(image = %image_id, count = results.len(), "Multiple results for one image");
        }
        Ok(if results.is_empty() {
            None
        } else {
            Some(results.remove(0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use equaforge_core::{ImageQuery, ImageRecord, OriginType};
    use serde_json::json;

    fn image(blob: BlobRef, name: &str) -> ImageRecord {
        ImageRecord {
            blob,
            filename: format!("{name}.png"),
            width: 32,
            height: 16,
            color_mode: "rgb8".into(),
            origin: OriginType::Digital,
            equation_name: name.into(),
            section: "algebra".into(),
            author: "noether".into(),
            needs_train: false,
            train_label: None,
            training_claim: None,
        }
    }

    #[tokio::test]
    async fn typed_insert_and_require() {
        let store = RecordStore::in_memory().unwrap();
        let blob = store.put_blob(b"png", "quad.png").await.unwrap();
        let id = store.insert(&image(blob, "quadratic")).await.unwrap();

        let stored = store.require::<ImageRecord>(id).await.unwrap();
        assert_eq!(stored.record.equation_name, "quadratic");
        assert_eq!(store.get_blob(stored.record.blob).await.unwrap().data, b"png");

        let missing = store.require::<ImageRecord>(RecordId::generate()).await;
        assert!(matches!(missing, Err(ForgeError::NotFound(_))));
    }

    #[tokio::test]
    async fn pending_training_query() {
        let store = RecordStore::in_memory().unwrap();
        let blob = store.put_blob(b"png", "a.png").await.unwrap();
        let a = store.insert(&image(blob, "a")).await.unwrap();
        store.insert(&image(blob, "b")).await.unwrap();

        store
            .update_fields::<ImageRecord>(a, json!({"needs_train": true, "train_label": "a=b"}))
            .await
            .unwrap();

        let pending = store.find(&ImageQuery::pending_training()).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, a);
        assert_eq!(pending[0].record.train_label.as_deref(), Some("a=b"));
        assert_eq!(store.count(&ImageQuery::pending_training()).await.unwrap(), 1);

        let err = store
            .update_fields::<ImageRecord>(RecordId::generate(), json!({"needs_train": true}))
            .await;
        assert!(matches!(err, Err(ForgeError::NotFound(_))));
    }

    #[tokio::test]
    async fn result_lookup_by_image() {
        let store = RecordStore::in_memory().unwrap();
        let image_id = RecordId::generate();
        assert!(store.result_for_image(image_id).await.unwrap().is_none());

        let result_id = store
            .insert(&ResultRecord {
                image_id,
                predicted_text: "e=mc^2".into(),
                is_correct: true,
            })
            .await
            .unwrap();
        let found = store.result_for_image(image_id).await.unwrap().unwrap();
        assert_eq!(found.id, result_id);
    }

    #[tokio::test]
    async fn latest_checkpoint_wins_by_timestamp() {
        let store = RecordStore::in_memory().unwrap();
        assert!(store.latest_checkpoint().await.unwrap().is_none());

        let now = Utc::now();
        let blob = store.put_blob(b"w", "w.pth").await.unwrap();
        let newer = store
            .insert(&CheckpointRecord {
                weights: blob,
                weights_filename: "new.pth".into(),
                created_at: now,
                training_ids: vec![],
            })
            .await
            .unwrap();
        store
            .insert(&CheckpointRecord {
                weights: blob,
                weights_filename: "old.pth".into(),
                created_at: now - ChronoDuration::hours(1),
                training_ids: vec![],
            })
            .await
            .unwrap();

        let latest = store.latest_checkpoint().await.unwrap().unwrap();
        assert_eq!(latest.id, newer);
        assert_eq!(latest.record.weights_filename, "new.pth");
    }
}
