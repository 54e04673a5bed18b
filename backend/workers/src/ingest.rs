//! Presentation-side operations: image upload and correction submission.

use image::GenericImageView;
use tracing::info;

use equaforge_core::{
    clean_label, CorrectionRequest, ForgeError, ImageReady, ImageRecord, OriginType, RecordId,
};
use equaforge_queue::QueueClient;
use equaforge_store::RecordStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadMetadata {
    pub origin: OriginType,
    pub equation_name: String,
    pub section: String,
    pub author: String,
}

pub struct Ingestor {
    store: RecordStore,
    queue: QueueClient,
    image_queue: String,
    training_queue: String,
}

/// Lower-case colour type name, e.g. `rgb8` or `la16`.
fn color_mode(img: &image::DynamicImage) -> String {
    format!("{:?}", img.color()).to_ascii_lowercase()
}

impl Ingestor {
    pub fn new(
        store: RecordStore,
        queue: QueueClient,
        image_queue: impl Into<String>,
        training_queue: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            image_queue: image_queue.into(),
            training_queue: training_queue.into(),
        }
    }

    /// Store an image with its metadata and queue it for inference.
    pub async fn upload(
        &self,
        bytes: &[u8],
        filename: &str,
        metadata: UploadMetadata,
    ) -> Result<RecordId, ForgeError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| ForgeError::codec(format!("{filename} is not a readable image: {e}")))?;
        let (width, height) = decoded.dimensions();

        let blob = self.store.put_blob(bytes, filename).await?;
        let record = ImageRecord {
            blob,
            filename: filename.to_string(),
            width,
            height,
            color_mode: color_mode(&decoded),
            origin: metadata.origin,
            equation_name: metadata.equation_name,
            section: metadata.section,
            author: metadata.author,
            needs_train: false,
            train_label: None,
            training_claim: None,
        };
        let image_id = self.store.insert(&record).await?;

        self.queue.declare_durable(&self.image_queue).await?;
        self.queue
            .publish(
                &self.image_queue,
                &ImageReady {
                    id: image_id.split(),
                    origin: record.origin,
                    equation_name: record.equation_name.clone(),
                    author: record.author.clone(),
                    section: record.section.clone(),
                },
            )
            .await?;
        info!(
            image_id = %image_id,
            filename,
            width,
            height,
            section = %record.section,
            equation = %record.equation_name,
            "Image uploaded"
        );
        Ok(image_id)
    }

    /// Queue a user-supplied label for a previously inferred result.
    pub async fn submit_correction(
        &self,
        result_id: RecordId,
        corrected_label: &str,
    ) -> Result<(), ForgeError> {
        let label = clean_label(corrected_label)?;
        self.queue.declare_durable(&self.training_queue).await?;
        self.queue
            .publish(
                &self.training_queue,
                &CorrectionRequest {
                    result_id: result_id.split(),
                    corrected_label: label.to_string(),
                },
            )
            .await?;
        info!(result_id = %result_id, "Correction submitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::png_bytes;
    use equaforge_core::QueueMessage;
    use equaforge_queue::{Broker, SqliteBroker};
    use std::sync::Arc;
    use std::time::Duration;

    fn ingestor() -> (RecordStore, QueueClient, Ingestor) {
        let store = RecordStore::in_memory().unwrap();
        let queue = QueueClient::new(Arc::new(
            SqliteBroker::in_memory(Duration::from_secs(60)).unwrap(),
        ));
        let ingestor = Ingestor::new(store.clone(), queue.clone(), "images", "training");
        (store, queue, ingestor)
    }

    fn metadata() -> UploadMetadata {
        UploadMetadata {
            origin: OriginType::Handwritten,
            equation_name: "euler".into(),
            section: "analysis".into(),
            author: "leonhard".into(),
        }
    }

    #[tokio::test]
    async fn upload_records_dimensions_and_publishes() {
        let (store, queue, ingestor) = ingestor();
        let image_id = ingestor
            .upload(&png_bytes(12, 5), "euler.png", metadata())
            .await
            .unwrap();

        let stored = store.require::<ImageRecord>(image_id).await.unwrap();
        assert_eq!((stored.record.width, stored.record.height), (12, 5));
        assert_eq!(stored.record.color_mode, "rgb8");
        assert!(!stored.record.needs_train);

        let delivery = queue.broker().fetch("images", "t").await.unwrap().unwrap();
        let ready = ImageReady::decode(&delivery.payload).unwrap();
        assert_eq!(RecordId::join(ready.id), image_id);
        assert_eq!(ready.section, "analysis");
    }

    #[tokio::test]
    async fn garbage_upload_stores_nothing() {
        let (store, queue, ingestor) = ingestor();
        let err = ingestor
            .upload(b"definitely not an image", "x.png", metadata())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Codec(_)));
        assert!(store.find_all::<ImageRecord>().await.unwrap().is_empty());
        queue.declare_durable("images").await.unwrap();
        assert_eq!(queue.depth("images").await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn corrections_are_trimmed_and_validated() {
        let (_store, queue, ingestor) = ingestor();
        assert!(ingestor.submit_correction(RecordId::generate(), "  ").await.is_err());

        let result_id = RecordId::generate();
        ingestor.submit_correction(result_id, " a+b \n").await.unwrap();
        let delivery = queue.broker().fetch("training", "t").await.unwrap().unwrap();
        let request = CorrectionRequest::decode(&delivery.payload).unwrap();
        assert_eq!(request.corrected_label, "a+b");
        assert_eq!(RecordId::join(request.result_id), result_id);
    }

    #[tokio::test]
    async fn multi_line_corrections_are_refused() {
        let (_store, queue, ingestor) = ingestor();
        let err = ingestor
            .submit_correction(RecordId::generate(), "x=\n1")
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::Codec(_)));
        queue.declare_durable("training").await.unwrap();
        assert_eq!(queue.depth("training").await.unwrap().ready, 0);
    }
}
