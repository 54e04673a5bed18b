//! Inference Worker: image-ready in, result record plus result-ready out.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use equaforge_core::{
    Disposition, ForgeError, ImageReady, ImageRecord, ModelLoader, OcrModel, RecordId,
    ResultReady, ResultRecord, Stored,
};
use equaforge_queue::{ConsumeStats, MessageHandler, QueueClient};
use equaforge_store::RecordStore;

use crate::model::provision_active_weights;

#[derive(Debug, Clone, PartialEq)]
pub enum InferenceOutcome {
    /// A new result was written and announced.
    Produced(Stored<ResultRecord>),
    /// The image already had a result; nothing was written or published.
    AlreadyProcessed(RecordId),
}

pub struct InferenceWorker {
    store: RecordStore,
    queue: QueueClient,
    model: Arc<dyn OcrModel>,
    result_queue: String,
}

impl InferenceWorker {
    /// Load the active checkpoint, provisioning it from the store if needed.
    /// The model is fixed for the lifetime of the worker.
    pub async fn new(
        store: RecordStore,
        queue: QueueClient,
        loader: &dyn ModelLoader,
        active_weights: &Path,
        result_queue: impl Into<String>,
    ) -> Result<Self, ForgeError> {
        let weights = provision_active_weights(&store, active_weights).await?;
        let model = loader.load(weights.as_deref())?;
        info!(model = model.name(), weights = ?weights, "Inference model loaded");
        Ok(Self::with_model(store, queue, model, result_queue))
    }

    pub fn with_model(
        store: RecordStore,
        queue: QueueClient,
        model: Arc<dyn OcrModel>,
        result_queue: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            model,
            result_queue: result_queue.into(),
        }
    }

    /// Run OCR on one stored image and record the outcome.
    pub async fn infer(&self, image_id: RecordId) -> Result<InferenceOutcome, ForgeError> {
        if let Some(existing) = self.store.result_for_image(image_id).await? {
            debug!(image_id = %image_id, result_id = %existing.id, "Image already has a result");
            return Ok(InferenceOutcome::AlreadyProcessed(existing.id));
        }

        let image = self.store.require::<ImageRecord>(image_id).await?;
        let blob = self.store.get_blob(image.record.blob).await?;

        let predicted_text = self
            .model
            .recognize(&blob.data, &image.record.filename)
            .await?
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ForgeError::InferenceFailed(format!(
                    "{} produced no text for image {image_id}",
                    self.model.name()
                ))
            })?;

        let record = ResultRecord {
            image_id,
            predicted_text,
            is_correct: true,
        };
        let result_id = self.store.insert(&record).await?;
        self.queue
            .publish(
                &self.result_queue,
                &ResultReady {
                    result_id: result_id.split(),
                    image_id: image_id.split(),
                    predicted_text: record.predicted_text.clone(),
                },
            )
            .await?;

        info!(
            image_id = %image_id,
            result_id = %result_id,
            equation = %image.record.equation_name,
            "Inference result stored"
        );
        Ok(InferenceOutcome::Produced(Stored {
            id: result_id,
            record,
        }))
    }

    pub async fn run(
        &self,
        image_queue: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumeStats, ForgeError> {
        self.queue.declare_durable(&self.result_queue).await?;
        self.queue
            .consume::<ImageReady, _>(image_queue, self, shutdown)
            .await
    }
}

#[async_trait]
impl MessageHandler<ImageReady> for InferenceWorker {
    async fn handle(&self, message: ImageReady) -> Result<Disposition, ForgeError> {
        let image_id = RecordId::join(message.id);
        match self.infer(image_id).await? {
            InferenceOutcome::Produced(_) => {}
            InferenceOutcome::AlreadyProcessed(result_id) => {
                warn!(
                    image_id = %image_id,
                    result_id = %result_id,
                    "Duplicate image-ready delivery ignored"
                );
            }
        }
        Ok(Disposition::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture_image, FixtureModel};
    use equaforge_core::{OriginType, QueueMessage};
    use equaforge_queue::{Broker, SqliteBroker};
    use std::time::Duration;

    const IMAGE_QUEUE: &str = "image-inference-queue";
    const RESULT_QUEUE: &str = "result-queue";

    async fn setup(model: FixtureModel) -> (RecordStore, QueueClient, InferenceWorker) {
        let store = RecordStore::in_memory().unwrap();
        let broker: Arc<dyn Broker> =
            Arc::new(SqliteBroker::in_memory(Duration::from_secs(60)).unwrap());
        let queue = QueueClient::new(broker);
        queue.declare_durable(IMAGE_QUEUE).await.unwrap();
        queue.declare_durable(RESULT_QUEUE).await.unwrap();
        let worker =
            InferenceWorker::with_model(store.clone(), queue.clone(), Arc::new(model), RESULT_QUEUE);
        (store, queue, worker)
    }

    #[tokio::test]
    async fn infer_writes_result_for_the_image() {
        let (store, _queue, worker) = setup(FixtureModel::answering("a^2+b^2=c^2")).await;
        let image_id = fixture_image(&store, "pythagoras").await;

        let outcome = worker.infer(image_id).await.unwrap();
        let InferenceOutcome::Produced(result) = outcome else {
            panic!("expected a new result");
        };
        let stored = store.require::<ResultRecord>(result.id).await.unwrap();
        assert_eq!(stored.record.image_id, image_id);
        assert_eq!(stored.record.predicted_text, "a^2+b^2=c^2");
        assert!(stored.record.is_correct);
    }

    #[tokio::test]
    async fn redelivery_is_a_no_op() {
        let model = FixtureModel::answering("x+1");
        let calls = model.calls();
        let (store, queue, worker) = setup(model).await;
        let image_id = fixture_image(&store, "linear").await;

        let message = ImageReady {
            id: image_id.split(),
            origin: OriginType::Digital,
            equation_name: "linear".into(),
            author: "ada".into(),
            section: "algebra".into(),
        };
        assert_eq!(worker.handle(message.clone()).await.unwrap(), Disposition::Ack);
        assert_eq!(worker.handle(message).await.unwrap(), Disposition::Ack);

        assert_eq!(store.find_all::<ResultRecord>().await.unwrap().len(), 1);
        assert_eq!(queue.depth(RESULT_QUEUE).await.unwrap().ready, 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_image_is_not_found() {
        let (_store, _queue, worker) = setup(FixtureModel::answering("x")).await;
        let err = worker.infer(RecordId::generate()).await.unwrap_err();
        assert!(matches!(err, ForgeError::NotFound(_)));
        assert_eq!(err.disposition(), Disposition::Ack);
    }

    #[tokio::test]
    async fn empty_prediction_is_inference_failure() {
        let (store, queue, worker) = setup(FixtureModel::answering("   ")).await;
        let image_id = fixture_image(&store, "blank").await;

        let err = worker.infer(image_id).await.unwrap_err();
        assert!(matches!(err, ForgeError::InferenceFailed(_)));
        assert_eq!(err.disposition(), Disposition::Requeue);
        assert!(store.result_for_image(image_id).await.unwrap().is_none());
        assert_eq!(queue.depth(RESULT_QUEUE).await.unwrap().ready, 0);
    }

    #[tokio::test]
    async fn image_ready_produces_result_ready_on_the_queue() {
        let (store, queue, worker) = setup(FixtureModel::answering("x^2+y^2=1")).await;
        let image_id = fixture_image(&store, "circle").await;
        queue
            .publish(
                IMAGE_QUEUE,
                &ImageReady {
                    id: image_id.split(),
                    origin: OriginType::Handwritten,
                    equation_name: "circle".into(),
                    author: "euler".into(),
                    section: "geometry".into(),
                },
            )
            .await
            .unwrap();

        let (stop, shutdown) = watch::channel(false);
        let consumer = worker.run(IMAGE_QUEUE, shutdown);
        let observer = async {
            loop {
                if let Some(delivery) = queue
                    .broker()
                    .fetch(RESULT_QUEUE, "observer")
                    .await
                    .unwrap()
                {
                    let _ = stop.send(true);
                    return ResultReady::decode(&delivery.payload).unwrap();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        let (stats, ready) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(consumer, observer)
        })
        .await
        .expect("result-ready within the time window");

        assert_eq!(stats.unwrap().acked, 1);
        assert_eq!(ready.predicted_text, "x^2+y^2=1");
        assert_eq!(RecordId::join(ready.image_id), image_id);
    }
}
