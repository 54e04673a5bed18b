//! Training Coordinator: applies corrections, tracks the pending set, and
//! cuts a batch for retraining once enough corrections have accumulated.
//!
//! Coordinators in separate processes share the pending set. Each run claims
//! its images in the record store before training, so concurrent runs never
//! train the same image, and a claim left by a crashed run expires.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use equaforge_core::{
    clean_label, CorrectionRequest, Disposition, Filter, ForgeError, ImageQuery, ImageRecord,
    RecordId, ResultRecord, RetrainJob, Stored, TrainingBatch, TrainingClaim, TrainingPolicy,
    TrainingSample,
};
use equaforge_queue::{ConsumeStats, MessageHandler, QueueClient, RetryPolicy};
use equaforge_store::RecordStore;

/// Claim lifetime used when no trainer timeout bounds a run.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Accumulating,
    BatchReady,
    Training,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Accumulating => "accumulating",
            Self::BatchReady => "batch-ready",
            Self::Training => "training",
        };
        f.write_str(s)
    }
}

/// What handling one correction led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionOutcome {
    /// Recorded; fewer than `threshold` unclaimed corrections are pending.
    Pending { pending: usize, threshold: usize },
    /// A batch was trained and its ids cleared.
    Trained { checkpoint: RecordId, batch_size: usize },
    /// A batch was cut but the job failed; its flags are left set.
    TrainingFailed { batch_size: usize },
}

struct Progress {
    state: CoordinatorState,
    pending: usize,
}

pub struct TrainingCoordinator {
    store: RecordStore,
    job: Arc<dyn RetrainJob>,
    policy: TrainingPolicy,
    write_retry: RetryPolicy,
    claim_ttl: Duration,
    progress: Mutex<Progress>,
}

/// Split `samples` into a validation partition of exactly
/// `min(validation_size, len)` uniformly chosen samples and a training
/// partition of the rest. Input order is kept within each partition.
pub fn partition_batch<R: Rng + ?Sized>(
    samples: Vec<TrainingSample>,
    validation_size: usize,
    rng: &mut R,
) -> TrainingBatch {
    let amount = validation_size.min(samples.len());
    let picked: HashSet<usize> = rand::seq::index::sample(rng, samples.len(), amount)
        .into_iter()
        .collect();
    let mut batch = TrainingBatch::default();
    for (index, sample) in samples.into_iter().enumerate() {
        if picked.contains(&index) {
            batch.validation.push(sample);
        } else {
            batch.train.push(sample);
        }
    }
    batch
}

fn partition_random(samples: Vec<TrainingSample>, validation_size: usize) -> TrainingBatch {
    partition_batch(samples, validation_size, &mut rand::rng())
}

fn held_by(token: &str) -> Filter {
    Filter::new().eq("training_claim.token", token)
}

impl TrainingCoordinator {
    pub fn new(store: RecordStore, job: Arc<dyn RetrainJob>, policy: TrainingPolicy) -> Self {
        Self {
            store,
            job,
            policy,
            write_retry: RetryPolicy::new(5, 200),
            claim_ttl: DEFAULT_CLAIM_TTL,
            progress: Mutex::new(Progress {
                state: CoordinatorState::Idle,
                pending: 0,
            }),
        }
    }

    pub fn with_write_retry(mut self, retry: RetryPolicy) -> Self {
        self.write_retry = retry;
        self
    }

    /// How long another run's claim is honoured before it is taken over.
    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    pub fn policy(&self) -> &TrainingPolicy {
        &self.policy
    }

    pub async fn state(&self) -> CoordinatorState {
        self.progress.lock().await.state
    }

    pub async fn pending_count(&self) -> usize {
        self.progress.lock().await.pending
    }

    /// Recount the pending set from the store. The in-memory counter is
    /// never carried across restarts.
    pub async fn recover(&self) -> Result<usize, ForgeError> {
        let mut progress = self.progress.lock().await;
        let pending = self.store.count(&ImageQuery::pending_training()).await?;
        progress.pending = pending;
        progress.state = if pending > 0 {
            CoordinatorState::Accumulating
        } else {
            CoordinatorState::Idle
        };
        info!(
            pending,
            threshold = self.policy.threshold(),
            state = %progress.state,
            "Training coordinator recovered"
        );
        Ok(pending)
    }

    /// Record a corrected label for the image behind `result_id`, and train
    /// if enough unclaimed corrections are pending.
    pub async fn on_correction(
        &self,
        result_id: RecordId,
        corrected_label: &str,
    ) -> Result<CorrectionOutcome, ForgeError> {
        let label = clean_label(corrected_label)?;
        let result = self.store.require::<ResultRecord>(result_id).await?;
        let image_id = result.record.image_id;

        let mut progress = self.progress.lock().await;
        self.store
            .update_fields::<ImageRecord>(image_id, json!({"needs_train": true, "train_label": label}))
            .await?;
        info!(result_id = %result_id, image_id = %image_id, "Image marked for training");

        let pending = self.store.find(&ImageQuery::pending_training()).await?;
        let now = Utc::now();
        let available = pending
            .iter()
            .filter(|image| self.is_claimable(&image.record, now))
            .count();
        progress.pending = pending.len();
        progress.state = CoordinatorState::Accumulating;

        let threshold = self.policy.threshold();
        if available < threshold {
            if pending.len() >= threshold {
                info!(
                    pending = pending.len(),
                    available,
                    "Part of the pending set is claimed by a running batch"
                );
            }
            return Ok(CorrectionOutcome::Pending {
                pending: available,
                threshold,
            });
        }
        progress.state = CoordinatorState::BatchReady;
        self.train(&mut progress).await
    }

    fn is_claimable(&self, image: &ImageRecord, now: DateTime<Utc>) -> bool {
        image
            .training_claim
            .as_ref()
            .map_or(true, |claim| claim.is_stale(self.claim_ttl, now))
    }

    /// Reserve one pending image for the run `token`, provided nobody
    /// changed its label or claim since it was read.
    async fn claim(
        &self,
        image: &Stored<ImageRecord>,
        label: &str,
        token: &str,
    ) -> Result<bool, ForgeError> {
        let unchanged = match &image.record.training_claim {
            Some(stale) => {
                warn!(
                    image_id = %image.id,
                    claimed_at = %stale.claimed_at,
                    "Taking over an expired training claim"
                );
                held_by(&stale.token)
            }
            None => Filter::new().eq("training_claim", Value::Null),
        }
        .eq("needs_train", true)
        .eq("train_label", label);
        let claim = serde_json::to_value(TrainingClaim::new(token)).map_err(ForgeError::write)?;
        self.store
            .update_fields_if::<ImageRecord>(image.id, &unchanged, json!({"training_claim": claim}))
            .await
    }

    /// Claim the unclaimed pending set and partition it. `None` if fewer than
    /// the threshold could be claimed; any claims taken are then released.
    async fn cut_batch(&self, token: &str) -> Result<Option<TrainingBatch>, ForgeError> {
        let pending = self.store.find(&ImageQuery::pending_training()).await?;
        let now = Utc::now();
        let mut samples = Vec::with_capacity(pending.len());
        for stored in pending {
            let label = match &stored.record.train_label {
                Some(label) if !label.trim().is_empty() => label.clone(),
                _ => {
                    warn!(image_id = %stored.id, "Pending image has no training label, skipped");
                    continue;
                }
            };
            if !self.is_claimable(&stored.record, now) {
                continue;
            }
            if self.claim(&stored, &label, token).await? {
                samples.push(TrainingSample {
                    image_id: stored.id,
                    label,
                });
            }
        }
        if samples.len() < self.policy.threshold() {
            self.release_claims(&samples, token).await?;
            return Ok(None);
        }
        Ok(Some(partition_random(samples, self.policy.validation_size())))
    }

    async fn train(&self, progress: &mut Progress) -> Result<CorrectionOutcome, ForgeError> {
        let token = RecordId::generate().to_hex();
        let Some(batch) = self.cut_batch(&token).await? else {
            progress.state = CoordinatorState::Accumulating;
            return Ok(CorrectionOutcome::Pending {
                pending: progress.pending,
                threshold: self.policy.threshold(),
            });
        };
        let batch_size = batch.len();
        progress.state = CoordinatorState::Training;
        info!(
            train = batch.train.len(),
            validation = batch.validation.len(),
            claim = %token,
            "Training batch cut, starting retrain job"
        );

        let run = self.job.run(&batch).await;
        let outcome = match run {
            Ok(checkpoint) => {
                if let Err(e) = self.clear_batch(&batch, &token).await {
                    error!(error = %e, checkpoint = %checkpoint.id, "Failed to clear trained batch");
                    progress.state = CoordinatorState::Accumulating;
                    return Err(e);
                }
                info!(checkpoint = %checkpoint.id, batch_size, "Retrain job succeeded");
                CorrectionOutcome::Trained {
                    checkpoint: checkpoint.id,
                    batch_size,
                }
            }
            Err(e) => {
                error!(error = %e, batch_size, "Retrain job failed, batch stays pending");
                let samples: Vec<TrainingSample> =
                    batch.train.into_iter().chain(batch.validation).collect();
                if let Err(e) = self.release_claims(&samples, &token).await {
                    warn!(error = %e, claim = %token, "Claims not released, they will expire");
                }
                CorrectionOutcome::TrainingFailed { batch_size }
            }
        };

        progress.pending = self.store.count(&ImageQuery::pending_training()).await?;
        progress.state = if progress.pending > 0 {
            CoordinatorState::Accumulating
        } else {
            CoordinatorState::Idle
        };
        Ok(outcome)
    }

    /// Clear `needs_train` for the batch's images whose label is unchanged
    /// since the cut. An image corrected again during training keeps its
    /// flag and only loses the claim. Returns how many were cleared.
    async fn clear_batch(&self, batch: &TrainingBatch, token: &str) -> Result<usize, ForgeError> {
        let mut cleared = 0;
        for sample in batch.train.iter().chain(&batch.validation) {
            let trained = held_by(token).eq("train_label", sample.label.as_str());
            let done = self
                .write_retry
                .run("clear needs_train", || {
                    self.store.update_fields_if::<ImageRecord>(
                        sample.image_id,
                        &trained,
                        json!({"needs_train": false, "training_claim": null}),
                    )
                })
                .await?;
            if done {
                cleared += 1;
            } else if self.release_claim(sample.image_id, token).await? {
                info!(image_id = %sample.image_id, "Image corrected during training, kept pending");
            } else {
                warn!(image_id = %sample.image_id, "Trained image deleted or its claim lost before clear");
            }
        }
        Ok(cleared)
    }

    async fn release_claim(&self, image_id: RecordId, token: &str) -> Result<bool, ForgeError> {
        let held = held_by(token);
        self.write_retry
            .run("release training claim", || {
                self.store.update_fields_if::<ImageRecord>(
                    image_id,
                    &held,
                    json!({"training_claim": null}),
                )
            })
            .await
    }

    async fn release_claims(&self, samples: &[TrainingSample], token: &str) -> Result<(), ForgeError> {
        for sample in samples {
            self.release_claim(sample.image_id, token).await?;
        }
        Ok(())
    }

    pub async fn run(
        &self,
        queue: &QueueClient,
        training_queue: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumeStats, ForgeError> {
        self.recover().await?;
        queue
            .consume::<CorrectionRequest, _>(training_queue, self, shutdown)
            .await
    }
}

#[async_trait]
impl MessageHandler<CorrectionRequest> for TrainingCoordinator {
    async fn handle(&self, message: CorrectionRequest) -> Result<Disposition, ForgeError> {
        self.on_correction(RecordId::join(message.result_id), &message.corrected_label)
            .await?;
        Ok(Disposition::Ack)
    }
}
