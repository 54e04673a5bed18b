//! Shared process setup: store and broker handles plus the mapping from
//! config sections to the worker crates' types.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;

use equaforge_config::EquaforgeConfig;
use equaforge_core::TrainingPolicy;
use equaforge_queue::{ConsumeOptions, QueueClient, RetryPolicy};
use equaforge_store::RecordStore;
use equaforge_workers::{CommandSpec, DEFAULT_CLAIM_TTL};

pub struct Runtime {
    pub config: EquaforgeConfig,
    pub store: RecordStore,
    pub queue: QueueClient,
}

impl Runtime {
    pub async fn connect(config: EquaforgeConfig) -> Result<Self> {
        let store_path = config.store.path();
        let store = RecordStore::open_sqlite(&store_path, config.store.busy_timeout())
            .with_context(|| format!("failed to open record store {}", store_path.display()))?;
        let queue = QueueClient::connect(
            &config.broker.path(),
            config.broker.visibility_timeout(),
            &connect_retry(&config),
        )
        .await
        .context("failed to connect to broker")?
        .with_options(consume_options(&config));
        info!(store = ?store_path, broker = ?config.broker.path(), "Runtime connected");
        Ok(Self {
            config,
            store,
            queue,
        })
    }

    pub async fn declare_all_queues(&self) -> Result<()> {
        let queues = &self.config.queues;
        for name in [queues.image(), queues.result(), queues.training()] {
            self.queue.declare_durable(name).await?;
        }
        Ok(())
    }
}

pub fn connect_retry(config: &EquaforgeConfig) -> RetryPolicy {
    RetryPolicy::new(
        config.broker.connect_attempts(),
        config.broker.retry_base_delay_ms(),
    )
}

pub fn consume_options(config: &EquaforgeConfig) -> ConsumeOptions {
    ConsumeOptions {
        poll_interval: config.broker.poll_interval(),
        max_redeliveries: config.broker.max_redeliveries(),
        ..ConsumeOptions::default()
    }
}

pub fn training_policy(config: &EquaforgeConfig) -> TrainingPolicy {
    TrainingPolicy {
        min_train_batch_size: config.training.min_train_batch_size(),
        max_batch_size: config.training.max_batch_size(),
    }
}

pub fn model_command(config: &EquaforgeConfig) -> CommandSpec {
    CommandSpec::new(
        config.model.program.clone().unwrap_or_default(),
        config.model.args.clone(),
    )
    .with_timeout(config.model.timeout())
}

pub fn trainer_command(config: &EquaforgeConfig) -> CommandSpec {
    CommandSpec::new(
        config.trainer.program.clone().unwrap_or_default(),
        config.trainer.args.clone(),
    )
    .with_timeout(config.trainer.timeout())
}

/// A live run finishes within the trainer timeout, and its correction lease
/// outlives a crashed process by at most the visibility timeout.
pub fn claim_ttl(config: &EquaforgeConfig) -> Duration {
    config
        .trainer
        .timeout()
        .map_or(DEFAULT_CLAIM_TTL, |t| t + config.broker.visibility_timeout())
}

/// Flips to `true` on Ctrl-C or, on unix, SIGTERM.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown requested, finishing current message");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
