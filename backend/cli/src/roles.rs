//! The three long-running worker roles. Each consumes one queue until a
//! shutdown signal arrives.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use equaforge_queue::ConsumeStats;
use equaforge_workers::{
    CommandModelLoader, InferenceWorker, ResultSink, RetrainJobRunner, TrainingCoordinator,
};

use crate::runtime::{
    claim_ttl, model_command, shutdown_signal, trainer_command, training_policy, Runtime,
};

fn log_stats(role: &str, stats: ConsumeStats) {
    info!(
        role,
        acked = stats.acked,
        requeued = stats.requeued,
        dead_lettered = stats.dead_lettered,
        lost = stats.lost,
        "Worker stopped"
    );
}

pub async fn inference_worker(runtime: Runtime) -> Result<()> {
    let config = &runtime.config;
    let loader = CommandModelLoader::new(model_command(config));
    let worker = InferenceWorker::new(
        runtime.store.clone(),
        runtime.queue.clone(),
        &loader,
        &config.model.active_weights_path(),
        config.queues.result(),
    )
    .await
    .context("failed to start inference worker")?;

    let image_queue = config.queues.image();
    runtime.queue.declare_durable(image_queue).await?;
    info!(queue = image_queue, consumer = runtime.queue.consumer_tag(), "Inference worker consuming");
    let stats = worker.run(image_queue, shutdown_signal()).await?;
    log_stats("inference-worker", stats);
    Ok(())
}

pub async fn result_sink(runtime: Runtime) -> Result<()> {
    let config = &runtime.config;
    let sink = ResultSink::new(runtime.store.clone(), config.display.index_path());
    let result_queue = config.queues.result();
    runtime.queue.declare_durable(result_queue).await?;
    info!(
        queue = result_queue,
        index = ?sink.index_path(),
        consumer = runtime.queue.consumer_tag(),
        "Result sink consuming"
    );
    let stats = sink
        .run(&runtime.queue, result_queue, shutdown_signal())
        .await?;
    log_stats("result-sink", stats);
    Ok(())
}

pub async fn training_coordinator(runtime: Runtime) -> Result<()> {
    let config = &runtime.config;
    if config.trainer.program.as_deref().map_or(true, |p| p.trim().is_empty()) {
        bail!("trainer.program is not set; cannot start a training coordinator");
    }
    let policy = training_policy(config);
    let job = Arc::new(RetrainJobRunner::new(
        runtime.store.clone(),
        trainer_command(config),
        policy,
        config.trainer.weights_extension(),
        config.model.active_weights_path(),
    ));
    let coordinator = TrainingCoordinator::new(runtime.store.clone(), job, policy)
        .with_claim_ttl(claim_ttl(config));

    let training_queue = config.queues.training();
    runtime.queue.declare_durable(training_queue).await?;
    info!(
        queue = training_queue,
        threshold = policy.threshold(),
        consumer = runtime.queue.consumer_tag(),
        "Training coordinator consuming"
    );
    let stats = coordinator
        .run(&runtime.queue, training_queue, shutdown_signal())
        .await?;
    log_stats("training-coordinator", stats);
    Ok(())
}
