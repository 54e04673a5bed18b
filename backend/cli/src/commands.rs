//! Presentation-layer operations run from the command line.

use std::path::Path;

use anyhow::{Context, Result};

use equaforge_config::{apply_all_defaults, write_config, EquaforgeConfig};
use equaforge_core::{ImageQuery, OriginType, RecordId};
use equaforge_queue::dead_letter_queue;
use equaforge_workers::{Ingestor, ResultSink, UploadMetadata};

use crate::runtime::{training_policy, Runtime};
use crate::terminal_output::{note_success, note_warn, render_table, supports_color, Column};

pub struct UploadArgs<'a> {
    pub file: &'a Path,
    pub origin: OriginType,
    pub equation_name: String,
    pub section: String,
    pub author: String,
}

fn ingestor(runtime: &Runtime) -> Ingestor {
    Ingestor::new(
        runtime.store.clone(),
        runtime.queue.clone(),
        runtime.config.queues.image(),
        runtime.config.queues.training(),
    )
}

fn sink(runtime: &Runtime) -> ResultSink {
    ResultSink::new(runtime.store.clone(), runtime.config.display.index_path())
}

pub async fn upload(runtime: &Runtime, args: UploadArgs<'_>) -> Result<()> {
    let bytes = tokio::fs::read(args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let filename = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let image_id = ingestor(runtime)
        .upload(
            &bytes,
            &filename,
            UploadMetadata {
                origin: args.origin,
                equation_name: args.equation_name,
                section: args.section,
                author: args.author,
            },
        )
        .await?;
    note_success(&format!("uploaded {filename} as image {image_id}"));
    Ok(())
}

pub async fn correct(runtime: &Runtime, result_id: RecordId, label: &str) -> Result<()> {
    ingestor(runtime).submit_correction(result_id, label).await?;
    note_success(&format!("correction for result {result_id} queued"));
    Ok(())
}

pub async fn delete(runtime: &Runtime, result_id: RecordId) -> Result<()> {
    sink(runtime).delete_result(result_id).await?;
    note_success(&format!("result {result_id} and its image deleted"));
    Ok(())
}

pub async fn rebuild_index(runtime: &Runtime) -> Result<()> {
    let sink = sink(runtime);
    let entries = sink.rebuild_index().await?;
    note_success(&format!(
        "display index {} rebuilt with {entries} entries",
        sink.index_path().display()
    ));
    Ok(())
}

pub async fn show_index(runtime: &Runtime) -> Result<()> {
    let index = sink(runtime).load_index()?;
    if index.is_empty() {
        note_warn("display index is empty");
        return Ok(());
    }
    let mut rows = Vec::with_capacity(index.len());
    for (section, equations) in index.sections() {
        for (equation, entry) in equations {
            rows.push(vec![
                section.to_string(),
                equation.clone(),
                entry.author.clone(),
                entry.predicted_text.clone(),
                RecordId::join(entry.store_id).to_string(),
            ]);
        }
    }
    let columns = [
        Column::left("section"),
        Column::left("equation"),
        Column::left("author"),
        Column::left("prediction"),
        Column::left("result"),
    ];
    print!("{}", render_table(&columns, &rows, supports_color()));
    Ok(())
}

pub async fn status(runtime: &Runtime) -> Result<()> {
    let config = &runtime.config;
    let policy = training_policy(config);
    let pending = runtime
        .store
        .count(&ImageQuery::pending_training())
        .await?;

    println!("Training");
    println!("  pending corrections: {pending} / {}", policy.threshold());
    match runtime.store.latest_checkpoint().await? {
        Some(checkpoint) => println!(
            "  latest checkpoint:   {} ({}, {} images, {})",
            checkpoint.id,
            checkpoint.record.weights_filename,
            checkpoint.record.training_ids.len(),
            checkpoint.record.created_at.to_rfc3339()
        ),
        None => println!("  latest checkpoint:   none"),
    }
    let active = config.model.active_weights_path();
    if active.is_file() {
        println!("  active weights:      {}", active.display());
    } else {
        println!("  active weights:      {} (missing)", active.display());
    }

    let queues = &config.queues;
    let mut rows = Vec::new();
    for name in [queues.image(), queues.result(), queues.training()] {
        for queue in [name.to_string(), dead_letter_queue(name)] {
            let depth = runtime.queue.depth(&queue).await?;
            if queue.ends_with(".dead-letter") && depth.ready + depth.unacked == 0 {
                continue;
            }
            rows.push(vec![
                queue,
                depth.ready.to_string(),
                depth.unacked.to_string(),
            ]);
        }
    }
    println!();
    let columns = [
        Column::left("queue"),
        Column::right("ready"),
        Column::right("unacked"),
    ];
    print!("{}", render_table(&columns, &rows, supports_color()));
    Ok(())
}

/// Write a fully defaulted config file, refusing to overwrite unless asked.
pub async fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        note_warn(&format!(
            "{} already exists; pass --force to overwrite",
            path.display()
        ));
        return Ok(());
    }
    write_config(&apply_all_defaults(EquaforgeConfig::default()), path).await?;
    note_success(&format!("wrote {}", path.display()));
    Ok(())
}

pub fn show_config(config: &EquaforgeConfig) -> Result<()> {
    print!(
        "{}",
        serde_yaml::to_string(config).context("failed to render config")?
    );
    Ok(())
}
