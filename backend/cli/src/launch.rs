//! Process launcher: starts the configured number of OS processes per worker
//! role, each running this binary with the role's subcommand.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use equaforge_config::EquaforgeConfig;

/// How long children get to drain after an interrupt before being killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    InferenceWorker,
    ResultSink,
    TrainingCoordinator,
}

impl Role {
    pub fn subcommand(self) -> &'static str {
        match self {
            Self::InferenceWorker => "inference-worker",
            Self::ResultSink => "result-sink",
            Self::TrainingCoordinator => "training-coordinator",
        }
    }
}

/// Process count per role, skipping roles configured to zero.
pub fn plan(config: &EquaforgeConfig) -> Vec<(Role, usize)> {
    [
        (Role::InferenceWorker, config.workers.inference()),
        (Role::ResultSink, config.workers.result_sink()),
        (Role::TrainingCoordinator, config.workers.coordinator()),
    ]
    .into_iter()
    .filter(|(_, count)| *count > 0)
    .collect()
}

pub async fn launch(config_path: &Path, config: &EquaforgeConfig) -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate the equaforge executable")?;
    let mut children: JoinSet<(String, std::io::Result<ExitStatus>)> = JoinSet::new();

    for (role, count) in plan(config) {
        for index in 0..count {
            let label = format!("{}#{index}", role.subcommand());
            let mut child = Command::new(&exe)
                .arg("--config")
                .arg(config_path)
                .arg(role.subcommand())
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("failed to spawn {label}"))?;
            info!(process = %label, pid = ?child.id(), "Started worker process");
            children.spawn(async move {
                let status = child.wait().await;
                (label, status)
            });
        }
    }
    if children.is_empty() {
        warn!("No worker processes configured");
        return Ok(());
    }

    let interrupted = tokio::select! {
        _ = wait_all(&mut children) => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if !interrupted {
        info!("All worker processes exited");
        return Ok(());
    }

    info!(remaining = children.len(), "Interrupt received, waiting for workers to stop");
    if tokio::time::timeout(SHUTDOWN_GRACE, wait_all(&mut children))
        .await
        .is_err()
    {
        warn!(remaining = children.len(), "Workers did not stop in time, killing them");
        children.shutdown().await;
    }
    Ok(())
}

async fn wait_all(children: &mut JoinSet<(String, std::io::Result<ExitStatus>)>) {
    while let Some(joined) = children.join_next().await {
        match joined {
            Ok((label, Ok(status))) if status.success() => {
                info!(process = %label, "Worker process exited");
            }
            Ok((label, Ok(status))) => {
                error!(process = %label, %status, "Worker process failed");
            }
            Ok((label, Err(e))) => {
                error!(process = %label, error = %e, "Lost track of worker process");
            }
            Err(e) => error!(error = %e, "Worker supervision task failed"),
        }
    }
}
