//! OCR model backed by an external program, and active-weights provisioning.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use equaforge_core::{ForgeError, ModelLoader, OcrModel, RecordId};
use equaforge_store::RecordStore;

use crate::fsutil::atomic_write;
use crate::process::CommandSpec;

/// Runs the configured program once per image and reads the equation from stdout.
pub struct CommandOcrModel {
    name: String,
    command: CommandSpec,
    weights: Option<PathBuf>,
}

impl CommandOcrModel {
    pub fn new(command: CommandSpec, weights: Option<PathBuf>) -> Self {
        let name = Path::new(&command.program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| command.program.clone());
        Self {
            name,
            command,
            weights,
        }
    }

    pub fn weights(&self) -> Option<&Path> {
        self.weights.as_deref()
    }
}

#[async_trait]
impl OcrModel for CommandOcrModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recognize(&self, image: &[u8], filename: &str) -> Result<Option<String>, ForgeError> {
        let suffix = Path::new(filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_else(|| ".png".to_string());
        let mut file = tempfile::Builder::new()
            .prefix("equaforge-ocr-")
            .suffix(&suffix)
            .tempfile()?;
        file.write_all(image)?;
        file.flush()?;

        let image_path = file.path().to_string_lossy().to_string();
        let weights = self
            .weights
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();
        let output = self
            .command
            .run(&[("image", &image_path), ("weights", &weights)])
            .await
            .map_err(|e| ForgeError::InferenceFailed(format!("{e:#}")))?;

        let text = output.stdout.trim();
        Ok((!text.is_empty()).then(|| text.to_string()))
    }
}

pub struct CommandModelLoader {
    command: CommandSpec,
}

impl CommandModelLoader {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

impl ModelLoader for CommandModelLoader {
    fn load(&self, weights: Option<&Path>) -> Result<Arc<dyn OcrModel>, ForgeError> {
        if self.command.program.trim().is_empty() {
            return Err(ForgeError::Config("model.program is not set".into()));
        }
        if let Some(path) = weights {
            if !path.is_file() {
                return Err(ForgeError::not_found(format!("weights file {path:?}")));
            }
        }
        Ok(Arc::new(CommandOcrModel::new(
            self.command.clone(),
            weights.map(Path::to_path_buf),
        )))
    }
}

/// Sidecar next to the active weights naming the checkpoint they came from.
pub fn deployed_marker(active: &Path) -> PathBuf {
    let mut name = active.file_name().unwrap_or_default().to_os_string();
    name.push(".checkpoint");
    active.with_file_name(name)
}

/// Record which checkpoint the active weights file now holds.
pub fn record_deployment(active: &Path, checkpoint: RecordId) -> Result<(), ForgeError> {
    atomic_write(&deployed_marker(active), checkpoint.to_hex().as_bytes())?;
    Ok(())
}

fn deployed_checkpoint(active: &Path) -> Option<String> {
    let marker = std::fs::read_to_string(deployed_marker(active)).ok()?;
    Some(marker.trim().to_string())
}

/// Make sure the active weights file reflects the newest stored checkpoint.
///
/// The file is kept when its marker names the latest checkpoint, or when no
/// checkpoint is stored at all. Otherwise the latest checkpoint is written
/// there atomically, followed by its marker. Returns the path a model should
/// load.
pub async fn provision_active_weights(
    store: &RecordStore,
    active: &Path,
) -> Result<Option<PathBuf>, ForgeError> {
    let existing = active.is_file().then(|| active.to_path_buf());
    let Some(checkpoint) = store.latest_checkpoint().await? else {
        if existing.is_none() {
            info!(path = ?active, "No checkpoint stored, starting from base model");
        }
        return Ok(existing);
    };
    let latest = checkpoint.id.to_hex();
    if existing.is_some() && deployed_checkpoint(active).as_deref() == Some(latest.as_str()) {
        return Ok(existing);
    }
    let blob = match store.get_blob(checkpoint.record.weights).await {
        Ok(blob) => blob,
        Err(ForgeError::NotFound(what)) => {
            warn!(checkpoint = %checkpoint.id, %what, "Checkpoint weights missing from store");
            return Ok(existing);
        }
        Err(e) => return Err(e),
    };
    atomic_write(active, &blob.data)?;
    record_deployment(active, checkpoint.id)?;
    info!(
        checkpoint = %checkpoint.id,
        filename = %checkpoint.record.weights_filename,
        path = ?active,
        replaced = existing.is_some(),
        "Provisioned active weights from store"
    );
    Ok(Some(active.to_path_buf()))
}
