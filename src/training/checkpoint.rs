//! Per-epoch checkpoints: head weights plus a JSON summary.
//!
//! Layout inside the checkpoint directory:
//! - `checkpoint_epoch_N.json` and `head_epoch_N.mpk` for recent epochs
//! - `best_model.json` / `best_head.mpk` for the best validation epoch
//! - `latest.json` for the most recent epoch

use std::fs;
use std::path::{Path, PathBuf};

use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::{record_file, ClassifierHead};
use crate::utils::error::{Result, TransferError};

/// Checkpoint summary written as JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 1-based epoch number
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_accuracy: Option<f64>,
    /// RFC 3339
    pub timestamp: String,
    pub metadata: CheckpointMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub backbone: String,
    pub class_names: Vec<String>,
    pub trainable_params: usize,
    /// `None` when the backbone runs outside Burn and its size is unknown
    pub frozen_params: Option<usize>,
    pub training_samples: usize,
}

impl Checkpoint {
    pub fn new(
        epoch: usize,
        train_loss: f64,
        train_accuracy: f64,
        val_accuracy: Option<f64>,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            epoch,
            train_loss,
            train_accuracy,
            val_accuracy,
            timestamp: Utc::now().to_rfc3339(),
            metadata,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TransferError::PathNotFound(path.to_path_buf()));
        }
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Writes checkpoints and prunes old ones
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    keep_last_n: usize,
}

impl CheckpointManager {
    pub fn new(checkpoint_dir: impl Into<PathBuf>, keep_last_n: usize) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            keep_last_n: keep_last_n.max(1),
        }
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Save `checkpoint` and the head weights for its epoch
    pub fn save<B: Backend>(
        &self,
        checkpoint: &Checkpoint,
        head: &ClassifierHead<B>,
        is_best: bool,
    ) -> Result<()> {
        fs::create_dir_all(&self.checkpoint_dir)?;

        checkpoint.save(&self.epoch_json(checkpoint.epoch))?;
        save_head(head, &self.head_base(checkpoint.epoch))?;

        if is_best {
            checkpoint.save(&self.checkpoint_dir.join("best_model.json"))?;
            save_head(head, &self.checkpoint_dir.join("best_head"))?;
            info!("Best checkpoint updated (epoch {})", checkpoint.epoch);
        }

        checkpoint.save(&self.checkpoint_dir.join("latest.json"))?;
        self.cleanup_old_checkpoints::<B>()
    }

    pub fn load_latest(&self) -> Result<Checkpoint> {
        Checkpoint::load(&self.checkpoint_dir.join("latest.json"))
    }

    pub fn load_best(&self) -> Result<Checkpoint> {
        Checkpoint::load(&self.checkpoint_dir.join("best_model.json"))
    }

    pub fn load_epoch(&self, epoch: usize) -> Result<Checkpoint> {
        Checkpoint::load(&self.epoch_json(epoch))
    }

    /// Epoch numbers with a per-epoch checkpoint on disk, ascending
    pub fn list_epochs(&self) -> Result<Vec<usize>> {
        if !self.checkpoint_dir.exists() {
            return Ok(Vec::new());
        }

        let mut epochs = Vec::new();
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let entry = entry?;
            if let Some(epoch) = entry.file_name().to_str().and_then(epoch_from_filename) {
                epochs.push(epoch);
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    /// Head record written for `epoch`, including the recorder's extension
    pub fn head_path<B: Backend>(&self, epoch: usize) -> PathBuf {
        record_file::<B>(&self.head_base(epoch))
    }

    fn head_base(&self, epoch: usize) -> PathBuf {
        self.checkpoint_dir.join(format!("head_epoch_{}", epoch))
    }

    fn epoch_json(&self, epoch: usize) -> PathBuf {
        self.checkpoint_dir.join(format!("checkpoint_epoch_{}.json", epoch))
    }

    fn cleanup_old_checkpoints<B: Backend>(&self) -> Result<()> {
        let epochs = self.list_epochs()?;
        if epochs.len() <= self.keep_last_n {
            return Ok(());
        }

        let to_remove = epochs.len() - self.keep_last_n;
        for epoch in epochs.into_iter().take(to_remove) {
            let files = [
                self.epoch_json(epoch),
                self.head_path::<B>(epoch),
            ];
            for path in files {
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to remove old checkpoint {:?}: {}", path, e);
                }
            }
        }
        Ok(())
    }
}

fn save_head<B: Backend>(head: &ClassifierHead<B>, base: &Path) -> Result<()> {
    head.clone()
        .save_file(base, &CompactRecorder::new())
        .map_err(|e| TransferError::Model(format!("Failed to save head weights: {:?}", e)))
}

/// `checkpoint_epoch_12.json` -> 12
pub fn epoch_from_filename(filename: &str) -> Option<usize> {
    filename
        .strip_prefix("checkpoint_epoch_")
        .and_then(|s| s.strip_suffix(".json"))
        .and_then(|s| s.parse().ok())
}
