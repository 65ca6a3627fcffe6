use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Something whose weights can be written to disk.
pub trait Persist {
    fn persist(&self, path: &Path) -> anyhow::Result<()>;
}

impl Persist for candle_nn::VarMap {
    fn persist(&self, path: &Path) -> anyhow::Result<()> {
        self.save(path)
            .with_context(|| format!("saving weights to {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub val_accuracy: f64,
    pub model: String,
}

/// Keeps the weights of the epoch with the highest validation accuracy.
#[derive(Debug)]
pub struct BestCheckpoint {
    path: PathBuf,
    model: String,
    best_val_acc: f64,
    best_epoch: Option<usize>,
}

impl BestCheckpoint {
    pub fn new(path: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            model: model.into(),
            best_val_acc: 0.0,
            best_epoch: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn best_val_acc(&self) -> f64 {
        self.best_val_acc
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn meta_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }

    /// Writes `weights` when `val_acc` beats every accuracy seen so far.
    pub fn consider<P: Persist + ?Sized>(
        &mut self,
        epoch: usize,
        val_acc: f64,
        weights: &P,
    ) -> anyhow::Result<bool> {
        if !(val_acc > self.best_val_acc) {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        weights.persist(&self.path)?;

        let meta = CheckpointMeta {
            epoch,
            val_accuracy: val_acc,
            model: self.model.clone(),
        };
        let meta_path = self.meta_path();
        std::fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)
            .with_context(|| format!("writing {}", meta_path.display()))?;

        log::info!(
            "Epoch {epoch:3} -> validation accuracy improved {:5.2}% -> {:5.2}%, saved {}",
            self.best_val_acc,
            val_acc,
            self.path.display()
        );
        self.best_val_acc = val_acc;
        self.best_epoch = Some(epoch);
        Ok(true)
    }
}

pub fn report_existing(path: &Path) -> bool {
    let exists = path.exists();
    if exists {
        log::info!("Checkpoint path: {}", path.display());
    } else {
        log::info!("Checkpoint file {} does not exist yet", path.display());
    }
    exists
}
