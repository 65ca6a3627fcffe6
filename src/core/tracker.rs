use anyhow::Context;
use serde::Serialize;
use std::fs::File;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochMetrics {
    #[serde(rename = "Epoch")]
    pub epoch: usize,
    #[serde(rename = "Train Loss")]
    pub train_loss: f64,
    #[serde(rename = "Train Accuracy")]
    pub train_acc: f64,
    #[serde(rename = "Validation Loss")]
    pub val_loss: f64,
    #[serde(rename = "Validation Accuracy")]
    pub val_acc: f64,
    #[serde(rename = "Learning Rate")]
    pub learning_rate: f64,
}

/// Per-epoch series returned by a finished run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    pub train_loss: Vec<f64>,
    pub train_acc: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub val_acc: Vec<f64>,
}

impl History {
    pub fn push(&mut self, m: &EpochMetrics) {
        self.train_loss.push(m.train_loss);
        self.train_acc.push(m.train_acc);
        self.val_loss.push(m.val_loss);
        self.val_acc.push(m.val_acc);
    }

    pub fn len(&self) -> usize {
        self.val_acc.len()
    }
}

/// Local experiment log: a `config.json` snapshot plus one `metrics.csv` row per epoch.
pub struct RunTracker {
    writer: csv::Writer<File>,
}

impl RunTracker {
    pub fn create<C: Serialize>(dir: &Path, config: &C) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let config_path = dir.join("config.json");
        std::fs::write(&config_path, serde_json::to_vec_pretty(config)?)
            .with_context(|| format!("writing {}", config_path.display()))?;

        let metrics_path = dir.join("metrics.csv");
        let writer = csv::Writer::from_path(&metrics_path)
            .with_context(|| format!("creating {}", metrics_path.display()))?;
        log::info!("Tracking run in {}", dir.display());
        Ok(Self { writer })
    }

    pub fn log(&mut self, metrics: &EpochMetrics) -> anyhow::Result<()> {
        self.writer.serialize(metrics)?;
        self.writer.flush()?;
        Ok(())
    }
}
