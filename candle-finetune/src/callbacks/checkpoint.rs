//! Model checkpointing callback.

use super::{Callback, EpochMetrics, Mode};
use crate::error::Result;
use crate::snapshot::ParameterSnapshot;
use crate::Trainer;
use candle_nn::VarMap;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

struct CheckpointEntry {
    metric: f64,
    path: PathBuf,
    mode: Mode,
}

impl PartialEq for CheckpointEntry {
    fn eq(&self, other: &Self) -> bool {
        self.metric == other.metric
    }
}

impl Eq for CheckpointEntry {}

impl PartialOrd for CheckpointEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CheckpointEntry {
    // The heap top is the worst checkpoint, i.e. the next one to prune.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let ordering = self.metric.total_cmp(&other.metric);
        match self.mode {
            Mode::Min => ordering,
            Mode::Max => ordering.reverse(),
        }
    }
}

/// Saves the parameters as a safetensors snapshot whenever the monitored metric improves.
///
/// Only the best `save_top_k` files are kept on disk. The module itself is never rolled back.
pub struct ModelCheckpoint {
    varmap: VarMap,
    dirpath: PathBuf,
    monitor: String,
    save_top_k: usize,
    mode: Mode,
    checkpoints: BinaryHeap<CheckpointEntry>,
    best_metric: Option<f64>,
    best_path: Option<PathBuf>,
}

impl ModelCheckpoint {
    /// `varmap` shares storage with the module being trained.
    pub fn new(varmap: VarMap, dirpath: impl Into<PathBuf>) -> Self {
        Self {
            varmap,
            dirpath: dirpath.into(),
            monitor: "val_loss".to_string(),
            save_top_k: 1,
            mode: Mode::Min,
            checkpoints: BinaryHeap::new(),
            best_metric: None,
            best_path: None,
        }
    }

    pub fn monitor(mut self, metric: impl Into<String>) -> Self {
        self.monitor = metric.into();
        self
    }

    pub fn save_top_k(mut self, k: usize) -> Self {
        self.save_top_k = k;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn best_path(&self) -> Option<&Path> {
        self.best_path.as_deref()
    }

    pub fn best_metric(&self) -> Option<f64> {
        self.best_metric
    }

    fn save_checkpoint(&mut self, epoch: usize, metric: f64) -> Result<()> {
        let filename = format!("epoch_{:04}_{}_{:.4}.safetensors", epoch, self.monitor, metric);
        let path = self.dirpath.join(&filename);

        ParameterSnapshot::from_varmap(&self.varmap)?.save(&path)?;
        tracing::debug!(epoch, metric, path = %path.display(), "saved checkpoint");

        self.best_path = Some(path.clone());
        self.checkpoints.push(CheckpointEntry {
            metric,
            path,
            mode: self.mode,
        });

        while self.checkpoints.len() > self.save_top_k {
            if let Some(entry) = self.checkpoints.pop() {
                if let Err(e) = std::fs::remove_file(&entry.path) {
                    tracing::warn!(path = %entry.path.display(), error = %e, "failed to prune checkpoint");
                }
            }
        }

        Ok(())
    }
}

impl Callback for ModelCheckpoint {
    fn on_epoch_end(&mut self, _trainer: &Trainer, epoch: usize, metrics: &EpochMetrics) -> Result<()> {
        let Some(current) = metrics.get(&self.monitor) else {
            return Ok(());
        };

        let should_save = match self.best_metric {
            None => true,
            Some(best) => self.mode.is_better(current, best),
        };

        if should_save && self.save_top_k > 0 {
            self.best_metric = Some(current);
            self.save_checkpoint(epoch, current)?;
        }

        Ok(())
    }
}
