//! Callback system for training hooks.

mod checkpoint;
mod early_stopping;
mod progress;

pub use checkpoint::ModelCheckpoint;
pub use early_stopping::{EarlyStopping, Signal};
pub use progress::{EpochObserver, ObserverCallback, ProgressLogger};

use crate::error::Result;
use crate::{StepOutput, Trainer};
use std::collections::HashMap;

/// Improvement direction of a monitored metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Lower is better.
    Min,
    /// Higher is better.
    Max,
}

impl Mode {
    /// Strict comparison; equal values are not an improvement.
    pub fn is_better(&self, current: f64, best: f64) -> bool {
        match self {
            Mode::Min => current < best,
            Mode::Max => current > best,
        }
    }
}

/// Metrics recorded at the end of one epoch.
#[derive(Clone, Debug)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Mean training-step loss over the epoch's mini-batches.
    pub train_loss: f32,
    /// Loss over the validation batches in evaluation mode.
    pub val_loss: Option<f32>,
    /// Step metrics over the training batches in evaluation mode.
    pub train_metrics: HashMap<String, f64>,
    pub val_metrics: HashMap<String, f64>,
}

impl EpochMetrics {
    pub fn new(epoch: usize, train_loss: f32) -> Self {
        Self {
            epoch,
            train_loss,
            val_loss: None,
            train_metrics: HashMap::new(),
            val_metrics: HashMap::new(),
        }
    }

    /// Look up `train_loss`, `val_loss`, or a step metric as `train_<name>` / `val_<name>`.
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "train_loss" => Some(self.train_loss as f64),
            "val_loss" => self.val_loss.map(f64::from),
            _ => {
                if let Some(metric) = name.strip_prefix("train_") {
                    self.train_metrics.get(metric).copied()
                } else if let Some(metric) = name.strip_prefix("val_") {
                    self.val_metrics.get(metric).copied()
                } else {
                    None
                }
            }
        }
    }
}

pub trait Callback: Send {
    fn on_fit_start(&mut self, _trainer: &Trainer) -> Result<()> {
        Ok(())
    }

    fn on_fit_end(&mut self, _trainer: &Trainer) -> Result<()> {
        Ok(())
    }

    fn on_epoch_start(&mut self, _trainer: &Trainer, _epoch: usize) -> Result<()> {
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> Result<()> {
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        _output: &StepOutput,
    ) -> Result<()> {
        Ok(())
    }

    fn should_stop(&self) -> bool {
        false
    }
}
