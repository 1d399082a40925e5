//! Per-epoch reporting, decoupled from the training loop.

use super::{Callback, EpochMetrics};
use crate::error::Result;
use crate::Trainer;
use std::sync::Arc;

/// Logs an epoch summary through `tracing` every `every_n_epochs` epochs.
#[derive(Clone, Debug)]
pub struct ProgressLogger {
    every_n_epochs: usize,
    label: String,
}

impl ProgressLogger {
    pub fn new(every_n_epochs: usize) -> Self {
        Self {
            every_n_epochs: every_n_epochs.max(1),
            label: String::new(),
        }
    }

    /// Tag attached to every event, e.g. the grid cell being fitted.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl Callback for ProgressLogger {
    fn on_epoch_end(&mut self, trainer: &Trainer, epoch: usize, metrics: &EpochMetrics) -> Result<()> {
        let is_last = epoch + 1 == trainer.config().max_epochs;
        if (epoch + 1) % self.every_n_epochs != 0 && !is_last {
            return Ok(());
        }
        tracing::info!(
            label = %self.label,
            epoch,
            train_loss = metrics.train_loss,
            val_loss = metrics.val_loss,
            train_acc = metrics.get("train_accuracy"),
            val_acc = metrics.get("val_accuracy"),
            "epoch"
        );
        Ok(())
    }
}

/// Receives every epoch's metrics from an estimator fit.
pub trait EpochObserver: Send + Sync {
    fn on_epoch_end(&self, metrics: &EpochMetrics);
}

impl<F> EpochObserver for F
where
    F: Fn(&EpochMetrics) + Send + Sync,
{
    fn on_epoch_end(&self, metrics: &EpochMetrics) {
        self(metrics)
    }
}

/// Adapts a shared [`EpochObserver`] to the trainer's callback interface.
pub struct ObserverCallback(pub Arc<dyn EpochObserver>);

impl Callback for ObserverCallback {
    fn on_epoch_end(&mut self, _trainer: &Trainer, _epoch: usize, metrics: &EpochMetrics) -> Result<()> {
        self.0.on_epoch_end(metrics);
        Ok(())
    }
}
