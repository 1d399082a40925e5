//! Early stopping callback.

use super::{Callback, EpochMetrics, Mode};
use crate::error::Result;
use crate::Trainer;

/// Verdict of one [`EarlyStopping::observe`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    Continue,
    Stop,
}

/// Stops a fit once the monitored metric has not improved for `patience` epochs.
///
/// One instance covers one fit: once it has signalled [`Signal::Stop`] it keeps
/// doing so.
#[derive(Clone, Debug)]
pub struct EarlyStopping {
    monitor: String,
    patience: usize,
    min_delta: f64,
    mode: Mode,
    best_metric: Option<f64>,
    epochs_without_improvement: usize,
    stopped: bool,
}

impl EarlyStopping {
    pub fn new() -> Self {
        Self {
            monitor: "val_loss".to_string(),
            patience: 3,
            min_delta: 0.0,
            mode: Mode::Min,
            best_metric: None,
            epochs_without_improvement: 0,
            stopped: false,
        }
    }

    pub fn monitor(mut self, metric: impl Into<String>) -> Self {
        self.monitor = metric.into();
        self
    }

    pub fn patience(mut self, patience: usize) -> Self {
        self.patience = patience;
        self
    }

    pub fn min_delta(mut self, delta: f64) -> Self {
        self.min_delta = delta;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn best(&self) -> Option<f64> {
        self.best_metric
    }

    pub fn epochs_without_improvement(&self) -> usize {
        self.epochs_without_improvement
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn is_improvement(&self, current: f64, best: f64) -> bool {
        match self.mode {
            Mode::Min => current < best - self.min_delta,
            Mode::Max => current > best + self.min_delta,
        }
    }

    /// Record one observation of the monitored metric.
    pub fn observe(&mut self, current: f64) -> Signal {
        if self.stopped {
            return Signal::Stop;
        }
        match self.best_metric {
            None => {
                self.best_metric = Some(current);
                self.epochs_without_improvement = 0;
            }
            Some(best) if self.is_improvement(current, best) => {
                self.best_metric = Some(current);
                self.epochs_without_improvement = 0;
            }
            Some(_) => {
                self.epochs_without_improvement += 1;
                if self.epochs_without_improvement >= self.patience {
                    self.stopped = true;
                    return Signal::Stop;
                }
            }
        }
        Signal::Continue
    }
}

impl Default for EarlyStopping {
    fn default() -> Self {
        Self::new()
    }
}

impl Callback for EarlyStopping {
    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        epoch: usize,
        metrics: &EpochMetrics,
    ) -> Result<()> {
        let Some(current) = metrics.get(&self.monitor) else {
            tracing::warn!(monitor = %self.monitor, epoch, "monitored metric not reported");
            return Ok(());
        };

        if self.observe(current) == Signal::Stop {
            tracing::info!(
                monitor = %self.monitor,
                epoch,
                best = self.best_metric,
                patience = self.patience,
                "early stopping"
            );
        }
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.stopped
    }
}
