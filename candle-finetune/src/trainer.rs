//! Training loop implementation.

use crate::callbacks::EpochMetrics;
use crate::data::Batches;
use crate::error::{FinetuneError, Result};
use crate::metrics::History;
use crate::{Callback, LightModule, TrainerConfig};
use candle::{DType, Tensor};
use candle_nn::Optimizer;
use std::collections::HashMap;

/// Why the epoch loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// A callback asked to stop before the epoch budget ran out.
    EarlyStopped,
    /// Every epoch of the budget ran.
    BudgetExhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FitOutcome {
    pub epochs_run: usize,
    pub stop_reason: StopReason,
}

pub struct Trainer {
    config: TrainerConfig,
    callbacks: Vec<Box<dyn Callback>>,
    history: History,
}

impl Trainer {
    pub fn new(config: TrainerConfig) -> Self {
        Self {
            config,
            callbacks: Vec::new(),
            history: History::new(),
        }
    }

    pub fn with_callback(mut self, callback: impl Callback + 'static) -> Self {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn add_callback(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Metrics of the most recent (or running) fit.
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Run up to `max_epochs` epochs of updates over `train`, evaluating on `val` after each.
    ///
    /// A non-finite training loss aborts the fit with `NumericalDivergence`
    /// before the offending step is applied. The end-of-epoch evaluation
    /// losses are checked the same way, so an update that blows up the
    /// parameters is caught even when it is the last one of the fit.
    pub fn fit<M, O, B>(
        &mut self,
        model: &mut M,
        optimizer: &mut O,
        train: B,
        val: Option<B>,
    ) -> Result<FitOutcome>
    where
        M: LightModule,
        O: Optimizer,
        B: Batches<M::Batch>,
    {
        self.history = History::new();
        let mut callbacks = std::mem::take(&mut self.callbacks);
        let outcome = self.run(&mut callbacks, model, optimizer, train, val);
        self.callbacks = callbacks;
        outcome
    }

    fn run<M, O, B>(
        &mut self,
        callbacks: &mut [Box<dyn Callback>],
        model: &mut M,
        optimizer: &mut O,
        mut train: B,
        mut val: Option<B>,
    ) -> Result<FitOutcome>
    where
        M: LightModule,
        O: Optimizer,
        B: Batches<M::Batch>,
    {
        for cb in callbacks.iter_mut() {
            cb.on_fit_start(self)?;
        }

        let mut outcome = FitOutcome {
            epochs_run: 0,
            stop_reason: StopReason::BudgetExhausted,
        };
        let mut step = 0usize;

        for epoch in 0..self.config.max_epochs {
            for cb in callbacks.iter_mut() {
                cb.on_epoch_start(self, epoch)?;
            }

            let batches = train.epoch_batches(epoch)?;
            let mut loss_sum = 0f64;
            for (batch_idx, batch) in batches.iter().enumerate() {
                let output = model.training_step(batch, batch_idx)?;
                let loss = finite(scalar(&output.loss)?, epoch, batch_idx, "training")?;
                optimizer.backward_step(&output.loss)?;
                loss_sum += loss as f64;
                step += 1;

                let n = self.config.log_every_n_steps;
                if n > 0 && step % n == 0 {
                    tracing::debug!(epoch, step, loss, "train step");
                }
                for cb in callbacks.iter_mut() {
                    cb.on_train_batch_end(self, batch_idx, &output)?;
                }
            }

            let train_loss = if batches.is_empty() {
                0.0
            } else {
                (loss_sum / batches.len() as f64) as f32
            };
            let mut metrics = EpochMetrics::new(epoch, train_loss);
            metrics.train_metrics = self.evaluate_finite(model, &train.eval_batches()?, epoch)?.1;
            if let Some(val) = val.as_mut() {
                let (val_loss, val_metrics) = self.evaluate_finite(model, &val.eval_batches()?, epoch)?;
                metrics.val_loss = Some(val_loss);
                metrics.val_metrics = val_metrics;
            }
            self.history.push(metrics);
            outcome.epochs_run = epoch + 1;

            if let Some(metrics) = self.history.last() {
                for cb in callbacks.iter_mut() {
                    cb.on_epoch_end(self, epoch, metrics)?;
                }
            }

            if callbacks.iter().any(|cb| cb.should_stop()) {
                outcome.stop_reason = StopReason::EarlyStopped;
                break;
            }
        }

        for cb in callbacks.iter_mut() {
            cb.on_fit_end(self)?;
        }
        Ok(outcome)
    }

    /// Mean loss and mean step metrics over `batches` in evaluation mode.
    pub fn evaluate<M: LightModule>(
        &self,
        model: &M,
        batches: &[M::Batch],
    ) -> Result<(f32, HashMap<String, f64>)> {
        let mut loss_sum = 0f64;
        let mut metric_sums: HashMap<String, f64> = HashMap::new();
        for (batch_idx, batch) in batches.iter().enumerate() {
            let output = model.validation_step(batch, batch_idx)?;
            loss_sum += scalar(&output.loss)? as f64;
            for (name, value) in output.metrics {
                *metric_sums.entry(name).or_default() += value;
            }
        }
        let n = batches.len().max(1) as f64;
        let metrics = metric_sums.into_iter().map(|(k, v)| (k, v / n)).collect();
        Ok(((loss_sum / n) as f32, metrics))
    }

    /// [`Trainer::evaluate`] that fails on the first non-finite batch loss.
    fn evaluate_finite<M: LightModule>(
        &self,
        model: &M,
        batches: &[M::Batch],
        epoch: usize,
    ) -> Result<(f32, HashMap<String, f64>)> {
        let (loss, metrics) = self.evaluate(model, batches)?;
        if loss.is_finite() {
            return Ok((loss, metrics));
        }
        for (batch_idx, batch) in batches.iter().enumerate() {
            let output = model.validation_step(batch, batch_idx)?;
            finite(scalar(&output.loss)?, epoch, batch_idx, "evaluation")?;
        }
        finite(loss, epoch, batches.len().saturating_sub(1), "evaluation")?;
        Ok((loss, metrics))
    }

    /// Mean validation loss over `batches`.
    pub fn validate<M: LightModule>(&self, model: &M, batches: &[M::Batch]) -> Result<f32> {
        Ok(self.evaluate(model, batches)?.0)
    }
}

fn finite(loss: f32, epoch: usize, batch: usize, phase: &str) -> Result<f32> {
    if loss.is_finite() {
        return Ok(loss);
    }
    tracing::warn!(epoch, batch, loss, phase, "loss diverged");
    Err(FinetuneError::NumericalDivergence {
        epoch,
        batch,
        value: loss,
    })
}

fn scalar(loss: &Tensor) -> candle::Result<f32> {
    loss.to_dtype(DType::F32)?.to_scalar::<f32>()
}
