//! Metrics for tracking training progress.

use crate::callbacks::{EpochMetrics, Mode};
use candle::{DType, Result, Tensor, D};

pub trait Metric {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()>;
    fn compute(&self) -> f64;
}

/// Fraction of rows whose predicted class equals the target.
///
/// `preds` may be class scores `(rows, classes)` or class ids `(rows,)`.
#[derive(Clone, Debug, Default)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Metric for Accuracy {
    fn update(&mut self, preds: &Tensor, targets: &Tensor) -> Result<()> {
        let ids = match preds.rank() {
            2 => preds.argmax(D::Minus1)?,
            _ => preds.to_dtype(DType::U32)?,
        };
        let targets = targets.to_dtype(DType::U32)?;
        let correct = ids
            .eq(&targets)?
            .to_dtype(DType::F32)?
            .sum_all()?
            .to_scalar::<f32>()?;
        self.correct += correct as usize;
        self.total += targets.dims1()?;
        Ok(())
    }

    fn compute(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

/// Append-only per-epoch record of a fit.
#[derive(Clone, Debug, Default)]
pub struct History {
    epochs: Vec<EpochMetrics>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// Values of one metric in epoch order; epochs lacking it are skipped.
    pub fn series(&self, name: &str) -> Vec<f64> {
        self.epochs.iter().filter_map(|m| m.get(name)).collect()
    }

    /// The first epoch holding the best value of `name`.
    pub fn best(&self, name: &str, mode: Mode) -> Option<&EpochMetrics> {
        let mut best: Option<(&EpochMetrics, f64)> = None;
        for m in &self.epochs {
            let Some(v) = m.get(name) else { continue };
            let better = match best {
                None => true,
                Some((_, b)) => mode.is_better(v, b),
            };
            if better {
                best = Some((m, v));
            }
        }
        best.map(|(m, _)| m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    #[test]
    fn accuracy_from_scores_and_ids() -> Result<()> {
        let dev = Device::Cpu;
        let mut acc = Accuracy::new();
        let scores = Tensor::new(&[[0.9f32, 0.1], [0.2, 0.8], [0.6, 0.4]], &dev)?;
        acc.update(&scores, &Tensor::new(&[0u32, 1, 1], &dev)?)?;
        assert!((acc.compute() - 2.0 / 3.0).abs() < 1e-12);

        acc.update(&Tensor::new(&[1u32], &dev)?, &Tensor::new(&[1u32], &dev)?)?;
        assert!((acc.compute() - 0.75).abs() < 1e-12);
        assert_eq!(Accuracy::new().compute(), 0.0);
        Ok(())
    }

    #[test]
    fn history_best_prefers_first_on_ties() {
        let mut history = History::new();
        for (epoch, acc) in [0.5, 0.9, 0.9, 0.7].into_iter().enumerate() {
            let mut m = EpochMetrics::new(epoch, 1.0);
            m.val_metrics.insert("accuracy".into(), acc);
            history.push(m);
        }
        assert_eq!(history.series("val_accuracy"), vec![0.5, 0.9, 0.9, 0.7]);
        assert_eq!(history.best("val_accuracy", Mode::Max).unwrap().epoch, 1);
        assert_eq!(history.best("val_accuracy", Mode::Min).unwrap().epoch, 0);
        assert!(history.best("val_loss", Mode::Min).is_none());
    }
}
