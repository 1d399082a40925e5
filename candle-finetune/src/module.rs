//! Trainable module traits and the default multi-layer perceptron.

use crate::config::Architecture;
use candle::{DType, Device, Module, ModuleT, Result, Tensor, Var};
use candle_nn::{Dropout, Linear, VarBuilder, VarMap};
use std::collections::HashMap;

/// Output from a training or validation step.
pub struct StepOutput {
    /// The loss tensor for backpropagation.
    pub loss: Tensor,
    /// Optional metrics (e.g., accuracy, perplexity).
    pub metrics: HashMap<String, f64>,
}

impl StepOutput {
    pub fn new(loss: Tensor) -> Self {
        Self {
            loss,
            metrics: HashMap::new(),
        }
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Trait for models that can be trained with [`Trainer`](crate::Trainer).
pub trait LightModule {
    type Batch;

    /// Compute loss and metrics for a training batch.
    fn training_step(&mut self, batch: &Self::Batch, batch_idx: usize) -> Result<StepOutput>;

    /// Compute loss and metrics for a batch in evaluation mode.
    fn validation_step(&self, batch: &Self::Batch, batch_idx: usize) -> Result<StepOutput>;

    /// Return all trainable parameters.
    fn parameters(&self) -> Vec<Var>;
}

/// A differentiable classifier producing class scores (logits) for a batch of rows.
///
/// Parameters live in a [`VarMap`] so they can be snapshotted and overwritten in place.
pub trait ClassifierModule: Sized + Send + Sync {
    /// Build a module with default (random) initialization.
    fn build(arch: &Architecture, dropout: f32, device: &Device) -> Result<Self>;

    /// Class scores of shape `(rows, num_classes)`. `train` enables dropout.
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor>;

    fn varmap(&self) -> &VarMap;

    fn device(&self) -> &Device;

    /// Parameters ordered by identifier.
    fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        named_vars(self.varmap())
    }

    fn parameters(&self) -> Result<Vec<Var>> {
        Ok(self
            .named_parameters()?
            .into_iter()
            .map(|(_, var)| var)
            .collect())
    }
}

/// The variables of `varmap`, sorted by name.
pub fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle::Error::Msg(format!("varmap lock poisoned: {e}")))?;
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

/// Fully connected ReLU network with dropout between hidden layers.
///
/// Layers are named `fc0`, `fc1`, ... in input-to-output order.
pub struct Mlp {
    layers: Vec<Linear>,
    dropout: Dropout,
    drop_p: f32,
    varmap: VarMap,
    device: Device,
}

impl ClassifierModule for Mlp {
    fn build(arch: &Architecture, dropout: f32, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let mut widths = Vec::with_capacity(arch.hidden.len() + 2);
        widths.push(arch.input_dim);
        widths.extend_from_slice(&arch.hidden);
        widths.push(arch.num_classes);

        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, w)| candle_nn::linear(w[0], w[1], vs.pp(format!("fc{i}"))))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layers,
            dropout: Dropout::new(dropout),
            drop_p: dropout,
            varmap,
            device: device.clone(),
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut xs = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i < last {
                xs = xs.relu()?;
                if train && self.drop_p > 0.0 {
                    xs = self.dropout.forward_t(&xs, true)?;
                }
            }
        }
        Ok(xs)
    }

    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
