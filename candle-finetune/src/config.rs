//! Trainer, estimator and search configuration.

use crate::error::{FinetuneError, Result};
use crate::hyperparams::{Hyperparameter, HyperparameterSet};
use crate::init::InitConfig;
use crate::search::ParamGrid;
use candle::Device;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Settings of the generic epoch loop.
#[derive(Clone, Debug)]
pub struct TrainerConfig {
    pub max_epochs: usize,
    /// Emit a debug event every `n` optimizer steps; 0 disables it.
    pub log_every_n_steps: usize,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: 1000,
            log_every_n_steps: 50,
        }
    }
}

impl TrainerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_epochs(mut self, epochs: usize) -> Self {
        self.max_epochs = epochs;
        self
    }

    pub fn log_every_n_steps(mut self, n: usize) -> Self {
        self.log_every_n_steps = n;
        self
    }
}

/// Compute device, resolved when a module is built.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceKind {
    pub fn device(&self) -> candle::Result<Device> {
        match *self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Device::new_cuda(ordinal),
            Self::Metal(ordinal) => Device::new_metal(ordinal),
        }
    }
}

/// Layer widths of the classifier. Fixed for the lifetime of a module.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Architecture {
    pub input_dim: usize,
    #[serde(default)]
    pub hidden: Vec<usize>,
    pub num_classes: usize,
}

impl Architecture {
    pub fn new(input_dim: usize, hidden: impl Into<Vec<usize>>, num_classes: usize) -> Self {
        Self {
            input_dim,
            hidden: hidden.into(),
            num_classes,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(FinetuneError::invalid_config("architecture.input_dim must be positive"));
        }
        if self.num_classes < 2 {
            return Err(FinetuneError::invalid_config("architecture.num_classes must be at least 2"));
        }
        if self.hidden.iter().any(|&w| w == 0) {
            return Err(FinetuneError::invalid_config("architecture.hidden widths must be positive"));
        }
        Ok(())
    }
}

/// Everything a [`Classifier`](crate::Classifier) needs to build and fit its module.
///
/// The fields named by [`Hyperparameter`] can be overridden per grid cell with
/// [`EstimatorConfig::apply`]; the architecture cannot, so a warm-start snapshot
/// stays shape compatible across the whole grid.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EstimatorConfig {
    pub architecture: Architecture,
    #[serde(default = "defaults::dropout")]
    pub dropout: f64,
    #[serde(default = "defaults::lr")]
    pub lr: f64,
    #[serde(default)]
    pub l1: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "defaults::batch_size")]
    pub batch_size: usize,
    #[serde(default = "defaults::max_epochs")]
    pub max_epochs: usize,
    /// Early stopping patience; `None` trains for the full epoch budget.
    #[serde(default = "defaults::patience")]
    pub patience: Option<usize>,
    #[serde(default)]
    pub min_delta: f64,
    /// Fraction of the fit data held out for per-epoch validation; 0 disables the split.
    #[serde(default = "defaults::val_fraction")]
    pub val_fraction: f64,
    /// Seeds the internal split and mini-batch order.
    #[serde(default = "defaults::seed")]
    pub seed: u64,
    #[serde(default)]
    pub device: DeviceKind,
    /// Log an epoch summary every `n` epochs; 0 disables it.
    #[serde(default)]
    pub log_every_n_epochs: usize,
    /// Keep the best-epoch parameters as safetensors files in this directory.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
}

mod defaults {
    pub fn dropout() -> f64 {
        0.0
    }
    pub fn lr() -> f64 {
        1e-3
    }
    pub fn batch_size() -> usize {
        32
    }
    pub fn max_epochs() -> usize {
        50
    }
    pub fn patience() -> Option<usize> {
        Some(5)
    }
    pub fn val_fraction() -> f64 {
        0.2
    }
    pub fn seed() -> u64 {
        42
    }
}

impl EstimatorConfig {
    pub fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            dropout: defaults::dropout(),
            lr: defaults::lr(),
            l1: 0.0,
            weight_decay: 0.0,
            batch_size: defaults::batch_size(),
            max_epochs: defaults::max_epochs(),
            patience: defaults::patience(),
            min_delta: 0.0,
            val_fraction: defaults::val_fraction(),
            seed: defaults::seed(),
            device: DeviceKind::Cpu,
            log_every_n_epochs: 0,
            checkpoint_dir: None,
        }
    }

    pub fn lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn l1(mut self, l1: f64) -> Self {
        self.l1 = l1;
        self
    }

    pub fn dropout(mut self, p: f64) -> Self {
        self.dropout = p;
        self
    }

    pub fn weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn max_epochs(mut self, n: usize) -> Self {
        self.max_epochs = n;
        self
    }

    pub fn patience(mut self, patience: Option<usize>) -> Self {
        self.patience = patience;
        self
    }

    pub fn min_delta(mut self, delta: f64) -> Self {
        self.min_delta = delta;
        self
    }

    pub fn val_fraction(mut self, fraction: f64) -> Self {
        self.val_fraction = fraction;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn device(mut self, device: DeviceKind) -> Self {
        self.device = device;
        self
    }

    pub fn log_every_n_epochs(mut self, n: usize) -> Self {
        self.log_every_n_epochs = n;
        self
    }

    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Return a copy with every value of `params` applied, validated.
    pub fn apply(&self, params: &HyperparameterSet) -> Result<Self> {
        let mut config = self.clone();
        for (name, value) in params.iter() {
            name.validate(value)?;
            match name {
                Hyperparameter::LearningRate => config.lr = value,
                Hyperparameter::L1 => config.l1 = value,
                Hyperparameter::Dropout => config.dropout = value,
                Hyperparameter::WeightDecay => config.weight_decay = value,
                Hyperparameter::BatchSize => config.batch_size = value as usize,
                Hyperparameter::MaxEpochs => config.max_epochs = value as usize,
                Hyperparameter::Patience => config.patience = Some(value as usize),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.architecture.validate()?;
        let checks = [
            (Hyperparameter::LearningRate, self.lr),
            (Hyperparameter::L1, self.l1),
            (Hyperparameter::Dropout, self.dropout),
            (Hyperparameter::WeightDecay, self.weight_decay),
            (Hyperparameter::BatchSize, self.batch_size as f64),
            (Hyperparameter::MaxEpochs, self.max_epochs as f64),
        ];
        for (name, value) in checks {
            name.validate(value)?;
        }
        if !(0.0..1.0).contains(&self.val_fraction) {
            return Err(FinetuneError::invalid_config("val_fraction must lie in [0, 1)"));
        }
        if !self.min_delta.is_finite() || self.min_delta < 0.0 {
            return Err(FinetuneError::invalid_config("min_delta must be finite and non-negative"));
        }
        Ok(())
    }
}

/// File-backed configuration for a grid search run.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    pub estimator: EstimatorConfig,
    /// Candidate values per hyperparameter name.
    pub grid: BTreeMap<String, Vec<f64>>,
    #[serde(default = "SearchConfig::default_k_folds")]
    pub k_folds: usize,
    #[serde(default = "SearchConfig::default_fold_seed")]
    pub fold_seed: u64,
    #[serde(default = "SearchConfig::default_refit")]
    pub refit: bool,
    #[serde(default = "SearchConfig::default_n_jobs")]
    pub n_jobs: usize,
    #[serde(default)]
    pub init: InitConfig,
}

impl SearchConfig {
    fn default_k_folds() -> usize {
        3
    }

    fn default_fold_seed() -> u64 {
        crate::search::DEFAULT_FOLD_SEED
    }

    fn default_refit() -> bool {
        true
    }

    fn default_n_jobs() -> usize {
        1
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.estimator.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// The grid with names resolved, rejecting unknown keys.
    pub fn param_grid(&self) -> Result<ParamGrid> {
        ParamGrid::from_named(self.grid.iter().map(|(k, v)| (k.as_str(), v.clone())))
    }
}
