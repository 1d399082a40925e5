//! Recognised hyperparameters and immutable hyperparameter sets.

use crate::error::{FinetuneError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Names the estimator knows how to apply.
///
/// The declaration order is the key order used when enumerating a grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Hyperparameter {
    LearningRate,
    L1,
    Dropout,
    WeightDecay,
    BatchSize,
    MaxEpochs,
    Patience,
}

impl Hyperparameter {
    pub const ALL: [Hyperparameter; 7] = [
        Self::LearningRate,
        Self::L1,
        Self::Dropout,
        Self::WeightDecay,
        Self::BatchSize,
        Self::MaxEpochs,
        Self::Patience,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LearningRate => "lr",
            Self::L1 => "l1",
            Self::Dropout => "dropout",
            Self::WeightDecay => "weight_decay",
            Self::BatchSize => "batch_size",
            Self::MaxEpochs => "max_epochs",
            Self::Patience => "patience",
        }
    }

    /// Whether the value must be a non-negative whole number.
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::BatchSize | Self::MaxEpochs | Self::Patience)
    }

    /// Check that `value` is admissible for this hyperparameter.
    pub fn validate(&self, value: f64) -> Result<()> {
        let reject = |reason: &str| {
            Err(FinetuneError::invalid_hyperparameter(
                self.as_str(),
                value,
                reason,
            ))
        };
        if !value.is_finite() {
            return reject("must be finite");
        }
        if self.is_integer() && (value < 0.0 || value.fract() != 0.0) {
            return reject("must be a non-negative integer");
        }
        match self {
            Self::LearningRate if value <= 0.0 => reject("must be positive"),
            Self::L1 | Self::WeightDecay if value < 0.0 => reject("must be non-negative"),
            Self::Dropout if !(0.0..1.0).contains(&value) => reject("must lie in [0, 1)"),
            Self::BatchSize | Self::MaxEpochs if value < 1.0 => reject("must be at least 1"),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Hyperparameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Hyperparameter {
    type Err = FinetuneError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|h| h.as_str() == s)
            .ok_or_else(|| FinetuneError::UnknownHyperparameter(s.to_string()))
    }
}

/// One grid cell: an immutable mapping from hyperparameter to value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HyperparameterSet {
    values: BTreeMap<Hyperparameter, f64>,
}

impl HyperparameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder used while materialising a set; the set is never mutated afterwards.
    pub fn with(mut self, name: Hyperparameter, value: f64) -> Self {
        self.values.insert(name, value);
        self
    }

    /// Build from string keys, rejecting unknown names and invalid values.
    pub fn from_named<K: AsRef<str>>(pairs: impl IntoIterator<Item = (K, f64)>) -> Result<Self> {
        let mut set = Self::new();
        for (key, value) in pairs {
            let name: Hyperparameter = key.as_ref().parse()?;
            name.validate(value)?;
            set = set.with(name, value);
        }
        Ok(set)
    }

    pub fn get(&self, name: Hyperparameter) -> Option<f64> {
        self.values.get(&name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Hyperparameter, f64)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for HyperparameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}
