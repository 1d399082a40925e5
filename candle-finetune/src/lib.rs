//! Hyperparameter search with warm-start fine-tuning for Candle classifiers.
//!
//! A [`Classifier`] trains an [`Mlp`] (or any [`ClassifierModule`]) with AdamW,
//! an optional L1 penalty and early stopping. Its starting weights come from a
//! [`WeightInit`] policy, so every fit can resume from a pretrained
//! [`ParameterSnapshot`]. [`GridSearchCv`] runs k-fold cross-validation over a
//! [`ParamGrid`] and refits the best combination.

pub mod callbacks;
pub mod config;
pub mod data;
pub mod error;
pub mod estimator;
pub mod hyperparams;
pub mod init;
pub mod loss;
pub mod metrics;
pub mod module;
pub mod search;
pub mod snapshot;
pub mod trainer;

pub use callbacks::Callback;
pub use config::{Architecture, DeviceKind, EstimatorConfig, SearchConfig, TrainerConfig};
pub use data::{Batch, BatchLoader, Dataset};
pub use error::{FinetuneError, Result};
pub use estimator::Classifier;
pub use hyperparams::{Hyperparameter, HyperparameterSet};
pub use init::{InitConfig, RandomInit, SnapshotInit, WeightInit};
pub use loss::{LossFn, RegularizedLoss};
pub use module::{ClassifierModule, LightModule, Mlp, StepOutput};
pub use search::{CellResult, GridSearchCv, GridSearchResult, KFold, ParamGrid};
pub use snapshot::ParameterSnapshot;
pub use trainer::{FitOutcome, StopReason, Trainer};

pub use candle::{Module, ModuleT};
