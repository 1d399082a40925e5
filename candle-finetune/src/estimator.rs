//! The trainable classifier: builds its module, applies the initialization
//! policy, and runs the epoch loop on every `fit`.
//!
//! Each call to [`Classifier::fit`] goes through the same sequence:
//!
//! 1. validate the input and build a fresh module from the architecture,
//! 2. apply the [`WeightInit`] policy once,
//! 3. split off the internal validation slice,
//! 4. train with shuffled mini-batches until early stopping or the epoch budget,
//! 5. keep the module in whatever state the last epoch left it.
//!
//! There is no rollback to the best epoch; attach a checkpoint directory to
//! keep the best parameters on disk.

use crate::callbacks::{
    EarlyStopping, EpochObserver, Mode, ModelCheckpoint, ObserverCallback, ProgressLogger,
};
use crate::config::{EstimatorConfig, TrainerConfig};
use crate::data::{check_feature_count, Batch, BatchLoader, Dataset};
use crate::error::{FinetuneError, Result};
use crate::hyperparams::HyperparameterSet;
use crate::init::{RandomInit, WeightInit};
use crate::loss::{LossFn, RegularizedLoss};
use crate::metrics::{Accuracy, History, Metric};
use crate::module::{ClassifierModule, LightModule, Mlp, StepOutput};
use crate::snapshot::ParameterSnapshot;
use crate::trainer::{FitOutcome, Trainer};
use candle::{Tensor, Var, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use std::path::Path;
use std::sync::Arc;

/// Binds a module to a loss strategy for the trainer.
struct ClassifierTask<'a, M> {
    module: &'a M,
    loss: &'a dyn LossFn,
    params: Vec<Var>,
    l1: f64,
}

impl<M: ClassifierModule> LightModule for ClassifierTask<'_, M> {
    type Batch = Batch;

    fn training_step(&mut self, batch: &Batch, _batch_idx: usize) -> candle::Result<StepOutput> {
        let logits = self.module.forward_t(&batch.xs, true)?;
        let loss = self.loss.loss(&logits, &batch.ys, &self.params, self.l1, true)?;
        Ok(StepOutput::new(loss))
    }

    fn validation_step(&self, batch: &Batch, _batch_idx: usize) -> candle::Result<StepOutput> {
        let logits = self.module.forward_t(&batch.xs, false)?;
        let loss = self.loss.loss(&logits, &batch.ys, &self.params, self.l1, false)?;
        let mut accuracy = Accuracy::new();
        accuracy.update(&logits, &batch.ys)?;
        Ok(StepOutput::new(loss).with_metric("accuracy", accuracy.compute()))
    }

    fn parameters(&self) -> Vec<Var> {
        self.params.clone()
    }
}

struct Fitted<M> {
    module: M,
    history: History,
    outcome: FitOutcome,
}

/// A classifier estimator with pluggable initialization and loss strategies.
pub struct Classifier<M: ClassifierModule = Mlp> {
    config: EstimatorConfig,
    init: Arc<dyn WeightInit>,
    loss: Arc<dyn LossFn>,
    observers: Vec<Arc<dyn EpochObserver>>,
    label: String,
    fitted: Option<Fitted<M>>,
}

impl<M: ClassifierModule> Classifier<M> {
    /// An unfitted classifier with random initialization and [`RegularizedLoss`].
    pub fn new(config: EstimatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            init: Arc::new(RandomInit),
            loss: Arc::new(RegularizedLoss),
            observers: Vec::new(),
            label: String::new(),
            fitted: None,
        })
    }

    pub fn with_init(self, init: impl WeightInit + 'static) -> Self {
        self.with_shared_init(Arc::new(init))
    }

    pub fn with_shared_init(mut self, init: Arc<dyn WeightInit>) -> Self {
        self.init = init;
        self
    }

    pub fn with_loss(mut self, loss: impl LossFn + 'static) -> Self {
        self.loss = Arc::new(loss);
        self
    }

    /// Notify `observer` after every epoch of every fit.
    pub fn with_observer(mut self, observer: impl EpochObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Tag for log events emitted during `fit`.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// A fresh, unfitted estimator with `params` applied on top of this one's configuration.
    ///
    /// Policy objects are shared; module, history and monitor state are not.
    pub fn clone_with(&self, params: &HyperparameterSet) -> Result<Self> {
        Ok(Self {
            config: self.config.apply(params)?,
            init: Arc::clone(&self.init),
            loss: Arc::clone(&self.loss),
            observers: self.observers.clone(),
            label: params.to_string(),
            fitted: None,
        })
    }

    /// Cross-validation cells share one configuration; only the refit may write checkpoints.
    pub(crate) fn without_checkpoints(mut self) -> Self {
        self.config.checkpoint_dir = None;
        self
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// Fit on features `x` `(rows, input_dim)` and class ids `y` `(rows,)`.
    pub fn fit(&mut self, x: &Tensor, y: &Tensor) -> Result<&History> {
        let data = Dataset::new(x, y)?;
        self.fit_dataset(&data)
    }

    /// Malformed input is rejected before any previous fit is discarded; once
    /// training starts, a failure leaves the estimator unfitted.
    pub fn fit_dataset(&mut self, data: &Dataset) -> Result<&History> {
        let config = &self.config;
        let arch = &config.architecture;
        data.check_features(arch.input_dim)?;
        data.check_labels(arch.num_classes)?;
        self.fitted = None;

        let device = config.device.device()?;
        let data = data.to_device(&device)?;
        let module = M::build(arch, config.dropout as f32, &device)?;
        self.init.initialize(module.varmap())?;

        let (train, val) = data.split(config.val_fraction, config.seed)?;

        let monitor = if val.is_some() { "val_accuracy" } else { "train_accuracy" };
        let mut trainer = Trainer::new(
            TrainerConfig::new()
                .max_epochs(config.max_epochs)
                .log_every_n_steps(0),
        );
        if let Some(patience) = config.patience {
            let early_stopping = EarlyStopping::new()
                .monitor(monitor)
                .mode(Mode::Max)
                .patience(patience)
                .min_delta(config.min_delta);
            trainer.add_callback(Box::new(early_stopping));
        }
        if let Some(dir) = &config.checkpoint_dir {
            let checkpoint = ModelCheckpoint::new(module.varmap().clone(), dir.clone())
                .monitor(monitor)
                .mode(Mode::Max);
            trainer.add_callback(Box::new(checkpoint));
        }
        if config.log_every_n_epochs > 0 {
            let logger = ProgressLogger::new(config.log_every_n_epochs).label(self.label.as_str());
            trainer.add_callback(Box::new(logger));
        }
        for observer in &self.observers {
            trainer.add_callback(Box::new(ObserverCallback(Arc::clone(observer))));
        }

        let mut task = ClassifierTask {
            module: &module,
            loss: self.loss.as_ref(),
            params: module.parameters()?,
            l1: config.l1,
        };
        let mut optimizer = AdamW::new(
            task.parameters(),
            ParamsAdamW {
                lr: config.lr,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        let val = val.map(|v| {
            let rows = v.len();
            BatchLoader::new(v, rows, config.seed)
        });
        let train = BatchLoader::new(train, config.batch_size, config.seed);
        let outcome = trainer.fit(&mut task, &mut optimizer, train, val)?;

        let history = trainer.history().clone();
        tracing::debug!(
            label = %self.label,
            epochs = outcome.epochs_run,
            stop = ?outcome.stop_reason,
            last = history.last().and_then(|m| m.get(monitor)),
            "fit finished"
        );
        let fitted = self.fitted.insert(Fitted {
            module,
            history,
            outcome,
        });
        Ok(&fitted.history)
    }

    fn fitted(&self) -> Result<&Fitted<M>> {
        self.fitted.as_ref().ok_or(FinetuneError::NotFitted)
    }

    pub fn module(&self) -> Result<&M> {
        Ok(&self.fitted()?.module)
    }

    pub fn history(&self) -> Result<&History> {
        Ok(&self.fitted()?.history)
    }

    pub fn fit_outcome(&self) -> Result<FitOutcome> {
        Ok(self.fitted()?.outcome)
    }

    fn logits(&self, x: &Tensor) -> Result<Tensor> {
        let module = &self.fitted()?.module;
        check_feature_count(x, self.config.architecture.input_dim)?;
        let x = x.to_dtype(candle::DType::F32)?.to_device(module.device())?;
        Ok(module.forward_t(&x, false)?)
    }

    /// Class probabilities `(rows, num_classes)`.
    pub fn predict_proba(&self, x: &Tensor) -> Result<Tensor> {
        let logits = self.logits(x)?;
        Ok(candle_nn::ops::softmax(&logits, D::Minus1)?)
    }

    /// Predicted class ids `(rows,)` as `u32`.
    pub fn predict(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.logits(x)?.argmax(D::Minus1)?)
    }

    /// Accuracy on `(x, y)`.
    pub fn score(&self, x: &Tensor, y: &Tensor) -> Result<f64> {
        self.score_dataset(&Dataset::new(x, y)?)
    }

    pub fn score_dataset(&self, data: &Dataset) -> Result<f64> {
        let logits = self.logits(data.features())?;
        let labels = data.labels().to_device(logits.device())?;
        let mut accuracy = Accuracy::new();
        accuracy.update(&logits, &labels)?;
        Ok(accuracy.compute())
    }

    pub fn snapshot(&self) -> Result<ParameterSnapshot> {
        ParameterSnapshot::from_varmap(self.module()?.varmap())
    }

    pub fn save_parameters(&self, path: impl AsRef<Path>) -> Result<()> {
        self.snapshot()?.save(path)
    }
}
