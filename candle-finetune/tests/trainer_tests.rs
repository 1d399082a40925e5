use anyhow::Result;
use candle::{Device, Tensor, Var};
use candle_finetune::callbacks::{EarlyStopping, EpochMetrics, Mode};
use candle_finetune::{Callback, FinetuneError, LightModule, StepOutput, StopReason, Trainer, TrainerConfig};
use candle_nn::{Linear, Module, Optimizer, SGD};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone)]
struct Batch {
    xs: Tensor,
    ys: Tensor,
}

struct LinearModel {
    linear: Linear,
    w: Var,
    b: Var,
}

impl LinearModel {
    fn new(device: &Device) -> Result<Self> {
        let w = Var::new(&[[0f32, 0.]], device)?;
        let b = Var::new(0f32, device)?;
        let linear = Linear::new(w.as_tensor().clone(), Some(b.as_tensor().clone()));
        Ok(Self { linear, w, b })
    }

    fn mse(&self, batch: &Batch) -> candle::Result<Tensor> {
        let ys = self.linear.forward(&batch.xs)?;
        ys.sub(&batch.ys)?.sqr()?.sum_all()
    }
}

impl LightModule for LinearModel {
    type Batch = Batch;

    fn training_step(&mut self, batch: &Batch, _batch_idx: usize) -> candle::Result<StepOutput> {
        Ok(StepOutput::new(self.mse(batch)?))
    }

    fn validation_step(&self, batch: &Batch, _batch_idx: usize) -> candle::Result<StepOutput> {
        let loss = self.mse(batch)?;
        let abs_err = loss.to_scalar::<f32>()?.sqrt() as f64;
        Ok(StepOutput::new(loss).with_metric("abs_err", abs_err))
    }

    fn parameters(&self) -> Vec<Var> {
        vec![self.w.clone(), self.b.clone()]
    }
}

fn regression_data(device: &Device) -> Result<Batch> {
    let w_gen = Tensor::new(&[[3f32, 1.]], device)?;
    let b_gen = Tensor::new(-2f32, device)?;
    let gen = Linear::new(w_gen, Some(b_gen));
    let xs = Tensor::new(&[[2f32, 1.], [7., 4.], [-4., 12.], [5., 8.]], device)?;
    let ys = gen.forward(&xs)?;
    Ok(Batch { xs, ys })
}

#[test]
fn trainer_basic_training() -> Result<()> {
    let device = Device::Cpu;
    let batches = vec![regression_data(&device)?];

    let mut model = LinearModel::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.004)?;

    let config = TrainerConfig::new().max_epochs(1000).log_every_n_steps(0);
    let mut trainer = Trainer::new(config);
    let outcome = trainer.fit(&mut model, &mut optimizer, batches, None)?;

    assert_eq!(outcome.epochs_run, 1000);
    assert_eq!(outcome.stop_reason, StopReason::BudgetExhausted);
    assert_eq!(trainer.history().len(), 1000);

    let w_vals = model.w.to_vec2::<f32>()?;
    let b_val = model.b.to_scalar::<f32>()?;

    assert!((w_vals[0][0] - 3.0).abs() < 0.01);
    assert!((w_vals[0][1] - 1.0).abs() < 0.01);
    assert!((b_val - (-2.0)).abs() < 0.03);

    Ok(())
}

#[test]
fn trainer_with_validation_records_history() -> Result<()> {
    let device = Device::Cpu;
    let data = regression_data(&device)?;

    let mut model = LinearModel::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.004)?;

    let config = TrainerConfig::new().max_epochs(100).log_every_n_steps(0);
    let mut trainer = Trainer::new(config);
    trainer.fit(&mut model, &mut optimizer, vec![data.clone()], Some(vec![data]))?;

    let history = trainer.history();
    assert_eq!(history.len(), 100);
    let first = &history.epochs()[0];
    let last = history.last().unwrap();
    assert!(first.val_loss.is_some());
    assert!(last.val_loss.unwrap() < first.val_loss.unwrap());
    assert!(last.get("val_abs_err").is_some());
    assert!(last.get("train_abs_err").is_some());

    let val_loss = trainer.validate(
        &model,
        &[Batch {
            xs: Tensor::new(&[[2f32, 1.], [7., 4.]], &device)?,
            ys: Tensor::new(&[[5f32], [25.]], &device)?,
        }],
    )?;
    assert!(val_loss.is_finite());
    Ok(())
}

struct CountingCallback {
    epoch_starts: Arc<AtomicUsize>,
    epoch_ends: Arc<AtomicUsize>,
    batch_ends: Arc<AtomicUsize>,
}

impl CountingCallback {
    fn epochs(counter: Arc<AtomicUsize>) -> Self {
        Self {
            epoch_starts: counter,
            epoch_ends: Arc::new(AtomicUsize::new(0)),
            batch_ends: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Callback for CountingCallback {
    fn on_epoch_start(&mut self, _trainer: &Trainer, _epoch: usize) -> candle_finetune::Result<()> {
        self.epoch_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> candle_finetune::Result<()> {
        self.epoch_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_train_batch_end(
        &mut self,
        _trainer: &Trainer,
        _batch_idx: usize,
        _output: &StepOutput,
    ) -> candle_finetune::Result<()> {
        self.batch_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn trainer_callback_invocation() -> Result<()> {
    let device = Device::Cpu;

    let batches = vec![
        Batch {
            xs: Tensor::new(&[[1f32, 0.]], &device)?,
            ys: Tensor::new(&[[1f32]], &device)?,
        },
        Batch {
            xs: Tensor::new(&[[0f32, 1.]], &device)?,
            ys: Tensor::new(&[[1f32]], &device)?,
        },
    ];

    let epoch_starts = Arc::new(AtomicUsize::new(0));
    let epoch_ends = Arc::new(AtomicUsize::new(0));
    let batch_ends = Arc::new(AtomicUsize::new(0));

    let callback = CountingCallback {
        epoch_starts: epoch_starts.clone(),
        epoch_ends: epoch_ends.clone(),
        batch_ends: batch_ends.clone(),
    };

    let mut model = LinearModel::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.01)?;

    let config = TrainerConfig::new().max_epochs(5).log_every_n_steps(0);
    let mut trainer = Trainer::new(config).with_callback(callback);
    trainer.fit(&mut model, &mut optimizer, batches, None)?;

    assert_eq!(epoch_starts.load(Ordering::SeqCst), 5);
    assert_eq!(epoch_ends.load(Ordering::SeqCst), 5);
    assert_eq!(batch_ends.load(Ordering::SeqCst), 10); // 2 batches * 5 epochs

    Ok(())
}

struct StopAfter {
    epochs: usize,
    seen: usize,
}

impl Callback for StopAfter {
    fn on_epoch_end(
        &mut self,
        _trainer: &Trainer,
        _epoch: usize,
        _metrics: &EpochMetrics,
    ) -> candle_finetune::Result<()> {
        self.seen += 1;
        Ok(())
    }

    fn should_stop(&self) -> bool {
        self.seen >= self.epochs
    }
}

#[test]
fn trainer_stops_when_a_callback_asks() -> Result<()> {
    let device = Device::Cpu;

    let batches = vec![Batch {
        xs: Tensor::new(&[[1f32, 0.]], &device)?,
        ys: Tensor::new(&[[1f32]], &device)?,
    }];

    let epoch_count = Arc::new(AtomicUsize::new(0));
    let mut model = LinearModel::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.01)?;

    let config = TrainerConfig::new().max_epochs(100).log_every_n_steps(0);
    let mut trainer = Trainer::new(config)
        .with_callback(CountingCallback::epochs(epoch_count.clone()))
        .with_callback(StopAfter { epochs: 3, seen: 0 });
    let outcome = trainer.fit(&mut model, &mut optimizer, batches, None)?;

    assert_eq!(epoch_count.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.epochs_run, 3);
    assert_eq!(outcome.stop_reason, StopReason::EarlyStopped);

    Ok(())
}

#[test]
fn builtin_early_stopping() -> Result<()> {
    let device = Device::Cpu;

    // Train on y = 3x + z - 2
    let batches = vec![regression_data(&device)?];

    // Validate on y = -x + 2z + 5, which gets worse as the train fit improves
    let w_val = Tensor::new(&[[-1f32, 2.]], &device)?;
    let b_val = Tensor::new(5f32, &device)?;
    let val_gen = Linear::new(w_val, Some(b_val));
    let val_xs = Tensor::new(&[[1f32, 1.], [2., 3.], [0., 2.]], &device)?;
    let val_ys = val_gen.forward(&val_xs)?;
    let val_batches = vec![Batch {
        xs: val_xs,
        ys: val_ys,
    }];

    let epoch_count = Arc::new(AtomicUsize::new(0));
    let early_stopping = EarlyStopping::new()
        .monitor("val_loss")
        .patience(5)
        .mode(Mode::Min);

    let mut model = LinearModel::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.01)?;

    let config = TrainerConfig::new().max_epochs(500).log_every_n_steps(0);
    let mut trainer = Trainer::new(config)
        .with_callback(CountingCallback::epochs(epoch_count.clone()))
        .with_callback(early_stopping);
    let outcome = trainer.fit(&mut model, &mut optimizer, batches, Some(val_batches))?;

    let epochs_run = epoch_count.load(Ordering::SeqCst);
    assert!(epochs_run < 500, "early stopping should trigger before 500 epochs, ran {epochs_run}");
    assert!(epochs_run > 5, "should run more than patience epochs before stopping");
    assert_eq!(outcome.stop_reason, StopReason::EarlyStopped);

    Ok(())
}

#[test]
fn non_finite_loss_aborts_before_the_step() -> Result<()> {
    let device = Device::Cpu;
    let batches = vec![Batch {
        xs: Tensor::new(&[[1f32, 2.]], &device)?,
        ys: Tensor::new(&[[f32::NAN]], &device)?,
    }];

    let mut model = LinearModel::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 0.01)?;
    let mut trainer = Trainer::new(TrainerConfig::new().max_epochs(10).log_every_n_steps(0));

    let err = trainer
        .fit(&mut model, &mut optimizer, batches, None)
        .unwrap_err();
    assert!(matches!(
        err,
        FinetuneError::NumericalDivergence { epoch: 0, batch: 0, .. }
    ));
    assert!(err.is_cell_local());
    assert_eq!(model.w.to_vec2::<f32>()?, vec![vec![0f32, 0.]]);
    assert!(trainer.history().is_empty());
    Ok(())
}

#[test]
fn divergence_from_the_last_update_is_caught_at_evaluation() -> Result<()> {
    let device = Device::Cpu;
    let data = regression_data(&device)?;

    let mut model = LinearModel::new(&device)?;
    let mut optimizer = SGD::new(model.parameters(), 1e30)?;
    let mut trainer = Trainer::new(TrainerConfig::new().max_epochs(1).log_every_n_steps(0));

    let err = trainer
        .fit(&mut model, &mut optimizer, vec![data.clone()], Some(vec![data]))
        .unwrap_err();
    assert!(matches!(
        err,
        FinetuneError::NumericalDivergence { epoch: 0, batch: 0, value } if !value.is_finite()
    ));
    // The step itself started from a finite loss and was applied.
    assert_ne!(model.w.to_vec2::<f32>()?, vec![vec![0f32, 0.]]);
    assert!(trainer.history().is_empty());
    Ok(())
}
