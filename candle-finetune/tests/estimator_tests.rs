mod common;

use anyhow::Result;
use approx::assert_relative_eq;
use candle::{DType, Device, Tensor};
use candle_finetune::callbacks::EpochMetrics;
use candle_finetune::{
    Architecture, Classifier, ClassifierModule, FinetuneError, Mlp, ParameterSnapshot,
    SnapshotInit, StopReason, WeightInit,
};
use common::{blobs, small_config};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn fitted_base(device: &Device) -> Result<Classifier> {
    let (x, y) = blobs(40, 0, device)?;
    let mut base: Classifier = Classifier::new(small_config())?;
    base.fit(&x, &y)?;
    Ok(base)
}

#[test]
fn predict_before_fit_is_an_error() -> Result<()> {
    let device = Device::Cpu;
    let (x, y) = blobs(5, 1, &device)?;
    let estimator: Classifier = Classifier::new(small_config())?;

    assert!(!estimator.is_fitted());
    assert!(matches!(estimator.predict(&x), Err(FinetuneError::NotFitted)));
    assert!(matches!(estimator.predict_proba(&x), Err(FinetuneError::NotFitted)));
    assert!(matches!(estimator.score(&x, &y), Err(FinetuneError::NotFitted)));
    assert!(matches!(estimator.history(), Err(FinetuneError::NotFitted)));
    Ok(())
}

#[test]
fn malformed_input_is_rejected() -> Result<()> {
    let device = Device::Cpu;
    let mut estimator: Classifier = Classifier::new(small_config())?;

    let x = Tensor::zeros((10, 3), DType::F32, &device)?;
    let y = Tensor::zeros(10, DType::U32, &device)?;
    assert!(matches!(estimator.fit(&x, &y), Err(FinetuneError::InputShape(_))));

    let x = Tensor::zeros((10, 2), DType::F32, &device)?;
    let y = Tensor::zeros(9, DType::U32, &device)?;
    assert!(matches!(estimator.fit(&x, &y), Err(FinetuneError::InputShape(_))));

    let y = Tensor::new(&[0u32, 1, 2, 0, 1, 0, 1, 0, 1, 0], &device)?;
    assert!(matches!(estimator.fit(&x, &y), Err(FinetuneError::InputShape(_))));
    assert!(!estimator.is_fitted());

    let base = fitted_base(&device)?;
    let wide = Tensor::zeros((4, 5), DType::F32, &device)?;
    assert!(matches!(base.predict(&wide), Err(FinetuneError::InputShape(_))));
    Ok(())
}

#[test]
fn learns_separable_blobs() -> Result<()> {
    let device = Device::Cpu;
    let base = fitted_base(&device)?;
    let (x_test, y_test) = blobs(25, 99, &device)?;

    assert!(base.score(&x_test, &y_test)? >= 0.9);

    let proba = base.predict_proba(&x_test)?;
    assert_eq!(proba.dims(), &[50, 2]);
    for row in proba.to_vec2::<f32>()? {
        assert_relative_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
    }
    let labels = base.predict(&x_test)?;
    assert_eq!(labels.dims(), &[50]);
    assert_eq!(labels.dtype(), DType::U32);

    let history = base.history()?;
    let outcome = base.fit_outcome()?;
    assert_eq!(history.len(), outcome.epochs_run);
    assert!(history.last().and_then(|m| m.get("val_accuracy")).is_some());
    Ok(())
}

#[test]
fn warm_start_fits_are_reproducible() -> Result<()> {
    let device = Device::Cpu;
    let base = fitted_base(&device)?;
    let init = SnapshotInit::new(base.snapshot()?);
    let (x, y) = blobs(30, 7, &device)?;

    let config = small_config().lr(0.01).max_epochs(8).patience(None);
    let mut a: Classifier = Classifier::new(config.clone())?.with_init(init.clone());
    let mut b: Classifier = Classifier::new(config)?.with_init(init);
    let history_a = a.fit(&x, &y)?.clone();
    let history_b = b.fit(&x, &y)?.clone();

    assert_eq!(history_a.len(), 8);
    assert_eq!(history_a.len(), history_b.len());
    for (ea, eb) in history_a.epochs().iter().zip(history_b.epochs()) {
        assert_relative_eq!(ea.train_loss, eb.train_loss, epsilon = 1e-5);
        assert_relative_eq!(ea.val_loss.unwrap(), eb.val_loss.unwrap(), epsilon = 1e-5);
        assert_eq!(ea.get("val_accuracy"), eb.get("val_accuracy"));
    }
    Ok(())
}

#[test]
fn saved_parameters_round_trip() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("base.safetensors");
    let base = fitted_base(&device)?;
    base.save_parameters(&path)?;

    let loaded = ParameterSnapshot::load(&path, &device)?;
    let fresh = Mlp::build(&small_config().architecture, 0.0, &device)?;
    loaded.apply_to(fresh.varmap())?;

    let original = base.snapshot()?;
    let reread = ParameterSnapshot::from_varmap(fresh.varmap())?;
    assert_eq!(original.shapes(), reread.shapes());
    for name in original.names() {
        let a = original.get(name).unwrap().flatten_all()?.to_vec1::<f32>()?;
        let b = reread.get(name).unwrap().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b, "{name} changed across save/load");
    }
    Ok(())
}

#[test]
fn incompatible_snapshot_fails_the_fit() -> Result<()> {
    let device = Device::Cpu;
    let base = fitted_base(&device)?;
    let (x, y) = blobs(10, 3, &device)?;

    let mut config = small_config();
    config.architecture = Architecture::new(2, [4], 2);
    let mut estimator: Classifier =
        Classifier::new(config)?.with_init(SnapshotInit::new(base.snapshot()?));
    let err = estimator.fit(&x, &y).unwrap_err();
    assert!(
        matches!(&err, FinetuneError::ShapeMismatch { name, .. } if name.starts_with("fc0")),
        "unexpected error: {err}"
    );
    assert!(!estimator.is_fitted());
    Ok(())
}

#[test]
fn zero_patience_stops_after_first_non_improvement() -> Result<()> {
    let device = Device::Cpu;
    let base = fitted_base(&device)?;
    let (x, y) = blobs(30, 11, &device)?;

    // A perfect start cannot strictly improve on 1.0 validation accuracy.
    let config = small_config().lr(1e-4).patience(Some(0));
    let mut estimator: Classifier =
        Classifier::new(config)?.with_init(SnapshotInit::new(base.snapshot()?));
    estimator.fit(&x, &y)?;

    let outcome = estimator.fit_outcome()?;
    assert_eq!(estimator.history()?.epochs()[0].get("val_accuracy"), Some(1.0));
    assert_eq!(outcome.epochs_run, 2);
    assert_eq!(outcome.stop_reason, StopReason::EarlyStopped);
    Ok(())
}

#[test]
fn without_validation_split_monitors_training_accuracy() -> Result<()> {
    let device = Device::Cpu;
    let (x, y) = blobs(20, 5, &device)?;
    let mut estimator: Classifier =
        Classifier::new(small_config().val_fraction(0.0).max_epochs(5))?;
    let history = estimator.fit(&x, &y)?;

    assert!(history.epochs().iter().all(|m| m.val_loss.is_none()));
    assert!(history.last().and_then(|m| m.get("train_accuracy")).is_some());
    Ok(())
}

#[derive(Debug)]
struct CountingInit(Arc<AtomicUsize>);

impl WeightInit for CountingInit {
    fn initialize(&self, _params: &candle_nn::VarMap) -> candle_finetune::Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn init_policy_and_observers_run_per_fit() -> Result<()> {
    let device = Device::Cpu;
    let (x, y) = blobs(20, 2, &device)?;
    let inits = Arc::new(AtomicUsize::new(0));
    let epochs = Arc::new(AtomicUsize::new(0));
    let seen = epochs.clone();

    let mut estimator: Classifier = Classifier::new(small_config().max_epochs(4).patience(None))?
        .with_init(CountingInit(inits.clone()))
        .with_observer(move |_: &EpochMetrics| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    estimator.fit(&x, &y)?;
    estimator.fit(&x, &y)?;

    assert_eq!(inits.load(Ordering::SeqCst), 2);
    assert_eq!(epochs.load(Ordering::SeqCst), 8);
    assert_eq!(estimator.fit_outcome()?.stop_reason, StopReason::BudgetExhausted);
    Ok(())
}

#[test]
fn checkpoint_dir_receives_best_epoch_snapshot() -> Result<()> {
    let device = Device::Cpu;
    let dir = tempfile::tempdir()?;
    let (x, y) = blobs(20, 4, &device)?;

    let config = small_config().max_epochs(5).checkpoint_dir(dir.path());
    let mut estimator: Classifier = Classifier::new(config)?;
    estimator.fit(&x, &y)?;

    let files: Vec<_> = std::fs::read_dir(dir.path())?.collect::<std::io::Result<_>>()?;
    assert_eq!(files.len(), 1);
    let snapshot = ParameterSnapshot::load(files[0].path(), &device)?;
    assert_eq!(snapshot.shapes(), estimator.snapshot()?.shapes());
    Ok(())
}

#[test]
fn rejected_refit_keeps_the_previous_model() -> Result<()> {
    let device = Device::Cpu;
    let mut estimator = fitted_base(&device)?;
    let before = estimator.snapshot()?;

    let wide = Tensor::zeros((6, 3), DType::F32, &device)?;
    let y = Tensor::zeros(6, DType::U32, &device)?;
    assert!(matches!(estimator.fit(&wide, &y), Err(FinetuneError::InputShape(_))));

    assert!(estimator.is_fitted());
    let after = estimator.snapshot()?;
    for name in before.names() {
        let a = before.get(name).unwrap().flatten_all()?.to_vec1::<f32>()?;
        let b = after.get(name).unwrap().flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b, "{name} changed");
    }
    Ok(())
}
