//! In-memory datasets, seeded splits and mini-batching.

use crate::error::{FinetuneError, Result};
use candle::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Row-aligned feature matrix `(rows, features)` in `f32` and label vector `(rows,)` in `u32`.
#[derive(Clone, Debug)]
pub struct Dataset {
    features: Tensor,
    labels: Tensor,
}

impl Dataset {
    pub fn new(features: &Tensor, labels: &Tensor) -> Result<Self> {
        let (rows, _) = features.dims2().map_err(|_| {
            FinetuneError::input_shape(format!(
                "features must be a (rows, features) matrix, got shape {:?}",
                features.dims()
            ))
        })?;
        let n_labels = labels.dims1().map_err(|_| {
            FinetuneError::input_shape(format!("labels must be a vector, got shape {:?}", labels.dims()))
        })?;
        if rows != n_labels {
            return Err(FinetuneError::input_shape(format!(
                "{rows} feature rows but {n_labels} labels"
            )));
        }
        if rows == 0 {
            return Err(FinetuneError::input_shape("dataset is empty"));
        }
        Ok(Self {
            features: features.to_dtype(DType::F32)?,
            labels: labels.to_dtype(DType::U32)?,
        })
    }

    pub fn from_vecs(features: Vec<f32>, n_features: usize, labels: Vec<u32>, device: &Device) -> Result<Self> {
        if n_features == 0 || features.len() != labels.len() * n_features {
            return Err(FinetuneError::input_shape(format!(
                "{} feature values do not form {} rows of {n_features}",
                features.len(),
                labels.len()
            )));
        }
        let rows = labels.len();
        let features = Tensor::from_vec(features, (rows, n_features), device)?;
        let labels = Tensor::from_vec(labels, rows, device)?;
        Self::new(&features, &labels)
    }

    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_features(&self) -> usize {
        self.features.dims()[1]
    }

    pub fn features(&self) -> &Tensor {
        &self.features
    }

    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    pub fn device(&self) -> &Device {
        self.features.device()
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            features: self.features.to_device(device)?,
            labels: self.labels.to_device(device)?,
        })
    }

    /// Fail with `InputShape` unless every row has `n_features` columns.
    pub fn check_features(&self, n_features: usize) -> Result<()> {
        check_feature_count(&self.features, n_features)
    }

    /// Fail with `InputShape` if any label is not a valid class id.
    pub fn check_labels(&self, num_classes: usize) -> Result<()> {
        let labels = self.labels.to_vec1::<u32>()?;
        if let Some(bad) = labels.iter().find(|&&l| l as usize >= num_classes) {
            return Err(FinetuneError::input_shape(format!(
                "label {bad} is out of range for {num_classes} classes"
            )));
        }
        Ok(())
    }

    /// The rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        let ids: Vec<u32> = indices.iter().map(|&i| i as u32).collect();
        let ids = Tensor::from_vec(ids, indices.len(), self.device())?;
        Ok(Self {
            features: self.features.index_select(&ids, 0)?,
            labels: self.labels.index_select(&ids, 0)?,
        })
    }

    /// Seeded shuffle split into (train, validation). `val_fraction == 0` keeps every row for training.
    pub fn split(&self, val_fraction: f64, seed: u64) -> Result<(Dataset, Option<Dataset>)> {
        if val_fraction == 0.0 {
            return Ok((self.clone(), None));
        }
        let n = self.len();
        let n_val = (n as f64 * val_fraction).round() as usize;
        if n_val == 0 || n_val >= n {
            return Err(FinetuneError::input_shape(format!(
                "cannot hold out {val_fraction} of {n} rows for validation"
            )));
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        let (val, train) = order.split_at(n_val);
        Ok((self.select(train)?, Some(self.select(val)?)))
    }

    /// The whole dataset as one batch.
    pub fn as_batch(&self) -> Batch {
        Batch {
            xs: self.features.clone(),
            ys: self.labels.clone(),
        }
    }
}

pub(crate) fn check_feature_count(features: &Tensor, n_features: usize) -> Result<()> {
    match features.dims() {
        [_, cols] if *cols == n_features => Ok(()),
        dims => Err(FinetuneError::input_shape(format!(
            "expected (rows, {n_features}) features, got shape {dims:?}"
        ))),
    }
}

/// One mini-batch of features and class ids.
#[derive(Clone, Debug)]
pub struct Batch {
    pub xs: Tensor,
    pub ys: Tensor,
}

/// A source of batches, asked once per epoch.
pub trait Batches<B> {
    /// Batches for one pass of parameter updates.
    fn epoch_batches(&mut self, epoch: usize) -> candle::Result<Vec<B>>;

    /// Batches covering the same rows for evaluation-mode metrics.
    fn eval_batches(&mut self) -> candle::Result<Vec<B>>;
}

/// A fixed list of batches, replayed in order every epoch.
impl<B: Clone> Batches<B> for Vec<B> {
    fn epoch_batches(&mut self, _epoch: usize) -> candle::Result<Vec<B>> {
        Ok(self.clone())
    }

    fn eval_batches(&mut self) -> candle::Result<Vec<B>> {
        Ok(self.clone())
    }
}

/// Mini-batches over a dataset, reshuffled every epoch from a seeded generator.
pub struct BatchLoader {
    data: Dataset,
    batch_size: usize,
    rng: StdRng,
}

impl BatchLoader {
    pub fn new(data: Dataset, batch_size: usize, seed: u64) -> Self {
        Self {
            data,
            batch_size: batch_size.max(1),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Batches<Batch> for BatchLoader {
    fn epoch_batches(&mut self, _epoch: usize) -> candle::Result<Vec<Batch>> {
        let mut order: Vec<u32> = (0..self.data.len() as u32).collect();
        order.shuffle(&mut self.rng);
        order
            .chunks(self.batch_size)
            .map(|chunk| {
                let ids = Tensor::new(chunk, self.data.device())?;
                Ok(Batch {
                    xs: self.data.features.index_select(&ids, 0)?,
                    ys: self.data.labels.index_select(&ids, 0)?,
                })
            })
            .collect()
    }

    fn eval_batches(&mut self) -> candle::Result<Vec<Batch>> {
        Ok(vec![self.data.as_batch()])
    }
}
