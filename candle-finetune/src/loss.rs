//! Loss strategies: cross-entropy with an optional L1 penalty over the module parameters.

use candle::{DType, Result, Tensor, Var};
use std::fmt;

/// Computes the scalar training objective for one batch.
pub trait LossFn: fmt::Debug + Send + Sync {
    /// `logits` are `(rows, classes)`, `targets` are `u32` class ids of length `rows`.
    /// `training` is informational; implementations may ignore it.
    fn loss(
        &self,
        logits: &Tensor,
        targets: &Tensor,
        params: &[Var],
        l1: f64,
        training: bool,
    ) -> Result<Tensor>;
}

/// Cross-entropy plus `l1 * sum(|p|)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RegularizedLoss;

impl LossFn for RegularizedLoss {
    fn loss(
        &self,
        logits: &Tensor,
        targets: &Tensor,
        params: &[Var],
        l1: f64,
        _training: bool,
    ) -> Result<Tensor> {
        regularized_loss(logits, targets, params, l1)
    }
}

pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    candle_nn::loss::cross_entropy(logits, targets)
}

/// Sum of absolute values over every parameter, as a scalar tensor.
pub fn l1_penalty(params: &[Var], device: &candle::Device) -> Result<Tensor> {
    let mut total = Tensor::zeros((), DType::F32, device)?;
    for p in params {
        let abs_sum = p.as_tensor().abs()?.sum_all()?.to_dtype(DType::F32)?;
        total = total.add(&abs_sum)?;
    }
    Ok(total)
}

/// Base loss when `l1 == 0`, with no penalty term computed at all.
pub fn regularized_loss(
    logits: &Tensor,
    targets: &Tensor,
    params: &[Var],
    l1: f64,
) -> Result<Tensor> {
    let base = cross_entropy_loss(logits, targets)?;
    if l1 == 0.0 {
        return Ok(base);
    }
    let penalty = l1_penalty(params, logits.device())?.affine(l1, 0.)?;
    base.add(&penalty)
}
