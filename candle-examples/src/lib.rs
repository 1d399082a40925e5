//! Shared helpers for the candle-finetune example drivers.

use candle::{Device, Result, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Synthetic classification data: one blob per class, rows interleaved by class.
///
/// Class `c` is centred at `3.0` on every feature `f` with `f % n_classes == c`
/// and at `0.0` elsewhere, with uniform noise of half-width `spread`.
pub fn toy_blobs(
    rows_per_class: usize,
    n_features: usize,
    n_classes: usize,
    spread: f32,
    seed: u64,
) -> Result<(Tensor, Tensor)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let rows = rows_per_class * n_classes;
    let mut xs = Vec::with_capacity(rows * n_features);
    let mut ys = Vec::with_capacity(rows);
    for _ in 0..rows_per_class {
        for class in 0..n_classes {
            for f in 0..n_features {
                let centre = if f % n_classes == class { 3.0 } else { 0.0 };
                xs.push(centre + rng.random_range(-spread..spread));
            }
            ys.push(class as u32);
        }
    }
    Ok((
        Tensor::from_vec(xs, (rows, n_features), &Device::Cpu)?,
        Tensor::from_vec(ys, rows, &Device::Cpu)?,
    ))
}
