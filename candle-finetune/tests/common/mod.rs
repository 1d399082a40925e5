#![allow(dead_code)]

use anyhow::Result;
use candle::{Device, Tensor};
use candle_finetune::{Architecture, EstimatorConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Two well separated gaussian-ish blobs centred on (-2, -2) and (2, 2), rows alternating by class.
pub fn blobs(rows_per_class: usize, seed: u64, device: &Device) -> Result<(Tensor, Tensor)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut xs = Vec::with_capacity(rows_per_class * 4);
    let mut ys = Vec::with_capacity(rows_per_class * 2);
    for _ in 0..rows_per_class {
        for (label, centre) in [(0u32, -2f32), (1, 2.)] {
            xs.push(centre + rng.random_range(-0.7f32..0.7));
            xs.push(centre + rng.random_range(-0.7f32..0.7));
            ys.push(label);
        }
    }
    let rows = ys.len();
    Ok((
        Tensor::from_vec(xs, (rows, 2), device)?,
        Tensor::from_vec(ys, rows, device)?,
    ))
}

pub fn small_config() -> EstimatorConfig {
    EstimatorConfig::new(Architecture::new(2, [8], 2))
        .lr(0.05)
        .batch_size(16)
        .max_epochs(20)
        .patience(Some(10))
}
