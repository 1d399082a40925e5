use crate::error::{FinetuneError, Result};
use crate::search::DEFAULT_FOLD_SEED;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Row indices of one cross-validation split. Both lists are sorted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Partitions `0..n` into `k` disjoint test folds.
///
/// When `k` does not divide `n`, the first `n % k` folds get one extra row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KFold {
    k: usize,
    shuffle: bool,
    seed: u64,
}

impl KFold {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            shuffle: true,
            seed: DEFAULT_FOLD_SEED,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Assign contiguous index ranges to folds instead of shuffling first.
    pub fn without_shuffle(mut self) -> Self {
        self.shuffle = false;
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn split(&self, n: usize) -> Result<Vec<Fold>> {
        if self.k < 2 {
            return Err(FinetuneError::invalid_config(format!(
                "k_folds must be at least 2, got {}",
                self.k
            )));
        }
        if self.k > n {
            return Err(FinetuneError::input_shape(format!(
                "cannot split {n} rows into {} folds",
                self.k
            )));
        }

        let mut order: Vec<usize> = (0..n).collect();
        if self.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(self.seed));
        }

        let base = n / self.k;
        let extra = n % self.k;
        let mut start = 0;
        let mut folds = Vec::with_capacity(self.k);
        for i in 0..self.k {
            let size = base + usize::from(i < extra);
            let mut test = order[start..start + size].to_vec();
            test.sort_unstable();
            let mut train: Vec<usize> = order[..start]
                .iter()
                .chain(&order[start + size..])
                .copied()
                .collect();
            train.sort_unstable();
            folds.push(Fold { train, test });
            start += size;
        }
        Ok(folds)
    }
}
