use crate::error::{FinetuneError, Result};
use crate::hyperparams::{Hyperparameter, HyperparameterSet};
use std::collections::BTreeMap;

/// Candidate values per hyperparameter.
///
/// Combinations are enumerated in lexicographic order over the
/// [`Hyperparameter`] declaration order, the last key varying fastest, and
/// each value list in the order it was given.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamGrid {
    values: BTreeMap<Hyperparameter, Vec<f64>>,
}

impl ParamGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the candidates for `name`, replacing any earlier list.
    pub fn add(mut self, name: Hyperparameter, values: impl Into<Vec<f64>>) -> Self {
        self.values.insert(name, values.into());
        self
    }

    /// Build from string keys, rejecting unknown names.
    pub fn from_named<K: AsRef<str>>(entries: impl IntoIterator<Item = (K, Vec<f64>)>) -> Result<Self> {
        let mut grid = Self::new();
        for (key, values) in entries {
            grid = grid.add(key.as_ref().parse()?, values);
        }
        Ok(grid)
    }

    /// Every value list is non-empty and every value is admissible.
    pub fn validate(&self) -> Result<()> {
        for (name, values) in &self.values {
            if values.is_empty() {
                return Err(FinetuneError::invalid_config(format!(
                    "grid entry `{name}` has no candidate values"
                )));
            }
            for &value in values {
                name.validate(value)?;
            }
        }
        Ok(())
    }

    pub fn names(&self) -> impl Iterator<Item = Hyperparameter> + '_ {
        self.values.keys().copied()
    }

    pub fn values(&self, name: Hyperparameter) -> Option<&[f64]> {
        self.values.get(&name).map(Vec::as_slice)
    }

    /// Number of combinations. An empty grid has exactly one, the empty set.
    pub fn len(&self) -> usize {
        self.values.values().map(Vec::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn combinations(&self) -> Vec<HyperparameterSet> {
        let axes: Vec<(Hyperparameter, &[f64])> = self
            .values
            .iter()
            .map(|(name, values)| (*name, values.as_slice()))
            .collect();
        if axes.iter().any(|(_, values)| values.is_empty()) {
            return Vec::new();
        }

        let mut combos = Vec::with_capacity(self.len());
        let mut cursor = vec![0usize; axes.len()];
        loop {
            let set = axes
                .iter()
                .zip(&cursor)
                .fold(HyperparameterSet::new(), |set, ((name, values), &i)| {
                    set.with(*name, values[i])
                });
            combos.push(set);

            // Odometer increment, last axis fastest.
            let mut axis = axes.len();
            loop {
                if axis == 0 {
                    return combos;
                }
                axis -= 1;
                cursor[axis] += 1;
                if cursor[axis] < axes[axis].1.len() {
                    break;
                }
                cursor[axis] = 0;
            }
        }
    }
}
