//! Exhaustive grid search with k-fold cross-validation.

mod grid;
mod grid_search;
mod kfold;

pub use grid::ParamGrid;
pub use grid_search::{CellResult, GridSearchCv, GridSearchResult};
pub use kfold::{Fold, KFold};

/// Seed used to shuffle rows into folds unless one is given.
pub const DEFAULT_FOLD_SEED: u64 = 42;
