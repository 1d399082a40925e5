use super::{KFold, ParamGrid, DEFAULT_FOLD_SEED};
use crate::config::SearchConfig;
use crate::data::Dataset;
use crate::error::{FinetuneError, Result};
use crate::estimator::Classifier;
use crate::hyperparams::HyperparameterSet;
use crate::module::{ClassifierModule, Mlp};
use candle::Tensor;
use rayon::prelude::*;

/// Cross-validated outcome of one grid combination.
#[derive(Clone, Debug, PartialEq)]
pub struct CellResult {
    pub params: HyperparameterSet,
    /// Held-out accuracy per completed fold, in fold order.
    pub fold_scores: Vec<f64>,
    /// Mean of `fold_scores`, or negative infinity if any fold failed.
    pub mean_score: f64,
    pub std_score: f64,
    /// The fit error that disqualified this combination.
    pub error: Option<String>,
}

impl CellResult {
    fn completed(params: HyperparameterSet, fold_scores: Vec<f64>) -> Self {
        let n = fold_scores.len().max(1) as f64;
        let mean = fold_scores.iter().sum::<f64>() / n;
        let var = fold_scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        Self {
            params,
            fold_scores,
            mean_score: mean,
            std_score: var.sqrt(),
            error: None,
        }
    }

    fn failed(params: HyperparameterSet, fold_scores: Vec<f64>, error: &FinetuneError) -> Self {
        Self {
            params,
            fold_scores,
            mean_score: f64::NEG_INFINITY,
            std_score: f64::NAN,
            error: Some(error.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Every cell of a finished search plus the winner.
pub struct GridSearchResult<M: ClassifierModule = Mlp> {
    /// One entry per combination, in enumeration order.
    pub cells: Vec<CellResult>,
    pub best_index: usize,
    pub best_params: HyperparameterSet,
    pub best_score: f64,
    /// The winner fitted on the full data, if refit was requested.
    pub refit: Option<Classifier<M>>,
    /// Cross-validation fits attempted, excluding the refit.
    pub n_fits: usize,
}

impl<M: ClassifierModule> GridSearchResult<M> {
    pub fn best(&self) -> &CellResult {
        &self.cells[self.best_index]
    }

    pub fn failed_cells(&self) -> impl Iterator<Item = &CellResult> {
        self.cells.iter().filter(|c| c.is_failed())
    }

    pub fn has_failures(&self) -> bool {
        self.failed_cells().next().is_some()
    }
}

/// Exhaustive search over a [`ParamGrid`] scored by k-fold cross-validation.
#[derive(Clone, Debug)]
pub struct GridSearchCv {
    grid: ParamGrid,
    k_folds: usize,
    fold_seed: u64,
    refit: bool,
    n_jobs: usize,
}

impl GridSearchCv {
    pub fn new(grid: ParamGrid, k_folds: usize) -> Self {
        Self {
            grid,
            k_folds,
            fold_seed: DEFAULT_FOLD_SEED,
            refit: true,
            n_jobs: 1,
        }
    }

    pub fn from_config(config: &SearchConfig) -> Result<Self> {
        Ok(Self::new(config.param_grid()?, config.k_folds)
            .fold_seed(config.fold_seed)
            .refit(config.refit)
            .n_jobs(config.n_jobs))
    }

    pub fn fold_seed(mut self, seed: u64) -> Self {
        self.fold_seed = seed;
        self
    }

    /// Fit the winning combination on the full data when the search ends.
    pub fn refit(mut self, refit: bool) -> Self {
        self.refit = refit;
        self
    }

    /// Worker threads for (combination, fold) fits; 1 runs them in order on the caller's thread.
    pub fn n_jobs(mut self, n: usize) -> Self {
        self.n_jobs = n.max(1);
        self
    }

    pub fn grid(&self) -> &ParamGrid {
        &self.grid
    }

    /// Cross-validate every combination of the grid on `(x, y)`.
    ///
    /// `prototype` supplies the base configuration and the initialization,
    /// loss and observer strategies; each fit gets a fresh estimator built
    /// from it. A fit that diverges disqualifies its combination. Any other
    /// error aborts the search.
    pub fn search<M: ClassifierModule>(
        &self,
        prototype: &Classifier<M>,
        x: &Tensor,
        y: &Tensor,
    ) -> Result<GridSearchResult<M>> {
        let data = Dataset::new(x, y)?;
        let arch = &prototype.config().architecture;
        data.check_features(arch.input_dim)?;
        data.check_labels(arch.num_classes)?;

        self.grid.validate()?;
        let combos = self.grid.combinations();
        for params in &combos {
            prototype.config().apply(params)?;
        }

        let folds = KFold::new(self.k_folds)
            .with_seed(self.fold_seed)
            .split(data.len())?
            .into_iter()
            .map(|fold| Ok((data.select(&fold.train)?, data.select(&fold.test)?)))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            combinations = combos.len(),
            folds = folds.len(),
            n_jobs = self.n_jobs,
            "starting grid search"
        );

        let (cells, n_fits) = if self.n_jobs > 1 {
            self.run_parallel(prototype, &combos, &folds)?
        } else {
            self.run_sequential(prototype, &combos, &folds)?
        };

        for cell in &cells {
            match &cell.error {
                None => tracing::info!(
                    params = %cell.params,
                    mean = cell.mean_score,
                    std = cell.std_score,
                    "cell scored"
                ),
                Some(error) => tracing::warn!(params = %cell.params, %error, "cell failed"),
            }
        }

        let mut best: Option<usize> = None;
        for (i, cell) in cells.iter().enumerate() {
            if cell.is_failed() {
                continue;
            }
            if best.map_or(true, |b| cell.mean_score > cells[b].mean_score) {
                best = Some(i);
            }
        }
        let Some(best_index) = best else {
            let last_error = cells
                .iter()
                .rev()
                .find_map(|c| c.error.clone())
                .unwrap_or_default();
            return Err(FinetuneError::NoViableCombination {
                attempted: cells.len(),
                last_error,
            });
        };

        let best_params = cells[best_index].params.clone();
        let best_score = cells[best_index].mean_score;
        tracing::info!(params = %best_params, score = best_score, "best combination");

        let refit = if self.refit {
            let mut estimator = prototype.clone_with(&best_params)?;
            estimator.fit_dataset(&data)?;
            Some(estimator)
        } else {
            None
        };

        Ok(GridSearchResult {
            cells,
            best_index,
            best_params,
            best_score,
            refit,
            n_fits,
        })
    }

    /// Stops scoring a combination at its first failing fold.
    fn run_sequential<M: ClassifierModule>(
        &self,
        prototype: &Classifier<M>,
        combos: &[HyperparameterSet],
        folds: &[(Dataset, Dataset)],
    ) -> Result<(Vec<CellResult>, usize)> {
        let mut cells = Vec::with_capacity(combos.len());
        let mut n_fits = 0;
        for params in combos {
            let mut scores = Vec::with_capacity(folds.len());
            let mut failure = None;
            for (train, test) in folds {
                n_fits += 1;
                match fit_and_score(prototype, params, train, test) {
                    Ok(score) => scores.push(score),
                    Err(e) if e.is_cell_local() => {
                        failure = Some(e);
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            cells.push(match failure {
                Some(e) => CellResult::failed(params.clone(), scores, &e),
                None => CellResult::completed(params.clone(), scores),
            });
        }
        Ok((cells, n_fits))
    }

    /// Runs every (combination, fold) pair on a dedicated pool, collecting in enumeration order.
    fn run_parallel<M: ClassifierModule>(
        &self,
        prototype: &Classifier<M>,
        combos: &[HyperparameterSet],
        folds: &[(Dataset, Dataset)],
    ) -> Result<(Vec<CellResult>, usize)> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.n_jobs)
            .build()
            .map_err(|e| FinetuneError::invalid_config(format!("cannot start {} workers: {e}", self.n_jobs)))?;

        let pairs: Vec<(usize, usize)> = (0..combos.len())
            .flat_map(|c| (0..folds.len()).map(move |f| (c, f)))
            .collect();
        let outcomes: Vec<Result<f64>> = pool.install(|| {
            pairs
                .par_iter()
                .map(|&(c, f)| {
                    let (train, test) = &folds[f];
                    fit_and_score(prototype, &combos[c], train, test)
                })
                .collect()
        });

        let n_fits = outcomes.len();
        let mut outcomes = outcomes.into_iter();
        let mut cells = Vec::with_capacity(combos.len());
        for params in combos {
            let mut scores = Vec::with_capacity(folds.len());
            let mut failure = None;
            for outcome in outcomes.by_ref().take(folds.len()) {
                match outcome {
                    Ok(score) => scores.push(score),
                    Err(e) if e.is_cell_local() => {
                        failure.get_or_insert(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            cells.push(match failure {
                Some(e) => CellResult::failed(params.clone(), scores, &e),
                None => CellResult::completed(params.clone(), scores),
            });
        }
        Ok((cells, n_fits))
    }
}

fn fit_and_score<M: ClassifierModule>(
    prototype: &Classifier<M>,
    params: &HyperparameterSet,
    train: &Dataset,
    test: &Dataset,
) -> Result<f64> {
    let mut estimator = prototype.clone_with(params)?.without_checkpoints();
    estimator.fit_dataset(train)?;
    estimator.score_dataset(test)
}
