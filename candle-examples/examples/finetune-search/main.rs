// Pretrains a classifier on one draw of synthetic blobs, then grid-searches
// fine-tuning hyperparameters on a second draw, warm-starting every fit from
// the pretrained parameters.
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use anyhow::Context;
use candle_examples::toy_blobs;
use candle_finetune::{Classifier, GridSearchCv, InitConfig, SearchConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = r#"
k_folds = 3
refit = true
n_jobs = 1

[estimator]
lr = 0.01
batch_size = 32
max_epochs = 50
patience = 5
val_fraction = 0.2
log_every_n_epochs = 10

[estimator.architecture]
input_dim = 4
hidden = [32]
num_classes = 3

[grid]
lr = [0.01, 0.001]
l1 = [0.0, 0.0001]
dropout = [0.0, 0.2]
"#;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML search configuration; a built-in grid is used when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the pretrained and refit parameter files.
    #[arg(long, default_value = "finetune-out")]
    out: PathBuf,

    #[arg(long, default_value_t = 200)]
    rows_per_class: usize,

    /// Override the number of worker threads from the configuration.
    #[arg(long)]
    n_jobs: Option<usize>,

    /// Search from random initialization instead of the pretrained snapshot.
    #[arg(long)]
    cold: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => SearchConfig::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SearchConfig::from_toml_str(DEFAULT_CONFIG)?,
    };
    if let Some(n) = args.n_jobs {
        config.n_jobs = n;
    }
    let arch = config.estimator.architecture.clone();
    let device = config.estimator.device.device()?;
    std::fs::create_dir_all(&args.out)?;

    let (x_pre, y_pre) = toy_blobs(args.rows_per_class, arch.input_dim, arch.num_classes, 1.5, 0)?;
    let (x, y) = toy_blobs(args.rows_per_class, arch.input_dim, arch.num_classes, 2.0, 1)?;
    let (x_test, y_test) = toy_blobs(args.rows_per_class / 2, arch.input_dim, arch.num_classes, 2.0, 2)?;

    let base_path = args.out.join("base.safetensors");
    let mut base: Classifier = Classifier::new(config.estimator.clone())?.with_label("pretrain");
    base.fit(&x_pre, &y_pre)?;
    base.save_parameters(&base_path)?;
    println!(
        "pretrained: {} epochs, test accuracy {:.4}, saved to {}",
        base.fit_outcome()?.epochs_run,
        base.score(&x_test, &y_test)?,
        base_path.display()
    );

    let init = match (&config.init, args.cold) {
        (_, true) => InitConfig::Random,
        (InitConfig::Random, false) => InitConfig::FromSnapshot { path: base_path },
        (explicit, false) => explicit.clone(),
    };
    let prototype: Classifier =
        Classifier::new(config.estimator.clone())?.with_shared_init(init.build(&device)?);

    let search = GridSearchCv::from_config(&config)?;
    let result = search.search(&prototype, &x, &y)?;

    for (i, cell) in result.cells.iter().enumerate() {
        let best = i == result.best_index;
        match &cell.error {
            None => tracing::info!(
                params = %cell.params,
                mean = cell.mean_score,
                std = cell.std_score,
                folds = ?cell.fold_scores,
                best,
                "cell"
            ),
            Some(error) => tracing::warn!(params = %cell.params, %error, "cell failed"),
        }
    }
    println!(
        "best {} with mean accuracy {:.4} ({} fits, {} failed cells)",
        result.best_params,
        result.best_score,
        result.n_fits,
        result.failed_cells().count()
    );

    if let Some(refit) = &result.refit {
        let path = args.out.join("refit.safetensors");
        refit.save_parameters(&path)?;
        println!(
            "refit test accuracy {:.4}, saved to {}",
            refit.score(&x_test, &y_test)?,
            path.display()
        );
    }
    Ok(())
}
