//! Train CUT-Semantic on the synthetic striped two-domain dataset.
//!
//! Usage:
//!   cargo run --release -p cut-semantic-mlx --example train_semantic -- \
//!     --steps 200 --batch-size 4 --classes 4 --output ./runs/semantic
//!
//! A YAML model config can replace the command-line model options:
//!   cargo run --release -p cut-semantic-mlx --example train_semantic -- \
//!     --config ./semantic.yaml

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use cut_semantic_mlx::{SemanticConfig, SemanticTrainer, SyntheticDomains, TrainerConfig};

#[derive(Parser)]
#[command(about = "Semantic-consistency CUT training on synthetic data")]
struct Args {
    /// YAML model config (overrides the model options below)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Training steps
    #[arg(long, default_value = "100")]
    steps: usize,
    #[arg(long, default_value = "4")]
    batch_size: usize,
    /// Image size (multiple of 4)
    #[arg(long, default_value = "16")]
    crop_size: i32,
    /// Number of semantic classes
    #[arg(long, default_value = "4")]
    classes: i32,
    /// Train a regression head on stripe brightness instead of classes
    #[arg(long)]
    regression: bool,
    /// Gradient accumulation micro-batches
    #[arg(long, default_value = "1")]
    iter_size: usize,
    /// Semantic loss is zeroed while the classifier loss is above this
    #[arg(long, default_value = "1.0")]
    threshold: f32,
    /// Also train the classifier on labelled domain B images
    #[arg(long)]
    train_cls_b: bool,
    /// Classifier template: basic or residual
    #[arg(long, default_value = "basic")]
    template: String,
    #[arg(long, default_value = "10")]
    log_every: usize,
    /// Checkpoint directory
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, default_value = "0")]
    save_every: usize,
    #[arg(long, default_value = "42")]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(false)
        .init();

    let args = Args::parse();

    let model_config = match &args.config {
        Some(path) => SemanticConfig::from_yaml(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => {
            let mut config = SemanticConfig::default()
                .with_crop_size(args.crop_size)
                .with_semantic_nclasses(args.classes)
                .with_iter_size(args.iter_size)
                .with_semantic_threshold(args.threshold)
                .with_train_cls_b(args.train_cls_b)
                .with_cls_template(args.template.clone())
                .with_seed(args.seed);
            if args.regression {
                config = config.with_l1_regression();
            }
            config
        }
    };

    if let Some(dir) = &args.output {
        std::fs::create_dir_all(dir)?;
        model_config.to_yaml(dir.join("config.yaml"))?;
    }

    let data = SyntheticDomains::new(&model_config, args.batch_size);
    let trainer_config = TrainerConfig {
        max_steps: args.steps,
        log_every: args.log_every,
        checkpoint_dir: args.output.clone(),
        save_every: args.save_every,
    };
    let mut trainer = SemanticTrainer::new(model_config, trainer_config)?;
    trainer.train(data)?;

    let state = trainer.state();
    info!(
        steps = state.step,
        secs = state.total_time_secs,
        quality = ?trainer.model().classifier_quality().value(),
        "finished"
    );
    for (name, value) in &state.last_losses {
        println!("{name:>8}: {value:.4}");
    }
    Ok(())
}
