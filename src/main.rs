//! evonorm-train - trains a small EvoNorm network on synthetic data
//!
//! Uses the Burn NdArray backend by default; build with `--features wgpu`
//! to train on the GPU instead.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::{
    backend::Autodiff,
    optim::{momentum::MomentumConfig, AdamConfig, Optimizer, SgdConfig},
    tensor::backend::Backend as _,
};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evonorm::{
    config::{OptimizerKind, TrainingConfig},
    data::{ClassificationBatch, SyntheticDataset},
    model::{EvoNet, EvoNetConfig},
    trainer::{cross_entropy, Trainer, TrainingHistory},
};

/// Backend type: WGPU when the `wgpu` feature is enabled, CPU otherwise
#[cfg(feature = "wgpu")]
pub type Backend = burn::backend::Wgpu;
#[cfg(not(feature = "wgpu"))]
pub type Backend = burn::backend::NdArray;

type TrainBackend = Autodiff<Backend>;
type Device = <TrainBackend as burn::tensor::backend::Backend>::Device;

#[derive(Parser, Debug)]
#[command(name = "evonorm-train", version, about = "Train an EvoNorm network on synthetic data")]
struct Cli {
    /// JSON training configuration; defaults are used for missing fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the number of epochs
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Write the per-epoch history as JSON
    #[arg(long)]
    history: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "evonorm=info,evonorm_train=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TrainingConfig::from_file(path)?,
        None => TrainingConfig::default(),
    };
    if let Some(epochs) = cli.epochs {
        config.epochs = epochs;
    }
    config.validate()?;
    info!("⚙️  Training config: {:?}", config);

    let device = Device::default();
    TrainBackend::seed(config.seed);
    info!("📡 Device initialized: {:?}", device);

    let dataset = SyntheticDataset::new(config.data.clone());
    let train: Vec<ClassificationBatch<TrainBackend>> =
        dataset.batches(config.data.num_train, config.batch_size, &device);
    let valid: Vec<ClassificationBatch<TrainBackend>> =
        dataset.batches(config.data.num_valid, config.batch_size, &device);
    info!(
        "📦 {} training and {} validation batches",
        train.len(),
        valid.len()
    );

    let model: EvoNet<TrainBackend> =
        EvoNetConfig::new(config.data.channels, config.data.num_classes)
            .with_hidden_channels(config.model.hidden_channels)
            .with_head_version(config.model.head_version)
            .with_num_groups(config.model.num_groups)
            .init(&device)?;
    info!("🏗️  EvoNet with head EvoNorm-{}", config.model.head_version);

    let history = match config.optimizer {
        OptimizerKind::Adam => {
            let adam = AdamConfig::new();
            fit(&config, model, adam.init(), &train, &valid, &device)?
        }
        OptimizerKind::Sgd => {
            let sgd = SgdConfig::new().with_momentum(Some(MomentumConfig::new()));
            fit(&config, model, sgd.init(), &train, &valid, &device)?
        }
    };

    if let (Some(loss), Some(acc)) = (history.train_loss.last(), history.val_acc.last()) {
        info!("✅ Final train_loss: {:.4}, valid_accuracy: {:.2}%", loss, acc);
    }

    if let Some(path) = cli.history {
        let json = serde_json::to_string_pretty(&history)?;
        fs::write(&path, json).with_context(|| format!("Failed to write history: {:?}", path))?;
        info!("📝 History written to {:?}", path);
    }

    Ok(())
}

fn fit<O>(
    config: &TrainingConfig,
    mut model: EvoNet<TrainBackend>,
    optimizer: O,
    train: &[ClassificationBatch<TrainBackend>],
    valid: &[ClassificationBatch<TrainBackend>],
    device: &Device,
) -> Result<TrainingHistory>
where
    O: Optimizer<EvoNet<TrainBackend>, TrainBackend>,
{
    let scheduler = config.lr_scheduler()?;
    let criterion = cross_entropy::<TrainBackend>(device);
    let mut trainer = Trainer::new(optimizer, scheduler, criterion, config.log_interval);
    let mut history = TrainingHistory::default();

    for epoch in 1..=config.epochs {
        info!("🚀 Epoch {} (lr {:.2e})", epoch, trainer.learning_rate());
        model = trainer.train(model, train, epoch, &mut history)?;
        model = trainer.evaluate(model, valid, epoch, &mut history)?;
    }

    Ok(history)
}
