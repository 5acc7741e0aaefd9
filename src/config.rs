//! Training run configuration

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use burn::lr_scheduler::step::{StepLrScheduler, StepLrSchedulerConfig};
use serde::{Deserialize, Serialize};

use crate::model::EvoNormVersion;

/// Top-level configuration for a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Initial learning rate
    pub learning_rate: f64,
    /// Epochs between learning rate decays
    pub lr_step_size: usize,
    /// Multiplicative learning rate decay
    pub lr_gamma: f64,
    pub optimizer: OptimizerKind,
    /// Log every `log_interval` batches
    pub log_interval: usize,
    pub seed: u64,
    pub model: ModelConfig,
    pub data: DataConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            lr_step_size: 5,
            lr_gamma: 0.5,
            optimizer: OptimizerKind::Adam,
            log_interval: 10,
            seed: 42,
            model: ModelConfig::default(),
            data: DataConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Read a JSON config file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {:?}", path))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if self.lr_step_size == 0 {
            anyhow::bail!("lr_step_size must be positive");
        }
        if self.data.num_classes == 0 {
            anyhow::bail!("data.num_classes must be positive");
        }
        if self.data.channels == 0 {
            anyhow::bail!("data.channels must be positive");
        }
        Ok(())
    }

    /// Step decay of `learning_rate` by `lr_gamma` every `lr_step_size` epochs
    pub fn lr_scheduler(&self) -> Result<StepLrScheduler> {
        StepLrSchedulerConfig::new(self.learning_rate, self.lr_step_size)
            .with_gamma(self.lr_gamma)
            .init()
            .map_err(|e| anyhow!("Invalid learning rate schedule: {}", e))
    }
}

/// Optimizer used for the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

/// Shape of the demo EvoNorm network
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub hidden_channels: usize,
    /// Variant of the last EvoNorm layer (the first one is always B0)
    pub head_version: EvoNormVersion,
    pub num_groups: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_channels: 16,
            head_version: EvoNormVersion::S0,
            num_groups: 8,
        }
    }
}

/// Synthetic classification data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub num_train: usize,
    pub num_valid: usize,
    pub num_classes: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    /// Standard deviation of the Gaussian noise around each class pattern
    pub noise: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            num_train: 512,
            num_valid: 128,
            num_classes: 4,
            channels: 3,
            height: 8,
            width: 8,
            noise: 0.5,
        }
    }
}
