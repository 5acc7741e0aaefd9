//! EvoNorm - normalization-activation layers for Burn
//!
//! Provides the EvoNorm-S0 and EvoNorm-B0 layers, a small network built
//! from them, and a supervised training loop that tracks loss and top-k
//! accuracy per epoch.

pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod model;
pub mod trainer;

pub use error::{NormError, NormResult};
pub use model::{EvoNorm, EvoNormConfig, EvoNormVersion, NormMode};
pub use trainer::{Classifier, Trainer, TrainingHistory};
