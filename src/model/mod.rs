//! EvoNorm layers and the demo network using them
//!
//! - `normalization`: the EvoNorm-S0 / EvoNorm-B0 layer
//! - `statistics`: batch variance, instance std and group std helpers
//! - `network`: a small conv classifier whose blocks are `Conv2d -> EvoNorm`

mod network;
mod normalization;
pub mod statistics;

pub use network::{EvoConvBlock, EvoNet, EvoNetConfig};
pub use normalization::{EvoNorm, EvoNormConfig, EvoNormVersion, NormMode};
