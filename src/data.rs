//! Synthetic labeled image batches
//!
//! Each class lights up one channel with a constant offset; samples add
//! Gaussian noise on top. Enough signal for a small network to learn in a
//! few epochs without any dataset on disk.

use burn::tensor::{backend::Backend, Distribution, Int, Tensor, TensorData};
use tracing::debug;

use crate::config::DataConfig;

/// Class pattern amplitude
const SIGNAL: f32 = 2.0;

/// A batch of `[N, C, H, W]` inputs and their class labels
#[derive(Debug, Clone)]
pub struct ClassificationBatch<B: Backend> {
    pub inputs: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ClassificationBatch<B> {
    /// Number of samples
    pub fn len(&self) -> usize {
        self.inputs.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Generator for labeled batches described by a [`DataConfig`]
#[derive(Debug, Clone)]
pub struct SyntheticDataset {
    config: DataConfig,
}

impl SyntheticDataset {
    pub fn new(config: DataConfig) -> Self {
        Self { config }
    }

    /// Build `num_samples` samples split into batches of `batch_size`; the last batch may be short.
    ///
    /// Labels cycle through the classes in order.
    pub fn batches<B: Backend>(
        &self,
        num_samples: usize,
        batch_size: usize,
        device: &B::Device,
    ) -> Vec<ClassificationBatch<B>> {
        let batch_size = batch_size.max(1);
        let batches: Vec<_> = (0..num_samples)
            .step_by(batch_size)
            .map(|start| {
                let end = (start + batch_size).min(num_samples);
                self.batch(start..end, device)
            })
            .collect();

        debug!(
            "Generated {} synthetic batches ({} samples)",
            batches.len(),
            num_samples
        );
        batches
    }

    fn batch<B: Backend>(
        &self,
        indices: core::ops::Range<usize>,
        device: &B::Device,
    ) -> ClassificationBatch<B> {
        let DataConfig {
            num_classes,
            channels,
            height,
            width,
            noise,
            ..
        } = self.config;
        let batch_size = indices.len();

        let labels: Vec<i64> = indices.map(|i| (i % num_classes) as i64).collect();
        let pattern: Vec<f32> = labels
            .iter()
            .flat_map(|&label| {
                (0..channels).map(move |c| {
                    if c == label as usize % channels {
                        SIGNAL * (1 + label as usize / channels) as f32
                    } else {
                        0.0
                    }
                })
            })
            .collect();

        let pattern: Tensor<B, 4> =
            Tensor::from_data(TensorData::new(pattern, [batch_size, channels, 1, 1]), device);
        let noise = Tensor::<B, 4>::random(
            [batch_size, channels, height, width],
            Distribution::Normal(0.0, noise),
            device,
        );

        ClassificationBatch {
            inputs: noise + pattern,
            targets: Tensor::from_data(TensorData::new(labels, [batch_size]), device),
        }
    }
}
