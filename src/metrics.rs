//! Running averages and top-k accuracy

use anyhow::{anyhow, Result};
use burn::tensor::{backend::Backend, Int, Tensor};
use serde::Serialize;

/// Weighted running average of a scalar over an epoch
#[derive(Debug, Clone, Default, Serialize)]
pub struct AverageMeter {
    /// Last value passed to `update`
    pub val: f64,
    pub sum: f64,
    pub count: usize,
    pub avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record `value` as the mean of `n` samples.
    pub fn update(&mut self, value: f64, n: usize) {
        self.val = value;
        self.sum += value * n as f64;
        self.count += n;
        if self.count > 0 {
            self.avg = self.sum / self.count as f64;
        }
    }
}

/// Percentage of samples whose label is within the `k` highest logits, for each `k`.
///
/// `logits` is row-major `[batch, num_classes]`. Equal logits rank the lower
/// class index first; labels outside `0..num_classes` never count as correct.
pub fn accuracy(logits: &[f32], num_classes: usize, labels: &[i64], topk: &[usize]) -> Vec<f64> {
    if labels.is_empty() || num_classes == 0 {
        return vec![0.0; topk.len()];
    }

    let mut correct = vec![0usize; topk.len()];
    for (row, &label) in logits.chunks_exact(num_classes).zip(labels) {
        let Some(rank) = label_rank(row, label) else {
            continue;
        };
        for (hits, &k) in correct.iter_mut().zip(topk) {
            if rank < k {
                *hits += 1;
            }
        }
    }

    correct
        .into_iter()
        .map(|hits| 100.0 * hits as f64 / labels.len() as f64)
        .collect()
}

/// Zero-based position of `label` when the row is sorted by descending logit.
fn label_rank(row: &[f32], label: i64) -> Option<usize> {
    let label = usize::try_from(label).ok().filter(|&l| l < row.len())?;
    let target = row[label];

    let rank = row
        .iter()
        .enumerate()
        .filter(|&(class, &logit)| logit > target || (logit == target && class < label))
        .count();
    Some(rank)
}

/// [`accuracy`] on backend tensors: `outputs` is `[batch, num_classes]`.
pub fn batch_accuracy<B: Backend>(
    outputs: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    topk: &[usize],
) -> Result<Vec<f64>> {
    let [_, num_classes] = outputs.dims();

    let logits = outputs
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read logits: {:?}", e))?;
    let labels = targets
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| anyhow!("Failed to read labels: {:?}", e))?;

    Ok(accuracy(&logits, num_classes, &labels, topk))
}
