//! Supervised training loop
//!
//! Runs one epoch of gradient descent over labeled batches, tracking loss and
//! top-1/top-3 accuracy, and steps the learning rate scheduler once per epoch.

use std::marker::PhantomData;

use anyhow::Result;
use burn::{
    lr_scheduler::LrScheduler,
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
    LearningRate,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::ClassificationBatch;
use crate::metrics::{batch_accuracy, AverageMeter};
use crate::model::NormMode;

/// A model the trainer can drive
pub trait Classifier<B: Backend> {
    /// `[N, C, H, W]` images to `[N, num_classes]` logits
    fn forward(&self, inputs: Tensor<B, 4>) -> Result<Tensor<B, 2>>;

    /// Switch every mode-dependent layer; applies to the next forward call
    fn set_mode(&mut self, mode: NormMode);
}

/// Per-epoch metrics, one entry per call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_loss: Vec<f64>,
    pub train_acc: Vec<f64>,
    pub train_acc_top3: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub val_acc: Vec<f64>,
}

/// Cross-entropy over logits and integer class labels
pub fn cross_entropy<B: Backend>(
    device: &B::Device,
) -> impl Fn(Tensor<B, 2>, Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let loss = CrossEntropyLossConfig::new().init(device);
    move |outputs, targets| loss.forward(outputs, targets)
}

/// Training loop over an optimizer, a scheduler and a loss function
pub struct Trainer<B, M, O, S, L>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Classifier<B>,
    O: Optimizer<M, B>,
    S: LrScheduler,
    L: Fn(Tensor<B, 2>, Tensor<B, 1, Int>) -> Tensor<B, 1>,
{
    optimizer: O,
    scheduler: S,
    criterion: L,
    lr: LearningRate,
    log_interval: usize,
    _model: PhantomData<(B, M)>,
}

impl<B, M, O, S, L> Trainer<B, M, O, S, L>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Classifier<B>,
    O: Optimizer<M, B>,
    S: LrScheduler,
    L: Fn(Tensor<B, 2>, Tensor<B, 1, Int>) -> Tensor<B, 1>,
{
    /// The scheduler's first step gives the learning rate of the first epoch.
    pub fn new(optimizer: O, mut scheduler: S, criterion: L, log_interval: usize) -> Self {
        let lr = scheduler.step();
        Self {
            optimizer,
            scheduler,
            criterion,
            lr,
            log_interval: log_interval.max(1),
            _model: PhantomData,
        }
    }

    /// Learning rate used by the next epoch
    pub fn learning_rate(&self) -> LearningRate {
        self.lr
    }

    /// Train `model` for one epoch and append the epoch's averages to `history`.
    pub fn train(
        &mut self,
        mut model: M,
        batches: &[ClassificationBatch<B>],
        epoch: usize,
        history: &mut TrainingHistory,
    ) -> Result<M> {
        let num_samples: usize = batches.iter().map(ClassificationBatch::len).sum();
        let width = num_samples.to_string().len();

        let mut losses = AverageMeter::new();
        let mut top1 = AverageMeter::new();
        let mut top3 = AverageMeter::new();
        let mut total_loss = 0.0;
        let mut count = 0;

        model.set_mode(NormMode::Training);
        for (batch_idx, batch) in batches.iter().enumerate() {
            let batch_size = batch.len();
            let outputs = model.forward(batch.inputs.clone())?;
            let loss = (self.criterion)(outputs.clone(), batch.targets.clone());

            let accuracies = batch_accuracy(outputs.detach(), batch.targets.clone(), &[1, 3])?;
            let loss_value: f64 = loss.clone().into_scalar().elem();
            losses.update(loss_value, batch_size);
            top1.update(accuracies[0], batch_size);
            top3.update(accuracies[1], batch_size);

            // Gradients are consumed by the step, nothing carries over to the next batch
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = self.optimizer.step(self.lr, model, grads);

            total_loss += loss_value * batch_size as f64;
            count += batch_size;

            if batch_idx % self.log_interval == 0 {
                info!(
                    "epoch: {:0>3} [{: >width$}/{} ({: >3.0}%)], train_loss: {: >4.2e}, train_accuracy : {:.2}%",
                    epoch,
                    count,
                    num_samples,
                    100.0 * count as f64 / num_samples as f64,
                    total_loss / count as f64,
                    top1.avg,
                );
            }
        }

        self.lr = self.scheduler.step();
        history.train_loss.push(losses.avg);
        history.train_acc.push(top1.avg);
        history.train_acc_top3.push(top3.avg);

        Ok(model)
    }

    /// Evaluate `model` without updating parameters or running statistics.
    pub fn evaluate(
        &self,
        mut model: M,
        batches: &[ClassificationBatch<B>],
        epoch: usize,
        history: &mut TrainingHistory,
    ) -> Result<M> {
        let mut losses = AverageMeter::new();
        let mut top1 = AverageMeter::new();

        model.set_mode(NormMode::Evaluation);
        for batch in batches {
            let batch_size = batch.len();
            let outputs = model.forward(batch.inputs.clone())?.detach();
            let loss = (self.criterion)(outputs.clone(), batch.targets.clone());

            let accuracies = batch_accuracy(outputs, batch.targets.clone(), &[1])?;
            losses.update(loss.into_scalar().elem(), batch_size);
            top1.update(accuracies[0], batch_size);
        }

        info!(
            "epoch: {:0>3}, valid_loss: {: >4.2e}, valid_accuracy : {:.2}%",
            epoch, losses.avg, top1.avg
        );
        history.val_loss.push(losses.avg);
        history.val_acc.push(top1.avg);

        Ok(model)
    }
}
