//! EvoNorm - joint normalization and activation layers
//!
//! Replaces the usual `BatchNorm -> ReLU` pair with a single parametric
//! transform. Two variants are provided:
//! - `S0`: sample-based, divides a sigmoid-gated input by a per-sample
//!   group standard deviation (no running statistics)
//! - `B0`: batch-based, divides the input by the larger of the batch standard
//!   deviation and a gated instance standard deviation, keeping a running
//!   variance for evaluation

use core::fmt;
use core::str::FromStr;

use burn::{
    module::{Ignored, Module, Param, RunningState},
    prelude::*,
    tensor::{activation::sigmoid, backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::statistics::{batch_variance, effective_groups, group_normalize, instance_std};
use crate::error::{NormError, NormResult};

/// EvoNorm variant, fixed when the layer is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvoNormVersion {
    S0,
    B0,
}

impl FromStr for EvoNormVersion {
    type Err = NormError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S0" => Ok(Self::S0),
            "B0" => Ok(Self::B0),
            other => Err(NormError::InvalidConfiguration(format!(
                "invalid EvoNorm version '{other}' (expected S0 or B0)"
            ))),
        }
    }
}

impl fmt::Display for EvoNormVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::S0 => f.write_str("S0"),
            Self::B0 => f.write_str("B0"),
        }
    }
}

/// Whether `B0` layers compute batch statistics or reuse the running variance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormMode {
    #[default]
    Training,
    Evaluation,
}

/// EvoNorm configuration
#[derive(Config, Debug)]
pub struct EvoNormConfig {
    /// Number of channels of the `[N, C, H, W]` input
    pub num_features: usize,
    /// Use the learned gate (`v` in the EvoNorm paper)
    #[config(default = true)]
    pub non_linear: bool,
    #[config(default = "EvoNormVersion::S0")]
    pub version: EvoNormVersion,
    /// Running variance update rate: `running = momentum * running + (1 - momentum) * batch`
    #[config(default = 0.9)]
    pub momentum: f64,
    #[config(default = 1e-5)]
    pub epsilon: f64,
    /// Requested channel groups for `S0`; reduced to `gcd(num_groups, num_features)`
    #[config(default = 32)]
    pub num_groups: usize,
    #[config(default = "NormMode::Training")]
    pub mode: NormMode,
}

impl EvoNormConfig {
    /// Build the layer, rejecting configurations that cannot produce one.
    pub fn init<B: Backend>(&self, device: &B::Device) -> NormResult<EvoNorm<B>> {
        self.validate()?;

        let shape = [1, self.num_features, 1, 1];
        let gate = self
            .non_linear
            .then(|| Param::from_tensor(Tensor::ones(shape, device)));
        let groups = effective_groups(self.num_groups, self.num_features);

        debug!(
            "EvoNorm-{} with {} features, groups={}, non_linear={}",
            self.version, self.num_features, groups, self.non_linear
        );

        Ok(EvoNorm {
            gamma: Param::from_tensor(Tensor::ones(shape, device)),
            beta: Param::from_tensor(Tensor::zeros(shape, device)),
            gate,
            running_var: RunningState::new(Tensor::ones(shape, device)),
            version: Ignored(self.version),
            mode: Ignored(self.mode),
            momentum: self.momentum,
            epsilon: self.epsilon,
            groups,
            num_features: self.num_features,
        })
    }

    fn validate(&self) -> NormResult<()> {
        if self.num_features == 0 {
            return Err(NormError::InvalidConfiguration(
                "num_features must be positive".to_string(),
            ));
        }
        if !(self.momentum > 0.0 && self.momentum < 1.0) {
            return Err(NormError::InvalidConfiguration(format!(
                "momentum must be in (0, 1), got {}",
                self.momentum
            )));
        }
        if !(self.epsilon > 0.0) {
            return Err(NormError::InvalidConfiguration(format!(
                "epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        if self.num_groups == 0 {
            return Err(NormError::InvalidConfiguration(
                "num_groups must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// EvoNorm layer over `[N, C, H, W]` inputs
///
/// `gamma`, `beta` and `gate` are learned and only changed by the optimizer.
/// `running_var` is only written by `B0` forward passes in training mode.
#[derive(Module, Debug)]
pub struct EvoNorm<B: Backend> {
    /// Per-channel scale, `[1, C, 1, 1]`
    pub gamma: Param<Tensor<B, 4>>,
    /// Per-channel shift, `[1, C, 1, 1]`
    pub beta: Param<Tensor<B, 4>>,
    /// Per-channel gate, present when the layer is non-linear
    pub gate: Option<Param<Tensor<B, 4>>>,
    /// Running variance used by `B0` in evaluation mode, `[1, C, 1, 1]`
    pub running_var: RunningState<Tensor<B, 4>>,
    version: Ignored<EvoNormVersion>,
    mode: Ignored<NormMode>,
    momentum: f64,
    epsilon: f64,
    groups: usize,
    num_features: usize,
}

impl<B: Backend> EvoNorm<B> {
    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn version(&self) -> EvoNormVersion {
        *self.version
    }

    pub fn mode(&self) -> NormMode {
        *self.mode
    }

    /// Takes effect on the next forward call.
    pub fn set_mode(&mut self, mode: NormMode) {
        self.mode = Ignored(mode);
    }

    pub fn is_non_linear(&self) -> bool {
        self.gate.is_some()
    }

    /// Channel groups used by the `S0` statistic.
    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn momentum(&self) -> f64 {
        self.momentum
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Apply the layer to an input of any rank; only rank 4 is accepted.
    pub fn forward_dyn<const D: usize>(&self, x: Tensor<B, D>) -> NormResult<Tensor<B, D>> {
        if D != 4 {
            return Err(NormError::InvalidInput(format!(
                "expected 4D input (got {D}D input)"
            )));
        }

        let dims = x.dims();
        let mut shape = [0usize; 4];
        shape.copy_from_slice(&dims);

        let output = self.forward(x.reshape(shape))?;
        Ok(output.reshape(dims))
    }

    /// Apply the layer to `[N, C, H, W]`, returning a tensor of the same shape.
    pub fn forward(&self, x: Tensor<B, 4>) -> NormResult<Tensor<B, 4>> {
        let [_, channels, _, _] = x.dims();
        if channels != self.num_features {
            return Err(NormError::InvalidInput(format!(
                "expected {} channels (got {channels})",
                self.num_features
            )));
        }

        let output = match *self.version {
            EvoNormVersion::S0 => self.forward_s0(x),
            EvoNormVersion::B0 => self.forward_b0(x),
        };
        Ok(output)
    }

    fn forward_s0(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match &self.gate {
            Some(gate) => {
                // x * sigmoid(v * x) / group_std(x)
                let gated = x.clone() * sigmoid(gate.val() * x.clone());
                self.affine(group_normalize(gated, x, self.groups, self.epsilon))
            }
            None => self.affine(x),
        }
    }

    fn forward_b0(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let var = match *self.mode {
            NormMode::Training => {
                let var = batch_variance(x.clone());
                let running_var = self.running_var.value_sync();

                // Detached so the statistic never enters the autodiff graph
                self.running_var.update(
                    running_var
                        .mul_scalar(self.momentum)
                        .add(var.clone().detach().mul_scalar(1.0 - self.momentum)),
                );
                var
            }
            NormMode::Evaluation => self.running_var.value_sync(),
        };

        match &self.gate {
            Some(gate) => {
                let [n, c, h, w] = x.dims();
                let batch_std = (var + self.epsilon).sqrt().expand([n, c, h, w]);
                let instance = gate.val() * x.clone() + instance_std(x.clone(), self.epsilon);
                let den = batch_std.max_pair(instance);

                self.affine(x / den)
            }
            None => self.affine(x),
        }
    }

    fn affine(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        x * self.gamma.val() + self.beta.val()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::TensorData;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    fn device() -> <TestBackend as Backend>::Device {
        Default::default()
    }

    fn tensor(values: Vec<f32>, shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::from_data(TensorData::new(values, shape), &device())
    }

    fn values<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    fn assert_close(got: &[f32], want: &[f32], tol: f32) {
        assert_eq!(got.len(), want.len());
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() < tol, "got {got:?}, want {want:?}");
        }
    }

    fn layer(config: EvoNormConfig) -> EvoNorm<TestBackend> {
        config.init(&device()).unwrap()
    }

    #[test]
    fn init_allocates_parameters_and_running_variance() {
        for version in [EvoNormVersion::S0, EvoNormVersion::B0] {
            let norm = layer(EvoNormConfig::new(3).with_version(version));

            assert_eq!(norm.gamma.val().dims(), [1, 3, 1, 1]);
            assert_eq!(values(norm.gamma.val()), vec![1.0; 3]);
            assert_eq!(values(norm.beta.val()), vec![0.0; 3]);
            assert_eq!(values(norm.gate.as_ref().unwrap().val()), vec![1.0; 3]);
            assert_eq!(values(norm.running_var.value()), vec![1.0; 3]);
            assert_eq!(norm.version(), version);
            assert_eq!(norm.mode(), NormMode::Training);
            assert_eq!(norm.num_features(), 3);
            assert_eq!(norm.momentum(), 0.9);
            assert_eq!(norm.epsilon(), 1e-5);
        }
    }

    #[test]
    fn linear_layer_has_no_gate() {
        let norm = layer(EvoNormConfig::new(2).with_non_linear(false));

        assert!(norm.gate.is_none());
        assert!(!norm.is_non_linear());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = "X0".parse::<EvoNormVersion>().unwrap_err();
        assert!(matches!(err, NormError::InvalidConfiguration(_)));

        assert!(serde_json::from_str::<EvoNormVersion>("\"X0\"").is_err());
        assert_eq!("B0".parse::<EvoNormVersion>().unwrap(), EvoNormVersion::B0);
    }

    #[test]
    fn invalid_hyper_parameters_are_rejected() {
        let configs = [
            EvoNormConfig::new(0),
            EvoNormConfig::new(4).with_momentum(1.0),
            EvoNormConfig::new(4).with_momentum(0.0),
            EvoNormConfig::new(4).with_epsilon(0.0),
            EvoNormConfig::new(4).with_num_groups(0),
        ];

        for config in configs {
            let result = config.init::<TestBackend>(&device());
            assert!(matches!(result, Err(NormError::InvalidConfiguration(_))));
        }
    }

    #[test]
    fn groups_follow_channel_count() {
        assert_eq!(layer(EvoNormConfig::new(64)).groups(), 32);
        assert_eq!(layer(EvoNormConfig::new(4)).groups(), 4);
        assert_eq!(layer(EvoNormConfig::new(8).with_num_groups(2)).groups(), 2);
    }

    #[test]
    fn forward_rejects_wrong_rank() {
        let norm = layer(EvoNormConfig::new(2));

        let x3 = Tensor::<TestBackend, 3>::ones([2, 2, 3], &device());
        assert!(matches!(norm.forward_dyn(x3), Err(NormError::InvalidInput(_))));

        let x5 = Tensor::<TestBackend, 5>::ones([1, 2, 2, 2, 2], &device());
        assert!(matches!(norm.forward_dyn(x5), Err(NormError::InvalidInput(_))));

        let x4 = Tensor::<TestBackend, 4>::ones([1, 2, 2, 2], &device());
        assert_eq!(norm.forward_dyn(x4).unwrap().dims(), [1, 2, 2, 2]);
    }

    #[test]
    fn forward_rejects_channel_mismatch() {
        let norm = layer(EvoNormConfig::new(4));
        let x = Tensor::<TestBackend, 4>::ones([1, 3, 2, 2], &device());

        assert!(matches!(norm.forward(x), Err(NormError::InvalidInput(_))));
    }

    #[test]
    fn output_shape_matches_input_for_every_variant() {
        let x = tensor((0..48).map(|v| v as f32 / 10.0).collect(), [2, 4, 2, 3]);

        for version in [EvoNormVersion::S0, EvoNormVersion::B0] {
            for non_linear in [true, false] {
                let norm = layer(
                    EvoNormConfig::new(4)
                        .with_version(version)
                        .with_non_linear(non_linear),
                );
                assert_eq!(norm.forward(x.clone()).unwrap().dims(), [2, 4, 2, 3]);
            }
        }
    }

    #[test]
    fn s0_without_gate_is_affine() {
        let mut norm = layer(EvoNormConfig::new(2).with_non_linear(false));
        norm.gamma = Param::from_tensor(tensor(vec![2.0, -1.0], [1, 2, 1, 1]));
        norm.beta = Param::from_tensor(tensor(vec![0.5, 3.0], [1, 2, 1, 1]));

        let x = tensor(vec![1., 2., 3., 4., 5., 6., 7., 8.], [2, 2, 1, 2]);
        let out = values(norm.forward(x).unwrap());

        assert_eq!(out, vec![2.5, 4.5, 0.0, -1.0, 10.5, 12.5, -4.0, -5.0]);
        assert_eq!(values(norm.running_var.value()), vec![1.0, 1.0]);
    }

    #[test]
    fn s0_gated_divides_by_group_std() {
        let norm = layer(EvoNormConfig::new(1));
        let x = tensor(vec![0.0, 2.0], [1, 1, 1, 2]);

        let out = values(norm.forward(x).unwrap());

        let sigmoid_2 = 1.0 / (1.0 + (-2.0f32).exp());
        let std = (1.0f32 + 1e-5).sqrt();
        assert_close(&out, &[0.0, 2.0 * sigmoid_2 / std], 1e-5);
    }

    #[test]
    fn s0_never_touches_running_variance() {
        let norm = layer(EvoNormConfig::new(2));
        let x = tensor(vec![1., 5., -3., 2., 0., 7., 4., 4.], [2, 2, 1, 2]);

        norm.forward(x).unwrap();

        assert_eq!(values(norm.running_var.value_sync()), vec![1.0, 1.0]);
    }

    #[test]
    fn b0_training_updates_running_variance() {
        let norm = layer(
            EvoNormConfig::new(2)
                .with_version(EvoNormVersion::B0)
                .with_momentum(0.9),
        );
        // channel 0 constant (var 0), channel 1 alternating 0/2 (var 1)
        let x = tensor(vec![3., 3., 0., 2., 3., 3., 0., 2.], [2, 2, 1, 2]);

        norm.forward(x.clone()).unwrap();
        assert_close(&values(norm.running_var.value_sync()), &[0.9, 1.0], 1e-6);

        norm.forward(x).unwrap();
        assert_close(&values(norm.running_var.value_sync()), &[0.81, 1.0], 1e-6);
    }

    #[test]
    fn b0_without_gate_still_tracks_statistics() {
        let norm = layer(
            EvoNormConfig::new(1)
                .with_version(EvoNormVersion::B0)
                .with_non_linear(false)
                .with_momentum(0.5),
        );
        let x = tensor(vec![1.0, 1.0, 1.0, 1.0], [1, 1, 2, 2]);

        let out = values(norm.forward(x).unwrap());

        assert_eq!(out, vec![1.0; 4]);
        assert_close(&values(norm.running_var.value_sync()), &[0.5], 1e-6);
    }

    #[test]
    fn b0_evaluation_leaves_running_variance_untouched() {
        let mut norm = layer(EvoNormConfig::new(2).with_version(EvoNormVersion::B0));
        norm.forward(tensor(vec![1., 4., 0., 9., 2., 2., 5., 1.], [2, 2, 1, 2]))
            .unwrap();
        norm.set_mode(NormMode::Evaluation);

        let before = values(norm.running_var.value_sync());
        norm.forward(tensor(vec![8., 1., 3., 3., 0., 0., 6., 2.], [2, 2, 1, 2]))
            .unwrap();
        norm.forward(tensor(vec![-1., 2., 7., 5., 4., 4., 1., 0.], [2, 2, 1, 2]))
            .unwrap();
        let after = values(norm.running_var.value_sync());

        assert_eq!(before, after);
    }

    #[test]
    fn b0_evaluation_uses_running_variance() {
        let norm = layer(
            EvoNormConfig::new(1)
                .with_version(EvoNormVersion::B0)
                .with_mode(NormMode::Evaluation),
        );
        let x = tensor(vec![1.0, 3.0], [1, 1, 1, 2]);

        let out = values(norm.forward(x).unwrap());

        // instance std is 1, so den = max(1, [1 + 1, 3 + 1])
        let std = (1.0f32 + 1e-5).sqrt();
        assert_close(&out, &[1.0 / (1.0 + std), 3.0 / (3.0 + std)], 1e-5);
    }

    #[test]
    fn evaluation_forward_is_deterministic() {
        let mut norm = layer(EvoNormConfig::new(2).with_version(EvoNormVersion::B0));
        norm.set_mode(NormMode::Evaluation);
        let x = tensor(vec![0.3, -1.2, 2.5, 0.0, 1.1, 4.2, -0.7, 0.9], [2, 2, 1, 2]);

        let first = values(norm.forward(x.clone()).unwrap());
        let second = values(norm.forward(x).unwrap());

        assert_eq!(first, second);
    }

    #[test]
    fn mode_switches_take_effect_on_next_forward() {
        let mut norm = layer(EvoNormConfig::new(1).with_version(EvoNormVersion::B0));
        // zero gate: den = max(sqrt(var + eps), sqrt(eps)) on a constant input
        norm.gate = Some(Param::from_tensor(tensor(vec![0.0], [1, 1, 1, 1])));
        let ones = tensor(vec![1.0, 1.0], [1, 1, 1, 2]);
        let spread = tensor(vec![0.0, 4.0], [1, 1, 1, 2]);

        norm.set_mode(NormMode::Evaluation);
        norm.forward(spread.clone()).unwrap();
        assert_eq!(values(norm.running_var.value_sync()), vec![1.0]);
        let first = values(norm.forward(ones.clone()).unwrap());
        let want = 1.0 / (1.0f32 + 1e-5).sqrt();
        assert_close(&first, &[want, want], 1e-5);

        // batch variance of [0, 4] is 4: 0.9 * 1 + 0.1 * 4
        norm.set_mode(NormMode::Training);
        norm.forward(spread).unwrap();
        assert_close(&values(norm.running_var.value_sync()), &[1.3], 1e-6);
        assert_eq!(norm.mode(), NormMode::Training);

        norm.set_mode(NormMode::Evaluation);
        let second = values(norm.forward(ones).unwrap());
        let want = 1.0 / (1.3f32 + 1e-5).sqrt();
        assert_close(&second, &[want, want], 1e-5);
        assert_close(&values(norm.running_var.value_sync()), &[1.3], 1e-6);
    }

    #[test]
    fn b0_evaluation_reads_latest_training_update() {
        let mut norm = layer(
            EvoNormConfig::new(1)
                .with_version(EvoNormVersion::B0)
                .with_momentum(0.5),
        );
        norm.gate = Some(Param::from_tensor(tensor(vec![0.0], [1, 1, 1, 1])));

        // constant batch: running variance becomes 0.5 * 1 + 0.5 * 0
        norm.forward(tensor(vec![3.0; 4], [1, 1, 2, 2])).unwrap();
        norm.set_mode(NormMode::Evaluation);
        let out = values(norm.forward(tensor(vec![1.0, 1.0], [1, 1, 1, 2])).unwrap());

        let want = 1.0 / (0.5f32 + 1e-5).sqrt();
        assert_close(&out, &[want, want], 1e-5);
    }

    #[test]
    fn b0_training_gated_output_matches_closed_form() {
        let mut norm = layer(EvoNormConfig::new(1).with_version(EvoNormVersion::B0));
        let v = 0.25f32;
        norm.gate = Some(Param::from_tensor(tensor(vec![v], [1, 1, 1, 1])));
        // sample 0 is [1, 3], sample 1 is [4, 4]
        let x = tensor(vec![1.0, 3.0, 4.0, 4.0], [2, 1, 1, 2]);

        let out = values(norm.forward(x).unwrap());

        let eps = 1e-5f32;
        let batch_std = (1.5f32 + eps).sqrt();
        let instance = [(1.0f32 + eps).sqrt(), eps.sqrt()];
        let want: Vec<f32> = [(1.0f32, 0), (3.0, 0), (4.0, 1), (4.0, 1)]
            .iter()
            .map(|&(x, n)| x / batch_std.max(v * x + instance[n]))
            .collect();
        assert_close(&out, &want, 1e-5);
        // the first sample takes the instance branch, the second the batch branch
        assert!(v * 1.0 + instance[0] > batch_std);
        assert!(v * 4.0 + instance[1] < batch_std);
        assert_close(&values(norm.running_var.value_sync()), &[1.05], 1e-6);
    }

    #[test]
    fn s0_gated_normalizes_per_channel_group() {
        let mut norm = layer(EvoNormConfig::new(4).with_num_groups(2));
        norm.gate = Some(Param::from_tensor(tensor(vec![2.0; 4], [1, 4, 1, 1])));
        let input = vec![0.0, 1.0, 2.0, 3.0, 1.0, 1.0, -1.0, 3.0];
        let x = tensor(input.clone(), [1, 4, 1, 2]);

        let out = values(norm.forward(x).unwrap());

        // channels 0-1 form group 0 (var 1.25), channels 2-3 group 1 (var 2)
        let sigmoid = |z: f32| 1.0 / (1.0 + (-z).exp());
        let std = [(1.25f32 + 1e-5).sqrt(), (2.0f32 + 1e-5).sqrt()];
        let want: Vec<f32> = input
            .iter()
            .enumerate()
            .map(|(i, &x)| x * sigmoid(2.0 * x) / std[i / 4])
            .collect();
        assert_eq!(norm.groups(), 2);
        assert_close(&out, &want, 1e-5);
    }

    #[test]
    fn ones_pass_through_linear_s0() {
        let norm = layer(
            EvoNormConfig::new(4)
                .with_version(EvoNormVersion::S0)
                .with_non_linear(false),
        );
        let x = Tensor::<TestBackend, 4>::ones([2, 4, 3, 3], &device());

        let out = norm.forward(x).unwrap();

        assert_eq!(out.dims(), [2, 4, 3, 3]);
        assert_eq!(values(out), vec![1.0; 72]);
    }

    #[test]
    fn running_variance_is_excluded_from_autodiff() {
        let device = Default::default();
        let norm = EvoNormConfig::new(2)
            .with_version(EvoNormVersion::B0)
            .init::<TestAutodiffBackend>(&device)
            .unwrap();
        let x = Tensor::<TestAutodiffBackend, 4>::from_data(
            TensorData::new(vec![1., 4., 0., 9., 2., 2., 5., 1.], [2, 2, 1, 2]),
            &device,
        );

        let grads = norm.forward(x).unwrap().sum().backward();

        assert!(norm.gamma.val().grad(&grads).is_some());
        assert!(!norm.running_var.value_sync().is_require_grad());
    }
}
