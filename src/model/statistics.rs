//! Per-channel statistics used by EvoNorm
//!
//! All variances are biased (divide by the number of reduced elements).

use burn::tensor::{backend::Backend, Tensor};

/// Variance over batch and spatial dims, one value per channel: `[N, C, H, W] -> [1, C, 1, 1]`
pub fn batch_variance<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();

    x.swap_dims(0, 1)
        .reshape([c, n * h * w])
        .var_bias(1)
        .reshape([1, c, 1, 1])
}

/// Spatial standard deviation per sample and channel: `[N, C, H, W] -> [N, C, 1, 1]`
pub fn instance_std<B: Backend>(x: Tensor<B, 4>, eps: f64) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();
    let variance = x.reshape([n, c, h * w]).var_bias(2);

    (variance + eps).sqrt().reshape([n, c, 1, 1])
}

/// Number of channel groups actually used for `channels` when `requested` are asked for.
///
/// The result always divides `channels`: it is `gcd(requested, channels)`.
pub fn effective_groups(requested: usize, channels: usize) -> usize {
    let (mut a, mut b) = (requested, channels);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.max(1)
}

/// Standard deviation per sample over each group of contiguous channels
/// and all spatial positions: `[N, C, H, W] -> [N, G, 1]`
///
/// `groups` must divide `C`; see [`effective_groups`].
pub fn group_std<B: Backend>(x: Tensor<B, 4>, groups: usize, eps: f64) -> Tensor<B, 3> {
    let [n, c, h, w] = x.dims();
    let variance = x.reshape([n, groups, (c / groups) * h * w]).var_bias(2);

    (variance + eps).sqrt()
}

/// Divide `num` by the group standard deviation of `x`, broadcast back over every
/// channel of the group. Both tensors share the shape `[N, C, H, W]`.
pub fn group_normalize<B: Backend>(
    num: Tensor<B, 4>,
    x: Tensor<B, 4>,
    groups: usize,
    eps: f64,
) -> Tensor<B, 4> {
    let [n, c, h, w] = num.dims();
    let std = group_std(x, groups, eps);

    num.reshape([n, groups, (c / groups) * h * w])
        .div(std)
        .reshape([n, c, h, w])
}
