//! Feature reducer block.

use burn::module::Module;
use burn::nn;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};

/// Configuration for the reducer block.
///
/// # Example
///
/// ```
/// use ml_fusion::ReducerBlockConfig;
///
/// let config = ReducerBlockConfig::new(2048, 256);
/// assert!(config.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReducerBlockConfig {
    /// Flattened input width.
    pub input_width: usize,

    /// Output width.
    pub output_width: usize,

    /// Dropout probability.
    pub dropout_prob: f64,
}

impl ReducerBlockConfig {
    /// Creates a configuration with the default dropout of 0.5.
    #[must_use]
    pub const fn new(input_width: usize, output_width: usize) -> Self {
        Self {
            input_width,
            output_width,
            dropout_prob: 0.5,
        }
    }

    /// Sets the dropout probability.
    #[must_use]
    pub const fn with_dropout_prob(mut self, dropout_prob: f64) -> Self {
        self.dropout_prob = dropout_prob;
        self
    }

    /// Returns `true` if both widths are positive and dropout is in `[0, 1]`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.input_width > 0 && self.output_width > 0 && (0.0..=1.0).contains(&self.dropout_prob)
    }
}

/// Projects flat features to a fixed-width embedding.
///
/// Architecture: Linear -> `BatchNorm` -> `ReLU` -> Dropout
///
/// Dropout and batch statistics are only active on autodiff backends; on the
/// inner backend the block is deterministic.
#[derive(Debug, Module)]
pub struct ReducerBlock<B: Backend> {
    linear: nn::Linear<B>,
    norm: nn::BatchNorm<B>,
    dropout: nn::Dropout,
}

impl<B: Backend> ReducerBlock<B> {
    /// Creates a new reducer block.
    #[must_use]
    pub fn new(config: ReducerBlockConfig, device: &B::Device) -> Self {
        Self {
            linear: nn::LinearConfig::new(config.input_width, config.output_width).init(device),
            norm: nn::BatchNormConfig::new(config.output_width).init(device),
            dropout: nn::DropoutConfig::new(config.dropout_prob).init(),
        }
    }

    /// Runs the block on `[batch, input_width]`, returning `[batch, output_width]`.
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = self.linear.forward(input);
        let x = batch_norm_1d(&self.norm, x);
        let x = relu(x);
        self.dropout.forward(x)
    }

    /// Output width of the block.
    #[must_use]
    pub fn output_width(&self) -> usize {
        self.linear.weight.val().dims()[1]
    }
}

/// Applies a batch norm over the feature axis of a `[batch, width]` tensor.
///
/// Burn's batch norm expects `[batch, channels, ...]`, so the vector is viewed
/// as `[batch, width, 1]`.
pub(crate) fn batch_norm_1d<B: Backend>(
    norm: &nn::BatchNorm<B>,
    input: Tensor<B, 2>,
) -> Tensor<B, 2> {
    let [batch, width] = input.dims();
    norm.forward(input.reshape([batch, width, 1]))
        .reshape([batch, width])
}
