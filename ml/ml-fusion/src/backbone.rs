//! Backbone feature extractors.
//!
//! The classifier is generic over any Burn module implementing [`Backbone`];
//! pretrained extractors are supplied by the caller. [`ConvBackbone`] is a
//! small reference extractor whose default output matches the default
//! `backbone_feature_width` of 2048.

use burn::module::Module;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};

/// A convolutional feature extractor.
///
/// Maps an image batch `[batch, channels, height, width]` to a spatial
/// feature volume `[batch, c, h, w]`. The classifier flattens the volume and
/// requires `c * h * w` to equal its configured `backbone_feature_width`.
pub trait Backbone<B: Backend>: Module<B> {
    /// Extracts the feature volume for `images`.
    fn extract(&self, images: Tensor<B, 4>) -> Tensor<B, 4>;
}

/// Configuration for [`ConvBackbone`].
///
/// # Example
///
/// ```
/// use ml_fusion::ConvBackboneConfig;
///
/// let config = ConvBackboneConfig::default();
/// assert_eq!(config.feature_width(), 2048);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvBackboneConfig {
    /// Image channels (3 for RGB).
    pub in_channels: usize,

    /// Output feature channels.
    pub channels: usize,

    /// Side of the pooled output grid.
    pub pooled: usize,
}

impl Default for ConvBackboneConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            channels: 32,
            pooled: 8,
        }
    }
}

impl ConvBackboneConfig {
    /// Creates a configuration for RGB input.
    #[must_use]
    pub const fn new(channels: usize, pooled: usize) -> Self {
        Self {
            in_channels: 3,
            channels,
            pooled,
        }
    }

    /// Sets the number of image channels.
    #[must_use]
    pub const fn with_in_channels(mut self, in_channels: usize) -> Self {
        self.in_channels = in_channels;
        self
    }

    /// Flattened width of the output volume.
    #[must_use]
    pub const fn feature_width(&self) -> usize {
        self.channels * self.pooled * self.pooled
    }
}

/// Reference backbone: 3x3 conv (stride 2) -> `ReLU` -> adaptive average pool.
#[derive(Debug, Module)]
pub struct ConvBackbone<B: Backend> {
    pub(crate) conv: Conv2d<B>,
    pool: AdaptiveAvgPool2d,
}

impl<B: Backend> ConvBackbone<B> {
    /// Creates a new backbone.
    #[must_use]
    pub fn new(config: ConvBackboneConfig, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([config.in_channels, config.channels], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let pool = AdaptiveAvgPool2dConfig::new([config.pooled, config.pooled]).init();
        Self { conv, pool }
    }
}

impl<B: Backend> Backbone<B> for ConvBackbone<B> {
    fn extract(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.conv.forward(images));
        self.pool.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn config_default() {
        let config = ConvBackboneConfig::default();
        assert_eq!(config.in_channels, 3);
        assert_eq!(config.channels, 32);
        assert_eq!(config.pooled, 8);
        assert_eq!(config.feature_width(), 2048);
    }

    #[test]
    fn config_builder() {
        let config = ConvBackboneConfig::new(64, 8).with_in_channels(1);
        assert_eq!(config.in_channels, 1);
        assert_eq!(config.feature_width(), 4096);
    }

    #[test]
    fn config_serialization() {
        let config = ConvBackboneConfig::new(16, 4);
        let json = serde_json::to_string(&config).unwrap_or_default();
        let parsed: Result<ConvBackboneConfig, _> = serde_json::from_str(&json);
        assert_eq!(parsed.ok(), Some(config));
    }

    #[test]
    fn extract_shape() {
        let device = <TestBackend as Backend>::Device::default();
        let backbone = ConvBackbone::<TestBackend>::new(ConvBackboneConfig::default(), &device);

        let images =
            Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Default, &device);
        let features = backbone.extract(images);
        assert_eq!(features.dims(), [2, 32, 8, 8]);
    }

    #[test]
    fn extract_shape_independent_of_image_size() {
        let device = <TestBackend as Backend>::Device::default();
        let backbone = ConvBackbone::<TestBackend>::new(ConvBackboneConfig::new(8, 4), &device);

        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 50, 30], &device);
        assert_eq!(backbone.extract(images).dims(), [1, 8, 4, 4]);
    }
}
