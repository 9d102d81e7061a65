//! Learned metadata fusion modules.
//!
//! Both modules work on a folded view of the flat backbone features,
//! `[batch, channels, spatial, k]`, and return a map of the same shape.

use burn::module::Module;
use burn::nn;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::activation::{relu, sigmoid, tanh};

use crate::error::{ModelError, Result};
use crate::reducer::batch_norm_1d;
use crate::strategy::{BLOCK_SPATIAL, BlockParams, NETWORK_SPATIAL, NetworkParams};

/// Linear projection of metadata followed by a batch norm.
#[derive(Debug, Module)]
pub struct MetaProjection<B: Backend> {
    pub(crate) linear: nn::Linear<B>,
    norm: nn::BatchNorm<B>,
}

impl<B: Backend> MetaProjection<B> {
    fn new(metadata_width: usize, channels: usize, device: &B::Device) -> Self {
        Self {
            linear: nn::LinearConfig::new(metadata_width, channels).init(device),
            norm: nn::BatchNormConfig::new(channels).init(device),
        }
    }

    fn forward(&self, metadata: Tensor<B, 2>) -> Tensor<B, 2> {
        batch_norm_1d(&self.norm, self.linear.forward(metadata))
    }
}

/// Metadata-conditioned channel gating.
///
/// Each channel `v` of the feature map becomes
/// `sigmoid(tanh(v * f(m)) + g(m))`, with `f` and `g` per-channel
/// projections of the metadata `m`.
#[derive(Debug, Module)]
pub struct MetaBlock<B: Backend> {
    pub(crate) scale: MetaProjection<B>,
    pub(crate) shift: MetaProjection<B>,
    #[module(skip)]
    channels: usize,
}

impl<B: Backend> MetaBlock<B> {
    /// Creates a new block fusion module.
    #[must_use]
    pub fn new(params: BlockParams, device: &B::Device) -> Self {
        Self {
            scale: MetaProjection::new(params.metadata_width, params.channels, device),
            shift: MetaProjection::new(params.metadata_width, params.channels, device),
            channels: params.channels,
        }
    }

    /// Gates `features` (`[batch, channels, h, w]`) with `metadata` (`[batch, m]`).
    pub fn forward(&self, features: Tensor<B, 4>, metadata: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, channels, _, _] = features.dims();
        let scale = self
            .scale
            .forward(metadata.clone())
            .reshape([batch, channels, 1, 1]);
        let shift = self.shift.forward(metadata).reshape([batch, channels, 1, 1]);

        sigmoid(tanh(features * scale) + shift)
    }

    /// Number of feature-map channels.
    #[must_use]
    pub const fn channels(&self) -> usize {
        self.channels
    }
}

/// Metadata network producing a multiplicative channel mask.
///
/// Metadata `[batch, m]` is viewed as `[batch, m, 1, 1]` and passed through
/// 1x1 conv -> `ReLU` -> 1x1 conv -> sigmoid; the resulting
/// `[batch, channels, 1, 1]` mask scales the feature map.
#[derive(Debug, Module)]
pub struct MetaNet<B: Backend> {
    pub(crate) expand: Conv2d<B>,
    pub(crate) project: Conv2d<B>,
    #[module(skip)]
    channels: usize,
}

impl<B: Backend> MetaNet<B> {
    /// Creates a new network fusion module.
    #[must_use]
    pub fn new(params: NetworkParams, device: &B::Device) -> Self {
        Self {
            expand: Conv2dConfig::new([params.metadata_width, params.hidden_width], [1, 1])
                .init(device),
            project: Conv2dConfig::new([params.hidden_width, params.channels], [1, 1])
                .init(device),
            channels: params.channels,
        }
    }

    /// Masks `features` (`[batch, channels, h, w]`) with a mask computed from `metadata`.
    pub fn forward(&self, features: Tensor<B, 4>, metadata: Tensor<B, 2>) -> Tensor<B, 4> {
        let [batch, width] = metadata.dims();
        let x = metadata.reshape([batch, width, 1, 1]);
        let x = relu(self.expand.forward(x));
        let mask = sigmoid(self.project.forward(x));

        features * mask
    }

    /// Number of feature-map channels.
    #[must_use]
    pub const fn channels(&self) -> usize {
        self.channels
    }
}

/// The learned fusion module of a block or network strategy.
#[derive(Debug, Module)]
pub enum FusionModule<B: Backend> {
    /// Channel gating.
    Block(MetaBlock<B>),

    /// Metadata network.
    Network(MetaNet<B>),
}

impl<B: Backend> FusionModule<B> {
    /// Fixed spatial height of the folded view.
    #[must_use]
    pub const fn spatial(&self) -> usize {
        match self {
            Self::Block(_) => BLOCK_SPATIAL,
            Self::Network(_) => NETWORK_SPATIAL,
        }
    }

    /// Channels of the folded view.
    #[must_use]
    pub const fn channels(&self) -> usize {
        match self {
            Self::Block(block) => block.channels(),
            Self::Network(net) => net.channels(),
        }
    }

    /// Folds flat features `[batch, width]` into `[batch, channels, spatial, k]`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::ShapeMismatch`] if `width` is not a multiple of
    /// `channels * spatial`, or [`ModelError::InvalidConfig`] if that product
    /// overflows.
    pub fn fold(&self, flat: Tensor<B, 2>) -> Result<Tensor<B, 4>> {
        let [batch, width] = flat.dims();
        let (channels, spatial) = (self.channels(), self.spatial());
        let cell = channels.checked_mul(spatial).ok_or_else(|| {
            ModelError::invalid_config(format!(
                "{channels} channels x {spatial} rows overflows the fold target"
            ))
        })?;
        if width == 0 || width % cell != 0 {
            return Err(ModelError::shape_mismatch(
                "fusion fold",
                format!("[{batch}, {channels}, {spatial}, k] with k > 0"),
                format!("[{batch}, {width}]"),
            ));
        }
        Ok(flat.reshape([batch, channels, spatial, width / cell]))
    }

    /// Combines a folded feature map with float metadata.
    pub fn combine(&self, features: Tensor<B, 4>, metadata: Tensor<B, 2>) -> Tensor<B, 4> {
        match self {
            Self::Block(block) => block.forward(features, metadata),
            Self::Network(net) => net.forward(features, metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn device() -> <TestBackend as Backend>::Device {
        <TestBackend as Backend>::Device::default()
    }

    #[test]
    fn meta_block_keeps_shape_and_range() {
        let device = device();
        let block = MetaBlock::<TestBackend>::new(BlockParams::new(64, 12), &device);
        assert_eq!(block.channels(), 64);

        let features = Tensor::<TestBackend, 4>::random(
            [2, 64, 32, 1],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let metadata = Tensor::<TestBackend, 2>::random([2, 12], Distribution::Default, &device);
        let output = block.forward(features, metadata);
        assert_eq!(output.dims(), [2, 64, 32, 1]);

        let values = output.into_data().to_vec::<f32>().unwrap_or_default();
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn meta_net_keeps_shape() {
        let device = device();
        let net = MetaNet::<TestBackend>::new(NetworkParams::with_defaults(5), &device);
        assert_eq!(net.channels(), 32);

        let features = Tensor::<TestBackend, 4>::ones([3, 32, 8, 8], &device);
        let metadata = Tensor::<TestBackend, 2>::random([3, 5], Distribution::Default, &device);
        let output = net.forward(features, metadata);
        assert_eq!(output.dims(), [3, 32, 8, 8]);

        // Mask is a sigmoid, so scaling ones stays in (0, 1].
        let values = output.into_data().to_vec::<f32>().unwrap_or_default();
        assert!(values.iter().all(|v| *v > 0.0 && *v <= 1.0));
    }

    #[test]
    fn fusion_module_fold() {
        let device = device();
        let module =
            FusionModule::Block(MetaBlock::<TestBackend>::new(BlockParams::new(64, 12), &device));
        assert_eq!(module.spatial(), BLOCK_SPATIAL);

        let folded = module.fold(Tensor::zeros([2, 4096], &device));
        assert_eq!(folded.ok().map(|t| t.dims()), Some([2, 64, 32, 2]));

        let err = module.fold(Tensor::zeros([2, 3000], &device));
        assert!(err.is_err_and(|e| e.is_shape()));
    }

    #[test]
    fn fusion_module_network_fold() {
        let device = device();
        let module = FusionModule::Network(MetaNet::<TestBackend>::new(
            NetworkParams::with_defaults(5),
            &device,
        ));
        assert_eq!(module.channels(), 32);
        assert_eq!(module.spatial(), NETWORK_SPATIAL);

        let folded = module.fold(Tensor::zeros([1, 2048], &device));
        assert_eq!(folded.ok().map(|t| t.dims()), Some([1, 32, 8, 8]));
    }

    #[test]
    fn fusion_module_combine_dispatches() {
        let device = device();
        let module =
            FusionModule::Block(MetaBlock::<TestBackend>::new(BlockParams::new(8, 3), &device));
        let features = Tensor::<TestBackend, 4>::zeros([2, 8, 32, 1], &device);
        let metadata = Tensor::<TestBackend, 2>::zeros([2, 3], &device);

        // With zero features every gate is sigmoid(g(m)), constant over the
        // spatial axes of each channel.
        let values = module
            .combine(features, metadata)
            .into_data()
            .to_vec::<f32>()
            .unwrap_or_default();
        assert_eq!(values.len(), 2 * 8 * 32);
        for channel in values.chunks(32) {
            assert!(channel.iter().all(|v| (v - channel[0]).abs() < 1e-6));
            assert!(channel[0] > 0.0 && channel[0] < 1.0);
        }
    }
}
