//! Per-sample tabular metadata accompanying an image batch.

use burn::prelude::Backend;
use burn::tensor::{Int, Tensor};

/// Metadata batch of shape `[batch, metadata_width]`.
///
/// Integer metadata (e.g. encoded categorical attributes) is accepted and
/// cast to float before it reaches any fusion module.
#[derive(Debug, Clone)]
pub enum Metadata<B: Backend> {
    /// Floating-point metadata.
    Float(Tensor<B, 2>),

    /// Integer metadata.
    Int(Tensor<B, 2, Int>),
}

impl<B: Backend> Metadata<B> {
    /// Returns `[batch, metadata_width]`.
    #[must_use]
    pub fn dims(&self) -> [usize; 2] {
        match self {
            Self::Float(tensor) => tensor.dims(),
            Self::Int(tensor) => tensor.dims(),
        }
    }

    /// Converts into a float tensor.
    #[must_use]
    pub fn into_float(self) -> Tensor<B, 2> {
        match self {
            Self::Float(tensor) => tensor,
            Self::Int(tensor) => tensor.float(),
        }
    }
}

impl<B: Backend> From<Tensor<B, 2>> for Metadata<B> {
    fn from(tensor: Tensor<B, 2>) -> Self {
        Self::Float(tensor)
    }
}

impl<B: Backend> From<Tensor<B, 2, Int>> for Metadata<B> {
    fn from(tensor: Tensor<B, 2, Int>) -> Self {
        Self::Int(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn float_metadata_passes_through() {
        let device = <TestBackend as Backend>::Device::default();
        let tensor = Tensor::<TestBackend, 2>::ones([2, 3], &device);
        let metadata = Metadata::from(tensor);

        assert_eq!(metadata.dims(), [2, 3]);
        let values = metadata.into_float().into_data().to_vec::<f32>().unwrap_or_default();
        assert_eq!(values, vec![1.0; 6]);
    }

    #[test]
    fn int_metadata_is_cast() {
        let device = <TestBackend as Backend>::Device::default();
        let tensor = Tensor::<TestBackend, 1, Int>::arange(0..4, &device).reshape([2, 2]);
        let metadata = Metadata::from(tensor);
        assert!(matches!(metadata, Metadata::Int(_)));
        assert_eq!(metadata.dims(), [2, 2]);

        let values = metadata.into_float().into_data().to_vec::<f32>().unwrap_or_default();
        assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0]);
    }
}
