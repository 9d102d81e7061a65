//! Image classifiers that fuse backbone features with per-sample metadata.
//!
//! A [`FusionClassifier`] wraps a convolutional [`Backbone`] and appends a
//! head whose structure is selected by configuration:
//!
//! - **none**: backbone features only, metadata is rejected
//! - **concat**: metadata is appended to the (reduced) features
//! - **block**: metadata gates each feature channel ([`MetaBlock`])
//! - **network**: a small metadata network masks the features ([`MetaNet`])
//!
//! An optional reducer block (Linear, `BatchNorm`, `ReLU`, Dropout) sits between
//! the fused features and the linear classifier.
//!
//! # Configuration
//!
//! [`FusionClassifierConfig`] is serde-serializable and validated once, at
//! construction, into a [`FusionStrategy`]. Invalid combinations fail with
//! [`ModelError::InvalidConfig`] before any layer is built.
//!
//! # Observation
//!
//! Intermediate activations can be inspected through
//! [`FusionClassifier::forward_observed`] and a [`StageObserver`], such as
//! [`ActivationRecorder`].
//!
//! # Checkpoints
//!
//! [`save_checkpoint`] writes the backbone record, the head record and the
//! configuration; [`load_checkpoint`] rebuilds the model from them.
//!
//! # Example
//!
//! ```ignore
//! use ml_fusion::prelude::*;
//!
//! let backbone = ConvBackbone::new(ConvBackboneConfig::default(), &device);
//! let config = FusionClassifierConfig::new(3).with_fusion(FusionMethod::Concat, 10);
//! let model = FusionClassifier::new(backbone, config, &device)?;
//!
//! let logits = model.forward(images, Some(metadata.into()))?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod backbone;
mod checkpoint;
mod classifier;
mod config;
mod error;
mod fusion;
mod metadata;
mod observe;
mod reducer;
mod strategy;

// Re-export model types
pub use backbone::{Backbone, ConvBackbone, ConvBackboneConfig};
pub use classifier::{FusionClassifier, FusionHead};
pub use fusion::{FusionModule, MetaBlock, MetaNet, MetaProjection};
pub use reducer::{ReducerBlock, ReducerBlockConfig};

// Re-export configuration
pub use config::{
    ConfigWarning, DEFAULT_BACKBONE_FEATURE_WIDTH, DEFAULT_DROPOUT_PROB, DEFAULT_REDUCER_WIDTH,
    FusionClassifierConfig, FusionConfigValue, FusionMethod,
};
pub use strategy::{
    BLOCK_SPATIAL, BlockParams, DEFAULT_BLOCK_CHANNELS, DEFAULT_NETWORK_CHANNELS,
    DEFAULT_NETWORK_HIDDEN, FusionStrategy, NETWORK_SPATIAL, NetworkParams,
};

// Re-export inputs and observation
pub use metadata::Metadata;
pub use observe::{Activation, ActivationRecorder, NoopObserver, Stage, StageObserver};

// Re-export checkpoint utilities
pub use checkpoint::{CheckpointFormat, CheckpointPaths, load_checkpoint, save_checkpoint};

// Re-export error types
pub use error::{ModelError, Result};

/// Prelude for convenient imports.
pub mod prelude {
    pub use super::{
        ActivationRecorder, Backbone, CheckpointFormat, ConvBackbone, ConvBackboneConfig,
        FusionClassifier, FusionClassifierConfig, FusionMethod, FusionStrategy, Metadata,
        ModelError, Stage, StageObserver, load_checkpoint, save_checkpoint,
    };
}
