//! Fusion strategy selection.
//!
//! A `(method, config)` pair is resolved exactly once into a [`FusionStrategy`].
//! Everything downstream matches on the strategy and never looks at the raw
//! config again.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{FusionConfigValue, FusionMethod};
use crate::error::{ModelError, Result};

/// Fixed spatial height the block fusion reshapes feature maps to.
pub const BLOCK_SPATIAL: usize = 32;

/// Fixed spatial height the network fusion reshapes feature maps to.
pub const NETWORK_SPATIAL: usize = 8;

/// Feature-map channels assumed by block fusion when only the metadata width
/// is configured. Matches a 2048-wide backbone reshaped to `64 x 32`.
pub const DEFAULT_BLOCK_CHANNELS: usize = 64;

/// Hidden width of the network fusion when only the metadata width is given.
pub const DEFAULT_NETWORK_HIDDEN: usize = 64;

/// Feature-map channels assumed by network fusion when only the metadata
/// width is configured. Matches a 2048-wide backbone reshaped to `32 x 8 x 8`.
pub const DEFAULT_NETWORK_CHANNELS: usize = 32;

/// Parameters of the block (gated) fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockParams {
    /// Feature-map channels the flat features are folded into.
    pub channels: usize,

    /// Width of the metadata vector.
    pub metadata_width: usize,
}

impl BlockParams {
    /// Creates block parameters with an explicit channel count.
    #[must_use]
    pub const fn new(channels: usize, metadata_width: usize) -> Self {
        Self {
            channels,
            metadata_width,
        }
    }

    /// Creates block parameters using [`DEFAULT_BLOCK_CHANNELS`].
    #[must_use]
    pub const fn with_default_channels(metadata_width: usize) -> Self {
        Self::new(DEFAULT_BLOCK_CHANNELS, metadata_width)
    }
}

/// Parameters of the network (metadata-conditioned 1x1 conv) fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkParams {
    /// Width of the metadata vector.
    pub metadata_width: usize,

    /// Hidden channels of the metadata network.
    pub hidden_width: usize,

    /// Feature-map channels, also the output channels of the metadata network.
    pub channels: usize,
}

impl NetworkParams {
    /// Creates network parameters.
    #[must_use]
    pub const fn new(metadata_width: usize, hidden_width: usize, channels: usize) -> Self {
        Self {
            metadata_width,
            hidden_width,
            channels,
        }
    }

    /// Creates network parameters using the default hidden width and channels.
    #[must_use]
    pub const fn with_defaults(metadata_width: usize) -> Self {
        Self::new(
            metadata_width,
            DEFAULT_NETWORK_HIDDEN,
            DEFAULT_NETWORK_CHANNELS,
        )
    }
}

/// The resolved way visual features and metadata are combined.
///
/// # Example
///
/// ```
/// use ml_fusion::{FusionConfigValue, FusionMethod, FusionStrategy, NetworkParams};
///
/// let strategy = FusionStrategy::resolve(
///     Some(FusionMethod::Network),
///     Some(&FusionConfigValue::Scalar(5)),
///     2048,
/// )
/// .unwrap();
/// assert_eq!(strategy, FusionStrategy::Network(NetworkParams::new(5, 64, 32)));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FusionStrategy {
    /// Image-only classification; metadata is rejected.
    #[default]
    None,

    /// Metadata appended to the (reduced) feature vector before the head.
    Concat {
        /// Width of the metadata vector.
        metadata_width: usize,
    },

    /// Channel-wise gating conditioned on metadata.
    Block(BlockParams),

    /// Metadata network producing a multiplicative channel mask.
    Network(NetworkParams),
}

impl FusionStrategy {
    /// Resolves a fusion method and its raw config into a strategy.
    ///
    /// `backbone_feature_width` is the flattened width the backbone produces;
    /// block and network fusion require it to fold into
    /// `[channels, spatial, k]` for a whole `k`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] if the config is missing, has the
    /// wrong shape for the method, contains zero dimensions, or the backbone
    /// width cannot be folded into the reshape target.
    pub fn resolve(
        method: Option<FusionMethod>,
        config: Option<&FusionConfigValue>,
        backbone_feature_width: usize,
    ) -> Result<Self> {
        let method = match method {
            None | Some(FusionMethod::None) => return Ok(Self::None),
            Some(method) => method,
        };

        let config = config.ok_or_else(|| {
            ModelError::invalid_config(format!(
                "fusion_config must be defined since fusion_method is '{method}'"
            ))
        })?;

        let strategy = match (method, config) {
            (FusionMethod::Concat, FusionConfigValue::Scalar(width)) => Self::Concat {
                metadata_width: *width,
            },
            (FusionMethod::Concat, FusionConfigValue::List(_)) => {
                return Err(ModelError::invalid_config(
                    "fusion_config must be a single metadata width for 'concat'",
                ));
            }
            (FusionMethod::Block, FusionConfigValue::Scalar(width)) => {
                Self::Block(BlockParams::with_default_channels(*width))
            }
            (FusionMethod::Block, FusionConfigValue::List(values)) => match values.as_slice() {
                [channels, width] => Self::Block(BlockParams::new(*channels, *width)),
                other => {
                    return Err(ModelError::invalid_config(format!(
                        "fusion_config for 'block' must be [channels, metadata_width], got {} values",
                        other.len()
                    )));
                }
            },
            (FusionMethod::Network, FusionConfigValue::Scalar(width)) => {
                Self::Network(NetworkParams::with_defaults(*width))
            }
            (FusionMethod::Network, FusionConfigValue::List(values)) => match values.as_slice() {
                [width, hidden, channels] => {
                    Self::Network(NetworkParams::new(*width, *hidden, *channels))
                }
                other => {
                    return Err(ModelError::invalid_config(format!(
                        "fusion_config for 'network' must be [metadata_width, hidden_width, channels], got {} values",
                        other.len()
                    )));
                }
            },
            (FusionMethod::None, _) => Self::None,
        };

        strategy.check_dimensions()?;
        strategy.check_layout(backbone_feature_width)?;
        Ok(strategy)
    }

    /// Short lowercase name of the strategy.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Concat { .. } => "concat",
            Self::Block(_) => "block",
            Self::Network(_) => "network",
        }
    }

    /// Returns `true` unless this is [`FusionStrategy::None`].
    #[must_use]
    pub const fn uses_metadata(&self) -> bool {
        !matches!(self, Self::None)
    }

    /// Metadata width the strategy expects, if any.
    #[must_use]
    pub const fn metadata_width(&self) -> Option<usize> {
        match self {
            Self::None => None,
            Self::Concat { metadata_width } => Some(*metadata_width),
            Self::Block(params) => Some(params.metadata_width),
            Self::Network(params) => Some(params.metadata_width),
        }
    }

    /// Extra classifier inputs contributed by the strategy.
    ///
    /// Only concat widens the classifier head.
    #[must_use]
    pub const fn concat_width(&self) -> usize {
        match self {
            Self::Concat { metadata_width } => *metadata_width,
            _ => 0,
        }
    }

    /// `(channels, spatial)` reshape target for the learned fusions.
    #[must_use]
    pub const fn fold(&self) -> Option<(usize, usize)> {
        match self {
            Self::Block(params) => Some((params.channels, BLOCK_SPATIAL)),
            Self::Network(params) => Some((params.channels, NETWORK_SPATIAL)),
            Self::None | Self::Concat { .. } => None,
        }
    }

    /// Checks that metadata presence matches the strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::MetadataContract`] if metadata is passed without
    /// a combination method, or omitted when one is configured.
    pub fn check_metadata(&self, present: bool) -> Result<()> {
        match (self.uses_metadata(), present) {
            (false, true) => Err(ModelError::unexpected_metadata()),
            (true, false) => Err(ModelError::missing_metadata(self.name())),
            _ => Ok(()),
        }
    }

    fn check_dimensions(&self) -> Result<()> {
        let zero = match self {
            Self::None => None,
            Self::Concat { metadata_width } => (*metadata_width == 0).then_some("metadata_width"),
            Self::Block(params) => {
                if params.channels == 0 {
                    Some("channels")
                } else if params.metadata_width == 0 {
                    Some("metadata_width")
                } else {
                    None
                }
            }
            Self::Network(params) => {
                if params.metadata_width == 0 {
                    Some("metadata_width")
                } else if params.hidden_width == 0 {
                    Some("hidden_width")
                } else if params.channels == 0 {
                    Some("channels")
                } else {
                    None
                }
            }
        };

        match zero {
            Some(field) => Err(ModelError::invalid_config(format!(
                "{field} must be > 0 for '{}' fusion",
                self.name()
            ))),
            None => Ok(()),
        }
    }

    fn check_layout(&self, backbone_feature_width: usize) -> Result<()> {
        let Some((channels, spatial)) = self.fold() else {
            return Ok(());
        };
        let cell = channels.checked_mul(spatial).ok_or_else(|| {
            ModelError::invalid_config(format!(
                "{channels} channels x {spatial} rows overflows for '{}' fusion",
                self.name()
            ))
        })?;
        if backbone_feature_width < cell || backbone_feature_width % cell != 0 {
            return Err(ModelError::invalid_config(format!(
                "backbone_feature_width {backbone_feature_width} cannot be folded into \
                 [{channels}, {spatial}, k] for '{}' fusion",
                self.name()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for FusionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Concat { metadata_width } => write!(f, "concat(metadata={metadata_width})"),
            Self::Block(p) => write!(
                f,
                "block(channels={}, metadata={})",
                p.channels, p.metadata_width
            ),
            Self::Network(p) => write!(
                f,
                "network(metadata={}, hidden={}, channels={})",
                p.metadata_width, p.hidden_width, p.channels
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(method: FusionMethod, config: FusionConfigValue) -> Result<FusionStrategy> {
        FusionStrategy::resolve(Some(method), Some(&config), 2048)
    }

    #[test]
    fn no_method_ignores_config() {
        let strategy =
            FusionStrategy::resolve(None, Some(&FusionConfigValue::List(vec![1, 2, 3])), 2048);
        assert_eq!(strategy.ok(), Some(FusionStrategy::None));

        let strategy = FusionStrategy::resolve(Some(FusionMethod::None), None, 2048);
        assert_eq!(strategy.ok(), Some(FusionStrategy::None));
    }

    #[test]
    fn method_without_config_fails() {
        for method in [FusionMethod::Concat, FusionMethod::Block, FusionMethod::Network] {
            let err = FusionStrategy::resolve(Some(method), None, 2048);
            assert!(matches!(err, Err(ModelError::InvalidConfig(_))), "{method}");
        }
    }

    #[test]
    fn concat_scalar() {
        let strategy = resolve(FusionMethod::Concat, FusionConfigValue::Scalar(10));
        assert_eq!(
            strategy.ok(),
            Some(FusionStrategy::Concat { metadata_width: 10 })
        );
    }

    #[test]
    fn concat_rejects_list() {
        let err = resolve(FusionMethod::Concat, FusionConfigValue::List(vec![10]));
        assert!(matches!(err, Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn block_scalar_defaults_channels() {
        let strategy = resolve(FusionMethod::Block, FusionConfigValue::Scalar(12));
        assert_eq!(
            strategy.ok(),
            Some(FusionStrategy::Block(BlockParams::new(64, 12)))
        );
    }

    #[test]
    fn block_pair_sets_channels() {
        let strategy = resolve(FusionMethod::Block, FusionConfigValue::List(vec![32, 12]));
        assert_eq!(
            strategy.ok(),
            Some(FusionStrategy::Block(BlockParams::new(32, 12)))
        );
    }

    #[test]
    fn block_wrong_arity() {
        for values in [vec![], vec![64], vec![64, 12, 3]] {
            let err = resolve(FusionMethod::Block, FusionConfigValue::List(values));
            assert!(matches!(err, Err(ModelError::InvalidConfig(_))));
        }
    }

    #[test]
    fn network_scalar_defaults() {
        let strategy = resolve(FusionMethod::Network, FusionConfigValue::Scalar(5));
        assert_eq!(
            strategy.ok(),
            Some(FusionStrategy::Network(NetworkParams::new(5, 64, 32)))
        );
    }

    #[test]
    fn network_triple() {
        let strategy = resolve(
            FusionMethod::Network,
            FusionConfigValue::List(vec![7, 16, 64]),
        );
        assert_eq!(
            strategy.ok(),
            Some(FusionStrategy::Network(NetworkParams::new(7, 16, 64)))
        );
    }

    #[test]
    fn network_wrong_arity() {
        let err = resolve(FusionMethod::Network, FusionConfigValue::List(vec![7, 16]));
        assert!(matches!(err, Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn zero_dimensions_rejected() {
        let err = resolve(FusionMethod::Concat, FusionConfigValue::Scalar(0));
        assert!(matches!(err, Err(ModelError::InvalidConfig(_))));

        let err = resolve(FusionMethod::Block, FusionConfigValue::List(vec![0, 4]));
        assert!(matches!(err, Err(ModelError::InvalidConfig(_))));

        let err = resolve(
            FusionMethod::Network,
            FusionConfigValue::List(vec![4, 0, 32]),
        );
        assert!(matches!(err, Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn layout_must_fold_backbone_width() {
        // 64 * 32 = 2048 divides 2048 and 4096 but not 3000.
        let config = FusionConfigValue::Scalar(12);
        assert!(FusionStrategy::resolve(Some(FusionMethod::Block), Some(&config), 4096).is_ok());
        let err = FusionStrategy::resolve(Some(FusionMethod::Block), Some(&config), 3000);
        assert!(matches!(err, Err(ModelError::InvalidConfig(_))));

        // 32 * 8 = 256 divides 2048 but 2048 is too small for 512 channels.
        let err = FusionStrategy::resolve(
            Some(FusionMethod::Network),
            Some(&FusionConfigValue::List(vec![5, 64, 512])),
            2048,
        );
        assert!(matches!(err, Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn oversized_channels_are_a_config_error() {
        let err = resolve(
            FusionMethod::Block,
            FusionConfigValue::List(vec![usize::MAX / 2, 3]),
        );
        assert!(matches!(err, Err(ModelError::InvalidConfig(_))));

        let err = resolve(
            FusionMethod::Network,
            FusionConfigValue::List(vec![3, 64, usize::MAX / 4]),
        );
        assert!(matches!(err, Err(ModelError::InvalidConfig(_))));
    }

    #[test]
    fn concat_and_none_skip_layout_check() {
        let config = FusionConfigValue::Scalar(3);
        assert!(FusionStrategy::resolve(Some(FusionMethod::Concat), Some(&config), 1000).is_ok());
        assert!(FusionStrategy::resolve(None, None, 1000).is_ok());
    }

    #[test]
    fn metadata_contract() {
        assert!(FusionStrategy::None.check_metadata(false).is_ok());
        assert!(
            FusionStrategy::None
                .check_metadata(true)
                .is_err_and(|e| e.is_contract())
        );

        let concat = FusionStrategy::Concat { metadata_width: 4 };
        assert!(concat.check_metadata(true).is_ok());
        assert!(concat.check_metadata(false).is_err_and(|e| e.is_contract()));
    }

    #[test]
    fn accessors() {
        let concat = FusionStrategy::Concat { metadata_width: 10 };
        assert_eq!(concat.concat_width(), 10);
        assert_eq!(concat.metadata_width(), Some(10));
        assert_eq!(concat.fold(), None);

        let block = FusionStrategy::Block(BlockParams::new(64, 12));
        assert_eq!(block.concat_width(), 0);
        assert_eq!(block.fold(), Some((64, BLOCK_SPATIAL)));

        let network = FusionStrategy::Network(NetworkParams::with_defaults(5));
        assert_eq!(network.fold(), Some((32, NETWORK_SPATIAL)));
        assert_eq!(FusionStrategy::None.metadata_width(), None);
    }

    #[test]
    fn display_and_name() {
        assert_eq!(FusionStrategy::None.to_string(), "none");
        assert_eq!(
            FusionStrategy::Block(BlockParams::new(64, 12)).to_string(),
            "block(channels=64, metadata=12)"
        );
        assert_eq!(
            FusionStrategy::Network(NetworkParams::with_defaults(5)).name(),
            "network"
        );
    }

    #[test]
    fn strategy_serialization() {
        let strategy = FusionStrategy::Network(NetworkParams::new(5, 64, 32));
        let json = serde_json::to_string(&strategy).unwrap_or_default();
        assert!(json.contains("\"kind\":\"network\""));

        let parsed: std::result::Result<FusionStrategy, _> = serde_json::from_str(&json);
        assert_eq!(parsed.ok(), Some(strategy));
    }
}
