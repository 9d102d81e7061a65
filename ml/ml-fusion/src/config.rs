//! Configuration for the fusion classifier.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::strategy::FusionStrategy;

/// Default width of the reducer block.
pub const DEFAULT_REDUCER_WIDTH: usize = 256;

/// Default dropout probability of the reducer block.
pub const DEFAULT_DROPOUT_PROB: f64 = 0.5;

/// Default flattened width of the backbone output (e.g. a `ResNet`-50 without
/// its pooling/fc stages reshaped to 2048 features).
pub const DEFAULT_BACKBONE_FEATURE_WIDTH: usize = 2048;

/// How metadata is combined with visual features.
///
/// Parses case-insensitively; `metablock` and `metanet` are accepted as
/// aliases of [`FusionMethod::Block`] and [`FusionMethod::Network`].
///
/// # Example
///
/// ```
/// use ml_fusion::FusionMethod;
///
/// let method: FusionMethod = "MetaBlock".parse().unwrap();
/// assert_eq!(method, FusionMethod::Block);
/// assert!("stack".parse::<FusionMethod>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FusionMethod {
    /// No fusion; equivalent to leaving the method unset.
    None,

    /// Concatenate metadata to the reduced feature vector.
    Concat,

    /// Metadata-conditioned channel gating.
    #[serde(alias = "metablock")]
    Block,

    /// Metadata network producing a channel mask.
    #[serde(alias = "metanet")]
    Network,
}

impl FusionMethod {
    /// Returns the canonical method name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Concat => "concat",
            Self::Block => "block",
            Self::Network => "network",
        }
    }
}

impl fmt::Display for FusionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for FusionMethod {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "concat" => Ok(Self::Concat),
            "block" | "metablock" => Ok(Self::Block),
            "network" | "metanet" => Ok(Self::Network),
            other => Err(ModelError::invalid_config(format!(
                "there is no fusion method called '{other}'"
            ))),
        }
    }
}

/// Raw fusion config: a single metadata width or an ordered list of sizes.
///
/// The meaning depends on the [`FusionMethod`]; it is interpreted once by
/// [`FusionStrategy::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FusionConfigValue {
    /// A single integer, the metadata width.
    Scalar(usize),

    /// An ordered list of sizes.
    List(Vec<usize>),
}

impl From<usize> for FusionConfigValue {
    fn from(value: usize) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<usize>> for FusionConfigValue {
    fn from(values: Vec<usize>) -> Self {
        Self::List(values)
    }
}

impl<const N: usize> From<[usize; N]> for FusionConfigValue {
    fn from(values: [usize; N]) -> Self {
        Self::List(values.to_vec())
    }
}

/// Non-fatal configuration findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigWarning {
    /// Concat fusion without a reducer block: raw backbone magnitudes are
    /// concatenated with metadata unnormalized.
    ConcatWithoutReducer,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConcatWithoutReducer => write!(
                f,
                "concat fusion with reducer_width=0 concatenates unreduced backbone features \
                 with raw metadata"
            ),
        }
    }
}

/// Configuration for [`FusionClassifier`](crate::FusionClassifier).
///
/// # Example
///
/// ```
/// use ml_fusion::{FusionClassifierConfig, FusionMethod};
///
/// let config = FusionClassifierConfig::new(3)
///     .with_fusion(FusionMethod::Concat, 10)
///     .with_reducer_width(128);
/// assert_eq!(config.classifier_input_width().unwrap(), 138);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionClassifierConfig {
    /// Number of output classes.
    pub num_classes: usize,

    /// Reducer output width (0 disables the reducer block).
    #[serde(default = "default_reducer_width")]
    pub reducer_width: usize,

    /// Dropout probability inside the reducer block.
    #[serde(default = "default_dropout_prob")]
    pub dropout_prob: f64,

    /// Disable gradients for every backbone parameter.
    #[serde(default)]
    pub freeze_backbone: bool,

    /// Flattened width of the backbone output.
    #[serde(default = "default_backbone_feature_width")]
    pub backbone_feature_width: usize,

    /// Fusion method (`None` means image-only).
    #[serde(default)]
    pub fusion_method: Option<FusionMethod>,

    /// Raw config for the fusion method; ignored when no method is set.
    #[serde(default)]
    pub fusion_config: Option<FusionConfigValue>,
}

const fn default_reducer_width() -> usize {
    DEFAULT_REDUCER_WIDTH
}

const fn default_dropout_prob() -> f64 {
    DEFAULT_DROPOUT_PROB
}

const fn default_backbone_feature_width() -> usize {
    DEFAULT_BACKBONE_FEATURE_WIDTH
}

impl FusionClassifierConfig {
    /// Creates an image-only configuration with default sizes.
    #[must_use]
    pub const fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            reducer_width: DEFAULT_REDUCER_WIDTH,
            dropout_prob: DEFAULT_DROPOUT_PROB,
            freeze_backbone: false,
            backbone_feature_width: DEFAULT_BACKBONE_FEATURE_WIDTH,
            fusion_method: None,
            fusion_config: None,
        }
    }

    /// Sets the fusion method and its config.
    #[must_use]
    pub fn with_fusion(
        mut self,
        method: FusionMethod,
        config: impl Into<FusionConfigValue>,
    ) -> Self {
        self.fusion_method = Some(method);
        self.fusion_config = Some(config.into());
        self
    }

    /// Sets the reducer width.
    #[must_use]
    pub const fn with_reducer_width(mut self, reducer_width: usize) -> Self {
        self.reducer_width = reducer_width;
        self
    }

    /// Sets the dropout probability.
    #[must_use]
    pub const fn with_dropout_prob(mut self, dropout_prob: f64) -> Self {
        self.dropout_prob = dropout_prob;
        self
    }

    /// Freezes the backbone parameters.
    #[must_use]
    pub const fn with_frozen_backbone(mut self) -> Self {
        self.freeze_backbone = true;
        self
    }

    /// Sets the flattened backbone output width.
    #[must_use]
    pub const fn with_backbone_feature_width(mut self, width: usize) -> Self {
        self.backbone_feature_width = width;
        self
    }

    /// Validates the configuration and resolves the fusion strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] for zero classes, a zero
    /// backbone width, a dropout outside `[0, 1]`, or any fusion error
    /// reported by [`FusionStrategy::resolve`].
    pub fn validate(&self) -> Result<FusionStrategy> {
        if self.num_classes == 0 {
            return Err(ModelError::invalid_config("num_classes must be > 0"));
        }
        if self.backbone_feature_width == 0 {
            return Err(ModelError::invalid_config(
                "backbone_feature_width must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.dropout_prob) {
            return Err(ModelError::invalid_config(format!(
                "dropout_prob must be in [0, 1], got {}",
                self.dropout_prob
            )));
        }

        FusionStrategy::resolve(
            self.fusion_method,
            self.fusion_config.as_ref(),
            self.backbone_feature_width,
        )
    }

    /// Lists non-fatal findings about the configuration.
    #[must_use]
    pub fn warnings(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if self.fusion_method == Some(FusionMethod::Concat) && self.reducer_width == 0 {
            warnings.push(ConfigWarning::ConcatWithoutReducer);
        }
        warnings
    }

    /// Width of the vector leaving the reducer stage.
    #[must_use]
    pub const fn reduced_width(&self) -> usize {
        if self.reducer_width > 0 {
            self.reducer_width
        } else {
            self.backbone_feature_width
        }
    }

    /// Input width of the classifier head.
    ///
    /// # Errors
    ///
    /// Returns the validation error if the configuration is invalid.
    pub fn classifier_input_width(&self) -> Result<usize> {
        let strategy = self.validate()?;
        Ok(self.reduced_width() + strategy.concat_width())
    }

    /// Serializes the configuration to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Serialization`] if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a configuration from JSON.
    ///
    /// Omitted size fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Serialization`] if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
