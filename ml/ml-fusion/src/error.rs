//! Error types for ml-fusion crate.

use thiserror::Error;

/// Errors that can occur while building or running a fusion classifier.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Invalid model configuration.
    ///
    /// Raised at construction time: unknown fusion method, missing fusion
    /// config, wrong config arity, or a reshape layout the backbone width
    /// cannot satisfy.
    #[error("invalid model configuration: {0}")]
    InvalidConfig(String),

    /// Metadata presence does not match the configured fusion strategy.
    #[error("metadata contract violated: {0}")]
    MetadataContract(String),

    /// Shape mismatch during inference.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Which tensor failed the check.
        context: String,
        /// Expected shape.
        expected: String,
        /// Actual shape.
        actual: String,
    },

    /// Failed to load checkpoint.
    #[error("failed to load checkpoint from {path}: {reason}")]
    LoadCheckpoint {
        /// Path to the checkpoint file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to save checkpoint.
    #[error("failed to save checkpoint to {path}: {reason}")]
    SaveCheckpoint {
        /// Path to the checkpoint file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Checkpoint file not found.
    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ModelError {
    /// Creates an invalid config error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Metadata was passed to a model without a combination method.
    #[must_use]
    pub fn unexpected_metadata() -> Self {
        Self::MetadataContract(
            "there is no combination method defined but metadata was passed to the model"
                .to_string(),
        )
    }

    /// Metadata was omitted although a combination method is configured.
    #[must_use]
    pub fn missing_metadata(method: &str) -> Self {
        Self::MetadataContract(format!(
            "metadata must be passed since the '{method}' combination method is configured"
        ))
    }

    /// Creates a shape mismatch error.
    #[must_use]
    pub fn shape_mismatch(
        context: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a load checkpoint error.
    #[must_use]
    pub fn load_checkpoint(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a save checkpoint error.
    #[must_use]
    pub fn save_checkpoint(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SaveCheckpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a checkpoint not found error.
    #[must_use]
    pub fn checkpoint_not_found(path: impl Into<String>) -> Self {
        Self::CheckpointNotFound(path.into())
    }

    /// Returns `true` for errors raised while validating the configuration.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::InvalidConfig(_))
    }

    /// Returns `true` for metadata presence violations.
    #[must_use]
    pub const fn is_contract(&self) -> bool {
        matches!(self, Self::MetadataContract(_))
    }

    /// Returns `true` for tensor shape violations.
    #[must_use]
    pub const fn is_shape(&self) -> bool {
        matches!(self, Self::ShapeMismatch { .. })
    }
}

impl From<std::io::Error> for ModelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for ml-fusion operations.
pub type Result<T> = std::result::Result<T, ModelError>;
