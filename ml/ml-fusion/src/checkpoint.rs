//! Checkpoint persistence for fusion classifiers.
//!
//! A checkpoint is three files sharing a stem: the backbone record, the head
//! record, and the configuration as JSON. The configuration is needed to
//! rebuild the head before its weights can be loaded.

use std::fs;
use std::path::{Path, PathBuf};

use burn::module::Module;
use burn::prelude::Backend;
use burn::record::{BinFileRecorder, FullPrecisionSettings, PrettyJsonFileRecorder};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backbone::Backbone;
use crate::classifier::FusionClassifier;
use crate::config::FusionClassifierConfig;
use crate::error::{ModelError, Result};

/// Supported record formats.
///
/// # Example
///
/// ```
/// use ml_fusion::CheckpointFormat;
///
/// assert_eq!(CheckpointFormat::default(), CheckpointFormat::Binary);
/// assert_eq!(CheckpointFormat::Json.extension(), "json");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CheckpointFormat {
    /// Burn's `BinFileRecorder` at full precision.
    #[default]
    Binary,

    /// Burn's `PrettyJsonFileRecorder`, for inspection.
    Json,
}

impl CheckpointFormat {
    /// File extension of records in this format.
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Binary => "bin",
            Self::Json => "json",
        }
    }
}

impl std::fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary => write!(f, "binary"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Files making up one classifier checkpoint.
///
/// # Example
///
/// ```
/// use ml_fusion::{CheckpointFormat, CheckpointPaths};
///
/// let paths = CheckpointPaths::new("runs/model", CheckpointFormat::Binary);
/// assert!(paths.backbone.ends_with("model-backbone.bin"));
/// assert!(paths.head.ends_with("model-head.bin"));
/// assert!(paths.config.ends_with("model-config.json"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    /// Backbone record.
    pub backbone: PathBuf,

    /// Fusion, reducer and classifier record.
    pub head: PathBuf,

    /// Classifier configuration.
    pub config: PathBuf,

    /// Record format.
    pub format: CheckpointFormat,
}

impl CheckpointPaths {
    /// Derives the checkpoint files from a path stem.
    #[must_use]
    pub fn new(stem: impl AsRef<Path>, format: CheckpointFormat) -> Self {
        let stem = stem.as_ref();
        let with_suffix = |suffix: &str, ext: &str| {
            let mut name = stem.as_os_str().to_owned();
            name.push(format!("-{suffix}.{ext}"));
            PathBuf::from(name)
        };

        Self {
            backbone: with_suffix("backbone", format.extension()),
            head: with_suffix("head", format.extension()),
            config: with_suffix("config", "json"),
            format,
        }
    }

    /// Returns `true` if all three files exist.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.backbone.exists() && self.head.exists() && self.config.exists()
    }
}

/// Saves a classifier checkpoint next to `stem`.
///
/// # Errors
///
/// Returns [`ModelError::SaveCheckpoint`] if a record cannot be written, or
/// [`ModelError::Io`] if the config file cannot be written.
pub fn save_checkpoint<B, E>(
    model: &FusionClassifier<B, E>,
    stem: impl AsRef<Path>,
    format: CheckpointFormat,
) -> Result<CheckpointPaths>
where
    B: Backend,
    E: Backbone<B>,
{
    let paths = CheckpointPaths::new(stem, format);

    write_record::<B, _>(model.backbone().clone(), &paths.backbone, format)?;
    write_record::<B, _>(model.head().clone(), &paths.head, format)?;
    fs::write(&paths.config, model.config().to_json()?)?;

    info!(
        backbone = %paths.backbone.display(),
        head = %paths.head.display(),
        %format,
        "saved fusion classifier checkpoint"
    );
    Ok(paths)
}

/// Rebuilds a classifier from a checkpoint saved with [`save_checkpoint`].
///
/// `backbone` supplies the architecture; its weights are replaced by the
/// saved ones. A frozen backbone is frozen again after loading.
///
/// # Errors
///
/// Returns [`ModelError::CheckpointNotFound`] if a file is missing,
/// [`ModelError::LoadCheckpoint`] if a record does not match the
/// architecture, or any construction error of [`FusionClassifier::new`].
pub fn load_checkpoint<B, E>(
    backbone: E,
    stem: impl AsRef<Path>,
    format: CheckpointFormat,
    device: &B::Device,
) -> Result<FusionClassifier<B, E>>
where
    B: Backend,
    E: Backbone<B>,
{
    let paths = CheckpointPaths::new(stem, format);
    for path in [&paths.backbone, &paths.head, &paths.config] {
        if !path.exists() {
            return Err(ModelError::checkpoint_not_found(path.display().to_string()));
        }
    }

    let config = FusionClassifierConfig::from_json(&fs::read_to_string(&paths.config)?)?;
    let backbone = read_record::<B, _>(backbone, &paths.backbone, format, device)?;
    let mut model = FusionClassifier::new(backbone, config, device)?;
    model.head = read_record::<B, _>(model.head, &paths.head, format, device)?;

    info!(head = %paths.head.display(), %format, "loaded fusion classifier checkpoint");
    Ok(model)
}

fn write_record<B, M>(module: M, path: &Path, format: CheckpointFormat) -> Result<()>
where
    B: Backend,
    M: Module<B>,
{
    let saved = match format {
        CheckpointFormat::Binary => {
            module.save_file(path, &BinFileRecorder::<FullPrecisionSettings>::new())
        }
        CheckpointFormat::Json => {
            module.save_file(path, &PrettyJsonFileRecorder::<FullPrecisionSettings>::new())
        }
    };
    saved.map_err(|e| ModelError::save_checkpoint(path.display().to_string(), e.to_string()))
}

fn read_record<B, M>(
    module: M,
    path: &Path,
    format: CheckpointFormat,
    device: &B::Device,
) -> Result<M>
where
    B: Backend,
    M: Module<B>,
{
    let loaded = match format {
        CheckpointFormat::Binary => module.load_file(
            path,
            &BinFileRecorder::<FullPrecisionSettings>::new(),
            device,
        ),
        CheckpointFormat::Json => module.load_file(
            path,
            &PrettyJsonFileRecorder::<FullPrecisionSettings>::new(),
            device,
        ),
    };
    loaded.map_err(|e| ModelError::load_checkpoint(path.display().to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_extension() {
        assert_eq!(CheckpointFormat::Binary.extension(), "bin");
        assert_eq!(CheckpointFormat::Json.extension(), "json");
    }

    #[test]
    fn format_display_and_default() {
        assert_eq!(CheckpointFormat::default(), CheckpointFormat::Binary);
        assert_eq!(CheckpointFormat::Binary.to_string(), "binary");
        assert_eq!(CheckpointFormat::Json.to_string(), "json");
    }

    #[test]
    fn paths_from_stem() {
        let paths = CheckpointPaths::new("/tmp/run.v2/model", CheckpointFormat::Json);
        assert_eq!(paths.backbone, PathBuf::from("/tmp/run.v2/model-backbone.json"));
        assert_eq!(paths.head, PathBuf::from("/tmp/run.v2/model-head.json"));
        assert_eq!(paths.config, PathBuf::from("/tmp/run.v2/model-config.json"));
        assert_eq!(paths.format, CheckpointFormat::Json);
        assert!(!paths.exists());
    }
}
