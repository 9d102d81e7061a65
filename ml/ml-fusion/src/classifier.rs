//! Image classifier fusing backbone features with metadata.

use std::path::Path;

use burn::module::{AutodiffModule, Ignored, Module};
use burn::nn;
use burn::prelude::Backend;
use burn::tensor::Tensor;
use burn::tensor::backend::AutodiffBackend;
use tracing::{debug, info, warn};

use crate::backbone::Backbone;
use crate::checkpoint::{self, CheckpointFormat, CheckpointPaths};
use crate::config::FusionClassifierConfig;
use crate::error::{ModelError, Result};
use crate::fusion::{FusionModule, MetaBlock, MetaNet};
use crate::metadata::Metadata;
use crate::observe::{self, Activation, NoopObserver, Stage, StageObserver};
use crate::reducer::{ReducerBlock, ReducerBlockConfig};
use crate::strategy::FusionStrategy;

/// Everything after the backbone: fusion, reducer and classifier head.
///
/// Operates on flat backbone features `[batch, feature_width]`.
#[derive(Debug, Module)]
pub struct FusionHead<B: Backend> {
    pub(crate) fusion: Option<FusionModule<B>>,
    pub(crate) reducer: Option<ReducerBlock<B>>,
    pub(crate) classifier: nn::Linear<B>,
    strategy: Ignored<FusionStrategy>,
    #[module(skip)]
    feature_width: usize,
}

impl<B: Backend> FusionHead<B> {
    /// Builds the head for an already resolved strategy.
    #[must_use]
    pub fn new(
        config: &FusionClassifierConfig,
        strategy: FusionStrategy,
        device: &B::Device,
    ) -> Self {
        let fusion = match strategy {
            FusionStrategy::Block(params) => {
                Some(FusionModule::Block(MetaBlock::new(params, device)))
            }
            FusionStrategy::Network(params) => {
                Some(FusionModule::Network(MetaNet::new(params, device)))
            }
            FusionStrategy::None | FusionStrategy::Concat { .. } => None,
        };

        let reducer = (config.reducer_width > 0).then(|| {
            let reducer_config =
                ReducerBlockConfig::new(config.backbone_feature_width, config.reducer_width)
                    .with_dropout_prob(config.dropout_prob);
            ReducerBlock::new(reducer_config, device)
        });

        let input_width = config.reduced_width() + strategy.concat_width();
        let classifier = nn::LinearConfig::new(input_width, config.num_classes).init(device);

        Self {
            fusion,
            reducer,
            classifier,
            strategy: Ignored(strategy),
            feature_width: config.backbone_feature_width,
        }
    }

    /// The resolved fusion strategy.
    #[must_use]
    pub const fn strategy(&self) -> FusionStrategy {
        self.strategy.0
    }

    /// Flat backbone width the head expects.
    #[must_use]
    pub const fn feature_width(&self) -> usize {
        self.feature_width
    }

    /// Input width of the classifier layer.
    #[must_use]
    pub fn classifier_input_width(&self) -> usize {
        self.classifier.weight.val().dims()[0]
    }

    /// Number of output classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.classifier.weight.val().dims()[1]
    }

    /// Returns `true` if the reducer block is present.
    #[must_use]
    pub const fn has_reducer(&self) -> bool {
        self.reducer.is_some()
    }

    /// Checks metadata presence and shape against the strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::MetadataContract`] on a presence mismatch and
    /// [`ModelError::ShapeMismatch`] if the batch or width is wrong.
    pub fn check_metadata(&self, batch: usize, metadata: Option<&Metadata<B>>) -> Result<()> {
        self.strategy.0.check_metadata(metadata.is_some())?;

        if let (Some(metadata), Some(width)) = (metadata, self.strategy.0.metadata_width()) {
            let dims = metadata.dims();
            if dims != [batch, width] {
                return Err(ModelError::shape_mismatch(
                    "metadata",
                    format!("[{batch}, {width}]"),
                    format!("{dims:?}"),
                ));
            }
        }
        Ok(())
    }

    /// Runs the head on flat features `[batch, feature_width]`.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`FusionHead::check_metadata`], or
    /// [`ModelError::ShapeMismatch`] if the features do not have the
    /// configured width.
    pub fn forward<O>(
        &self,
        features: Tensor<B, 2>,
        metadata: Option<Metadata<B>>,
        observer: &mut O,
    ) -> Result<Tensor<B, 2>>
    where
        O: StageObserver<B> + ?Sized,
    {
        let [batch, _] = features.dims();
        self.check_metadata(batch, metadata.as_ref())?;
        self.forward_checked(features, metadata, observer)
    }

    /// Runs the head once metadata has passed [`FusionHead::check_metadata`].
    pub(crate) fn forward_checked<O>(
        &self,
        features: Tensor<B, 2>,
        metadata: Option<Metadata<B>>,
        observer: &mut O,
    ) -> Result<Tensor<B, 2>>
    where
        O: StageObserver<B> + ?Sized,
    {
        let [batch, width] = features.dims();
        if width != self.feature_width {
            return Err(ModelError::shape_mismatch(
                "backbone features",
                format!("[{batch}, {}]", self.feature_width),
                format!("[{batch}, {width}]"),
            ));
        }

        let metadata = metadata.map(Metadata::into_float);
        let x = match (self.strategy.0, metadata) {
            (FusionStrategy::None, None) => self.reduce(features, observer),
            (FusionStrategy::Concat { .. }, Some(metadata)) => {
                let x = self.reduce(features, observer);
                Tensor::cat(vec![x, metadata], 1)
            }
            (FusionStrategy::Block(_) | FusionStrategy::Network(_), Some(metadata)) => {
                let fused = self.fuse(features, metadata, observer)?;
                self.reduce(fused, observer)
            }
            (FusionStrategy::None, Some(_)) => return Err(ModelError::unexpected_metadata()),
            (strategy, None) => return Err(ModelError::missing_metadata(strategy.name())),
        };

        observe::report(observer, Stage::ClassifierInput, || {
            Activation::Vector(x.clone())
        });
        let logits = self.classifier.forward(x);
        observe::report(observer, Stage::Logits, || Activation::Vector(logits.clone()));

        Ok(logits)
    }

    fn fuse<O>(
        &self,
        features: Tensor<B, 2>,
        metadata: Tensor<B, 2>,
        observer: &mut O,
    ) -> Result<Tensor<B, 2>>
    where
        O: StageObserver<B> + ?Sized,
    {
        let module = self.fusion.as_ref().ok_or_else(|| {
            ModelError::invalid_config(format!(
                "'{}' fusion has no fusion module",
                self.strategy.0.name()
            ))
        })?;

        let [batch, width] = features.dims();
        let fused = module.combine(module.fold(features)?, metadata);
        observe::report(observer, Stage::Fused, || Activation::Map(fused.clone()));

        Ok(fused.reshape([batch, width]))
    }

    fn reduce<O>(&self, features: Tensor<B, 2>, observer: &mut O) -> Tensor<B, 2>
    where
        O: StageObserver<B> + ?Sized,
    {
        match &self.reducer {
            Some(reducer) => {
                let reduced = reducer.forward(features);
                observe::report(observer, Stage::Reduced, || {
                    Activation::Vector(reduced.clone())
                });
                reduced
            }
            None => features,
        }
    }
}

/// Image classifier combining a backbone, an optional metadata fusion, an
/// optional reducer block and a linear head.
///
/// Data flow:
///
/// ```text
/// images -> backbone -> flatten -> [fold -> fusion -> flatten] -> [reducer]
///        -> [concat metadata] -> classifier -> logits
/// ```
///
/// # Training and evaluation
///
/// On an autodiff backend the reducer's dropout and batch statistics are
/// active. [`FusionClassifier::valid`] returns the same model on the inner
/// backend, where the forward pass is deterministic.
///
/// # Example
///
/// ```ignore
/// use ml_fusion::{ConvBackbone, ConvBackboneConfig, FusionClassifier, FusionClassifierConfig, FusionMethod};
///
/// let backbone = ConvBackbone::new(ConvBackboneConfig::default(), &device);
/// let config = FusionClassifierConfig::new(3).with_fusion(FusionMethod::Network, 5);
/// let model = FusionClassifier::new(backbone, config, &device)?;
///
/// let logits = model.forward(images, Some(metadata.into()))?;
/// assert_eq!(logits.dims(), [4, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct FusionClassifier<B: Backend, E> {
    pub(crate) backbone: E,
    pub(crate) head: FusionHead<B>,
    config: FusionClassifierConfig,
}

impl<B: Backend, E: Backbone<B>> FusionClassifier<B, E> {
    /// Stable names of the addressable submodules.
    pub const SUBMODULES: [&'static str; 4] = [
        observe::BACKBONE,
        observe::FUSION,
        observe::REDUCER,
        observe::CLASSIFIER,
    ];

    /// Builds a classifier around `backbone`.
    ///
    /// Resolves the fusion strategy, logs configuration warnings and, if
    /// requested, disables gradients for every backbone parameter.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] if the configuration is invalid.
    pub fn new(backbone: E, config: FusionClassifierConfig, device: &B::Device) -> Result<Self> {
        let strategy = config.validate()?;
        for warning in config.warnings() {
            warn!(%warning, "fusion classifier configuration warning");
        }

        let backbone = Self::prepare_backbone(backbone, &config);
        let head = FusionHead::new(&config, strategy, device);
        debug!(
            %strategy,
            feature_width = config.backbone_feature_width,
            reducer_width = config.reducer_width,
            classifier_input = head.classifier_input_width(),
            num_classes = config.num_classes,
            "built fusion classifier"
        );

        Ok(Self {
            backbone,
            head,
            config,
        })
    }

    /// Runs the forward pass and returns raw logits `[batch, num_classes]`.
    ///
    /// # Errors
    ///
    /// - [`ModelError::MetadataContract`] if metadata is passed without a
    ///   fusion method or omitted with one.
    /// - [`ModelError::ShapeMismatch`] if the backbone output or metadata
    ///   shape disagrees with the configuration.
    pub fn forward(
        &self,
        images: Tensor<B, 4>,
        metadata: Option<Metadata<B>>,
    ) -> Result<Tensor<B, 2>> {
        self.forward_observed(images, metadata, &mut NoopObserver)
    }

    /// Alias of [`FusionClassifier::forward`].
    ///
    /// # Errors
    ///
    /// See [`FusionClassifier::forward`].
    pub fn predict(
        &self,
        images: Tensor<B, 4>,
        metadata: Option<Metadata<B>>,
    ) -> Result<Tensor<B, 2>> {
        self.forward(images, metadata)
    }

    /// Runs the forward pass, reporting each stage to `observer`.
    ///
    /// Observation does not change the result.
    ///
    /// # Errors
    ///
    /// See [`FusionClassifier::forward`].
    pub fn forward_observed<O>(
        &self,
        images: Tensor<B, 4>,
        metadata: Option<Metadata<B>>,
        observer: &mut O,
    ) -> Result<Tensor<B, 2>>
    where
        O: StageObserver<B> + ?Sized,
    {
        let [batch, ..] = images.dims();
        self.head.check_metadata(batch, metadata.as_ref())?;

        let features = self.backbone.extract(images);
        observe::report(observer, Stage::Backbone, || {
            Activation::Map(features.clone())
        });

        let [batch, channels, height, width] = features.dims();
        let flat = features.reshape([batch, channels * height * width]);
        self.head.forward_checked(flat, metadata, observer)
    }

    /// The configuration the model was built from.
    #[must_use]
    pub const fn config(&self) -> &FusionClassifierConfig {
        &self.config
    }

    /// The resolved fusion strategy.
    #[must_use]
    pub const fn strategy(&self) -> FusionStrategy {
        self.head.strategy()
    }

    /// The backbone extractor.
    #[must_use]
    pub const fn backbone(&self) -> &E {
        &self.backbone
    }

    /// Everything after the backbone.
    #[must_use]
    pub const fn head(&self) -> &FusionHead<B> {
        &self.head
    }

    /// Input width of the classifier head.
    #[must_use]
    pub fn classifier_input_width(&self) -> usize {
        self.head.classifier_input_width()
    }

    /// Number of output classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.head.num_classes()
    }

    /// Whether the backbone parameters were frozen at construction.
    #[must_use]
    pub const fn is_backbone_frozen(&self) -> bool {
        self.config.freeze_backbone
    }

    /// Names of the submodules present in this instance.
    #[must_use]
    pub fn submodule_names(&self) -> Vec<&'static str> {
        Self::SUBMODULES
            .into_iter()
            .filter(|name| match *name {
                observe::FUSION => self.head.fusion.is_some(),
                observe::REDUCER => self.head.has_reducer(),
                _ => true,
            })
            .collect()
    }

    /// Splits the model into its backbone and head.
    ///
    /// [`FusionClassifier::from_parts`] is the inverse, e.g. after an
    /// optimizer step on either part.
    #[must_use]
    pub fn into_parts(self) -> (E, FusionHead<B>) {
        (self.backbone, self.head)
    }

    /// Reassembles a classifier from an existing backbone and head.
    ///
    /// Unlike [`FusionClassifier::new`], the head's parameters are kept. A
    /// frozen configuration freezes `backbone` again.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidConfig`] if the configuration is invalid
    /// or `head` was not built for it.
    pub fn from_parts(
        backbone: E,
        head: FusionHead<B>,
        config: FusionClassifierConfig,
    ) -> Result<Self> {
        let strategy = config.validate()?;
        let expected_input = config.reduced_width() + strategy.concat_width();

        let mismatch = if head.strategy() != strategy {
            Some(format!("strategy {} != {strategy}", head.strategy()))
        } else if head.feature_width() != config.backbone_feature_width {
            Some(format!(
                "feature width {} != {}",
                head.feature_width(),
                config.backbone_feature_width
            ))
        } else if head.has_reducer() != (config.reducer_width > 0) {
            Some(format!("reducer present: {}", head.has_reducer()))
        } else if head.classifier_input_width() != expected_input {
            Some(format!(
                "classifier input {} != {expected_input}",
                head.classifier_input_width()
            ))
        } else if head.num_classes() != config.num_classes {
            Some(format!("classes {} != {}", head.num_classes(), config.num_classes))
        } else {
            None
        };
        if let Some(reason) = mismatch {
            return Err(ModelError::invalid_config(format!(
                "head does not match configuration: {reason}"
            )));
        }

        let backbone = Self::prepare_backbone(backbone, &config);
        Ok(Self {
            backbone,
            head,
            config,
        })
    }

    /// Replaces the head, keeping backbone and configuration.
    ///
    /// # Errors
    ///
    /// See [`FusionClassifier::from_parts`].
    pub fn with_head(self, head: FusionHead<B>) -> Result<Self> {
        Self::from_parts(self.backbone, head, self.config)
    }

    fn prepare_backbone(backbone: E, config: &FusionClassifierConfig) -> E {
        if config.freeze_backbone {
            info!("freezing backbone parameters");
            backbone.no_grad()
        } else {
            backbone
        }
    }

    /// Saves the model as a checkpoint; see [`checkpoint::save_checkpoint`].
    ///
    /// # Errors
    ///
    /// Returns an error if any checkpoint file cannot be written.
    pub fn save(
        &self,
        stem: impl AsRef<Path>,
        format: CheckpointFormat,
    ) -> Result<CheckpointPaths> {
        checkpoint::save_checkpoint(self, stem, format)
    }

    /// Loads a model saved with [`FusionClassifier::save`] around `backbone`.
    ///
    /// # Errors
    ///
    /// See [`checkpoint::load_checkpoint`].
    pub fn load(
        backbone: E,
        stem: impl AsRef<Path>,
        format: CheckpointFormat,
        device: &B::Device,
    ) -> Result<Self> {
        checkpoint::load_checkpoint(backbone, stem, format, device)
    }
}

impl<B, E> FusionClassifier<B, E>
where
    B: AutodiffBackend,
    E: Backbone<B> + AutodiffModule<B>,
    E::InnerModule: Backbone<B::InnerBackend>,
{
    /// Returns the model on the inner (non-autodiff) backend, for evaluation.
    #[must_use]
    pub fn valid(&self) -> FusionClassifier<B::InnerBackend, E::InnerModule> {
        FusionClassifier {
            backbone: self.backbone.valid(),
            head: self.head.valid(),
            config: self.config.clone(),
        }
    }
}
