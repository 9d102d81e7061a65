//! Observation of intermediate activations.
//!
//! The classifier reports each labelled stage of its forward pass to a
//! caller-supplied [`StageObserver`]. Observers are read-only: they receive
//! handles to the activations and cannot alter the computation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use burn::prelude::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Stable name of the backbone submodule.
pub const BACKBONE: &str = "backbone";

/// Stable name of the fusion submodule.
pub const FUSION: &str = "fusion";

/// Stable name of the reducer submodule.
pub const REDUCER: &str = "reducer";

/// Stable name of the classifier head submodule.
pub const CLASSIFIER: &str = "classifier";

/// Labelled points of the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Backbone output, `[batch, channels, height, width]`.
    Backbone,

    /// Folded feature map after block/network fusion.
    Fused,

    /// Reducer block output.
    Reduced,

    /// Vector entering the classifier head.
    ClassifierInput,

    /// Classifier head output.
    Logits,
}

impl Stage {
    /// All stages in forward order.
    pub const ALL: [Self; 5] = [
        Self::Backbone,
        Self::Fused,
        Self::Reduced,
        Self::ClassifierInput,
        Self::Logits,
    ];

    /// Stable stage label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Backbone => "backbone",
            Self::Fused => "fused",
            Self::Reduced => "reduced",
            Self::ClassifierInput => "classifier_input",
            Self::Logits => "logits",
        }
    }

    /// Name of the submodule this stage belongs to.
    ///
    /// `ClassifierInput` and `Logits` are the input and output of the same
    /// classifier head.
    #[must_use]
    pub const fn submodule(&self) -> &'static str {
        match self {
            Self::Backbone => BACKBONE,
            Self::Fused => FUSION,
            Self::Reduced => REDUCER,
            Self::ClassifierInput | Self::Logits => CLASSIFIER,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An observed activation.
#[derive(Debug, Clone)]
pub enum Activation<B: Backend> {
    /// A spatial feature map.
    Map(Tensor<B, 4>),

    /// A flat feature vector per sample.
    Vector(Tensor<B, 2>),
}

impl<B: Backend> Activation<B> {
    /// Shape of the activation.
    #[must_use]
    pub fn dims(&self) -> Vec<usize> {
        match self {
            Self::Map(tensor) => tensor.dims().to_vec(),
            Self::Vector(tensor) => tensor.dims().to_vec(),
        }
    }

    /// Returns the tensor if this is a feature map.
    #[must_use]
    pub fn into_map(self) -> Option<Tensor<B, 4>> {
        match self {
            Self::Map(tensor) => Some(tensor),
            Self::Vector(_) => None,
        }
    }

    /// Returns the tensor if this is a flat vector.
    #[must_use]
    pub fn into_vector(self) -> Option<Tensor<B, 2>> {
        match self {
            Self::Vector(tensor) => Some(tensor),
            Self::Map(_) => None,
        }
    }
}

/// Receives activations after each labelled stage of the forward pass.
pub trait StageObserver<B: Backend> {
    /// Whether `stage` should be reported at all.
    ///
    /// Stages reported `false` here are never materialized for the observer.
    fn wants(&self, _stage: Stage) -> bool {
        true
    }

    /// Called once per wanted stage, in forward order.
    fn observe(&mut self, stage: Stage, activation: Activation<B>);
}

/// Observer that ignores every stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl<B: Backend> StageObserver<B> for NoopObserver {
    fn wants(&self, _stage: Stage) -> bool {
        false
    }

    fn observe(&mut self, _stage: Stage, _activation: Activation<B>) {}
}

/// Records activations of registered stages.
///
/// # Example
///
/// ```ignore
/// use ml_fusion::{ActivationRecorder, Stage};
///
/// let mut recorder = ActivationRecorder::with_stages([Stage::Backbone, Stage::ClassifierInput]);
/// let logits = model.forward_observed(images, None, &mut recorder)?;
/// let pooled = recorder.get(Stage::ClassifierInput);
/// ```
#[derive(Debug, Clone)]
pub struct ActivationRecorder<B: Backend> {
    stages: Option<BTreeSet<Stage>>,
    records: BTreeMap<Stage, Activation<B>>,
}

impl<B: Backend> Default for ActivationRecorder<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> ActivationRecorder<B> {
    /// Creates a recorder keeping every stage.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stages: None,
            records: BTreeMap::new(),
        }
    }

    /// Creates a recorder keeping only `stages`.
    #[must_use]
    pub fn with_stages(stages: impl IntoIterator<Item = Stage>) -> Self {
        Self {
            stages: Some(stages.into_iter().collect()),
            records: BTreeMap::new(),
        }
    }

    /// Returns the recorded activation of `stage`.
    #[must_use]
    pub fn get(&self, stage: Stage) -> Option<&Activation<B>> {
        self.records.get(&stage)
    }

    /// Removes and returns the recorded activation of `stage`.
    pub fn take(&mut self, stage: Stage) -> Option<Activation<B>> {
        self.records.remove(&stage)
    }

    /// Stages recorded so far, in forward order.
    pub fn recorded(&self) -> impl Iterator<Item = Stage> + '_ {
        self.records.keys().copied()
    }

    /// Number of recorded stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops all recorded activations, keeping the registrations.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Consumes the recorder and returns the recorded activations.
    #[must_use]
    pub fn into_inner(self) -> BTreeMap<Stage, Activation<B>> {
        self.records
    }
}

impl<B: Backend> StageObserver<B> for ActivationRecorder<B> {
    fn wants(&self, stage: Stage) -> bool {
        self.stages
            .as_ref()
            .is_none_or(|stages| stages.contains(&stage))
    }

    fn observe(&mut self, stage: Stage, activation: Activation<B>) {
        self.records.insert(stage, activation);
    }
}

/// Reports `stage` to `observer` if it wants it, building the activation lazily.
pub(crate) fn report<B, O, F>(observer: &mut O, stage: Stage, activation: F)
where
    B: Backend,
    O: StageObserver<B> + ?Sized,
    F: FnOnce() -> Activation<B>,
{
    if observer.wants(stage) {
        observer.observe(stage, activation());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn vector(width: usize) -> Activation<TestBackend> {
        let device = <TestBackend as Backend>::Device::default();
        Activation::Vector(Tensor::zeros([2, width], &device))
    }

    #[test]
    fn stage_names_are_stable() {
        assert_eq!(Stage::Backbone.name(), "backbone");
        assert_eq!(Stage::ClassifierInput.to_string(), "classifier_input");
        assert_eq!(Stage::Backbone.submodule(), BACKBONE);
        assert_eq!(Stage::Fused.submodule(), FUSION);
        assert_eq!(Stage::Reduced.submodule(), REDUCER);
        assert_eq!(Stage::ClassifierInput.submodule(), CLASSIFIER);
        assert_eq!(Stage::Logits.submodule(), CLASSIFIER);
    }

    #[test]
    fn stages_order_follows_forward_pass() {
        let mut sorted = Stage::ALL;
        sorted.sort();
        assert_eq!(sorted, Stage::ALL);
    }

    #[test]
    fn recorder_keeps_everything_by_default() {
        let mut recorder = ActivationRecorder::<TestBackend>::new();
        for stage in Stage::ALL {
            report(&mut recorder, stage, || vector(4));
        }
        assert_eq!(recorder.len(), Stage::ALL.len());
        assert_eq!(recorder.recorded().collect::<Vec<_>>(), Stage::ALL.to_vec());
    }

    #[test]
    fn recorder_filters_registered_stages() {
        let mut recorder = ActivationRecorder::<TestBackend>::with_stages([Stage::Logits]);
        report(&mut recorder, Stage::Backbone, || vector(8));
        report(&mut recorder, Stage::Logits, || vector(3));

        assert_eq!(recorder.len(), 1);
        assert!(recorder.get(Stage::Backbone).is_none());
        assert_eq!(
            recorder.get(Stage::Logits).map(Activation::dims),
            Some(vec![2, 3])
        );

        let logits = recorder.take(Stage::Logits).and_then(Activation::into_vector);
        assert!(logits.is_some());
        assert!(recorder.is_empty());
    }

    #[test]
    fn noop_observer_never_builds_activations() {
        let mut observer = NoopObserver;
        let mut built = false;
        report::<TestBackend, _, _>(&mut observer, Stage::Backbone, || {
            built = true;
            vector(1)
        });
        assert!(!built);
    }

    #[test]
    fn activation_accessors() {
        let device = <TestBackend as Backend>::Device::default();
        let map = Activation::<TestBackend>::Map(Tensor::zeros([1, 2, 3, 4], &device));
        assert_eq!(map.dims(), vec![1, 2, 3, 4]);
        assert!(map.clone().into_vector().is_none());
        assert!(map.into_map().is_some());
    }

    #[test]
    fn recorder_clear_keeps_registrations() {
        let mut recorder = ActivationRecorder::<TestBackend>::with_stages([Stage::Reduced]);
        report(&mut recorder, Stage::Reduced, || vector(2));
        recorder.clear();
        assert!(recorder.is_empty());
        assert!(recorder.wants(Stage::Reduced));
        assert!(!recorder.wants(Stage::Backbone));
    }
}
