//! Decision rules that map an embedding to an identity.

use crate::config::RecognitionConfig;
use crate::snapshot::ModelSnapshot;
use crate::types::{DimensionMismatch, Embedding, Identity, Label, UNKNOWN_LABEL};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifyError {
    #[error("no trained model is loaded")]
    ModelNotLoaded,
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatch),
}

/// Which decision rule a [`Recognizer`](crate::Recognizer) builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierKind {
    #[default]
    Centroid,
    Margin,
}

impl std::str::FromStr for ClassifierKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "centroid" => Ok(Self::Centroid),
            "margin" | "svm" => Ok(Self::Margin),
            other => Err(format!("unknown classifier kind: {other}")),
        }
    }
}

/// Outcome of classifying one embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub identity: Identity,
    /// Raw rule output. The unknown branch of the centroid rule can go
    /// negative; [`RecognitionResult`](crate::RecognitionResult) clamps it.
    pub confidence: f32,
    pub distance: Option<f32>,
}

/// Strategy for resolving a probe embedding against a trained snapshot.
pub trait Classifier {
    fn classify(&self, probe: &Embedding) -> Result<Decision, ClassifyError>;
}

/// Build the classifier selected by `config` over `snapshot`.
pub fn build_classifier<'a>(
    snapshot: &'a ModelSnapshot,
    config: &RecognitionConfig,
) -> Box<dyn Classifier + 'a> {
    match config.classifier {
        ClassifierKind::Centroid => Box::new(CentroidClassifier::new(snapshot, config.threshold)),
        ClassifierKind::Margin => {
            Box::new(MarginClassifier::new(snapshot, config.min_margin_confidence))
        }
    }
}

fn check_dim(snapshot: &ModelSnapshot, probe: &Embedding) -> Result<(), ClassifyError> {
    if probe.dim() != snapshot.dim() {
        return Err(DimensionMismatch {
            expected: snapshot.dim(),
            actual: probe.dim(),
        }
        .into());
    }
    Ok(())
}

fn identity_for(snapshot: &ModelSnapshot, label: Label) -> Identity {
    if label == UNKNOWN_LABEL {
        return Identity::Unknown;
    }
    let name = snapshot
        .name_of(label)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Class_{label}"));
    Identity::Known { label, name }
}

/// Nearest-centroid rule with a Euclidean distance threshold.
pub struct CentroidClassifier<'a> {
    snapshot: &'a ModelSnapshot,
    threshold: f32,
}

impl<'a> CentroidClassifier<'a> {
    pub fn new(snapshot: &'a ModelSnapshot, threshold: f32) -> Self {
        Self {
            snapshot,
            threshold,
        }
    }

    /// Nearest centroid label and its distance. Centroids are visited in
    /// ascending label order and only a strictly smaller distance replaces
    /// the current best, so ties resolve to the lower label.
    fn nearest(&self, probe: &Embedding) -> Option<(Label, f32)> {
        let mut best: Option<(Label, f32)> = None;
        for (&label, centroid) in self.snapshot.centroids() {
            let distance = probe.euclidean_distance(centroid);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((label, distance));
            }
        }
        best
    }
}

impl Classifier for CentroidClassifier<'_> {
    fn classify(&self, probe: &Embedding) -> Result<Decision, ClassifyError> {
        check_dim(self.snapshot, probe)?;
        let (label, distance) = self.nearest(probe).ok_or(ClassifyError::ModelNotLoaded)?;

        if distance > self.threshold {
            return Ok(Decision {
                identity: Identity::Unknown,
                confidence: 1.0 - distance / 2.0,
                distance: Some(distance),
            });
        }

        Ok(Decision {
            identity: identity_for(self.snapshot, label),
            confidence: 1.0 - distance / self.threshold,
            distance: Some(distance),
        })
    }
}

/// Probabilistic rule backed by the snapshot's [`MarginModel`](crate::margin::MarginModel).
pub struct MarginClassifier<'a> {
    snapshot: &'a ModelSnapshot,
    min_confidence: f32,
}

impl<'a> MarginClassifier<'a> {
    pub fn new(snapshot: &'a ModelSnapshot, min_confidence: f32) -> Self {
        Self {
            snapshot,
            min_confidence,
        }
    }
}

impl Classifier for MarginClassifier<'_> {
    fn classify(&self, probe: &Embedding) -> Result<Decision, ClassifyError> {
        let model = self.snapshot.margin().ok_or(ClassifyError::ModelNotLoaded)?;
        check_dim(self.snapshot, probe)?;
        let (label, probability) = model
            .predict(&probe.values)
            .ok_or(ClassifyError::ModelNotLoaded)?;

        if probability < self.min_confidence {
            return Ok(Decision {
                identity: Identity::Unknown,
                confidence: 1.0 - probability,
                distance: None,
            });
        }

        Ok(Decision {
            identity: identity_for(self.snapshot, label),
            confidence: probability,
            distance: None,
        })
    }
}
