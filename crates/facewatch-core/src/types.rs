use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Integer class identifier assigned at training time.
pub type Label = i32;

/// Reserved label for faces that belong to no enrolled identity.
pub const UNKNOWN_LABEL: Label = -1;

/// Display name used for results produced without a loaded model.
pub const UNLABELED_NAME: &str = "unlabeled";

/// Face bounding region in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl FaceRegion {
    /// Build a region from an `(x, y, width, height)` box.
    pub fn from_xywh(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            top: y.round() as i32,
            right: (x + width).round() as i32,
            bottom: (y + height).round() as i32,
            left: x.round() as i32,
        }
    }

    pub fn width(&self) -> i32 {
        (self.right - self.left).max(0)
    }

    pub fn height(&self) -> i32 {
        (self.bottom - self.top).max(0)
    }

    pub fn area(&self) -> i64 {
        self.width() as i64 * self.height() as i64
    }

    /// Map a region detected on a frame downscaled by `scale_factor` back to
    /// the coordinates of the full-size frame.
    pub fn rescale(&self, scale_factor: f32) -> Self {
        if scale_factor <= 0.0 {
            return *self;
        }
        let up = |v: i32| (v as f32 / scale_factor) as i32;
        Self {
            top: up(self.top),
            right: up(self.right),
            bottom: up(self.bottom),
            left: up(self.left),
        }
    }
}

/// Face embedding vector produced by an [`EmbeddingSource`](crate::EmbeddingSource).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to another vector of the same dimension.
    pub fn euclidean_distance(&self, other: &[f32]) -> f32 {
        self.values
            .iter()
            .zip(other.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One face found in an image, with its embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub region: FaceRegion,
    pub embedding: Embedding,
    /// Detector confidence for the region.
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("embedding dimension mismatch: expected {expected}, got {actual}")]
pub struct DimensionMismatch {
    pub expected: usize,
    pub actual: usize,
}

/// Row-aligned embedding matrix and label vector collected from a dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSet {
    pub dim: usize,
    pub rows: Vec<Vec<f32>>,
    pub labels: Vec<Label>,
}

impl EmbeddingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one labeled embedding. The first row fixes the dimension.
    pub fn push(&mut self, values: Vec<f32>, label: Label) -> Result<(), DimensionMismatch> {
        if self.rows.is_empty() {
            self.dim = values.len();
        } else if values.len() != self.dim {
            return Err(DimensionMismatch {
                expected: self.dim,
                actual: values.len(),
            });
        }
        self.rows.push(values);
        self.labels.push(label);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Distinct labels in ascending order.
    pub fn distinct_labels(&self) -> BTreeSet<Label> {
        self.labels.iter().copied().collect()
    }

    pub fn count_of(&self, label: Label) -> usize {
        self.labels.iter().filter(|&&l| l == label).count()
    }
}

/// Who a face was resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Identity {
    Known { label: Label, name: String },
    Unknown,
    /// No model was available, the face was detected but not classified.
    Unlabeled,
}

impl Identity {
    pub fn label(&self) -> Option<Label> {
        match self {
            Identity::Known { label, .. } => Some(*label),
            Identity::Unknown => Some(UNKNOWN_LABEL),
            Identity::Unlabeled => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Identity::Known { .. })
    }
}

/// Per-face recognition output handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub region: FaceRegion,
    pub identity: Identity,
    /// Resolved display name.
    pub name: String,
    /// Always within [0, 1].
    pub confidence: f32,
    /// Distance to the winning centroid, when the centroid rule was used.
    pub distance: Option<f32>,
}

impl RecognitionResult {
    /// Build a result, clamping a raw decision confidence into [0, 1].
    pub fn new(
        region: FaceRegion,
        identity: Identity,
        unknown_name: &str,
        raw_confidence: f32,
        distance: Option<f32>,
    ) -> Self {
        let name = match &identity {
            Identity::Known { name, .. } => name.clone(),
            Identity::Unknown => unknown_name.to_string(),
            Identity::Unlabeled => UNLABELED_NAME.to_string(),
        };
        let confidence = if raw_confidence.is_nan() {
            0.0
        } else {
            raw_confidence.clamp(0.0, 1.0)
        };
        Self {
            region,
            identity,
            name,
            confidence,
            distance,
        }
    }

    /// Detection-only result used when no model is loaded.
    pub fn unlabeled(region: FaceRegion) -> Self {
        Self::new(region, Identity::Unlabeled, "", 0.0, None)
    }

    /// Same result with its region mapped back from a downscaled frame.
    pub fn rescaled(mut self, scale_factor: f32) -> Self {
        self.region = self.region.rescale(scale_factor);
        self
    }
}
