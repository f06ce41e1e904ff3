//! Trained model generation shared between the live pipeline, the upload
//! watcher and the trainer.

use crate::cell::ArcCell;
use crate::margin::MarginModel;
use crate::types::Label;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SnapshotError {
    #[error("snapshot has no centroids")]
    Empty,
    #[error("centroid label {0} has no entry in the label-name table")]
    MissingName(Label),
    #[error("dimension mismatch in {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Centroids, label names and optional margin model from one training run.
///
/// Constructed only through [`ModelSnapshot::new`], which checks that every
/// centroid label is named and that all stored vectors share one dimension.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSnapshot {
    generation: String,
    dim: usize,
    centroids: BTreeMap<Label, Vec<f32>>,
    names: BTreeMap<Label, String>,
    margin: Option<MarginModel>,
}

/// Process-wide slot holding the snapshot currently used for recognition.
pub type SnapshotCell = ArcCell<Option<ModelSnapshot>>;

impl ModelSnapshot {
    pub fn new(
        generation: impl Into<String>,
        centroids: BTreeMap<Label, Vec<f32>>,
        names: BTreeMap<Label, String>,
        margin: Option<MarginModel>,
    ) -> Result<Self, SnapshotError> {
        let dim = centroids
            .values()
            .next()
            .map(Vec::len)
            .ok_or(SnapshotError::Empty)?;

        for (label, centroid) in &centroids {
            if !names.contains_key(label) {
                return Err(SnapshotError::MissingName(*label));
            }
            if centroid.len() != dim {
                return Err(SnapshotError::DimensionMismatch {
                    what: "centroid",
                    expected: dim,
                    actual: centroid.len(),
                });
            }
        }

        if let Some(model) = &margin {
            if model.dim() != dim {
                return Err(SnapshotError::DimensionMismatch {
                    what: "margin classifier",
                    expected: dim,
                    actual: model.dim(),
                });
            }
        }

        Ok(Self {
            generation: generation.into(),
            dim,
            centroids,
            names,
            margin,
        })
    }

    /// Identifier of the training run that produced this snapshot.
    pub fn generation(&self) -> &str {
        &self.generation
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Centroids in ascending label order.
    pub fn centroids(&self) -> &BTreeMap<Label, Vec<f32>> {
        &self.centroids
    }

    pub fn names(&self) -> &BTreeMap<Label, String> {
        &self.names
    }

    pub fn name_of(&self, label: Label) -> Option<&str> {
        self.names.get(&label).map(String::as_str)
    }

    pub fn margin(&self) -> Option<&MarginModel> {
        self.margin.as_ref()
    }

    pub fn num_classes(&self) -> usize {
        self.centroids.len()
    }
}
