//! Detection, embedding and classification of a whole image.

use crate::cell::ArcCell;
use crate::classifier::{build_classifier, ClassifierKind, ClassifyError};
use crate::config::RecognitionConfig;
use crate::snapshot::SnapshotCell;
use crate::source::{load_image, EmbeddingSource, SourceError};
use crate::types::RecognitionResult;
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;

/// Binds an [`EmbeddingSource`] to the shared model snapshot and config.
///
/// Each call loads the current snapshot and config once and builds a single
/// classifier from them, so a retrain or threshold change in the middle of
/// a call never mixes rules or generations within one result set.
pub struct Recognizer {
    source: Box<dyn EmbeddingSource>,
    snapshot: Arc<SnapshotCell>,
    config: Arc<ArcCell<RecognitionConfig>>,
}

impl Recognizer {
    pub fn new(
        source: Box<dyn EmbeddingSource>,
        snapshot: Arc<SnapshotCell>,
        config: Arc<ArcCell<RecognitionConfig>>,
    ) -> Self {
        Self {
            source,
            snapshot,
            config,
        }
    }

    pub fn snapshot(&self) -> &Arc<SnapshotCell> {
        &self.snapshot
    }

    pub fn config(&self) -> &Arc<ArcCell<RecognitionConfig>> {
        &self.config
    }

    /// Mutable access to the underlying source, for training extraction.
    pub fn source_mut(&mut self) -> &mut dyn EmbeddingSource {
        self.source.as_mut()
    }

    /// Results for every face in `image`, in detector order.
    ///
    /// Without a loaded model, faces come back as unlabeled detections.
    pub fn recognize(&mut self, image: &RgbImage) -> Result<Vec<RecognitionResult>, SourceError> {
        let faces = self.source.detect_and_embed(image)?;
        if faces.is_empty() {
            return Ok(Vec::new());
        }

        let current = self.snapshot.load();
        let Some(snapshot) = &*current else {
            return Ok(faces
                .iter()
                .map(|f| RecognitionResult::unlabeled(f.region))
                .collect());
        };

        let mut config = (*self.config.load()).clone();
        if config.classifier == ClassifierKind::Margin && snapshot.margin().is_none() {
            tracing::debug!(
                generation = snapshot.generation(),
                "no margin model in snapshot, using centroid rule"
            );
            config.classifier = ClassifierKind::Centroid;
        }
        let classifier = build_classifier(snapshot, &config);

        let results = faces
            .iter()
            .map(|face| match classifier.classify(&face.embedding) {
                Ok(decision) => RecognitionResult::new(
                    face.region,
                    decision.identity,
                    &config.unknown_name,
                    decision.confidence,
                    decision.distance,
                ),
                Err(ClassifyError::DimensionMismatch(err)) => {
                    tracing::warn!(
                        generation = snapshot.generation(),
                        %err,
                        "embedding does not match model, face left unlabeled"
                    );
                    RecognitionResult::unlabeled(face.region)
                }
                Err(ClassifyError::ModelNotLoaded) => RecognitionResult::unlabeled(face.region),
            })
            .collect();
        Ok(results)
    }

    pub fn recognize_file(&mut self, path: &Path) -> Result<Vec<RecognitionResult>, SourceError> {
        let image = load_image(path)?;
        self.recognize(&image)
    }
}
