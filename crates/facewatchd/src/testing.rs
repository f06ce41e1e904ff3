//! Synthetic embedding source for daemon tests.

use facewatch_core::{
    ArcCell, DetectedFace, Embedding, EmbeddingSource, FaceRegion, ModelSnapshot,
    RecognitionConfig, Recognizer, SnapshotCell, SourceError,
};
use image::RgbImage;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One whole-image face whose embedding is the top-left pixel in [0, 1].
/// A black top-left pixel means no face.
pub struct ColorSource;

impl EmbeddingSource for ColorSource {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, SourceError> {
        let (w, h) = image.dimensions();
        let p = image.get_pixel(0, 0).0;
        if p == [0, 0, 0] {
            return Ok(Vec::new());
        }
        Ok(vec![DetectedFace {
            region: FaceRegion { top: 0, right: w as i32, bottom: h as i32, left: 0 },
            embedding: Embedding::new(p.iter().map(|&c| c as f32 / 255.0).collect()),
            score: 0.99,
        }])
    }
}

pub fn solid(rgb: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(8, 8, image::Rgb(rgb))
}

/// "alice" at white, "bob" at blue.
pub fn snapshot() -> ModelSnapshot {
    ModelSnapshot::new(
        "test",
        BTreeMap::from([(0, vec![1.0, 1.0, 1.0]), (1, vec![0.0, 0.0, 1.0])]),
        BTreeMap::from([(0, "alice".to_string()), (1, "bob".to_string())]),
        None,
    )
    .unwrap()
}

pub fn recognizer() -> Recognizer {
    Recognizer::new(
        Box::new(ColorSource),
        Arc::new(SnapshotCell::new(Some(snapshot()))),
        Arc::new(ArcCell::new(RecognitionConfig::default())),
    )
}
