//! Face detection plus embedding, behind one seam.

use crate::types::DetectedFace;
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions treated as images, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to decode image {path}: {source}")]
    DecodeFailure {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Finds faces in an RGB image and produces one embedding per face.
///
/// Implementations are used from a single thread at a time but may move
/// between threads, hence `Send`.
pub trait EmbeddingSource: Send {
    /// Every face found in `image`, in the order the detector reports them.
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, SourceError>;
}

impl<S: EmbeddingSource + ?Sized> EmbeddingSource for Box<S> {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, SourceError> {
        (**self).detect_and_embed(image)
    }
}

/// Decode an image file to 8-bit RGB.
pub fn load_image(path: &Path) -> Result<RgbImage, SourceError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| SourceError::DecodeFailure {
            path: path.to_path_buf(),
            source,
        })
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Image files directly inside `dir`, sorted by path.
pub fn list_images(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_file() && is_image_file(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}
