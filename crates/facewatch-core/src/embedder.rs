//! ArcFace embeddings on landmark-aligned RGB crops, paired with the SCRFD
//! detector into the production [`EmbeddingSource`].

use crate::detector::{Detection, FaceDetector, Landmarks};
use crate::source::{EmbeddingSource, SourceError};
use crate::types::{DetectedFace, Embedding, FaceRegion};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ALIGNED_SIZE: u32 = 112;
const MEAN: f32 = 127.5;
const STD: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;

/// Canonical landmark positions in a 112x112 ArcFace crop.
const REFERENCE: Landmarks = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Similarity transform `u = a*x - b*y + tx`, `v = b*x + a*y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    fn estimate(src: &Landmarks, dst: &Landmarks) -> Option<Self> {
        let n = src.len() as f32;
        let mean = |pts: &Landmarks| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
            (sx / n, sy / n)
        };
        let (mx, my) = mean(src);
        let (mu, mv) = mean(dst);

        let (mut num_a, mut num_b, mut denom) = (0.0f32, 0.0f32, 0.0f32);
        for ((x, y), (u, v)) in src.iter().zip(dst) {
            let (x, y, u, v) = (x - mx, y - my, u - mu, v - mv);
            num_a += x * u + y * v;
            num_b += x * v - y * u;
            denom += x * x + y * y;
        }
        if denom <= f32::EPSILON {
            return None;
        }

        let (a, b) = (num_a / denom, num_b / denom);
        Some(Self {
            a,
            b,
            tx: mu - (a * mx - b * my),
            ty: mv - (b * mx + a * my),
        })
    }

    fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn invert(&self, u: f32, v: f32) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (du, dv) = (u - self.tx, v - self.ty);
        (
            (self.a * du + self.b * dv) / det,
            (self.a * dv - self.b * du) / det,
        )
    }
}

/// Warp `image` so the landmarks land on [`REFERENCE`]. Pixels sampled from
/// outside the source come out black.
fn align(image: &RgbImage, landmarks: &Landmarks) -> Option<RgbImage> {
    let transform = Similarity::estimate(landmarks, &REFERENCE)?;
    Some(RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |u, v| {
        let (x, y) = transform.invert(u as f32, v as f32);
        sample_bilinear(image, x, y)
    }))
}

fn sample_bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x.floor(), y - y.floor());

    let at = |px: i64, py: i64| -> [f32; 3] {
        if px < 0 || py < 0 || px >= w || py >= h {
            return [0.0; 3];
        }
        let p = image.get_pixel(px as u32, py as u32).0;
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };
    let (tl, tr, bl, br) = (at(x0, y0), at(x0 + 1, y0), at(x0, y0 + 1), at(x0 + 1, y0 + 1));

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bottom = bl[c] * (1.0 - fx) + br[c] * fx;
        out[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Crop the detection box and stretch it to the network input. Used when
/// the detector gave no landmarks.
fn crop_resize(image: &RgbImage, region: &FaceRegion) -> Option<RgbImage> {
    if region.width() == 0 || region.height() == 0 {
        return None;
    }
    let crop = imageops::crop_imm(
        image,
        region.left as u32,
        region.top as u32,
        region.width() as u32,
        region.height() as u32,
    )
    .to_image();
    Some(imageops::resize(&crop, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle))
}

fn to_tensor(face: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - MEAN) / STD;
        }
    }
    tensor
}

fn l2_normalize(mut values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}

/// Detection box clamped to the image bounds.
fn clamp_region(det: &Detection, width: u32, height: u32) -> FaceRegion {
    let clamp_x = |v: f32| v.round().clamp(0.0, width as f32) as i32;
    let clamp_y = |v: f32| v.round().clamp(0.0, height as f32) as i32;
    FaceRegion {
        top: clamp_y(det.y),
        right: clamp_x(det.x + det.width),
        bottom: clamp_y(det.y + det.height),
        left: clamp_x(det.x),
    }
}

/// ArcFace (w600k_r50) embedding extractor.
pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, SourceError> {
        if !model_path.exists() {
            return Err(SourceError::ModelNotFound(model_path.to_path_buf()));
        }
        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;
        tracing::info!(path = %model_path.display(), "loaded ArcFace model");
        Ok(Self { session })
    }

    /// Unit-length embedding of an aligned 112x112 crop.
    pub fn embed(&mut self, face: &RgbImage) -> Result<Embedding, SourceError> {
        let input = to_tensor(face);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| SourceError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(SourceError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(Embedding::new(l2_normalize(raw.to_vec())))
    }
}

/// SCRFD detection followed by ArcFace embedding of each face.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    embedder: FaceEmbedder,
}

impl OnnxEmbedder {
    pub fn load(detector_path: &Path, embedder_path: &Path) -> Result<Self, SourceError> {
        Ok(Self {
            detector: FaceDetector::load(detector_path)?,
            embedder: FaceEmbedder::load(embedder_path)?,
        })
    }
}

impl EmbeddingSource for OnnxEmbedder {
    fn detect_and_embed(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, SourceError> {
        let detections = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(detections.len());

        for det in &detections {
            let region = clamp_region(det, image.width(), image.height());
            let crop = match &det.landmarks {
                Some(landmarks) => align(image, landmarks),
                None => crop_resize(image, &region),
            };
            let Some(crop) = crop else {
                tracing::debug!(?region, "skipping degenerate detection");
                continue;
            };
            faces.push(DetectedFace {
                region,
                embedding: self.embedder.embed(&crop)?,
                score: det.score,
            });
        }

        tracing::trace!(detected = detections.len(), embedded = faces.len(), "faces processed");
        Ok(faces)
    }
}
