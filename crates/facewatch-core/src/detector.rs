//! SCRFD face detector over RGB images.
//!
//! Letterboxes the image into the 640x640 network input, decodes the three
//! stride heads (boxes plus five landmarks per anchor) and merges them with
//! non-maximum suppression.

use crate::source::SourceError;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Five facial landmarks: eyes, nose tip, mouth corners.
pub type Landmarks = [(f32, f32); 5];

/// Raw detector output in source-image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
    pub landmarks: Option<Landmarks>,
}

impl Detection {
    fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let scale = (INPUT_SIZE as f32 / width as f32).min(INPUT_SIZE as f32 / height as f32);
        let (new_w, new_h) = Self::scaled_size(width, height, scale);
        Self {
            scale,
            pad_x: (INPUT_SIZE - new_w) as f32 / 2.0,
            pad_y: (INPUT_SIZE - new_h) as f32 / 2.0,
        }
    }

    fn scaled_size(width: u32, height: u32, scale: f32) -> (u32, u32) {
        let w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        let h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
        (w, h)
    }

    /// Map a point from network input space back to the source image.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions (score, bbox, kps) for one stride.
type HeadIndices = (usize, usize, usize);

pub struct FaceDetector {
    session: Session,
    heads: [HeadIndices; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, SourceError> {
        if !model_path.exists() {
            return Err(SourceError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 9 {
            return Err(SourceError::InferenceFailed(format!(
                "detector needs 9 outputs (score/bbox/kps per stride), got {}",
                names.len()
            )));
        }
        let heads = head_indices(&names);
        tracing::info!(path = %model_path.display(), outputs = ?names, ?heads, "loaded SCRFD model");

        Ok(Self { session, heads })
    }

    /// Faces in `image`, highest score first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, SourceError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, letterbox) = preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in STRIDES.iter().zip(&self.heads) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data.to_vec())
                    .map_err(|e| SourceError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let boxes = extract(bbox_idx, "boxes")?;
            let kps = extract(kps_idx, "landmarks")?;
            detections.extend(decode_stride(&scores, &boxes, &kps, stride, &letterbox));
        }

        Ok(nms(detections, NMS_THRESHOLD))
    }
}

fn preprocess(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height());
    let (new_w, new_h) = Letterbox::scaled_size(image.width(), image.height(), letterbox.scale);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    // Padding stays at zero, which is the normalized mean.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let off_x = letterbox.pad_x.floor() as usize;
    let off_y = letterbox.pad_y.floor() as usize;
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (off_x + x as usize, off_y + y as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - MEAN) / STD;
        }
    }
    (tensor, letterbox)
}

/// Locate stride heads by output name (`score_8`, `bbox_16`, ...), falling
/// back to the usual positional export order.
fn head_indices(names: &[String]) -> [HeadIndices; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let named: Option<Vec<HeadIndices>> = STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(heads) if heads.len() == 3 => [heads[0], heads[1], heads[2]],
        _ => [(0, 3, 6), (1, 4, 7), (2, 5, 8)],
    }
}

fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<Detection> {
    let grid = INPUT_SIZE as usize / stride;
    let anchors = grid * grid * ANCHORS_PER_CELL;
    let s = stride as f32;

    let mut out = Vec::new();
    for idx in 0..anchors.min(scores.len()) {
        let score = scores[idx];
        if score <= SCORE_THRESHOLD {
            continue;
        }
        let Some(b) = boxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };
        let cell = idx / ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * s;
        let ay = (cell / grid) as f32 * s;

        let (x1, y1) = letterbox.unmap(ax - b[0] * s, ay - b[1] * s);
        let (x2, y2) = letterbox.unmap(ax + b[2] * s, ay + b[3] * s);

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            let mut points = [(0.0, 0.0); 5];
            for (i, point) in points.iter_mut().enumerate() {
                *point = letterbox.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s);
            }
            points
        });

        out.push(Detection {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            score,
            landmarks,
        });
    }
    out
}

fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let iw = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let ih = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = iw * ih;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
