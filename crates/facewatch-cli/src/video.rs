//! Offline recognition over a video file.
//!
//! Frames are scheduled the same way as live capture: every N-th frame is
//! recognized on a downscaled copy and the result set is reused for up to K
//! frames in between.

use facewatch_core::schedule::FrameScheduler;
use facewatch_core::{Config, RecognitionResult, Recognizer};
use facewatch_hw::frame::downscale;
use facewatch_hw::{CaptureDevice, CaptureError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy)]
pub struct VideoSettings {
    pub frame_skip: u64,
    pub scale_factor: f32,
    pub cache_frames: u64,
}

impl VideoSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frame_skip: config.frame_skip.max(1),
            scale_factor: config.scale_factor,
            cache_frames: config.cache_frames,
        }
    }
}

/// Faces shown on one frame.
#[derive(Debug, Clone, Serialize)]
pub struct FrameRecord {
    pub frame: u64,
    /// Whether `results` were computed on this frame rather than reused.
    pub fresh: bool,
    pub results: Vec<RecognitionResult>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VideoStats {
    pub frames: u64,
    pub recognized_frames: u64,
    pub failed_frames: u64,
    /// Faces recognized per name, counted on fresh frames only.
    pub counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VideoReport {
    pub source: PathBuf,
    pub stats: VideoStats,
    /// Frames that carry at least one face.
    pub frames: Vec<FrameRecord>,
    /// Set when decoding stopped before the end of the file.
    pub error: Option<String>,
}

/// Run every frame of `device` through `recognizer` until end of stream.
pub fn process_video<D: CaptureDevice>(
    device: &mut D,
    recognizer: &mut Recognizer,
    settings: &VideoSettings,
    source: &Path,
) -> VideoReport {
    let mut scheduler = FrameScheduler::new(settings.frame_skip, settings.cache_frames);
    let mut report = VideoReport {
        source: source.to_path_buf(),
        ..VideoReport::default()
    };

    loop {
        let frame = match device.read() {
            Ok(frame) => frame,
            Err(CaptureError::EndOfStream) => break,
            Err(e) => {
                tracing::warn!(frame = report.stats.frames + 1, error = %e, "video decoding stopped");
                report.error = Some(e.to_string());
                break;
            }
        };
        let stats = &mut report.stats;
        stats.frames += 1;

        let mut fresh = false;
        if scheduler.tick() {
            let small = downscale(&frame.image, settings.scale_factor);
            match recognizer.recognize(&small) {
                Ok(results) => {
                    let results: Vec<_> = results
                        .into_iter()
                        .map(|r| r.rescaled(settings.scale_factor))
                        .collect();
                    for r in &results {
                        *stats.counts.entry(r.name.clone()).or_default() += 1;
                    }
                    scheduler.refresh(results);
                    stats.recognized_frames += 1;
                    fresh = true;
                }
                Err(e) => {
                    tracing::warn!(frame = scheduler.frame_number(), error = %e, "recognition failed");
                    stats.failed_frames += 1;
                    scheduler.reuse();
                }
            }
        } else {
            scheduler.reuse();
        }

        if !scheduler.cached().is_empty() {
            report.frames.push(FrameRecord {
                frame: scheduler.frame_number(),
                fresh,
                results: scheduler.cached().to_vec(),
            });
        }
        if stats.frames % 30 == 0 {
            tracing::info!(frames = stats.frames, "video frames processed");
        }
    }
    report
}

/// `processed_<timestamp>_<file stem>.json`
pub fn report_name(source: &Path, at: chrono::DateTime<chrono::Local>) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    format!("processed_{}_{stem}.json", at.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use facewatch_core::{
        ArcCell, DetectedFace, Embedding, EmbeddingSource, FaceRegion, ModelSnapshot,
        RecognitionConfig, SnapshotCell, SourceError,
    };
    use facewatch_hw::{Frame, ReplayDevice};
    use image::RgbImage;
    use std::sync::Arc;

    /// One face covering the frame, embedded as its corner colour.
    struct ColorSource;

    impl EmbeddingSource for ColorSource {
        fn detect_and_embed(
            &mut self,
            image: &RgbImage,
        ) -> Result<Vec<DetectedFace>, SourceError> {
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

    /// Yields `frames` white frames, then fails.
    struct BrokenDevice {
        frames: u32,
    }

    impl CaptureDevice for BrokenDevice {
        fn read(&mut self) -> Result<Frame, CaptureError> {
            if self.frames == 0 {
                return Err(CaptureError::CaptureFailed("corrupt packet".into()));
            }
            self.frames -= 1;
            Ok(Frame::new(solid([255, 255, 255]), self.frames))
        }
    }

    fn solid(rgb: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(8, 8, image::Rgb(rgb))
    }

    fn recognizer() -> Recognizer {
        let snapshot = ModelSnapshot::new(
            "g",
            BTreeMap::from([(0, vec![1.0, 1.0, 1.0])]),
            BTreeMap::from([(0, "alice".to_string())]),
            None,
        )
        .unwrap();
        Recognizer::new(
            Box::new(ColorSource),
            Arc::new(SnapshotCell::new(Some(snapshot))),
            Arc::new(ArcCell::new(RecognitionConfig::default())),
        )
    }

    fn settings(frame_skip: u64, cache_frames: u64) -> VideoSettings {
        VideoSettings {
            frame_skip,
            scale_factor: 0.5,
            cache_frames,
        }
    }

    #[test]
    fn test_schedule_and_cache_over_file() {
        let mut device = ReplayDevice::new((0..6).map(|_| solid([255, 255, 255])));
        let report = process_video(
            &mut device,
            &mut recognizer(),
            &settings(3, 1),
            Path::new("clip.mp4"),
        );

        assert_eq!(report.stats.frames, 6);
        assert_eq!(report.stats.recognized_frames, 2);
        assert_eq!(report.stats.counts["alice"], 2);
        assert!(report.error.is_none());

        let shown: Vec<(u64, bool)> = report.frames.iter().map(|f| (f.frame, f.fresh)).collect();
        // Frame 5 is past the one-frame cache lifetime.
        assert_eq!(shown, vec![(3, true), (4, false), (6, true)]);
        assert_eq!(
            report.frames[0].results[0].region,
            FaceRegion { top: 0, right: 8, bottom: 8, left: 0 }
        );
    }

    #[test]
    fn test_empty_frames_not_recorded() {
        let frames = [[255, 255, 255], [0, 0, 0], [0, 0, 0]].map(solid);
        let mut device = ReplayDevice::new(frames);
        let report =
            process_video(&mut device, &mut recognizer(), &settings(1, 5), Path::new("a.mp4"));
        assert_eq!(report.stats.recognized_frames, 3);
        assert_eq!(report.frames.len(), 1);
        assert_eq!(report.frames[0].results[0].name, "alice");
    }

    #[test]
    fn test_decode_error_keeps_partial_report() {
        let mut device = BrokenDevice { frames: 4 };
        let report =
            process_video(&mut device, &mut recognizer(), &settings(2, 0), Path::new("b.mp4"));
        assert_eq!(report.stats.frames, 4);
        assert_eq!(report.stats.recognized_frames, 2);
        assert_eq!(report.error.as_deref(), Some("capture failed: corrupt packet"));
    }

    #[test]
    fn test_report_name() {
        let at = chrono::Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            report_name(Path::new("/in/lobby.mp4"), at),
            "processed_20240309_140507_lobby.json"
        );
    }
}
