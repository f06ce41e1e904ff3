//! Live capture loop: frame skipping, result caching, throttled hand-off.
//!
//! The capture thread owns the device and the result cache. Consumers only
//! ever see [`HandOff`] values published on a `watch` channel, so a slow
//! consumer never stalls capture; it simply observes the latest frame.

use facewatch_core::schedule::FrameScheduler;
use facewatch_core::{Config, Recognizer, RecognitionResult};
use facewatch_hw::frame::downscale;
use facewatch_hw::{CaptureDevice, CaptureError};
use image::RgbImage;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(#[source] CaptureError),
    #[error("pipeline is already running")]
    AlreadyRunning,
    #[error("recognizer is not available")]
    RecognizerLost,
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Recognize on every N-th frame.
    pub frame_skip: u64,
    pub scale_factor: f32,
    /// Frames the last result set may be reused for.
    pub cache_frames: u64,
    pub handoff_interval: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frame_skip: config.frame_skip.max(1),
            scale_factor: config.scale_factor,
            cache_frames: config.cache_frames,
            handoff_interval: Duration::from_millis(config.handoff_interval_ms),
        }
    }
}

/// What the consumer sees for one published frame.
#[derive(Debug, Clone)]
pub struct HandOff {
    pub frame: Arc<RgbImage>,
    /// Results to draw on `frame`: fresh or cached.
    pub results: Vec<RecognitionResult>,
    /// Faces recognized per name since the pipeline started.
    pub counts: BTreeMap<String, u64>,
    pub frame_number: u64,
    /// Whether `results` were computed on this frame.
    pub fresh: bool,
}

/// Limits hand-offs to one per interval.
#[derive(Debug)]
struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub frames: u64,
    pub recognized_frames: u64,
    pub failed_frames: u64,
    pub handoffs: u64,
    pub counts: BTreeMap<String, u64>,
}

pub type HandOffReceiver = watch::Receiver<Option<HandOff>>;

/// Owns the capture thread and hands the recognizer back and forth to it.
pub struct FramePipeline {
    settings: PipelineSettings,
    state: Arc<Mutex<PipelineState>>,
    stop: Arc<AtomicBool>,
    handoff: Arc<watch::Sender<Option<HandOff>>>,
    recognizer: Option<Recognizer>,
    worker: Option<JoinHandle<(Recognizer, PipelineStats)>>,
    last_stats: Option<PipelineStats>,
}

impl FramePipeline {
    pub fn new(settings: PipelineSettings, recognizer: Recognizer) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            settings,
            state: Arc::new(Mutex::new(PipelineState::Stopped)),
            stop: Arc::new(AtomicBool::new(false)),
            handoff: Arc::new(tx),
            recognizer: Some(recognizer),
            worker: None,
            last_stats: None,
        }
    }

    pub fn subscribe(&self) -> HandOffReceiver {
        self.handoff.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Open the device with `open` and start capturing on a new thread.
    ///
    /// The device is opened on the calling thread so an unavailable camera
    /// is reported here rather than from inside the loop.
    pub fn start<D, F>(&mut self, open: F) -> Result<(), PipelineError>
    where
        D: CaptureDevice + 'static,
        F: FnOnce() -> Result<D, CaptureError>,
    {
        if self.state() != PipelineState::Stopped {
            return Err(PipelineError::AlreadyRunning);
        }
        self.reap();
        let mut recognizer = self.recognizer.take().ok_or(PipelineError::RecognizerLost)?;

        self.set_state(PipelineState::Starting);
        let device = match open() {
            Ok(device) => device,
            Err(e) => {
                tracing::error!(error = %e, "failed to open capture device");
                self.recognizer = Some(recognizer);
                self.set_state(PipelineState::Stopped);
                return Err(PipelineError::DeviceUnavailable(e));
            }
        };

        self.stop.store(false, Ordering::SeqCst);
        let settings = self.settings;
        let stop = Arc::clone(&self.stop);
        let state = Arc::clone(&self.state);
        let handoff = Arc::clone(&self.handoff);

        let spawned = std::thread::Builder::new()
            .name("facewatch-capture".into())
            .spawn(move || {
                tracing::info!("capture thread started");
                let stats = capture_loop(device, &mut recognizer, &settings, &stop, &handoff);
                *state.lock().unwrap_or_else(PoisonError::into_inner) = PipelineState::Stopped;
                tracing::info!(
                    frames = stats.frames,
                    recognized = stats.recognized_frames,
                    failed = stats.failed_frames,
                    "capture thread exiting"
                );
                (recognizer, stats)
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                // The thread may already have hit end of stream and set Stopped.
                let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if *guard == PipelineState::Starting {
                    *guard = PipelineState::Running;
                }
                Ok(())
            }
            Err(e) => {
                self.set_state(PipelineState::Stopped);
                Err(PipelineError::Spawn(e))
            }
        }
    }

    /// Ask the capture thread to stop and wait for it to release the device.
    pub fn stop(&mut self) -> Option<&PipelineStats> {
        if self.worker.is_none() {
            return self.last_stats.as_ref();
        }
        self.set_state(PipelineState::Stopping);
        self.stop.store(true, Ordering::SeqCst);
        self.reap();
        self.set_state(PipelineState::Stopped);
        self.last_stats.as_ref()
    }

    /// Block until the capture thread ends on its own (end of stream).
    #[cfg(test)]
    pub fn wait(&mut self) -> Option<&PipelineStats> {
        self.reap();
        self.last_stats.as_ref()
    }

    fn reap(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        match worker.join() {
            Ok((recognizer, stats)) => {
                self.recognizer = Some(recognizer);
                self.last_stats = Some(stats);
            }
            Err(_) => tracing::error!("capture thread panicked"),
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop<D: CaptureDevice>(
    mut device: D,
    recognizer: &mut Recognizer,
    settings: &PipelineSettings,
    stop: &AtomicBool,
    handoff: &watch::Sender<Option<HandOff>>,
) -> PipelineStats {
    let mut scheduler = FrameScheduler::new(settings.frame_skip, settings.cache_frames);
    let mut throttle = Throttle::new(settings.handoff_interval);
    let mut stats = PipelineStats::default();

    while !stop.load(Ordering::SeqCst) {
        let frame = match device.read() {
            Ok(frame) => frame,
            Err(CaptureError::EndOfStream) => {
                tracing::info!("capture stream ended");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "frame read failed, stopping capture");
                break;
            }
        };
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

        if throttle.ready(Instant::now()) {
            handoff.send_replace(Some(HandOff {
                frame: Arc::new(frame.image),
                results: scheduler.cached().to_vec(),
                counts: stats.counts.clone(),
                frame_number: scheduler.frame_number(),
                fresh,
            }));
            stats.handoffs += 1;
        }
    }

    drop(device);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use facewatch_core::{
        ArcCell, DetectedFace, Embedding, EmbeddingSource, FaceRegion, ModelSnapshot,
        RecognitionConfig, SnapshotCell, SourceError,
    };
    use facewatch_hw::{Frame, ReplayDevice};
    use std::sync::atomic::AtomicUsize;

    /// Counts calls and reports one face at a fixed region.
    struct CountingSource {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl EmbeddingSource for CountingSource {
        fn detect_and_embed(
            &mut self,
            image: &RgbImage,
        ) -> Result<Vec<DetectedFace>, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SourceError::InferenceFailed("boom".into()));
            }
            let (w, h) = image.dimensions();
            Ok(vec![DetectedFace {
                region: FaceRegion { top: 0, right: w as i32, bottom: h as i32, left: 0 },
                embedding: Embedding::new(vec![1.0, 0.0]),
                score: 0.9,
            }])
        }
    }

    /// Produces frames forever and records when it is dropped.
    struct EndlessDevice {
        released: Arc<AtomicBool>,
        sequence: u32,
    }

    impl CaptureDevice for EndlessDevice {
        fn read(&mut self) -> Result<Frame, CaptureError> {
            std::thread::sleep(Duration::from_millis(1));
            self.sequence += 1;
            Ok(Frame::new(RgbImage::new(8, 8), self.sequence))
        }
    }

    impl Drop for EndlessDevice {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn recognizer(calls: Arc<AtomicUsize>, fail: bool) -> Recognizer {
        let snapshot = ModelSnapshot::new(
            "g",
            BTreeMap::from([(0, vec![1.0, 0.0])]),
            BTreeMap::from([(0, "alice".to_string())]),
            None,
        )
        .unwrap();
        Recognizer::new(
            Box::new(CountingSource { calls, fail }),
            Arc::new(SnapshotCell::new(Some(snapshot))),
            Arc::new(ArcCell::new(RecognitionConfig::default())),
        )
    }

    fn settings(frame_skip: u64) -> PipelineSettings {
        PipelineSettings {
            frame_skip,
            scale_factor: 0.5,
            cache_frames: 5,
            handoff_interval: Duration::ZERO,
        }
    }

    fn frames(n: usize) -> ReplayDevice {
        ReplayDevice::new((0..n).map(|_| RgbImage::new(64, 48)))
    }

    #[test]
    fn test_throttle() {
        let mut t = Throttle::new(Duration::from_millis(33));
        let start = Instant::now();
        assert!(t.ready(start));
        assert!(!t.ready(start + Duration::from_millis(10)));
        assert!(t.ready(start + Duration::from_millis(40)));
    }

    #[test]
    fn test_pipeline_recognizes_frames_3_6_9() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = FramePipeline::new(settings(3), recognizer(Arc::clone(&calls), false));
        let rx = pipeline.subscribe();

        pipeline.start(|| Ok(frames(10))).unwrap();
        let stats = pipeline.wait().cloned().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.frames, 10);
        assert_eq!(stats.recognized_frames, 3);
        assert_eq!(stats.handoffs, 10);
        assert_eq!(stats.counts["alice"], 3);
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        let last = rx.borrow().clone().unwrap();
        assert_eq!(last.frame_number, 10);
        assert!(!last.fresh);
        assert_eq!(last.results.len(), 1);
        // Detected on the half-size frame, reported at full size.
        assert_eq!(last.results[0].region, FaceRegion { top: 0, right: 64, bottom: 48, left: 0 });
        assert_eq!(last.counts["alice"], 3);
    }

    #[test]
    fn test_recognition_failure_counts_and_reuses() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = FramePipeline::new(settings(2), recognizer(Arc::clone(&calls), true));
        pipeline.start(|| Ok(frames(6))).unwrap();
        let stats = pipeline.wait().cloned().unwrap();
        assert_eq!(stats.failed_frames, 3);
        assert_eq!(stats.recognized_frames, 0);
        assert!(stats.counts.is_empty());
    }

    #[test]
    fn test_open_failure_leaves_pipeline_stopped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = FramePipeline::new(settings(3), recognizer(calls, false));
        let err = pipeline
            .start(|| -> Result<ReplayDevice, CaptureError> {
                Err(CaptureError::DeviceUnavailable("/dev/video9".into()))
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::DeviceUnavailable(_)));
        assert_eq!(pipeline.state(), PipelineState::Stopped);

        // The recognizer is still there for the next attempt.
        pipeline.start(|| Ok(frames(3))).unwrap();
        assert_eq!(pipeline.wait().unwrap().frames, 3);
    }

    #[test]
    fn test_stop_releases_device() {
        let released = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = FramePipeline::new(settings(3), recognizer(calls, false));
        let rx = pipeline.subscribe();

        let flag = Arc::clone(&released);
        pipeline
            .start(move || Ok(EndlessDevice { released: flag, sequence: 0 }))
            .unwrap();
        assert!(matches!(
            pipeline.start(|| Ok(frames(1))),
            Err(PipelineError::AlreadyRunning)
        ));

        let deadline = Instant::now() + Duration::from_secs(5);
        while rx.borrow().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(pipeline.stop().unwrap().frames > 0);
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }
}
