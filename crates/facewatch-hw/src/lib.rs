//! facewatch-hw: Frame capture for the live pipeline.
//!
//! Provides the [`CaptureDevice`] seam, a V4L2 camera implementation that
//! delivers RGB frames, ffmpeg-backed video file playback, and the
//! pixel-format conversions they need.

pub mod camera;
pub mod device;
pub mod frame;
pub mod video;

pub use camera::{Camera, DeviceInfo, PixelFormat};
pub use device::{CaptureDevice, CaptureError, ReplayDevice};
pub use frame::Frame;
pub use video::{VideoFile, VideoInfo};
