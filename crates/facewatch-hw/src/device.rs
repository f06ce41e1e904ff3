//! Capture device seam shared by the V4L2 camera and synthetic sources.

use crate::frame::Frame;
use image::RgbImage;
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("end of stream")]
    EndOfStream,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// A source of frames. Opening happens in the implementor's constructor and
/// release happens on drop.
pub trait CaptureDevice: Send {
    /// Block until the next frame is available.
    fn read(&mut self) -> Result<Frame, CaptureError>;
}

impl<D: CaptureDevice + ?Sized> CaptureDevice for Box<D> {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        (**self).read()
    }
}

/// Plays back a fixed list of images, then reports end of stream.
pub struct ReplayDevice {
    frames: VecDeque<RgbImage>,
    sequence: u32,
}

impl ReplayDevice {
    pub fn new(frames: impl IntoIterator<Item = RgbImage>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
            sequence: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl CaptureDevice for ReplayDevice {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let image = self.frames.pop_front().ok_or(CaptureError::EndOfStream)?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Frame::new(image, self.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_device_ends() {
        let mut dev = ReplayDevice::new(vec![RgbImage::new(2, 2), RgbImage::new(3, 3)]);
        assert_eq!(dev.read().unwrap().sequence, 1);
        let second = dev.read().unwrap();
        assert_eq!((second.sequence, second.width()), (2, 3));
        assert!(matches!(dev.read(), Err(CaptureError::EndOfStream)));
        assert_eq!(dev.remaining(), 0);
    }
}
