//! V4L2 camera capture via the `v4l` crate.

use crate::device::{CaptureDevice, CaptureError};
use crate::frame::{self, Frame};
use image::RgbImage;
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Rgb24,
    Grey,
}

impl PixelFormat {
    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, CaptureError> {
        let converted = match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Rgb24 => frame::rgb24_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
        };
        converted.map_err(|e| CaptureError::CaptureFailed(e.to_string()))
    }

    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"RGB3" => Some(Self::Rgb24),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

/// V4L2 camera streaming through memory-mapped buffers.
///
/// The device is opened and streaming starts in [`Camera::open`]; dropping
/// the camera stops the stream and closes the device.
pub struct Camera {
    stream: Stream<'static>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `/dev/video<index>`.
    pub fn open_index(index: u32) -> Result<Self, CaptureError> {
        Self::open(&format!("/dev/video{index}"))
    }

    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CaptureError> {
        if !Path::new(device_path).exists() {
            return Err(CaptureError::DeviceUnavailable(format!("{device_path} does not exist")));
        }
        let device = Device::with_path(device_path)
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{device_path}: {e}")))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::DeviceUnavailable(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::StreamingNotSupported);
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut fmt = device
            .format()
            .map_err(|e| CaptureError::FormatNegotiationFailed(format!("get format: {e}")))?;
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;
        fmt.fourcc = FourCC::new(b"YUYV");
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CaptureError::FormatNegotiationFailed(format!("set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CaptureError::FormatNegotiationFailed(format!(
                "unsupported pixel format {} (need YUYV, RGB3 or GREY)",
                negotiated.fourcc
            ))
        })?;
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "negotiated format"
        );

        let stream = Stream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CaptureError::CaptureFailed(format!("create mmap stream: {e}")))?;

        Ok(Self {
            stream,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .filter_map(|i| {
                let path = format!("/dev/video{i}");
                if !Path::new(&path).exists() {
                    return None;
                }
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

impl CaptureDevice for Camera {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CaptureError::CaptureFailed(format!("dequeue buffer: {e}")))?;
        let image = self.pixel_format.to_rgb(buf, self.width, self.height)?;
        Ok(Frame::new(image, meta.sequence))
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device_path, "releasing camera");
    }
}
