//! Video file playback through ffmpeg (libavformat + libavcodec).

use crate::device::{CaptureDevice, CaptureError};
use crate::frame::{self, Frame};
use ffmpeg_next::format::context::Input;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::frame::video::Video;
use std::path::Path;

/// Stream properties reported when a file is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Frame count from the container; 0 when unknown.
    pub frames: u64,
    pub codec: String,
}

/// Decodes a video file frame by frame as a [`CaptureDevice`].
///
/// Reports [`CaptureError::EndOfStream`] once the decoder is drained.
pub struct VideoFile {
    input: Input,
    decoder: ffmpeg_next::decoder::Video,
    scaler: scaling::Context,
    stream_index: usize,
    info: VideoInfo,
    sequence: u32,
    draining: bool,
}

// Safety: the ffmpeg contexts are owned exclusively by this value and only
// touched through `&mut self`, so moving it to another thread is sound.
unsafe impl Send for VideoFile {}

impl VideoFile {
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let unavailable =
            |e: ffmpeg_next::Error| CaptureError::DeviceUnavailable(format!("{}: {e}", path.display()));

        ffmpeg_next::init().map_err(unavailable)?;
        let input = ffmpeg_next::format::input(path).map_err(unavailable)?;
        let stream = input
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| {
                CaptureError::DeviceUnavailable(format!("{}: no video stream", path.display()))
            })?;
        let stream_index = stream.index();
        let rate = stream.rate();
        let fps = if rate.denominator() != 0 {
            f64::from(rate.numerator()) / f64::from(rate.denominator())
        } else {
            0.0
        };
        let frames = u64::try_from(stream.frames()).unwrap_or(0);

        let decoder = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .map_err(unavailable)?;
        let (width, height) = (decoder.width(), decoder.height());
        let scaler = scaling::Context::get(
            decoder.format(),
            width,
            height,
            Pixel::RGB24,
            width,
            height,
            scaling::Flags::BILINEAR,
        )
        .map_err(|e| CaptureError::FormatNegotiationFailed(e.to_string()))?;

        let info = VideoInfo {
            width,
            height,
            fps,
            frames,
            codec: decoder
                .codec()
                .map(|c| c.name().to_string())
                .unwrap_or_default(),
        };
        tracing::info!(
            path = %path.display(),
            width,
            height,
            fps,
            codec = %info.codec,
            "video opened"
        );

        Ok(Self {
            input,
            decoder,
            scaler,
            stream_index,
            info,
            sequence: 0,
            draining: false,
        })
    }

    pub fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn receive(&mut self) -> Result<Option<Frame>, CaptureError> {
        let mut decoded = Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }
        let mut rgb = Video::empty();
        self.scaler
            .run(&decoded, &mut rgb)
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

        let (width, height) = (self.info.width, self.info.height);
        let packed = pack_rows(rgb.data(0), rgb.stride(0), width, height);
        let image = frame::rgb24_to_rgb(&packed, width, height)
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(Frame::new(image, self.sequence)))
    }
}

impl CaptureDevice for VideoFile {
    fn read(&mut self) -> Result<Frame, CaptureError> {
        loop {
            if let Some(frame) = self.receive()? {
                return Ok(frame);
            }
            if self.draining {
                return Err(CaptureError::EndOfStream);
            }
            match self.input.packets().next() {
                Some((stream, packet)) => {
                    if stream.index() != self.stream_index {
                        continue;
                    }
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        tracing::debug!(error = %e, "skipping undecodable packet");
                    }
                }
                None => {
                    let _ = self.decoder.send_eof();
                    self.draining = true;
                }
            }
        }
    }
}

/// Copy `height` rows of `width` RGB pixels out of a buffer whose rows are
/// `stride` bytes apart.
fn pack_rows(data: &[u8], stride: usize, width: u32, height: u32) -> Vec<u8> {
    let row = width as usize * 3;
    let mut packed = Vec::with_capacity(row * height as usize);
    for chunk in data.chunks(stride.max(row)).take(height as usize) {
        packed.extend_from_slice(&chunk[..row.min(chunk.len())]);
    }
    packed
}
