//! RGB frame type and pixel-format conversion.

use image::imageops::{self, FilterType};
use image::RgbImage;
use std::time::Instant;
use thiserror::Error;

/// A captured camera frame, already converted to 8-bit RGB.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    /// Driver sequence number, or a running counter for synthetic sources.
    pub sequence: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            sequence,
            timestamp: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum FrameError {
    #[error("invalid {format} buffer length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(format: &'static str, buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn to_image(width: u32, height: u32, rgb: Vec<u8>) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 3) as usize;
    let actual = rgb.len();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        format: "RGB",
        expected,
        actual,
    })
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Convert packed YUYV 4:2:2 (`[Y0, U, Y1, V]` per pixel pair) to RGB
/// using BT.601 full-range coefficients.
pub fn yuyv_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len("YUYV", buf, expected)?;

    let mut out = Vec::with_capacity((width * height * 3) as usize);
    for chunk in buf[..expected].chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        for y in [chunk[0] as f32, chunk[2] as f32] {
            out.push(clamp_u8(y + 1.402 * v));
            out.push(clamp_u8(y - 0.344_136 * u - 0.714_136 * v));
            out.push(clamp_u8(y + 1.772 * u));
        }
    }
    to_image(width, height, out)
}

/// Replicate 8-bit grayscale into three channels.
pub fn grey_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len("GREY", buf, pixels)?;
    let out = buf[..pixels].iter().flat_map(|&y| [y, y, y]).collect();
    to_image(width, height, out)
}

/// Copy a packed RGB24 buffer.
pub fn rgb24_to_rgb(buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 3) as usize;
    check_len("RGB3", buf, expected)?;
    to_image(width, height, buf[..expected].to_vec())
}

/// Shrink `image` by `scale_factor` in each dimension. Factors outside
/// `(0, 1)` return an unscaled copy.
pub fn downscale(image: &RgbImage, scale_factor: f32) -> RgbImage {
    if !(scale_factor > 0.0 && scale_factor < 1.0) {
        return image.clone();
    }
    let w = ((image.width() as f32 * scale_factor) as u32).max(1);
    let h = ((image.height() as f32 * scale_factor) as u32).max(1);
    imageops::resize(image, w, h, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_neutral_chroma_is_gray() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let img = yuyv_to_rgb(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [100, 100, 100]);
        assert_eq!(img.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn test_yuyv_red_chroma() {
        let img = yuyv_to_rgb(&[128, 128, 128, 255], 2, 1).unwrap();
        let [r, g, b] = img.get_pixel(0, 0).0;
        assert!(r > 250 && g < 60 && b == 128);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let err = yuyv_to_rgb(&[100, 128], 2, 1).unwrap_err();
        assert_eq!(
            err,
            FrameError::InvalidLength { format: "YUYV", expected: 4, actual: 2 }
        );
    }

    #[test]
    fn test_grey_to_rgb() {
        let img = grey_to_rgb(&[7, 9, 11, 13, 99], 2, 2).unwrap();
        assert_eq!(img.get_pixel(1, 1).0, [13, 13, 13]);
        assert!(grey_to_rgb(&[1, 2, 3], 2, 2).is_err());
    }

    #[test]
    fn test_rgb24_copy() {
        let img = rgb24_to_rgb(&[1, 2, 3, 4, 5, 6], 2, 1).unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [4, 5, 6]);
    }

    #[test]
    fn test_downscale() {
        let img = RgbImage::from_pixel(640, 480, image::Rgb([50, 60, 70]));
        let half = downscale(&img, 0.5);
        assert_eq!(half.dimensions(), (320, 240));
        assert_eq!(half.get_pixel(10, 10).0, [50, 60, 70]);
        assert_eq!(downscale(&img, 1.0).dimensions(), (640, 480));
        assert_eq!(downscale(&img, 0.0).dimensions(), (640, 480));
    }
}
