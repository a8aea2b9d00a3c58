//! Frame type and pixel conversions: YUYV/GREY to RGB, RGB to grayscale.

use image::{GrayImage, RgbImage};

/// A captured color camera frame.
#[derive(Clone)]
pub struct Frame {
    /// RGB8 pixels, row-major.
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Grayscale copy of the frame, used for detection and recognition.
    pub fn to_gray(&self) -> GrayImage {
        rgb_to_gray(&self.image)
    }

    /// Average luma brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let gray = self.to_gray();
        if gray.is_empty() {
            return 0.0;
        }
        gray.as_raw().iter().map(|&b| b as f32).sum::<f32>() / gray.as_raw().len() as f32
    }
}

/// Convert packed YUYV (4:2:2) to RGB using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidDimensions { width, height })
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clip = |x: i32| x.clamp(0, 255) as u8;
    [
        clip((298 * c + 409 * e + 128) >> 8),
        clip((298 * c - 100 * d - 208 * e + 128) >> 8),
        clip((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Expand 8-bit grayscale (native GREY output) to RGB by replicating the channel.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    if gray.len() < pixels {
        return Err(FrameError::InvalidLength {
            expected: pixels,
            actual: gray.len(),
        });
    }
    let rgb = gray[..pixels].iter().flat_map(|&p| [p, p, p]).collect();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidDimensions { width, height })
}

/// Convert RGB to 8-bit luma with BT.601 weights (0.299, 0.587, 0.114).
///
/// Fixed-point with 14 fractional bits, matching the weights the bundled
/// Haar cascades were trained against.
pub fn rgb_to_gray(rgb: &RgbImage) -> GrayImage {
    const R: u32 = 4899;
    const G: u32 = 9617;
    const B: u32 = 1868;

    let data = rgb
        .as_raw()
        .chunks_exact(3)
        .map(|p| ((p[0] as u32 * R + p[1] as u32 * G + p[2] as u32 * B + (1 << 13)) >> 14) as u8)
        .collect();
    // Same dimensions as a valid RgbImage, so the buffer is always the right size.
    GrayImage::from_raw(rgb.width(), rgb.height(), data).unwrap_or_default()
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("invalid frame dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_black_and_white() {
        // 2x1 image: both pixels share U/V = 128 (no chroma)
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_to_rgb_dimensions() {
        let yuyv = vec![128u8; 4 * 2 * 2];
        let rgb = yuyv_to_rgb(&yuyv, 4, 2).unwrap();
        assert_eq!(rgb.dimensions(), (4, 2));
        assert_eq!(rgb.as_raw().len(), 4 * 2 * 3);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(yuyv_to_rgb(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_grey_to_rgb_replicates() {
        let rgb = grey_to_rgb(&[10, 200], 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [10, 10, 10]);
        assert_eq!(rgb.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn test_rgb_to_gray_weights() {
        let mut rgb = RgbImage::new(3, 1);
        rgb.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        rgb.put_pixel(1, 0, image::Rgb([255, 255, 255]));
        rgb.put_pixel(2, 0, image::Rgb([0, 0, 0]));
        let gray = rgb_to_gray(&rgb);
        assert_eq!(gray.get_pixel(0, 0).0, [76]);
        assert_eq!(gray.get_pixel(1, 0).0, [255]);
        assert_eq!(gray.get_pixel(2, 0).0, [0]);
    }

    #[test]
    fn test_avg_brightness_uniform() {
        let frame = Frame::new(RgbImage::from_pixel(8, 8, image::Rgb([128, 128, 128])), 0);
        assert!((frame.avg_brightness() - 128.0).abs() < 1e-3);
    }
}
