//! Frame type, pixel conversion, and JPEG data-URL encoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

pub const DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// A captured RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = rgb_len(width, height);
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    /// Average luma (0.0–255.0), BT.601 weights.
    pub fn avg_brightness(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum: f32 = self
            .data
            .chunks_exact(3)
            .map(|px| 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32)
            .sum();
        sum / (self.data.len() / 3) as f32
    }
}

fn rgb_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 3
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Convert packed YUYV (4:2:2) to RGB8 using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share chroma.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(rgb_len(width, height));
    for quad in yuyv[..expected].chunks_exact(4) {
        let d = quad[1] as i32 - 128;
        let e = quad[3] as i32 - 128;
        for y in [quad[0], quad[2]] {
            let c = y as i32 - 16;
            rgb.push(clamp_u8((298 * c + 409 * e + 128) >> 8));
            rgb.push(clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8));
            rgb.push(clamp_u8((298 * c + 516 * d + 128) >> 8));
        }
    }
    Ok(rgb)
}

/// Expand 8-bit grayscale to RGB8.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = width as usize * height as usize;
    if grey.len() < pixels {
        return Err(FrameError::InvalidLength {
            expected: pixels,
            actual: grey.len(),
        });
    }
    Ok(grey[..pixels].iter().flat_map(|&g| [g, g, g]).collect())
}

/// Decode a motion-JPEG buffer to RGB8, returning the decoded dimensions.
pub fn mjpeg_to_rgb(jpeg: &[u8]) -> Result<(Vec<u8>, u32, u32), FrameError> {
    let img = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(e.to_string()))?
        .to_rgb8();
    let (width, height) = img.dimensions();
    Ok((img.into_raw(), width, height))
}

/// Check if a frame is almost entirely black (>`threshold_pct` of luma < 32).
pub fn is_dark_frame(frame: &Frame, threshold_pct: f32) -> bool {
    if frame.data.is_empty() {
        return true;
    }
    let pixels = frame.data.len() / 3;
    let dark = frame
        .data
        .chunks_exact(3)
        .filter(|px| px.iter().all(|&c| c < 32))
        .count();
    (dark as f32 / pixels as f32) > threshold_pct
}

/// JPEG encoder with a reused output buffer.
///
/// One encoder serves every sampling tick; ticks never overlap, so the
/// scratch buffer is simply overwritten.
pub struct FrameEncoder {
    quality: u8,
    scratch: Vec<u8>,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            scratch: Vec::new(),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Encode into the scratch buffer and borrow the JPEG bytes.
    pub fn encode_jpeg(&mut self, frame: &Frame) -> Result<&[u8], FrameError> {
        let expected = rgb_len(frame.width, frame.height);
        if frame.data.len() != expected || expected == 0 {
            return Err(FrameError::InvalidLength {
                expected,
                actual: frame.data.len(),
            });
        }
        self.scratch.clear();
        JpegEncoder::new_with_quality(&mut self.scratch, self.quality)
            .encode(&frame.data, frame.width, frame.height, ExtendedColorType::Rgb8)
            .map_err(|e| FrameError::Encode(e.to_string()))?;
        Ok(&self.scratch)
    }

    /// Encode as `data:image/jpeg;base64,...`, the payload the classifier expects.
    pub fn encode_data_url(&mut self, frame: &Frame) -> Result<String, FrameError> {
        let jpeg = self.encode_jpeg(frame)?;
        let mut url = String::with_capacity(DATA_URL_PREFIX.len() + jpeg.len().div_ceil(3) * 4);
        url.push_str(DATA_URL_PREFIX);
        STANDARD.encode_string(jpeg, &mut url);
        Ok(url)
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("encode failed: {0}")]
    Encode(String),
}
