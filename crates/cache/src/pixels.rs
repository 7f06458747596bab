//! Owned, decoded bitmaps.
//!
//! `PixelBuffer` is the leaf data type of the export pipeline: sources decode
//! into it, the color corrector produces new ones from it and every cache tier
//! stores it. A buffer is immutable once constructed; transforms always
//! allocate a new buffer.

use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::{ExtendedColorType, ImageEncoder, ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

/// Memory layout of a pixel in a [`PixelBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 8-bit red, green, blue
    Rgb8,
    /// 8-bit red, green, blue, alpha (straight alpha)
    Rgba8,
}

impl PixelFormat {
    /// Number of bytes one pixel occupies
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }

    fn color_type(self) -> ExtendedColorType {
        match self {
            PixelFormat::Rgb8 => ExtendedColorType::Rgb8,
            PixelFormat::Rgba8 => ExtendedColorType::Rgba8,
        }
    }
}

/// PNG compression effort used when serializing buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PngCompression {
    /// Fastest encode, largest files
    Fast,
    /// Balanced
    #[default]
    Default,
    /// Smallest files, slowest encode
    Best,
}

impl From<PngCompression> for CompressionType {
    fn from(value: PngCompression) -> Self {
        match value {
            PngCompression::Fast => CompressionType::Fast,
            PngCompression::Default => CompressionType::Default,
            PngCompression::Best => CompressionType::Best,
        }
    }
}

/// Errors raised while constructing or serializing a [`PixelBuffer`]
#[derive(Debug, thiserror::Error)]
pub enum PixelError {
    #[error("buffer holds {actual} bytes but {width}x{height} {format:?} needs {expected}")]
    LengthMismatch {
        width: u32,
        height: u32,
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("{width}x{height} image does not fit in addressable memory")]
    TooLarge { width: u32, height: u32 },
    #[error("image codec error: {0}")]
    Codec(#[from] image::ImageError),
}

/// An owned, decoded bitmap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    bytes: Vec<u8>,
}

impl PixelBuffer {
    /// Wrap `bytes` as a `width` x `height` bitmap.
    ///
    /// Zero dimensions are accepted (with an empty byte buffer); the stages
    /// that cannot work on an empty image reject it themselves.
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        bytes: Vec<u8>,
    ) -> Result<Self, PixelError> {
        let expected = Self::expected_len(width, height, format)
            .ok_or(PixelError::TooLarge { width, height })?;

        if bytes.len() != expected {
            return Err(PixelError::LengthMismatch {
                width,
                height,
                format,
                expected,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            width,
            height,
            format,
            bytes,
        })
    }

    /// Number of bytes a `width` x `height` buffer of `format` occupies, or
    /// `None` when that overflows `usize`.
    pub fn expected_len(width: u32, height: u32, format: PixelFormat) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)?
            .checked_mul(format.bytes_per_pixel())
    }

    /// A solid RGBA buffer
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self, PixelError> {
        let pixel_count = (width as usize)
            .checked_mul(height as usize)
            .ok_or(PixelError::TooLarge { width, height })?;
        let bytes = rgba.repeat(pixel_count);
        Self::new(width, height, PixelFormat::Rgba8, bytes)
    }

    /// Take ownership of an `image` RGBA buffer
    pub fn from_rgba_image(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            width,
            height,
            format: PixelFormat::Rgba8,
            bytes: image.into_raw(),
        }
    }

    /// Copy this buffer into an `image` RGBA buffer, expanding RGB if needed
    pub fn to_rgba_image(&self) -> Result<RgbaImage, PixelError> {
        let rgba = self.to_rgba8_bytes();
        let actual = rgba.len();
        RgbaImage::from_raw(self.width, self.height, rgba).ok_or(PixelError::LengthMismatch {
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgba8,
            expected: self.pixel_count() * 4,
            actual,
        })
    }

    /// Convert to an RGBA8 buffer (a copy when the buffer is already RGBA8)
    pub fn to_rgba8(&self) -> PixelBuffer {
        PixelBuffer {
            width: self.width,
            height: self.height,
            format: PixelFormat::Rgba8,
            bytes: self.to_rgba8_bytes(),
        }
    }

    fn to_rgba8_bytes(&self) -> Vec<u8> {
        match self.format {
            PixelFormat::Rgba8 => self.bytes.clone(),
            PixelFormat::Rgb8 => {
                let mut out = Vec::with_capacity(self.pixel_count() * 4);
                for px in self.bytes.chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
                out
            }
        }
    }

    /// Decode PNG bytes into an RGBA8 buffer
    pub fn decode_png(bytes: &[u8]) -> Result<Self, PixelError> {
        let image = image::load_from_memory_with_format(bytes, ImageFormat::Png)?;
        Ok(Self::from_rgba_image(image.into_rgba8()))
    }

    /// Serialize as PNG
    pub fn encode_png(&self, compression: PngCompression) -> Result<Vec<u8>, PixelError> {
        let mut out = Vec::new();
        let encoder = PngEncoder::new_with_quality(&mut out, compression.into(), PngFilter::Adaptive);
        encoder.write_image(&self.bytes, self.width, self.height, self.format.color_type())?;
        Ok(out)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Raw pixel bytes, row-major, no padding
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// True when either dimension is zero
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Memory footprint of the pixel data in bytes
    pub fn memory_size(&self) -> usize {
        self.bytes.len()
    }
}
