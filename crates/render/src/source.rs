//! Source image loading with format, size and dimension guards

use std::fs;
use std::io::{self, Cursor};
use std::path::Path;

use card_export_cache::PixelBuffer;
use image::ImageReader;
use serde::{Deserialize, Serialize};

use crate::error::{RenderError, RenderResult};

/// Extensions accepted as source images (compared case-insensitively)
pub const SUPPORTED_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "gif", "tiff", "webp"];

/// Per-item cost ceilings checked before a full decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceLimits {
    /// Largest accepted source file in bytes
    pub max_file_bytes: u64,
    /// Largest accepted width or height in pixels
    pub max_dimension: u32,
}

impl Default for SourceLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 64 * 1024 * 1024, // 64 MB
            max_dimension: 12_000,
        }
    }
}

/// Check a path against the extension allow-list
pub fn is_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

/// Read and decode a source image into an RGBA buffer.
///
/// The file size is checked before reading and the pixel dimensions are read
/// from the header before decoding, so oversized inputs never get decoded.
pub fn load_source(path: &Path, limits: &SourceLimits) -> RenderResult<PixelBuffer> {
    if !is_supported_extension(path) {
        return Err(RenderError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }

    let metadata = match fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => {
            return Err(RenderError::SourceNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(RenderError::SourceNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(err) => return Err(RenderError::invalid_image(path, err)),
    };

    if metadata.len() > limits.max_file_bytes {
        return Err(RenderError::too_large(
            path,
            format!("{} bytes exceeds {}", metadata.len(), limits.max_file_bytes),
        ));
    }

    let bytes = fs::read(path).map_err(|e| RenderError::invalid_image(path, e))?;

    let (width, height) = reader(&bytes, path)?
        .into_dimensions()
        .map_err(|e| RenderError::invalid_image(path, e))?;
    if width == 0 || height == 0 {
        return Err(RenderError::invalid_image(
            path,
            format!("zero dimension {width}x{height}"),
        ));
    }
    if width > limits.max_dimension || height > limits.max_dimension {
        return Err(RenderError::too_large(
            path,
            format!("{width}x{height} exceeds {} px", limits.max_dimension),
        ));
    }

    let decoded = reader(&bytes, path)?
        .decode()
        .map_err(|e| RenderError::invalid_image(path, e))?;

    tracing::debug!(path = %path.display(), width, height, "decoded source image");
    Ok(PixelBuffer::from_rgba_image(decoded.into_rgba8()))
}

fn reader<'a>(bytes: &'a [u8], path: &Path) -> RenderResult<ImageReader<Cursor<&'a [u8]>>> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| RenderError::invalid_image(path, e))
}
