//! Error types for color correction and page rendering

use std::path::{Path, PathBuf};

/// Errors raised by [`ColorCorrector`](crate::ColorCorrector)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ColorError {
    #[error("cannot correct a {width}x{height} image")]
    InvalidImage { width: u32, height: u32 },
    #[error("gamma must be finite and positive, got {0}")]
    InvalidGamma(f32),
}

/// Errors raised while rendering a page or one of its items
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// Undecodable bytes, zero dimensions or a failed transform
    #[error("invalid image {path}: {reason}")]
    InvalidImage { path: PathBuf, reason: String },

    #[error("source image not found: {path}")]
    SourceNotFound { path: PathBuf },

    /// File size or pixel dimensions above the configured ceiling
    #[error("source image too large {path}: {reason}")]
    SourceTooLarge { path: PathBuf, reason: String },

    #[error("unsupported image format: {path}")]
    UnsupportedFormat { path: PathBuf },

    #[error("cannot allocate a {width}x{height} page canvas")]
    CanvasAllocation { width: u32, height: u32 },

    #[error("failed to encode page: {0}")]
    Encode(String),
}

impl RenderError {
    pub(crate) fn invalid_image(path: &Path, reason: impl ToString) -> Self {
        RenderError::InvalidImage {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn too_large(path: &Path, reason: impl Into<String>) -> Self {
        RenderError::SourceTooLarge {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// True for failures confined to one grid item; the page renders a
    /// placeholder in that cell and carries on.
    pub fn is_item_recoverable(&self) -> bool {
        matches!(
            self,
            RenderError::InvalidImage { .. }
                | RenderError::SourceNotFound { .. }
                | RenderError::SourceTooLarge { .. }
                | RenderError::UnsupportedFormat { .. }
        )
    }
}

/// Result type for rendering operations
pub type RenderResult<T> = Result<T, RenderError>;
