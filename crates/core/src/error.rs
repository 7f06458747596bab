//! Export error taxonomy
//!
//! Item-level problems never show up here: the renderer substitutes a
//! placeholder and reports a [`Substitution`](card_export_render::Substitution).
//! Output write failures skip one page. Only failures that make the whole run
//! meaningless reach the caller as an [`ExportError`].

use std::io;
use std::path::PathBuf;

use card_export_render::RenderError;

use crate::config::ConfigError;

/// Convenience result type for export operations
pub type ExportResult<T> = Result<T, ExportError>;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    /// Output directory, worker thread or page canvas unavailable
    #[error("export infrastructure failure: {0}")]
    InfrastructureFailure(String),

    #[error("failed to write {path}: {source}")]
    DiskWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

impl ExportError {
    /// Build an [`ExportError::InfrastructureFailure`] value.
    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::InfrastructureFailure(msg.into())
    }

    /// Build an [`ExportError::DiskWriteFailure`] value.
    pub fn disk_write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::DiskWriteFailure {
            path: path.into(),
            source,
        }
    }
}
