//! Export configuration
//!
//! One explicit [`ExportConfig`] value carries every setting the export
//! engine needs. It is built once (defaults, a JSON file, environment
//! overrides) and passed into [`ExportOrchestrator::new`](crate::ExportOrchestrator::new).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use card_export_cache::CacheConfig;
use card_export_render::{ColorConfig, PageConfig, SourceLimits};
use serde::{Deserialize, Serialize};

/// Everything an export run is configured by
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub page: PageConfig,
    pub color: ColorConfig,
    pub cache: CacheConfig,
    pub limits: SourceLimits,
}

/// Errors raised while loading, saving or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Cache(#[from] card_export_cache::ConfigError),
}

impl ExportConfig {
    /// Load a JSON configuration file. Missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write this configuration as pretty JSON, atomically
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json).map_err(io_err)?;
        fs::rename(&temp_path, path).map_err(io_err)
    }

    /// Apply environment overrides on top of this configuration.
    ///
    /// Besides the cache variables read by [`CacheConfig::apply_env`]:
    /// - `CARD_EXPORT_GAMMA`: gamma value
    /// - `CARD_EXPORT_TOLERANCE`: color match tolerance (0-255)
    /// - `CARD_EXPORT_MAX_SOURCE_MB`: largest accepted source file in MB
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        self.cache = self.cache.apply_env()?;

        if let Some(gamma) = env_parse::<f32>("CARD_EXPORT_GAMMA")? {
            self.color.gamma = gamma;
        }
        if let Some(tolerance) = env_parse::<u8>("CARD_EXPORT_TOLERANCE")? {
            self.color.tolerance = tolerance;
        }
        if let Some(mb) = env_parse::<u64>("CARD_EXPORT_MAX_SOURCE_MB")? {
            self.limits.max_file_bytes =
                mb.checked_mul(1024 * 1024).ok_or_else(|| ConfigError::InvalidValue {
                    key: "CARD_EXPORT_MAX_SOURCE_MB",
                    value: mb.to_string(),
                })?;
        }
        Ok(self)
    }

    /// Reject settings no export could run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page.width == 0 || self.page.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "page size {}x{} has a zero dimension",
                self.page.width, self.page.height
            )));
        }
        let (content_w, content_h) = self.page.content_size();
        if content_w == 0 || content_h == 0 {
            return Err(ConfigError::Invalid(
                "margins leave no room for content".to_string(),
            ));
        }
        if !self.color.gamma.is_finite() || self.color.gamma <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "gamma must be finite and positive, got {}",
                self.color.gamma
            )));
        }
        if self.limits.max_dimension == 0 {
            return Err(ConfigError::Invalid(
                "max_dimension must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        Err(_) => Ok(None),
    }
}
