//! Cache configuration: tier capacities, disk budgets and the disk cache
//! location.
//!
//! Configuration can be loaded from environment variables or created
//! programmatically; the export configuration file embeds it as JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::disk::DiskCachePolicy;
use crate::pixels::PngCompression;

const MB: u64 = 1024 * 1024;
const DAY_SECS: u64 = 24 * 3600;

/// Configuration for the cache system.
///
/// Memory tiers are bounded by entry count; the disk tier by total bytes and
/// record age.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries kept in the decoded (unscaled) source tier
    pub raw_capacity: usize,
    /// Entries kept in the scaled-and-corrected tier
    pub scaled_capacity: usize,
    /// Whether the persistent disk tier is used at all
    pub disk_enabled: bool,
    /// Disk cache size limit in bytes
    pub disk_max_bytes: u64,
    /// Disk records older than this many days are removed
    pub disk_max_age_days: u64,
    /// Directory path for disk cache storage
    pub disk_cache_dir: PathBuf,
    /// PNG compression for disk cache files
    pub disk_compression: PngCompression,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            raw_capacity: 16,
            scaled_capacity: 64,
            disk_enabled: true,
            disk_max_bytes: 512 * MB,
            disk_max_age_days: 30,
            disk_cache_dir: Self::default_cache_dir(),
            disk_compression: PngCompression::Fast,
        }
    }
}

impl CacheConfig {
    /// Sets the decoded source tier capacity.
    pub fn with_raw_capacity(mut self, entries: usize) -> Self {
        self.raw_capacity = entries;
        self
    }

    /// Sets the scaled tier capacity.
    pub fn with_scaled_capacity(mut self, entries: usize) -> Self {
        self.scaled_capacity = entries;
        self
    }

    /// Sets the disk cache size in megabytes (saturating).
    pub fn with_disk_mb(mut self, mb: u64) -> Self {
        self.disk_max_bytes = mb.saturating_mul(MB);
        self
    }

    /// Sets the maximum disk record age in days.
    pub fn with_disk_max_age_days(mut self, days: u64) -> Self {
        self.disk_max_age_days = days;
        self
    }

    /// Sets the disk cache directory.
    pub fn with_disk_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.disk_cache_dir = path.as_ref().to_path_buf();
        self
    }

    /// Enables or disables the disk tier.
    pub fn with_disk_enabled(mut self, enabled: bool) -> Self {
        self.disk_enabled = enabled;
        self
    }

    /// Returns the default cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/card-export/images
    /// - Linux: ~/.cache/card-export/images
    /// - Windows: %LOCALAPPDATA%\card-export\images
    pub fn default_cache_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("card-export").join("images")
        } else {
            PathBuf::from("cache/images")
        }
    }

    /// Loads configuration from environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Applies environment overrides to this configuration.
    ///
    /// Environment variables:
    /// - `CARD_EXPORT_RAW_CACHE_ENTRIES`: decoded tier capacity (default: 16)
    /// - `CARD_EXPORT_SCALED_CACHE_ENTRIES`: scaled tier capacity (default: 64)
    /// - `CARD_EXPORT_DISK_CACHE_MB`: disk cache size in MB (default: 512)
    /// - `CARD_EXPORT_DISK_CACHE_MAX_AGE_DAYS`: disk record age limit (default: 30)
    /// - `CARD_EXPORT_CACHE_DIR`: disk cache directory path
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(entries) = env_number("CARD_EXPORT_RAW_CACHE_ENTRIES")? {
            self.raw_capacity = entries as usize;
        }
        if let Some(entries) = env_number("CARD_EXPORT_SCALED_CACHE_ENTRIES")? {
            self.scaled_capacity = entries as usize;
        }
        if let Some(mb) = env_number("CARD_EXPORT_DISK_CACHE_MB")? {
            self.disk_max_bytes = mb.checked_mul(MB).ok_or_else(|| ConfigError::InvalidValue {
                key: "CARD_EXPORT_DISK_CACHE_MB",
                value: mb.to_string(),
            })?;
        }
        if let Some(days) = env_number("CARD_EXPORT_DISK_CACHE_MAX_AGE_DAYS")? {
            self.disk_max_age_days = days;
        }
        if let Ok(val) = std::env::var("CARD_EXPORT_CACHE_DIR") {
            self.disk_cache_dir = PathBuf::from(val);
        }
        Ok(self)
    }

    /// Eviction policy for the disk tier
    pub fn disk_policy(&self) -> DiskCachePolicy {
        DiskCachePolicy {
            max_bytes: self.disk_max_bytes,
            max_age: Duration::from_secs(self.disk_max_age_days.saturating_mul(DAY_SECS)),
            compression: self.disk_compression,
            ..DiskCachePolicy::default()
        }
    }

    /// Returns the disk cache size in megabytes.
    pub fn disk_cache_mb(&self) -> u64 {
        self.disk_max_bytes / MB
    }
}

fn env_number(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key: name, value: val }),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: [&str; 5] = [
        "CARD_EXPORT_RAW_CACHE_ENTRIES",
        "CARD_EXPORT_SCALED_CACHE_ENTRIES",
        "CARD_EXPORT_DISK_CACHE_MB",
        "CARD_EXPORT_DISK_CACHE_MAX_AGE_DAYS",
        "CARD_EXPORT_CACHE_DIR",
    ];

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.raw_capacity, 16);
        assert_eq!(config.scaled_capacity, 64);
        assert_eq!(config.disk_max_bytes, 512 * 1024 * 1024);
        assert_eq!(config.disk_cache_mb(), 512);
        assert!(config.disk_enabled);
        assert!(config.disk_cache_dir.ends_with("images"));
    }

    #[test]
    fn test_builder_methods() {
        let config = CacheConfig::default()
            .with_raw_capacity(4)
            .with_scaled_capacity(8)
            .with_disk_mb(64)
            .with_disk_max_age_days(2)
            .with_disk_dir("/custom/path")
            .with_disk_enabled(false);

        assert_eq!(config.raw_capacity, 4);
        assert_eq!(config.scaled_capacity, 8);
        assert_eq!(config.disk_max_bytes, 64 * 1024 * 1024);
        assert_eq!(config.disk_max_age_days, 2);
        assert_eq!(config.disk_cache_dir, PathBuf::from("/custom/path"));
        assert!(!config.disk_enabled);
    }

    #[test]
    fn test_disk_policy() {
        let policy = CacheConfig::default()
            .with_disk_mb(10)
            .with_disk_max_age_days(1)
            .disk_policy();

        assert_eq!(policy.max_bytes, 10 * 1024 * 1024);
        assert_eq!(policy.max_age, Duration::from_secs(86_400));
        assert_eq!(policy.mtime_tolerance, Duration::from_secs(2));
    }

    #[test]
    fn test_json_fills_missing_fields() {
        let config: CacheConfig = serde_json::from_str(r#"{ "raw_capacity": 3 }"#).unwrap();
        assert_eq!(config.raw_capacity, 3);
        assert_eq!(config.scaled_capacity, 64);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&VARS);

        env::set_var("CARD_EXPORT_RAW_CACHE_ENTRIES", "2");
        env::set_var("CARD_EXPORT_SCALED_CACHE_ENTRIES", "5");
        env::set_var("CARD_EXPORT_DISK_CACHE_MB", "128");
        env::set_var("CARD_EXPORT_DISK_CACHE_MAX_AGE_DAYS", "7");
        env::set_var("CARD_EXPORT_CACHE_DIR", "/tmp/test-cache");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.raw_capacity, 2);
        assert_eq!(config.scaled_capacity, 5);
        assert_eq!(config.disk_max_bytes, 128 * 1024 * 1024);
        assert_eq!(config.disk_max_age_days, 7);
        assert_eq!(config.disk_cache_dir, PathBuf::from("/tmp/test-cache"));
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&VARS);
        for name in VARS {
            env::remove_var(name);
        }
        env::set_var("CARD_EXPORT_DISK_CACHE_MB", "32");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.disk_max_bytes, 32 * 1024 * 1024);
        assert_eq!(config.raw_capacity, 16); // default
        assert_eq!(config.scaled_capacity, 64); // default
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&VARS);

        env::set_var("CARD_EXPORT_SCALED_CACHE_ENTRIES", "lots");
        let err = CacheConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("CARD_EXPORT_SCALED_CACHE_ENTRIES"));
    }

    #[test]
    #[serial]
    fn test_from_env_disk_size_overflow() {
        let _guard = EnvGuard::new(&VARS);
        for name in VARS {
            env::remove_var(name);
        }

        env::set_var("CARD_EXPORT_DISK_CACHE_MB", u64::MAX.to_string());
        let err = CacheConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "CARD_EXPORT_DISK_CACHE_MB", .. }
        ));
    }

    #[test]
    fn test_with_disk_mb_saturates() {
        let config = CacheConfig::default().with_disk_mb(u64::MAX);
        assert_eq!(config.disk_max_bytes, u64::MAX);
        assert_eq!(CacheConfig::default().with_disk_mb(2).disk_max_bytes, 2 * 1024 * 1024);
    }

    // Helper to save and restore environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }
}
