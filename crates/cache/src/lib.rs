//! Card Export Cache Library
//!
//! Decoded bitmaps, strongly typed cache keys, bounded in-memory LRU tiers
//! and a validated persistent disk tier.

pub mod config;
pub mod disk;
pub mod key;
pub mod pixels;
pub mod ram;

pub use config::{CacheConfig, ConfigError};
pub use disk::{DiskCacheError, DiskCachePolicy, DiskCacheRecord, DiskCacheStats, DiskCacheStore};
pub use key::CacheKey;
pub use pixels::{PixelBuffer, PixelError, PixelFormat, PngCompression};
pub use ram::{CacheTier, MemoryCacheTier, TierStats};
