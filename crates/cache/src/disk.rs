//! Persistent disk cache for corrected images.
//!
//! One PNG file per cache key (named by the key digest) plus a single
//! `index.json` that maps keys to [`DiskCacheRecord`]s. The index is rewritten
//! on every mutation; cache writes are rare next to reads.
//!
//! Every `get` validates the record before trusting it: the file must exist
//! and be non-empty, its modification time must match the recorded write
//! time, the source it was derived from must be unchanged, and the bytes must
//! decode. Anything else is a miss and the record is dropped.
//!
//! Write failures never propagate: they are logged and the key is remembered
//! as unwritable for the lifetime of the store.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::key::CacheKey;
use crate::pixels::{PixelBuffer, PixelError, PngCompression};

/// Name of the metadata index inside the cache directory
pub const INDEX_FILE_NAME: &str = "index.json";

const INDEX_VERSION: u32 = 1;

/// Eviction and validation budgets for a [`DiskCacheStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskCachePolicy {
    /// Total size budget for cached files in bytes
    pub max_bytes: u64,
    /// Records older than this are removed
    pub max_age: Duration,
    /// Allowed drift between a record's write time and its file's mtime
    pub mtime_tolerance: Duration,
    /// Run age/size maintenance after this many writes
    pub maintenance_interval: u32,
    /// PNG compression for cached files
    pub compression: PngCompression,
}

impl Default for DiskCachePolicy {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024,                 // 512 MB
            max_age: Duration::from_secs(30 * 24 * 3600), // 30 days
            mtime_tolerance: Duration::from_secs(2),
            maintenance_interval: 32,
            compression: PngCompression::Fast,
        }
    }
}

/// Statistics for monitoring disk cache performance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskCacheStats {
    /// Number of records in the index
    pub entry_count: usize,
    /// Total size of cached files in bytes
    pub total_bytes: u64,
    /// Number of validated retrievals
    pub hits: u64,
    /// Number of misses, including records rejected by validation
    pub misses: u64,
    /// Number of records removed by age/size/staleness eviction
    pub evictions: u64,
    /// Number of failed cache or index writes
    pub write_failures: u64,
}

impl DiskCacheStats {
    /// Calculate cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Metadata for one cached file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskCacheRecord {
    pub key: CacheKey,
    /// File name inside the cache directory
    pub file_name: String,
    /// Write time (milliseconds since the Unix epoch)
    pub created_at_ms: u64,
    pub byte_size: u64,
    /// Source the cached image was derived from
    pub source_path: String,
    /// Source modification time at write, when the source is a local file
    pub source_mtime_ms: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    records: Vec<DiskCacheRecord>,
}

/// Errors raised by disk cache maintenance
#[derive(Debug, thiserror::Error)]
pub enum DiskCacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cache index error: {0}")]
    Index(#[from] serde_json::Error),
    #[error("image encoding error: {0}")]
    Encode(#[from] PixelError),
    #[error("cache record {file_name} is corrupt: {reason}")]
    CacheCorruption { file_name: String, reason: String },
}

impl DiskCacheError {
    fn corruption(file_name: &str, reason: impl Into<String>) -> Self {
        DiskCacheError::CacheCorruption {
            file_name: file_name.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Default)]
struct StoreState {
    records: HashMap<CacheKey, DiskCacheRecord>,
    total_bytes: u64,
    stats: DiskCacheStats,
    writes_since_maintenance: u32,
    /// Keys whose write failed; never retried
    unwritable: HashSet<CacheKey>,
}

impl StoreState {
    fn insert(&mut self, record: DiskCacheRecord) {
        self.total_bytes += record.byte_size;
        if let Some(old) = self.records.insert(record.key.clone(), record) {
            self.total_bytes = self.total_bytes.saturating_sub(old.byte_size);
        }
    }

    /// Forget a record and delete its file
    fn remove(&mut self, dir: &Path, key: &CacheKey) -> Option<DiskCacheRecord> {
        let record = self.records.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(record.byte_size);
        remove_file_quietly(&dir.join(&record.file_name));
        Some(record)
    }

    fn evict_keys(&mut self, dir: &Path, keys: Vec<CacheKey>) -> usize {
        let mut removed = 0;
        for key in keys {
            if self.remove(dir, &key).is_some() {
                removed += 1;
            }
        }
        self.stats.evictions += removed as u64;
        removed
    }

    /// Remove records older than `max_age` or whose source changed
    fn evict_expired(&mut self, dir: &Path, max_age: Duration, now_ms: u64) -> usize {
        let max_age_ms = max_age.as_millis() as u64;
        let expired: Vec<CacheKey> = self
            .records
            .values()
            .filter(|record| {
                now_ms.saturating_sub(record.created_at_ms) > max_age_ms
                    || source_changed(record)
            })
            .map(|record| record.key.clone())
            .collect();
        self.evict_keys(dir, expired)
    }

    /// Remove oldest-written records until the total fits `max_bytes`
    fn evict_over_budget(&mut self, dir: &Path, max_bytes: u64) -> usize {
        if self.total_bytes <= max_bytes {
            return 0;
        }

        let mut by_age: Vec<(u64, String, CacheKey)> = self
            .records
            .values()
            .map(|r| (r.created_at_ms, r.file_name.clone(), r.key.clone()))
            .collect();
        by_age.sort();

        let mut victims = Vec::new();
        let mut remaining = self.total_bytes;
        for (_, _, key) in by_age {
            if remaining <= max_bytes {
                break;
            }
            if let Some(record) = self.records.get(&key) {
                remaining = remaining.saturating_sub(record.byte_size);
            }
            victims.push(key);
        }
        self.evict_keys(dir, victims)
    }

    fn snapshot_stats(&self) -> DiskCacheStats {
        DiskCacheStats {
            entry_count: self.records.len(),
            total_bytes: self.total_bytes,
            ..self.stats.clone()
        }
    }
}

/// Persistent key → PNG store with integrity validation and age/size eviction
///
/// Cheap to clone; clones share one index guarded by a single mutex. File
/// reads and PNG decoding happen outside the lock.
#[derive(Clone)]
pub struct DiskCacheStore {
    dir: PathBuf,
    policy: DiskCachePolicy,
    state: Arc<Mutex<StoreState>>,
}

impl DiskCacheStore {
    /// Open (or create) a cache directory.
    ///
    /// Loads the index, drops records whose files are gone, deletes files the
    /// index does not know about and runs [`invalidate_stale`](Self::invalidate_stale).
    /// A corrupt index is discarded rather than treated as an error.
    pub fn open<P: AsRef<Path>>(dir: P, policy: DiskCachePolicy) -> Result<Self, DiskCacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut state = StoreState::default();
        for mut record in load_index(&dir) {
            let path = dir.join(&record.file_name);
            match fs::metadata(&path) {
                Ok(metadata) if metadata.len() > 0 => {
                    record.byte_size = metadata.len();
                    state.insert(record);
                }
                _ => {
                    tracing::debug!(file = %record.file_name, "dropping index record without a backing file");
                    remove_file_quietly(&path);
                }
            }
        }

        remove_orphans(&dir, &state)?;

        let store = Self {
            dir,
            policy,
            state: Arc::new(Mutex::new(state)),
        };

        let evicted = store.invalidate_stale();
        {
            let state = store.lock();
            write_index(&store.dir, &state)?;
            tracing::info!(
                dir = %store.dir.display(),
                entries = state.records.len(),
                bytes = state.total_bytes,
                evicted,
                "opened disk cache"
            );
        }

        Ok(store)
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Retrieve and validate a cached image.
    ///
    /// Validation failures are misses; the offending record is deleted so it
    /// is not retried.
    pub fn get(&self, key: &CacheKey) -> Option<PixelBuffer> {
        let record = {
            let mut state = self.lock();
            match state.records.get(key) {
                Some(record) => record.clone(),
                None => {
                    state.stats.misses += 1;
                    return None;
                }
            }
        };

        match self.validate(&record) {
            Ok(buffer) => {
                self.lock().stats.hits += 1;
                Some(buffer)
            }
            Err(err) => {
                tracing::debug!(file = %record.file_name, error = %err, "rejecting disk cache record");
                let mut state = self.lock();
                state.stats.misses += 1;
                // Only drop the record we validated; a concurrent put may
                // already have replaced it.
                if state.records.get(key) == Some(&record) {
                    state.remove(&self.dir, key);
                    self.persist(&mut state);
                }
                None
            }
        }
    }

    fn validate(&self, record: &DiskCacheRecord) -> Result<PixelBuffer, DiskCacheError> {
        let name = record.file_name.as_str();
        let path = self.dir.join(name);

        let metadata = fs::metadata(&path)
            .map_err(|e| DiskCacheError::corruption(name, format!("file unavailable: {e}")))?;
        if metadata.len() == 0 {
            return Err(DiskCacheError::corruption(name, "file is empty"));
        }

        let mtime_ms = metadata.modified().map(system_time_ms)?;
        let tolerance_ms = self.policy.mtime_tolerance.as_millis() as u64;
        if mtime_ms.abs_diff(record.created_at_ms) > tolerance_ms {
            return Err(DiskCacheError::corruption(
                name,
                "file modified after it was recorded",
            ));
        }

        if source_changed(record) {
            return Err(DiskCacheError::corruption(name, "source file changed"));
        }

        let bytes = fs::read(&path)?;
        PixelBuffer::decode_png(&bytes)
            .map_err(|e| DiskCacheError::corruption(name, format!("undecodable: {e}")))
    }

    /// Store an image under `key`.
    ///
    /// Never fails: write errors are logged and the key is not attempted
    /// again by this store.
    pub fn put(&self, key: &CacheKey, buffer: &PixelBuffer) {
        if self.lock().unwritable.contains(key) {
            return;
        }

        let written = self.write_entry(key, buffer);

        let mut state = self.lock();
        match written {
            Ok(record) => {
                state.insert(record);
                state.writes_since_maintenance += 1;

                if state.writes_since_maintenance >= self.policy.maintenance_interval {
                    state.writes_since_maintenance = 0;
                    state.evict_expired(&self.dir, self.policy.max_age, now_ms());
                }
                state.evict_over_budget(&self.dir, self.policy.max_bytes);
                self.persist(&mut state);
            }
            Err(err) => {
                tracing::warn!(source = %key.source, error = %err, "disk cache write failed; key will not be cached");
                state.stats.write_failures += 1;
                state.unwritable.insert(key.clone());
            }
        }
    }

    fn write_entry(
        &self,
        key: &CacheKey,
        buffer: &PixelBuffer,
    ) -> Result<DiskCacheRecord, DiskCacheError> {
        let png = buffer.encode_png(self.policy.compression)?;
        let file_name = key.file_name();
        let path = self.dir.join(&file_name);

        write_atomically(&path, &png)?;

        let created_at_ms = fs::metadata(&path)?
            .modified()
            .map(system_time_ms)
            .unwrap_or_else(|_| now_ms());

        Ok(DiskCacheRecord {
            key: key.clone(),
            file_name,
            created_at_ms,
            byte_size: png.len() as u64,
            source_path: key.source.clone(),
            source_mtime_ms: file_mtime_ms(Path::new(&key.source)),
        })
    }

    fn persist(&self, state: &mut StoreState) {
        if let Err(err) = write_index(&self.dir, state) {
            tracing::warn!(dir = %self.dir.display(), error = %err, "failed to rewrite disk cache index");
            state.stats.write_failures += 1;
        }
    }

    /// Apply the age and size budgets now.
    ///
    /// Also removes records whose source file changed. Returns the number of
    /// records removed.
    pub fn invalidate_stale(&self) -> usize {
        let mut state = self.lock();
        let expired = state.evict_expired(&self.dir, self.policy.max_age, now_ms());
        let over_budget = state.evict_over_budget(&self.dir, self.policy.max_bytes);

        let removed = expired + over_budget;
        if removed > 0 {
            tracing::debug!(expired, over_budget, "disk cache maintenance");
            self.persist(&mut state);
        }
        removed
    }

    /// Check if a key is indexed, without validating it
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().records.contains_key(key)
    }

    /// Remove one record and its file
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut state = self.lock();
        let removed = state.remove(&self.dir, key).is_some();
        if removed {
            self.persist(&mut state);
        }
        removed
    }

    /// Remove every record and file
    pub fn clear(&self) -> Result<(), DiskCacheError> {
        let mut state = self.lock();
        let keys: Vec<CacheKey> = state.records.keys().cloned().collect();
        for key in keys {
            state.remove(&self.dir, &key);
        }
        state.unwritable.clear();
        write_index(&self.dir, &state)
    }

    /// Get current cache statistics
    pub fn stats(&self) -> DiskCacheStats {
        self.lock().snapshot_stats()
    }

    /// Copy of the record for `key`, if indexed
    pub fn record(&self, key: &CacheKey) -> Option<DiskCacheRecord> {
        self.lock().records.get(key).cloned()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> &DiskCachePolicy {
        &self.policy
    }
}

fn system_time_ms(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_ms() -> u64 {
    system_time_ms(SystemTime::now())
}

fn file_mtime_ms(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(system_time_ms)
}

/// True when the record's source was a file that has since changed or gone
fn source_changed(record: &DiskCacheRecord) -> bool {
    match record.source_mtime_ms {
        Some(recorded) => file_mtime_ms(Path::new(&record.source_path)) != Some(recorded),
        None => false,
    }
}

fn remove_file_quietly(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "failed to delete cache file");
        }
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let result = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn load_index(dir: &Path) -> Vec<DiskCacheRecord> {
    let path = dir.join(INDEX_FILE_NAME);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "unreadable disk cache index; starting empty");
            return Vec::new();
        }
    };

    match serde_json::from_slice::<IndexFile>(&bytes) {
        Ok(index) if index.version == INDEX_VERSION => index.records,
        Ok(index) => {
            tracing::warn!(version = index.version, "unknown disk cache index version; starting empty");
            Vec::new()
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "corrupt disk cache index; starting empty");
            Vec::new()
        }
    }
}

fn write_index(dir: &Path, state: &StoreState) -> Result<(), DiskCacheError> {
    let mut records: Vec<DiskCacheRecord> = state.records.values().cloned().collect();
    records.sort_by(|a, b| a.file_name.cmp(&b.file_name));

    let index = IndexFile {
        version: INDEX_VERSION,
        records,
    };
    let bytes = serde_json::to_vec_pretty(&index)?;
    write_atomically(&dir.join(INDEX_FILE_NAME), &bytes)?;
    Ok(())
}

/// Delete cache files and temp files the index does not reference
fn remove_orphans(dir: &Path, state: &StoreState) -> io::Result<()> {
    let known: HashSet<&str> = state
        .records
        .values()
        .map(|r| r.file_name.as_str())
        .collect();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let is_cache_file = name.ends_with(".png") && !known.contains(name);
        let is_leftover_tmp = name.ends_with(".tmp");
        if is_cache_file || is_leftover_tmp {
            tracing::debug!(file = name, "removing orphaned cache file");
            remove_file_quietly(&path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PixelFormat;
    use std::fs::File;

    fn image(seed: u8) -> PixelBuffer {
        let bytes = (0..8 * 8 * 4).map(|i| (i as u8).wrapping_mul(seed)).collect();
        PixelBuffer::new(8, 8, PixelFormat::Rgba8, bytes).unwrap()
    }

    fn open(dir: &Path) -> DiskCacheStore {
        DiskCacheStore::open(dir.join("cache"), DiskCachePolicy::default()).unwrap()
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn test_put_get_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let store = open(temp.path());
        let key = CacheKey::new("virtual:a", (8, 8));

        store.put(&key, &image(3));

        assert_eq!(store.get(&key), Some(image(3)));
        let stats = store.stats();
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.hits, 1);
        assert!(stats.total_bytes > 0);
        assert!(store.cache_dir().join(key.file_name()).exists());
    }

    #[test]
    fn test_cache_miss() {
        let temp = tempfile::tempdir().unwrap();
        let store = open(temp.path());

        assert!(store.get(&CacheKey::new("nothing", (1, 1))).is_none());
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_index_survives_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let key = CacheKey::new("virtual:persist", (8, 8)).with_param(42);

        {
            let store = open(temp.path());
            store.put(&key, &image(5));
        }

        let reopened = open(temp.path());
        assert!(reopened.contains(&key));
        assert_eq!(reopened.get(&key), Some(image(5)));
    }

    #[test]
    fn test_source_touch_invalidates_record() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("source.png");
        fs::write(&source, b"pretend source").unwrap();
        set_mtime(&source, UNIX_EPOCH + Duration::from_secs(1_600_000_000));

        let store = open(temp.path());
        let key = CacheKey::for_source(&source);
        store.put(&key, &image(7));
        assert!(store.get(&key).is_some());

        set_mtime(&source, UNIX_EPOCH + Duration::from_secs(1_700_000_000));

        assert!(store.get(&key).is_none());
        assert!(!store.contains(&key));
        assert!(!store.cache_dir().join(key.file_name()).exists());
    }

    #[test]
    fn test_deleted_source_invalidates_record() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("gone.png");
        fs::write(&source, b"x").unwrap();

        let store = open(temp.path());
        let key = CacheKey::for_source(&source);
        store.put(&key, &image(1));

        fs::remove_file(&source).unwrap();
        assert!(store.get(&key).is_none());
        assert!(!store.contains(&key));
    }

    #[test]
    fn test_truncated_file_is_a_miss() {
        let temp = tempfile::tempdir().unwrap();
        let store = open(temp.path());
        let key = CacheKey::new("virtual:truncated", (8, 8));
        store.put(&key, &image(2));

        let path = store.cache_dir().join(key.file_name());
        let created = store.record(&key).unwrap().created_at_ms;
        fs::write(&path, b"").unwrap();
        set_mtime(&path, UNIX_EPOCH + Duration::from_millis(created));

        assert!(store.get(&key).is_none());
        assert!(!store.contains(&key));
    }

    #[test]
    fn test_undecodable_file_is_a_miss() {
        let temp = tempfile::tempdir().unwrap();
        let store = open(temp.path());
        let key = CacheKey::new("virtual:garbage", (8, 8));
        store.put(&key, &image(2));

        let path = store.cache_dir().join(key.file_name());
        let created = store.record(&key).unwrap().created_at_ms;
        fs::write(&path, b"garbage bytes that are not a png").unwrap();
        set_mtime(&path, UNIX_EPOCH + Duration::from_millis(created));

        assert!(store.get(&key).is_none());
        assert!(!store.contains(&key));
    }

    #[test]
    fn test_rewritten_file_fails_mtime_check() {
        let temp = tempfile::tempdir().unwrap();
        let store = open(temp.path());
        let key = CacheKey::new("virtual:rewritten", (8, 8));
        store.put(&key, &image(2));

        let path = store.cache_dir().join(key.file_name());
        set_mtime(&path, SystemTime::now() + Duration::from_secs(3600));

        assert!(store.get(&key).is_none());
    }

    #[test]
    fn test_size_budget_evicts_oldest_first() {
        let temp = tempfile::tempdir().unwrap();
        let probe = open(temp.path());
        probe.put(&CacheKey::new("probe", (8, 8)), &image(9));
        let entry_size = probe.stats().total_bytes;
        drop(probe);

        let policy = DiskCachePolicy {
            max_bytes: entry_size * 2 + entry_size / 2,
            ..DiskCachePolicy::default()
        };
        let store = DiskCacheStore::open(temp.path().join("budget"), policy).unwrap();

        let keys: Vec<CacheKey> = (0..3).map(|i| CacheKey::new(format!("k{i}"), (8, 8))).collect();
        for key in &keys {
            store.put(key, &image(9));
            // distinct write timestamps
            std::thread::sleep(Duration::from_millis(20));
        }

        assert!(!store.contains(&keys[0]));
        assert!(store.contains(&keys[1]));
        assert!(store.contains(&keys[2]));
        assert!(store.stats().total_bytes <= policy.max_bytes);
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_age_budget() {
        let temp = tempfile::tempdir().unwrap();
        let key = CacheKey::new("virtual:old", (8, 8));
        {
            let store = open(temp.path());
            store.put(&key, &image(4));
        }

        let policy = DiskCachePolicy {
            max_age: Duration::ZERO,
            ..DiskCachePolicy::default()
        };
        std::thread::sleep(Duration::from_millis(5));
        let store = DiskCacheStore::open(temp.path().join("cache"), policy).unwrap();

        assert!(!store.contains(&key));
        assert_eq!(store.stats().entry_count, 0);
    }

    #[test]
    fn test_orphans_and_corrupt_index_are_cleaned() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("cache");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("deadbeef.png"), b"orphan").unwrap();
        fs::write(dir.join("leftover.png.tmp"), b"partial").unwrap();
        fs::write(dir.join(INDEX_FILE_NAME), b"{ not json").unwrap();

        let store = DiskCacheStore::open(&dir, DiskCachePolicy::default()).unwrap();

        assert_eq!(store.stats().entry_count, 0);
        assert!(!dir.join("deadbeef.png").exists());
        assert!(!dir.join("leftover.png.tmp").exists());
        let index: serde_json::Value =
            serde_json::from_slice(&fs::read(dir.join(INDEX_FILE_NAME)).unwrap()).unwrap();
        assert_eq!(index["records"].as_array().map(Vec::len), Some(0));
    }

    #[test]
    fn test_write_failure_degrades_to_permanent_miss() {
        let temp = tempfile::tempdir().unwrap();
        let store = open(temp.path());
        let key = CacheKey::new("virtual:blocked", (8, 8));

        // A directory squatting on the target file name makes the rename fail
        fs::create_dir_all(store.cache_dir().join(key.file_name())).unwrap();

        store.put(&key, &image(1));
        assert!(!store.contains(&key));
        assert_eq!(store.stats().write_failures, 1);

        // Not retried even once the obstacle is gone
        fs::remove_dir(store.cache_dir().join(key.file_name())).unwrap();
        store.put(&key, &image(1));
        assert!(!store.contains(&key));
        assert_eq!(store.stats().write_failures, 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let temp = tempfile::tempdir().unwrap();
        let store = open(temp.path());
        let a = CacheKey::new("a", (8, 8));
        let b = CacheKey::new("b", (8, 8));
        store.put(&a, &image(1));
        store.put(&b, &image(2));

        assert!(store.remove(&a));
        assert!(!store.remove(&a));
        assert_eq!(store.stats().entry_count, 1);

        store.clear().unwrap();
        let stats = store.stats();
        assert_eq!(stats.entry_count, 0);
        assert_eq!(stats.total_bytes, 0);
        assert!(!store.cache_dir().join(b.file_name()).exists());
    }
}
