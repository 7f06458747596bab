//! Strongly typed cache keys shared by the memory and disk tiers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Identifies one cached image: which source, at which geometry, after which
/// transform.
///
/// Two logically identical requests always produce equal keys and the same
/// [`CacheKey::digest`], across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    /// Source identity, usually the absolute path of the source file
    pub source: String,

    /// Target geometry in pixels; `(0, 0)` for the unscaled decode
    pub geometry: (u32, u32),

    /// Ordered transform parameters (float values enter as their bit patterns)
    pub params: Vec<u64>,
}

impl CacheKey {
    pub fn new(source: impl Into<String>, geometry: (u32, u32)) -> Self {
        Self {
            source: source.into(),
            geometry,
            params: Vec::new(),
        }
    }

    /// Key for the decoded, unscaled image of a source file
    pub fn for_source(path: &Path) -> Self {
        Self::new(path.to_string_lossy().into_owned(), (0, 0))
    }

    /// Append an integer transform parameter
    pub fn with_param(mut self, value: u64) -> Self {
        self.params.push(value);
        self
    }

    /// Append a float transform parameter by bit pattern
    pub fn with_f32(self, value: f32) -> Self {
        self.with_param(u64::from(value.to_bits()))
    }

    /// Length-prefixed little-endian encoding of every field
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let source = self.source.as_bytes();
        let mut out = Vec::with_capacity(8 + source.len() + 8 + 8 + self.params.len() * 8);
        out.extend_from_slice(&(source.len() as u64).to_le_bytes());
        out.extend_from_slice(source);
        out.extend_from_slice(&self.geometry.0.to_le_bytes());
        out.extend_from_slice(&self.geometry.1.to_le_bytes());
        out.extend_from_slice(&(self.params.len() as u64).to_le_bytes());
        for param in &self.params {
            out.extend_from_slice(&param.to_le_bytes());
        }
        out
    }

    /// 32 hex characters (first 16 bytes of SHA-256 over the canonical bytes)
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.canonical_bytes());
        hex::encode(&hash[..16])
    }

    /// File name of this key inside the disk cache directory
    pub fn file_name(&self) -> String {
        format!("{}.png", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn hash_of(key: &CacheKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_identical_requests_produce_identical_keys() {
        let a = CacheKey::new("/cards/a.png", (200, 300)).with_f32(1.2).with_param(7);
        let b = CacheKey::new("/cards/a.png", (200, 300)).with_f32(1.2).with_param(7);

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_fields_are_not_confused() {
        // Concatenating strings would make these collide.
        let a = CacheKey::new("ab", (1, 23));
        let b = CacheKey::new("ab1", (2, 3));
        assert_ne!(a.digest(), b.digest());

        let c = CacheKey::new("x", (10, 10)).with_param(1).with_param(2);
        let d = CacheKey::new("x", (10, 10)).with_param(2).with_param(1);
        assert_ne!(c.digest(), d.digest());
    }

    #[test]
    fn test_digest_shape() {
        let key = CacheKey::for_source(Path::new("/tmp/source.jpg"));
        assert_eq!(key.geometry, (0, 0));
        assert_eq!(key.digest().len(), 32);
        assert!(key.file_name().ends_with(".png"));
    }

    #[test]
    fn test_digest_is_stable() {
        // Pinned so that on-disk cache names survive rebuilds.
        let key = CacheKey::new("", (0, 0));
        let expected = hex::encode(&Sha256::digest([0u8; 24])[..16]);
        assert_eq!(key.digest(), expected);
    }
}
