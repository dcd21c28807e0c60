//! Cache backend abstraction and key derivation
//!
//! The remote blob cache is treated as an opaque key/value store that can
//! restore a set of paths from an archive, save a set of paths under a key, and
//! delete a key. Policy (which key, when to save) lives in the provisioning and
//! build-cache layers; this module only defines the seam and a few concrete
//! backends.

use crate::errors::CacheError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;

pub mod keys;
mod local;
pub mod mock;

pub use keys::{
    build_key, lock_file_fingerprint, normalize_path_component, toolchain_set_fingerprint,
};
pub use local::LocalCacheBackend;
pub use mock::{CacheCall, MockCacheBackend};

/// Cache prefix value that disables caching entirely
pub const NO_CACHE: &str = "no-cache";

/// Result type for cache backend operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Restore/save/delete operations against a blob cache
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Restore `paths` from the entry stored under `primary_key`, or from the
    /// first of `fallback_keys` that exists.
    ///
    /// Returns the key that actually matched, or `None` on a miss.
    async fn restore(
        &self,
        paths: &[PathBuf],
        primary_key: &str,
        fallback_keys: &[String],
    ) -> CacheResult<Option<String>>;

    /// Store `paths` under `key`
    async fn save(&self, paths: &[PathBuf], key: &str) -> CacheResult<()>;

    /// Remove the entry stored under `key`, if any
    async fn delete(&self, key: &str) -> CacheResult<()>;
}

/// Map a configured cache prefix to the prefix actually used for keys
///
/// Returns `None` when caching is disabled, either because no prefix was
/// configured or because it is the [`NO_CACHE`] sentinel.
pub fn effective_prefix(prefix: Option<&str>) -> Option<&str> {
    match prefix {
        Some(p) if !p.trim().is_empty() && p != NO_CACHE => Some(p),
        _ => None,
    }
}

/// SHA-256 hex digest of arbitrary bytes
pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_prefix() {
        assert_eq!(effective_prefix(Some("rax-cache")), Some("rax-cache"));
        assert_eq!(effective_prefix(Some(NO_CACHE)), None);
        assert_eq!(effective_prefix(Some("  ")), None);
        assert_eq!(effective_prefix(None), None);
    }

    #[test]
    fn test_sha256_hex() {
        let digest = sha256_hex(b"");
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest.len(), 64);
    }
}
