//! In-memory cache backend for tests
//!
//! Records every call and keeps a set of known keys so that provisioning and
//! build-cache policy can be verified without touching the filesystem. Keys
//! behave like a hosted CI cache: write-once, with prefix matching for
//! fallback keys.

use super::{CacheBackend, CacheResult};
use crate::errors::CacheError;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Record of a call made against [`MockCacheBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheCall {
    Restore {
        paths: Vec<PathBuf>,
        primary: String,
        fallbacks: Vec<String>,
    },
    Save {
        paths: Vec<PathBuf>,
        key: String,
    },
    Delete {
        key: String,
    },
}

#[derive(Debug, Default)]
struct MockCacheState {
    /// Stored keys in insertion order, with the paths they were saved from
    entries: IndexMap<String, Vec<PathBuf>>,
    calls: Vec<CacheCall>,
    fail_restore: bool,
    fail_save: bool,
}

/// Mock cache backend
#[derive(Debug, Clone, Default)]
pub struct MockCacheBackend {
    state: Arc<Mutex<MockCacheState>>,
}

impl MockCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate an entry
    pub fn with_entry(self, key: impl Into<String>) -> Self {
        self.insert_entry(key);
        self
    }

    /// Pre-populate an entry on a shared handle
    pub fn insert_entry(&self, key: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        state.entries.insert(key.into(), Vec::new());
    }

    /// Make every restore fail with a backend error
    pub fn fail_restores(&self) {
        self.state.lock().unwrap().fail_restore = true;
    }

    /// Make every save fail with a backend error
    pub fn fail_saves(&self) {
        self.state.lock().unwrap().fail_save = true;
    }

    /// All calls made so far, in order
    pub fn calls(&self) -> Vec<CacheCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Keys passed to `save`, in order
    pub fn saved_keys(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CacheCall::Save { key, .. } => Some(key),
                _ => None,
            })
            .collect()
    }

    /// Keys passed to `delete`, in order
    pub fn deleted_keys(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                CacheCall::Delete { key } => Some(key),
                _ => None,
            })
            .collect()
    }

    /// Number of restore calls
    pub fn restore_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, CacheCall::Restore { .. }))
            .count()
    }

    /// Whether an entry is currently stored under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().unwrap().entries.contains_key(key)
    }
}

#[async_trait]
impl CacheBackend for MockCacheBackend {
    async fn restore(
        &self,
        paths: &[PathBuf],
        primary_key: &str,
        fallback_keys: &[String],
    ) -> CacheResult<Option<String>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(CacheCall::Restore {
            paths: paths.to_vec(),
            primary: primary_key.to_string(),
            fallbacks: fallback_keys.to_vec(),
        });

        if state.fail_restore {
            return Err(CacheError::Backend {
                message: "mock restore failure".to_string(),
            });
        }

        if state.entries.contains_key(primary_key) {
            debug!("Mock cache hit for {}", primary_key);
            return Ok(Some(primary_key.to_string()));
        }

        for fallback in fallback_keys {
            if state.entries.contains_key(fallback) {
                return Ok(Some(fallback.clone()));
            }
            // Latest insertion wins among prefix matches
            if let Some(key) = state
                .entries
                .keys()
                .rev()
                .find(|key| key.starts_with(fallback.as_str()))
            {
                return Ok(Some(key.clone()));
            }
        }

        Ok(None)
    }

    async fn save(&self, paths: &[PathBuf], key: &str) -> CacheResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(CacheCall::Save {
            paths: paths.to_vec(),
            key: key.to_string(),
        });

        if state.fail_save {
            return Err(CacheError::Backend {
                message: "mock save failure".to_string(),
            });
        }
        if state.entries.contains_key(key) {
            return Err(CacheError::AlreadyExists {
                key: key.to_string(),
            });
        }

        state.entries.insert(key.to_string(), paths.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(CacheCall::Delete {
            key: key.to_string(),
        });
        state.entries.shift_remove(key);
        Ok(())
    }
}
