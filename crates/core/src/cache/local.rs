//! Directory-backed cache backend
//!
//! Each entry is stored as a gzip-compressed tar archive plus a small JSON
//! manifest recording the key, the archived paths and the creation time. File
//! names are SHA-256 digests of the key so arbitrary keys map to safe names.
//!
//! Entries are write-once: saving over an existing key fails with
//! [`CacheError::AlreadyExists`], matching hosted CI caches. Callers that need
//! to refresh an entry delete it first.
//!
//! Fallback keys match exactly first and then by prefix, picking the most
//! recently created entry, which is how hosted CI caches treat restore keys.

use super::{sha256_hex, CacheBackend, CacheResult};
use crate::errors::CacheError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, instrument, trace, warn};

/// Cache backend storing archives in a local directory
#[derive(Debug, Clone)]
pub struct LocalCacheBackend {
    root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchivedPath {
    index: usize,
    path: PathBuf,
    kind: EntryKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    key: String,
    created_at: DateTime<Utc>,
    paths: Vec<ArchivedPath>,
}

impl LocalCacheBackend {
    /// Create a backend rooted at `root`; the directory is created lazily
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the archives
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn archive_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.tar.gz", sha256_hex(key.as_bytes())))
    }

    fn manifest_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", sha256_hex(key.as_bytes())))
    }

    fn read_manifest(path: &Path) -> CacheResult<Manifest> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| CacheError::Archive {
            message: format!("Corrupt cache manifest {}: {}", path.display(), e),
        })
    }

    /// Find the key to restore from, without touching any archive
    fn lookup(&self, primary_key: &str, fallback_keys: &[String]) -> CacheResult<Option<String>> {
        if self.manifest_path(primary_key).exists() {
            return Ok(Some(primary_key.to_string()));
        }

        for fallback in fallback_keys {
            if self.manifest_path(fallback).exists() {
                return Ok(Some(fallback.clone()));
            }
            if let Some(key) = self.newest_with_prefix(fallback)? {
                return Ok(Some(key));
            }
        }

        Ok(None)
    }

    fn newest_with_prefix(&self, prefix: &str) -> CacheResult<Option<String>> {
        if !self.root.exists() {
            return Ok(None);
        }

        let mut newest: Option<Manifest> = None;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let manifest = match Self::read_manifest(&path) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Skipping unreadable cache manifest {}: {}", path.display(), e);
                    continue;
                }
            };
            if !manifest.key.starts_with(prefix) {
                continue;
            }
            if newest
                .as_ref()
                .map_or(true, |current| manifest.created_at > current.created_at)
            {
                newest = Some(manifest);
            }
        }

        Ok(newest.map(|m| m.key))
    }

    fn restore_blocking(
        &self,
        paths: &[PathBuf],
        primary_key: &str,
        fallback_keys: &[String],
    ) -> CacheResult<Option<String>> {
        let Some(matched) = self.lookup(primary_key, fallback_keys)? else {
            debug!("No local cache entry for {}", primary_key);
            return Ok(None);
        };

        let manifest = Self::read_manifest(&self.manifest_path(&matched))?;
        let file = fs::File::open(self.archive_path(&matched))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));

        for entry in archive.entries()? {
            let mut entry = entry?;
            let entry_path = entry.path()?.into_owned();
            let Some(dest) = destination_for(&entry_path, &manifest, paths)? else {
                trace!("Skipping archive entry {}", entry_path.display());
                continue;
            };
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&dest).map_err(|e| CacheError::Archive {
                message: format!("Failed to extract {}: {}", dest.display(), e),
            })?;
        }

        debug!("Restored local cache entry {}", matched);
        Ok(Some(matched))
    }

    fn save_blocking(&self, paths: &[PathBuf], key: &str) -> CacheResult<()> {
        let manifest_path = self.manifest_path(key);
        if manifest_path.exists() {
            return Err(CacheError::AlreadyExists {
                key: key.to_string(),
            });
        }

        let mut archived = Vec::new();
        for (index, path) in paths.iter().enumerate() {
            if path.is_dir() {
                archived.push(ArchivedPath {
                    index,
                    path: path.clone(),
                    kind: EntryKind::Dir,
                });
            } else if path.is_file() {
                archived.push(ArchivedPath {
                    index,
                    path: path.clone(),
                    kind: EntryKind::File,
                });
            } else {
                debug!("Cache path {} is missing", path.display());
            }
        }
        if archived.is_empty() {
            return Err(CacheError::NothingToSave {
                key: key.to_string(),
            });
        }

        fs::create_dir_all(&self.root)?;
        let archive_path = self.archive_path(key);
        let partial_path = archive_path.with_extension("partial");

        let file = fs::File::create(&partial_path)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::fast()));
        builder.follow_symlinks(false);
        for item in &archived {
            let name = item.index.to_string();
            match item.kind {
                EntryKind::Dir => builder.append_dir_all(&name, &item.path)?,
                EntryKind::File => builder.append_path_with_name(&item.path, &name)?,
            }
        }
        let encoder = builder.into_inner()?;
        encoder.finish()?;

        fs::rename(&partial_path, &archive_path)?;

        let manifest = Manifest {
            key: key.to_string(),
            created_at: Utc::now(),
            paths: archived,
        };
        let content = serde_json::to_string_pretty(&manifest).map_err(|e| CacheError::Archive {
            message: format!("Failed to serialize cache manifest: {}", e),
        })?;
        fs::write(&manifest_path, content)?;

        debug!("Saved local cache entry {}", key);
        Ok(())
    }

    fn delete_blocking(&self, key: &str) -> CacheResult<()> {
        for path in [self.manifest_path(key), self.archive_path(key)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Map an archive entry `"{index}/rest"` to its restore destination
fn destination_for(
    entry_path: &Path,
    manifest: &Manifest,
    paths: &[PathBuf],
) -> CacheResult<Option<PathBuf>> {
    let mut components = entry_path.components();
    let index = match components.next() {
        Some(Component::Normal(first)) => match first.to_str().and_then(|s| s.parse::<usize>().ok())
        {
            Some(i) => i,
            None => return Ok(None),
        },
        _ => return Ok(None),
    };

    let rest: PathBuf = components.collect();
    if rest
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(CacheError::Archive {
            message: format!("Refusing to extract unsafe path {}", entry_path.display()),
        });
    }

    let Some(target) = paths.get(index) else {
        return Ok(None);
    };
    let kind = manifest
        .paths
        .iter()
        .find(|p| p.index == index)
        .map(|p| p.kind);

    Ok(match kind {
        Some(EntryKind::File) => Some(target.clone()),
        Some(EntryKind::Dir) if rest.as_os_str().is_empty() => Some(target.clone()),
        Some(EntryKind::Dir) => Some(target.join(rest)),
        None => None,
    })
}

async fn blocking<T, F>(f: F) -> CacheResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CacheResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Backend {
            message: format!("Cache task panicked: {}", e),
        })?
}

#[async_trait]
impl CacheBackend for LocalCacheBackend {
    #[instrument(level = "debug", skip(self, paths))]
    async fn restore(
        &self,
        paths: &[PathBuf],
        primary_key: &str,
        fallback_keys: &[String],
    ) -> CacheResult<Option<String>> {
        let this = self.clone();
        let paths = paths.to_vec();
        let primary_key = primary_key.to_string();
        let fallback_keys = fallback_keys.to_vec();
        blocking(move || this.restore_blocking(&paths, &primary_key, &fallback_keys)).await
    }

    #[instrument(level = "debug", skip(self, paths))]
    async fn save(&self, paths: &[PathBuf], key: &str) -> CacheResult<()> {
        let this = self.clone();
        let paths = paths.to_vec();
        let key = key.to_string();
        blocking(move || this.save_blocking(&paths, &key)).await
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete(&self, key: &str) -> CacheResult<()> {
        let this = self.clone();
        let key = key.to_string();
        blocking(move || this.delete_blocking(&key)).await
    }
}
