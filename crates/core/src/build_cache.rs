//! Build output caching around the task run
//!
//! The target directory is restored before the tasks and saved after them.
//! Keys are built so that:
//!
//! * the fallback branch always saves under its own name, giving every other
//!   branch a warm starting point
//! * other branches key on the Cargo.lock digest, so one entry exists per
//!   dependency set and unchanged dependencies are never saved twice
//! * without a lock file, the branch name is used
//!
//! No backend failure ever leaves this module; they are logged as warnings.

use crate::cache::keys::{
    build_output_key, lock_file_fingerprint, normalize_path_component, toolchain_set_fingerprint,
};
use crate::cache::{self, CacheBackend};
use crate::config::BuildCacheStrategyKind;
use crate::platform::HostPlatform;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Inputs to the build cache keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCacheSettings {
    pub cache_prefix: String,
    pub project_dir: PathBuf,
    pub target_dir: PathBuf,
    /// Every toolchain provisioned for this run
    pub toolchains: Vec<String>,
    pub fallback_branch: String,
    pub current_branch: String,
    pub platform: HostPlatform,
}

/// Keys for one run and what `restore` matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCacheState {
    pub primary_key: String,
    pub fallback_key: String,
    pub restored_from: Option<String>,
}

/// Restore-before, save-after strategy for the target directory
pub struct BuildCache<'a> {
    settings: BuildCacheSettings,
    state: BuildCacheState,
    backend: &'a dyn CacheBackend,
}

impl<'a> BuildCache<'a> {
    pub fn new(settings: BuildCacheSettings, backend: &'a dyn CacheBackend) -> Self {
        let toolchains = toolchain_set_fingerprint(&settings.toolchains);
        let project = normalize_path_component(&settings.project_dir.to_string_lossy());
        let fingerprint = lock_fingerprint(&settings);

        let primary_key = build_output_key(
            &settings.cache_prefix,
            &settings.platform,
            &toolchains,
            &project,
            &fingerprint,
        );
        let fallback_key = build_output_key(
            &settings.cache_prefix,
            &settings.platform,
            &toolchains,
            &project,
            &settings.fallback_branch,
        );
        debug!("Build cache keys: {} (fallback {})", primary_key, fallback_key);

        Self {
            settings,
            state: BuildCacheState {
                primary_key,
                fallback_key,
                restored_from: None,
            },
            backend,
        }
    }

    /// Build cache for the configured strategy, `None` when disabled
    pub fn for_strategy(
        kind: BuildCacheStrategyKind,
        cache_prefix: Option<&str>,
        settings: impl FnOnce(&str) -> BuildCacheSettings,
        backend: &'a dyn CacheBackend,
    ) -> Option<Self> {
        let prefix = cache::effective_prefix(cache_prefix)?;
        match kind {
            BuildCacheStrategyKind::None => None,
            BuildCacheStrategyKind::Remote => Some(Self::new(settings(prefix), backend)),
        }
    }

    pub fn state(&self) -> &BuildCacheState {
        &self.state
    }

    pub fn primary_key(&self) -> &str {
        &self.state.primary_key
    }

    pub fn fallback_key(&self) -> &str {
        &self.state.fallback_key
    }

    pub fn restored_from(&self) -> Option<&str> {
        self.state.restored_from.as_deref()
    }

    fn on_fallback_branch(&self) -> bool {
        self.settings.current_branch == self.settings.fallback_branch
    }

    /// Restore the target directory from the primary or fallback key
    #[instrument(skip(self), fields(key = %self.state.primary_key))]
    pub async fn restore(&mut self) {
        let fallbacks = if self.state.fallback_key == self.state.primary_key {
            Vec::new()
        } else {
            vec![self.state.fallback_key.clone()]
        };

        let paths = [self.settings.target_dir.clone()];
        self.state.restored_from = match self
            .backend
            .restore(&paths, &self.state.primary_key, &fallbacks)
            .await
        {
            Ok(Some(key)) => {
                info!("Restored build cache from key: {}", key);
                Some(key)
            }
            Ok(None) => {
                info!(
                    "No build cache found for keys: {}, {}",
                    self.state.primary_key, self.state.fallback_key
                );
                None
            }
            Err(e) => {
                warn!("Build cache restore failed: {}", e);
                None
            }
        };
    }

    /// Save the target directory when it may have changed
    #[instrument(skip(self), fields(key = %self.state.primary_key))]
    pub async fn save(&self) {
        let restored_primary = self.restored_from() == Some(self.primary_key());

        if !self.on_fallback_branch() && restored_primary {
            info!("Build cache dependencies unchanged, skipping save");
            return;
        }

        let target_dir = &self.settings.target_dir;
        if !target_dir.exists() {
            warn!(
                "Target directory does not exist: {}, skipping cache save",
                target_dir.display()
            );
            return;
        }

        // Entries are write-once; the fallback branch replaces its own
        if self.restored_from().is_some() && self.on_fallback_branch() {
            if let Err(e) = self.backend.delete(self.primary_key()).await {
                warn!("Failed to delete build cache entry {}: {}", self.primary_key(), e);
            }
        }

        match self
            .backend
            .save(&[target_dir.clone()], self.primary_key())
            .await
        {
            Ok(()) => info!("Saved build cache with key: {}", self.primary_key()),
            Err(e) => warn!("Build cache save failed: {}", e),
        }
    }
}

/// Branch name on the fallback branch, else the Cargo.lock digest, else the branch
fn lock_fingerprint(settings: &BuildCacheSettings) -> String {
    if settings.current_branch == settings.fallback_branch {
        return settings.current_branch.clone();
    }
    match read_lock_file(&settings.project_dir) {
        Some(contents) => lock_file_fingerprint(&contents),
        None => settings.current_branch.clone(),
    }
}

fn read_lock_file(project_dir: &Path) -> Option<Vec<u8>> {
    let path = project_dir.join("Cargo.lock");
    match std::fs::read(&path) {
        Ok(contents) => Some(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Cannot read {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MockCacheBackend;
    use tempfile::TempDir;

    fn settings(project: &Path, branch: &str) -> BuildCacheSettings {
        BuildCacheSettings {
            cache_prefix: "rax-cache".to_string(),
            project_dir: project.to_path_buf(),
            target_dir: project.join("target"),
            toolchains: vec!["stable".to_string()],
            fallback_branch: "main".to_string(),
            current_branch: branch.to_string(),
            platform: HostPlatform::new("linux", "x86_64"),
        }
    }

    #[test]
    fn test_fallback_branch_keys_on_its_name() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), "version = 3\n").unwrap();
        let backend = MockCacheBackend::new();

        let cache = BuildCache::new(settings(dir.path(), "main"), &backend);
        assert!(cache.primary_key().ends_with("-main"));
        assert_eq!(cache.primary_key(), cache.fallback_key());
    }

    #[test]
    fn test_feature_branch_keys_on_lock_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), "version = 3\n").unwrap();
        let backend = MockCacheBackend::new();

        let cache = BuildCache::new(settings(dir.path(), "feature-x"), &backend);
        let expected = lock_file_fingerprint(b"version = 3\n");
        assert!(cache.primary_key().ends_with(&expected));
        assert!(cache.fallback_key().ends_with("-main"));
    }

    #[test]
    fn test_no_lock_file_keys_on_branch() {
        let dir = TempDir::new().unwrap();
        let backend = MockCacheBackend::new();
        let cache = BuildCache::new(settings(dir.path(), "feature-x"), &backend);
        assert!(cache.primary_key().ends_with("-feature-x"));
    }

    #[test]
    fn test_key_embeds_platform_and_toolchains() {
        let backend = MockCacheBackend::new();
        let mut s = settings(Path::new("."), "main");
        s.toolchains = vec!["stable".to_string(), "nightly".to_string()];
        let cache = BuildCache::new(s, &backend);
        let fp = toolchain_set_fingerprint(&["nightly", "stable"]);
        assert_eq!(
            cache.primary_key(),
            format!("rax-cache-build-linux-x86_64-{}-root-main", fp)
        );
    }

    #[test]
    fn test_for_strategy() {
        let backend = MockCacheBackend::new();
        let make = |prefix: &str| BuildCacheSettings {
            cache_prefix: prefix.to_string(),
            ..settings(Path::new("."), "main")
        };
        let none = BuildCacheStrategyKind::None;
        let remote = BuildCacheStrategyKind::Remote;
        assert!(BuildCache::for_strategy(none, Some("p"), make, &backend).is_none());
        assert!(BuildCache::for_strategy(remote, Some("no-cache"), make, &backend).is_none());
        assert!(BuildCache::for_strategy(remote, None, make, &backend).is_none());
        let cache = BuildCache::for_strategy(remote, Some("p"), make, &backend).unwrap();
        assert!(cache.primary_key().starts_with("p-build-"));
    }

    #[tokio::test]
    async fn test_restore_omits_duplicate_fallback() {
        let dir = TempDir::new().unwrap();
        let backend = MockCacheBackend::new();
        let mut cache = BuildCache::new(settings(dir.path(), "main"), &backend);
        cache.restore().await;

        match &backend.calls()[0] {
            crate::cache::CacheCall::Restore { fallbacks, .. } => assert!(fallbacks.is_empty()),
            other => panic!("unexpected call {:?}", other),
        }
    }
}
