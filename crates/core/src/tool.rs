//! Cargo tool provisioning
//!
//! [`ToolProvisioner::ensure_tool`] makes a cargo subcommand binary available
//! with as little work as possible:
//!
//! 1. a binary already on `PATH` is trusted as-is, whatever its version
//! 2. `latest` is pinned through the registry so cache keys track releases
//! 3. the binary is restored from the cache when an entry exists
//! 4. otherwise it is installed with `cargo binstall` or `cargo install`
//!    and saved to the cache
//!
//! Cache failures are logged and otherwise ignored; installer failures are
//! returned to the caller.

use crate::cache::{self, keys::tool_key, CacheBackend};
use crate::config::HostEnv;
use crate::errors::{Result, ToolError};
use crate::process::{CommandRunner, CommandSpec};
use crate::registry::VersionResolver;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

/// Crate providing prebuilt-binary installs
pub const BINSTALL: &str = "cargo-binstall";

/// Version requested for a tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionRequest {
    Latest,
    Exact(String),
}

impl fmt::Display for VersionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionRequest::Latest => write!(f, "latest"),
            VersionRequest::Exact(version) => write!(f, "{}", version),
        }
    }
}

/// A cargo tool and the version wanted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub name: String,
    pub version: VersionRequest,
}

impl ToolSpec {
    pub fn latest(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: VersionRequest::Latest,
        }
    }

    pub fn exact(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: VersionRequest::Exact(version.into()),
        }
    }

    /// Parse `name`, `name@latest` or `name@1.2.3`
    ///
    /// ```
    /// use rax_core::tool::{ToolSpec, VersionRequest};
    ///
    /// let spec = ToolSpec::parse("cargo-audit@0.17.4").unwrap();
    /// assert_eq!(spec.name, "cargo-audit");
    /// assert_eq!(spec.version, VersionRequest::Exact("0.17.4".into()));
    /// assert_eq!(ToolSpec::parse("cargo-deny").unwrap().version, VersionRequest::Latest);
    /// assert!(ToolSpec::parse("cargo-deny@one").is_err());
    /// ```
    pub fn parse(spec: &str) -> std::result::Result<Self, ToolError> {
        let invalid = |reason: &str| ToolError::InvalidSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = spec.trim();
        let (name, version) = match trimmed.split_once('@') {
            Some((name, version)) => (name.trim(), version.trim()),
            None => (trimmed, ""),
        };

        if name.is_empty() {
            return Err(invalid("missing tool name"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(invalid("tool name contains whitespace"));
        }

        let version = if version.is_empty() || version.eq_ignore_ascii_case("latest") {
            VersionRequest::Latest
        } else {
            semver::Version::parse(version)
                .map_err(|e| invalid(&format!("invalid version: {}", e)))?;
            VersionRequest::Exact(version.to_string())
        };

        Ok(Self {
            name: name.to_string(),
            version,
        })
    }
}

impl fmt::Display for ToolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// How a tool became available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolSource {
    /// Already on PATH; nothing was done
    AlreadyPresent,
    /// Restored from the cache
    Cache,
    /// Installed by the installer
    Installed,
}

/// Outcome of [`ToolProvisioner::ensure_tool`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInstallation {
    pub name: String,
    /// Concrete version; `None` when the tool was already on PATH
    pub version: Option<String>,
    pub path: PathBuf,
    pub source: ToolSource,
}

/// Installs cargo tools, consulting the cache first
pub struct ToolProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    cache: &'a dyn CacheBackend,
    resolver: &'a dyn VersionResolver,
    host: &'a HostEnv,
}

impl<'a> ToolProvisioner<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        cache: &'a dyn CacheBackend,
        resolver: &'a dyn VersionResolver,
        host: &'a HostEnv,
    ) -> Self {
        Self {
            runner,
            cache,
            resolver,
            host,
        }
    }

    /// Make `spec` available, see the module documentation for the steps
    #[instrument(skip(self), fields(tool = %spec))]
    pub async fn ensure_tool(
        &self,
        spec: &ToolSpec,
        cache_prefix: Option<&str>,
        fast_install: bool,
    ) -> Result<ToolInstallation> {
        let pending = match self.locate(spec, cache_prefix).await? {
            Located::Ready(installation) => return Ok(installation),
            Located::Missing(pending) => pending,
        };

        if !fast_install {
            return self.install(spec, pending, Installer::Cargo).await;
        }

        // The fast installer itself is always compiled from source
        let binstall = ToolSpec::latest(BINSTALL);
        if let Located::Missing(installer) = self.locate(&binstall, cache_prefix).await? {
            self.install(&binstall, installer, Installer::Cargo).await?;
        }
        self.install(spec, pending, Installer::Binstall).await
    }

    /// PATH lookup, version pinning and cache restore
    async fn locate(&self, spec: &ToolSpec, cache_prefix: Option<&str>) -> Result<Located> {
        if let Some(path) = self.runner.which(&spec.name) {
            debug!("{} found at {}, skipping installation", spec.name, path.display());
            return Ok(Located::Ready(ToolInstallation {
                name: spec.name.clone(),
                version: None,
                path,
                source: ToolSource::AlreadyPresent,
            }));
        }

        let version = match &spec.version {
            VersionRequest::Exact(version) => version.clone(),
            VersionRequest::Latest => self.resolver.latest_version(&spec.name).await?,
        };

        let binary = self.host.tool_binary(&spec.name);
        let key = cache::effective_prefix(cache_prefix)
            .map(|prefix| tool_key(prefix, &spec.name, &version, &self.host.platform));

        if let Some(key) = &key {
            if self.try_restore(&binary, key).await {
                info!("Using cached {}@{}", spec.name, version);
                return Ok(Located::Ready(ToolInstallation {
                    name: spec.name.clone(),
                    version: Some(version),
                    path: binary,
                    source: ToolSource::Cache,
                }));
            }
        }

        Ok(Located::Missing(Pending {
            version,
            binary,
            key,
        }))
    }

    async fn install(
        &self,
        spec: &ToolSpec,
        pending: Pending,
        installer: Installer,
    ) -> Result<ToolInstallation> {
        info!("Installing {}@{}", spec.name, pending.version);
        self.runner
            .run_checked(&install_command(installer, spec))
            .await
            .map_err(|source| ToolError::InstallationFailed {
                name: spec.name.clone(),
                version: pending.version.clone(),
                source,
            })?;

        if let Some(key) = &pending.key {
            self.try_save(&pending.binary, key).await;
        }

        Ok(ToolInstallation {
            name: spec.name.clone(),
            version: Some(pending.version),
            path: pending.binary,
            source: ToolSource::Installed,
        })
    }

    async fn try_restore(&self, binary: &std::path::Path, key: &str) -> bool {
        match self.cache.restore(&[binary.to_path_buf()], key, &[]).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                debug!("No cache entry for {}", key);
                false
            }
            Err(e) => {
                warn!("Cache restore for {} failed: {}", key, e);
                false
            }
        }
    }

    async fn try_save(&self, binary: &std::path::Path, key: &str) {
        info!("Caching {} with key {}", binary.display(), key);
        if let Err(e) = self.cache.save(&[binary.to_path_buf()], key).await {
            warn!("Caching {} failed: {}", key, e);
        }
    }
}

enum Located {
    Ready(ToolInstallation),
    Missing(Pending),
}

/// A tool that must be installed
struct Pending {
    version: String,
    binary: PathBuf,
    /// Cache key, `None` when caching is disabled
    key: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Installer {
    /// `cargo install`, compiles from source
    Cargo,
    /// `cargo binstall`, downloads prebuilt binaries
    Binstall,
}

fn install_command(installer: Installer, spec: &ToolSpec) -> CommandSpec {
    let mut command = CommandSpec::new("cargo");
    command = match installer {
        Installer::Cargo => command.arg("install"),
        Installer::Binstall => command.args(["binstall", "--no-confirm"]),
    };
    if let VersionRequest::Exact(version) = &spec.version {
        command = command.args(["--version", version.as_str()]);
    }
    command.arg(spec.name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_specs() {
        assert_eq!(ToolSpec::parse("cargo-shear").unwrap(), ToolSpec::latest("cargo-shear"));
        assert_eq!(
            ToolSpec::parse("cargo-shear@latest").unwrap(),
            ToolSpec::latest("cargo-shear")
        );
        assert_eq!(
            ToolSpec::parse(" cargo-audit@0.17.4 ").unwrap(),
            ToolSpec::exact("cargo-audit", "0.17.4")
        );
        assert_eq!(
            ToolSpec::parse("cargo-nextest@").unwrap(),
            ToolSpec::latest("cargo-nextest")
        );
    }

    #[test]
    fn test_parse_rejects_bad_specs() {
        for bad in ["", "@1.0.0", "cargo audit", "cargo-audit@1.x", "cargo-audit@1.0.0@2"] {
            let err = ToolSpec::parse(bad).unwrap_err();
            assert!(
                matches!(err, ToolError::InvalidSpec { .. }),
                "spec {:?} gave {:?}",
                bad,
                err
            );
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(ToolSpec::latest("cargo-deny").to_string(), "cargo-deny@latest");
        assert_eq!(ToolSpec::exact("cargo-deny", "0.16.1").to_string(), "cargo-deny@0.16.1");
    }

    #[test]
    fn test_install_commands() {
        let explicit = ToolSpec::exact("cargo-audit", "0.17.4");
        assert_eq!(
            install_command(Installer::Cargo, &explicit).command_line(),
            "cargo install --version 0.17.4 cargo-audit"
        );
        assert_eq!(
            install_command(Installer::Binstall, &explicit).command_line(),
            "cargo binstall --no-confirm --version 0.17.4 cargo-audit"
        );

        let latest = ToolSpec::latest("cargo-deny");
        assert_eq!(
            install_command(Installer::Cargo, &latest).command_line(),
            "cargo install cargo-deny"
        );
    }
}
