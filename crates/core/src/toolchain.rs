//! Rust toolchain provisioning
//!
//! Toolchains are identified by `(channel, host triple)`. An installed
//! toolchain is used in place; otherwise it is restored from the cache or
//! installed with rustup. Components are reconciled in every case, and the
//! cache entry is refreshed whenever the toolchain directory changed.
//!
//! The project's `rust-toolchain.toml` (or legacy `rust-toolchain`) pin file
//! is read here as well, since it decides which channel wins.

use crate::cache::{self, keys::toolchain_key, CacheBackend};
use crate::config::HostEnv;
use crate::errors::{Result, ToolchainError};
use crate::process::{CommandRunner, CommandSpec};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Channel used when nothing else is configured
pub const DEFAULT_CHANNEL: &str = "stable";

/// Pin file names, in lookup order
const PIN_FILES: &[&str] = &["rust-toolchain.toml", "rust-toolchain"];

/// A toolchain channel plus the components it must carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainSpec {
    pub channel: String,
    pub components: IndexSet<String>,
}

impl ToolchainSpec {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            components: IndexSet::new(),
        }
    }

    pub fn with_components<I, S>(mut self, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.components
            .extend(components.into_iter().map(Into::into));
        self
    }
}

/// Where a provisioned toolchain came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolchainSource {
    /// Already installed locally
    Local,
    /// Restored from the cache
    Cache,
    /// Installed by rustup
    Installed,
}

/// Outcome of [`ToolchainProvisioner::ensure_toolchain`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainOutcome {
    pub channel: String,
    pub host_triple: String,
    pub source: ToolchainSource,
    /// Components that had to be added
    pub added_components: Vec<String>,
}

/// Toolchain requested by a project pin file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedToolchain {
    pub path: PathBuf,
    pub channel: String,
    pub components: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PinFile {
    toolchain: PinFileToolchain,
}

#[derive(Debug, Deserialize)]
struct PinFileToolchain {
    channel: Option<String>,
    #[serde(default)]
    components: Vec<String>,
}

/// Read the project's toolchain pin file, if any
///
/// `rust-toolchain.toml` wins over the legacy `rust-toolchain` file. The
/// legacy file may hold either TOML or a bare channel name.
pub fn read_pinned_toolchain(project_dir: &Path) -> Result<Option<PinnedToolchain>> {
    for name in PIN_FILES {
        let path = project_dir.join(name);
        if !path.is_file() {
            continue;
        }
        let content = std::fs::read_to_string(&path).map_err(|e| ToolchainError::PinFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        return parse_pin_file(&path, &content).map(Some);
    }
    Ok(None)
}

/// Channel declared by the project's pin file, if any
pub fn read_pinned_channel(project_dir: &Path) -> Result<Option<String>> {
    Ok(read_pinned_toolchain(project_dir)?.map(|pin| pin.channel))
}

fn parse_pin_file(path: &Path, content: &str) -> Result<PinnedToolchain> {
    let pin_error = |message: String| ToolchainError::PinFile {
        path: path.display().to_string(),
        message,
    };

    let is_toml = path.extension().map_or(false, |ext| ext == "toml")
        || content.trim_start().starts_with("[toolchain]");

    if is_toml {
        let parsed: PinFile = toml::from_str(content).map_err(|e| pin_error(e.to_string()))?;
        let channel = parsed
            .toolchain
            .channel
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| pin_error("missing [toolchain] channel".to_string()))?;
        return Ok(PinnedToolchain {
            path: path.to_path_buf(),
            channel: channel.trim().to_string(),
            components: parsed.toolchain.components,
        });
    }

    let channel = content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| pin_error("file is empty".to_string()))?;
    Ok(PinnedToolchain {
        path: path.to_path_buf(),
        channel: channel.to_string(),
        components: Vec::new(),
    })
}

/// Thin wrapper over the `rustup` and `rustc` command lines
pub struct Rustup<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> Rustup<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Host triple from `rustc -vV`
    pub async fn host_triple(&self) -> Result<String> {
        let output = self
            .runner
            .run_checked(&CommandSpec::new("rustc").arg("-vV").captured())
            .await
            .map_err(|e| ToolchainError::HostTriple {
                message: e.to_string(),
            })?;
        parse_host_triple(&output.stdout).ok_or_else(|| {
            ToolchainError::HostTriple {
                message: "no `host:` line in `rustc -vV` output".to_string(),
            }
            .into()
        })
    }

    /// Names of installed toolchains, without annotations such as `(default)`
    pub async fn installed_toolchains(&self) -> Result<Vec<String>> {
        let output = self
            .runner
            .run_checked(&CommandSpec::new("rustup").args(["toolchain", "list"]).captured())
            .await
            .map_err(ToolchainError::Query)?;
        Ok(first_tokens(&output.stdout))
    }

    pub async fn installed_components(&self, channel: &str) -> Result<Vec<String>> {
        let output = self
            .runner
            .run_checked(
                &CommandSpec::new("rustup")
                    .arg(format!("+{}", channel))
                    .args(["component", "list", "--installed"])
                    .captured(),
            )
            .await
            .map_err(ToolchainError::Query)?;
        Ok(first_tokens(&output.stdout))
    }

    pub async fn add_component(&self, channel: &str, component: &str) -> Result<()> {
        self.runner
            .run_checked(
                &CommandSpec::new("rustup")
                    .arg(format!("+{}", channel))
                    .args(["component", "add", component]),
            )
            .await
            .map_err(|source| ToolchainError::Component {
                component: component.to_string(),
                toolchain: channel.to_string(),
                source,
            })?;
        Ok(())
    }

    /// Install with the `default` profile so later component adds rarely
    /// need extra downloads
    pub async fn install(&self, channel: &str) -> Result<()> {
        self.runner
            .run_checked(&CommandSpec::new("rustup").args([
                "install",
                channel,
                "--profile",
                "default",
            ]))
            .await
            .map_err(|source| ToolchainError::Install {
                toolchain: channel.to_string(),
                source,
            })?;
        Ok(())
    }

    /// The configured default toolchain, `None` when there is none
    pub async fn default_toolchain(&self) -> Result<Option<String>> {
        let output = self
            .runner
            .run(&CommandSpec::new("rustup").arg("default").captured())
            .await
            .map_err(ToolchainError::Query)?;
        if !output.is_success() {
            debug!("rustup reports no default toolchain: {}", output.stderr.trim());
            return Ok(None);
        }
        Ok(first_tokens(&output.stdout).into_iter().next())
    }

    pub async fn set_default_toolchain(&self, channel: &str) -> Result<()> {
        self.runner
            .run_checked(&CommandSpec::new("rustup").args(["default", channel]))
            .await
            .map_err(|source| ToolchainError::Install {
                toolchain: channel.to_string(),
                source,
            })?;
        Ok(())
    }
}

fn parse_host_triple(rustc_verbose: &str) -> Option<String> {
    rustc_verbose
        .lines()
        .find_map(|line| line.strip_prefix("host:"))
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty())
}

fn first_tokens(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// An installed toolchain named `channel` or `channel-host`
fn toolchain_installed(installed: &[String], channel: &str, host_triple: &str) -> bool {
    let qualified = format!("{}-{}", channel, host_triple);
    installed.iter().any(|t| *t == channel || *t == qualified)
}

/// Installed components carry a target suffix, e.g. `clippy-x86_64-unknown-linux-gnu`
fn component_installed(installed: &[String], component: &str) -> bool {
    let prefix = format!("{}-", component);
    installed
        .iter()
        .any(|c| c == component || c.starts_with(&prefix))
}

/// Provisions toolchains through rustup and the cache
pub struct ToolchainProvisioner<'a> {
    rustup: Rustup<'a>,
    cache: &'a dyn CacheBackend,
    host: &'a HostEnv,
}

impl<'a> ToolchainProvisioner<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        cache: &'a dyn CacheBackend,
        host: &'a HostEnv,
    ) -> Self {
        Self {
            rustup: Rustup::new(runner),
            cache,
            host,
        }
    }

    #[instrument(skip(self), fields(channel = %spec.channel))]
    pub async fn ensure_toolchain(
        &self,
        spec: &ToolchainSpec,
        cache_prefix: Option<&str>,
    ) -> Result<ToolchainOutcome> {
        let channel = spec.channel.as_str();
        let host_triple = self.rustup.host_triple().await?;
        let prefix = cache::effective_prefix(cache_prefix);
        let key = prefix.map(|p| toolchain_key(p, channel, &host_triple));
        let toolchain_dir = self.host.toolchain_dir(channel, &host_triple);

        let installed = self.rustup.installed_toolchains().await?;
        let source = if toolchain_installed(&installed, channel, &host_triple) {
            debug!("Toolchain {} already installed", channel);
            ToolchainSource::Local
        } else if self.try_restore(&toolchain_dir, key.as_deref()).await {
            info!("Restored toolchain {} from cache", channel);
            ToolchainSource::Cache
        } else {
            info!("Installing toolchain {}", channel);
            self.rustup.install(channel).await?;
            ToolchainSource::Installed
        };

        let added_components = self.ensure_components(channel, &spec.components).await?;

        let needs_save = source == ToolchainSource::Installed || !added_components.is_empty();
        if needs_save {
            if let Some(key) = &key {
                self.try_save(&toolchain_dir, key).await;
            }
        }

        Ok(ToolchainOutcome {
            channel: channel.to_string(),
            host_triple,
            source,
            added_components,
        })
    }

    /// Add missing components, returning the ones added
    async fn ensure_components(
        &self,
        channel: &str,
        components: &IndexSet<String>,
    ) -> Result<Vec<String>> {
        if components.is_empty() {
            return Ok(Vec::new());
        }

        let installed = self.rustup.installed_components(channel).await?;
        let mut added = Vec::new();
        for component in components {
            if component_installed(&installed, component) {
                debug!("Component {} already installed for {}", component, channel);
                continue;
            }
            info!("Installing component {} for toolchain {}", component, channel);
            self.rustup.add_component(channel, component).await?;
            added.push(component.clone());
        }
        Ok(added)
    }

    async fn try_restore(&self, toolchain_dir: &Path, key: Option<&str>) -> bool {
        let Some(key) = key else {
            return false;
        };
        match self
            .cache
            .restore(&[toolchain_dir.to_path_buf()], key, &[])
            .await
        {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                warn!("Toolchain cache restore for {} failed: {}", key, e);
                false
            }
        }
    }

    async fn try_save(&self, toolchain_dir: &Path, key: &str) {
        if !toolchain_dir.exists() {
            warn!(
                "Expected path {} missing, skip caching",
                toolchain_dir.display()
            );
            return;
        }
        match self.cache.save(&[toolchain_dir.to_path_buf()], key).await {
            Ok(()) => info!("Saved toolchain to cache key {}", key),
            Err(e) => warn!("Toolchain cache save for {} failed: {}", key, e),
        }
    }
}
