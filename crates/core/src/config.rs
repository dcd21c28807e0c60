//! Run configuration and host environment snapshot
//!
//! Configuration is layered, lowest precedence first:
//!
//! 1. Built-in defaults ([`RunConfig::default`])
//! 2. An optional TOML file (`rax.toml`)
//! 3. `RAX_`-prefixed environment variables
//! 4. Command-line flags (applied by the binary)
//!
//! Environment variables address fields by path, with `_` separating the
//! segments and segment names matched case-insensitively against the camelCase
//! field names: `RAX_flow_clippy_denyWarnings=false`, `RAX_cacheKey=no-cache`.
//! The value is interpreted according to the type of the field it targets:
//! list fields take comma-separated values, boolean fields take JSON, and
//! string fields take the raw value.
//!
//! Ambient process state that is not user configuration (home directories,
//! `PATH`, CI branch name) is captured separately in [`HostEnv`].

use crate::errors::{ConfigError, Result};
use crate::platform::HostPlatform;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument, warn};

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "RAX_";

/// Branch name used when not running under a CI system that reports one
pub const DEFAULT_BRANCH: &str = "not-in-ci";

/// Default local cache directory, relative to the working directory
pub const DEFAULT_CACHE_DIR: &str = ".rax/cache";

/// Configuration file picked up from the working directory
pub const DEFAULT_CONFIG_FILE: &str = "rax.toml";

/// `RAX_` variables that are not configuration paths
const RESERVED_ENV: &[&str] = &["LOG", "LOG_FORMAT"];

/// Per-task settings shared by every task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConfig {
    /// Toolchain for this task; overrides the global toolchain
    pub toolchain: Option<String>,
    /// Replaces the task's default arguments; shell-style quoting applies
    pub override_args: Option<String>,
    /// Cargo profile, for tasks that accept one
    pub profile: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestTaskConfig {
    #[serde(flatten)]
    pub common: TaskConfig,
    /// Stop at the first failing test binary
    pub fail_fast: bool,
}

impl Default for TestTaskConfig {
    fn default() -> Self {
        Self {
            common: TaskConfig::default(),
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClippyTaskConfig {
    #[serde(flatten)]
    pub common: TaskConfig,
    /// Append `-- -D warnings`
    pub deny_warnings: bool,
}

impl Default for ClippyTaskConfig {
    fn default() -> Self {
        Self {
            common: TaskConfig::default(),
            deny_warnings: true,
        }
    }
}

/// Settings for every verification task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    pub test: TestTaskConfig,
    pub clippy: ClippyTaskConfig,
    pub fmt: TaskConfig,
    pub doc: TaskConfig,
    pub shear: TaskConfig,
    pub deny: TaskConfig,
}

/// Build cache strategy selected by `buildCacheStrategy`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildCacheStrategyKind {
    None,
    Remote,
}

/// Complete user configuration for one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct RunConfig {
    /// Task names to run; `all-default` expands to the default set
    pub run: Vec<String>,
    /// Path to the project
    pub project: String,
    /// Cache prefix; `no-cache` disables caching
    pub cache_key: String,
    /// Global toolchain channel
    pub toolchain: Option<String>,
    /// Components added to every provisioned toolchain
    pub extra_components: Vec<String>,
    /// Additional `tool@version` specs to install
    pub install_additional: Vec<String>,
    /// Provision toolchains and tools, then stop
    pub install_only: bool,
    /// Install tools with cargo-binstall instead of compiling them
    pub fast_install: bool,
    /// `none`, `github` or `remote`
    pub build_cache_strategy: String,
    /// Branch whose build output every other branch may start from
    pub build_cache_fallback_branch: String,
    /// Directory of the local cache backend
    pub cache_dir: Option<PathBuf>,
    pub flow: FlowConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run: vec!["all-default".to_string()],
            project: ".".to_string(),
            cache_key: "rax-cache".to_string(),
            toolchain: None,
            extra_components: Vec::new(),
            install_additional: Vec::new(),
            install_only: false,
            fast_install: true,
            build_cache_strategy: "none".to_string(),
            build_cache_fallback_branch: "main".to_string(),
            cache_dir: None,
            flow: FlowConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load configuration from an optional file and an environment snapshot
    #[instrument(skip(vars))]
    pub fn load<I>(file: Option<&Path>, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let base = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.with_env_overlay(vars)
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {}", path.display());
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| {
            ConfigError::Parsing {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Apply `RAX_`-prefixed variables on top of this configuration
    pub fn with_env_overlay<I>(self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut tree = serde_json::to_value(&self).map_err(|e| ConfigError::Parsing {
            message: e.to_string(),
        })?;

        let mut vars: Vec<(String, String)> = vars
            .into_iter()
            .filter(|(name, _)| name.starts_with(ENV_PREFIX))
            .collect();
        // Deterministic application order regardless of the environment's
        vars.sort();

        for (name, raw) in vars {
            let path = &name[ENV_PREFIX.len()..];
            if RESERVED_ENV.contains(&path) {
                continue;
            }
            let segments: Vec<&str> = if path.eq_ignore_ascii_case("CACHE_DIR") {
                vec!["cacheDir"]
            } else {
                path.split('_').filter(|s| !s.is_empty()).collect()
            };
            if !set_path(&mut tree, &segments, &raw)? {
                warn!("Ignoring unknown configuration variable {}", name);
            } else {
                debug!("Applied configuration variable {}", name);
            }
        }

        serde_json::from_value(tree).map_err(|e| {
            ConfigError::Validation {
                message: format!("Invalid configuration from environment: {}", e),
            }
            .into()
        })
    }

    /// Caching disabled entirely
    pub fn caching_disabled(&self) -> bool {
        crate::cache::effective_prefix(Some(&self.cache_key)).is_none()
    }

    /// Parse `buildCacheStrategy`; unknown values disable the build cache
    pub fn build_cache_strategy_kind(&self) -> BuildCacheStrategyKind {
        match self.build_cache_strategy.trim().to_ascii_lowercase().as_str() {
            "" | "none" => BuildCacheStrategyKind::None,
            "github" | "remote" => BuildCacheStrategyKind::Remote,
            other => {
                warn!(
                    "Unknown build cache strategy '{}', build caching is disabled",
                    other
                );
                BuildCacheStrategyKind::None
            }
        }
    }

    /// Directory of the local cache backend
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
    }

    pub fn project_dir(&self) -> PathBuf {
        PathBuf::from(&self.project)
    }
}

/// Set `segments` inside `tree` from a raw environment value
///
/// Returns `false` when the path does not name an existing field.
fn set_path(tree: &mut Value, segments: &[&str], raw: &str) -> Result<bool> {
    let Some((last, parents)) = segments.split_last() else {
        return Ok(false);
    };

    let mut node = tree;
    for segment in parents {
        let Some(next) = child_mut(node, segment) else {
            return Ok(false);
        };
        node = next;
    }
    let Some(slot) = child_mut(node, last) else {
        return Ok(false);
    };

    *slot = coerce(slot, raw).map_err(|message| ConfigError::Validation {
        message: format!("{}: {}", segments.join("_"), message),
    })?;
    Ok(true)
}

fn child_mut<'a>(node: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    let object = node.as_object_mut()?;
    let key = object
        .keys()
        .find(|k| k.eq_ignore_ascii_case(segment))?
        .clone();
    object.get_mut(&key)
}

/// Interpret a raw value according to the shape of the field it replaces
fn coerce(current: &Value, raw: &str) -> std::result::Result<Value, String> {
    match current {
        Value::Array(_) => {
            let trimmed = raw.trim();
            if trimmed.starts_with('[') {
                serde_json::from_str(trimmed).map_err(|e| e.to_string())
            } else {
                Ok(Value::Array(
                    trimmed
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| Value::String(s.to_string()))
                        .collect(),
                ))
            }
        }
        Value::Bool(_) | Value::Number(_) => match serde_json::from_str::<Value>(raw.trim()) {
            Ok(parsed @ (Value::Bool(_) | Value::Number(_))) => Ok(parsed),
            _ => Err(format!("expected a boolean or number, got '{}'", raw)),
        },
        Value::Object(_) => serde_json::from_str(raw).map_err(|e| e.to_string()),
        Value::String(_) | Value::Null => Ok(Value::String(raw.to_string())),
    }
}

/// Snapshot of the process environment relevant to provisioning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnv {
    pub cargo_home: PathBuf,
    pub rustup_home: PathBuf,
    /// Executable search path
    pub path: Option<String>,
    /// Current branch as reported by CI
    pub branch: String,
    /// `CARGO_TARGET_DIR`, if set
    pub cargo_target_dir: Option<PathBuf>,
    pub sccache_path: Option<String>,
    pub rustc_wrapper: Option<String>,
    pub platform: HostPlatform,
}

impl HostEnv {
    /// Build from environment variables and the user's home directory
    pub fn from_vars<I>(vars: I, home: Option<PathBuf>, platform: HostPlatform) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .collect();
        let home = home.unwrap_or_default();

        let cargo_home = vars
            .get("CARGO_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".cargo"));
        let rustup_home = vars
            .get("RUSTUP_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".rustup"));

        Self {
            cargo_home,
            rustup_home,
            path: vars.get("PATH").cloned(),
            branch: vars
                .get("GITHUB_REF_NAME")
                .cloned()
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            cargo_target_dir: vars.get("CARGO_TARGET_DIR").map(PathBuf::from),
            sccache_path: vars.get("SCCACHE_PATH").cloned(),
            rustc_wrapper: vars.get("RUSTC_WRAPPER").cloned(),
            platform,
        }
    }

    /// Snapshot of the current process environment
    pub fn capture() -> Self {
        let home = directories_next::BaseDirs::new().map(|dirs| dirs.home_dir().to_path_buf());
        if home.is_none() {
            warn!("Could not determine home directory, CARGO_HOME and RUSTUP_HOME must be set");
        }
        Self::from_vars(std::env::vars(), home, HostPlatform::current())
    }

    /// Where `cargo install` puts binaries
    pub fn cargo_bin_dir(&self) -> PathBuf {
        self.cargo_home.join("bin")
    }

    /// Installed location of a cargo tool binary
    pub fn tool_binary(&self, name: &str) -> PathBuf {
        self.cargo_bin_dir()
            .join(self.platform.executable_name(name))
    }

    /// Installed location of a toolchain
    pub fn toolchain_dir(&self, channel: &str, host_triple: &str) -> PathBuf {
        self.rustup_home
            .join("toolchains")
            .join(format!("{}-{}", channel, host_triple))
    }

    /// Build output directory for a project
    pub fn target_dir(&self, project_dir: &Path) -> PathBuf {
        match &self.cargo_target_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => project_dir.join(dir),
            None => project_dir.join("target"),
        }
    }
}
