//! Run orchestration
//!
//! Sequences one complete run: base tooling checks, toolchain and tool
//! provisioning, build cache restore, the verification tasks, build cache
//! save and the summary. Cache policy lives in the provisioners and in
//! [`BuildCache`]; this module only wires them together and decides which
//! failures end the run and which only fail a task.

use crate::build_cache::{BuildCache, BuildCacheSettings};
use crate::cache::{self, CacheBackend};
use crate::config::{HostEnv, RunConfig};
use crate::errors::{Result, ToolchainError};
use crate::process::{CommandRunner, CommandSpec};
use crate::registry::VersionResolver;
use crate::tasks::Task;
use crate::tool::{ToolProvisioner, ToolSpec};
use crate::toolchain::{
    read_pinned_toolchain, PinnedToolchain, Rustup, ToolchainProvisioner, ToolchainSpec,
    DEFAULT_CHANNEL,
};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// Programs that must exist before anything else happens
const BASE_PROGRAMS: &[&str] = &["rustup", "cargo"];

/// Result of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskOutcome {
    Passed,
    Failed { message: String },
}

impl TaskOutcome {
    pub fn is_passed(&self) -> bool {
        matches!(self, TaskOutcome::Passed)
    }
}

/// Summary of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub installed_toolchains: Vec<String>,
    /// `(name, version)` pairs
    pub installed_tools: Vec<(String, String)>,
    pub task_results: IndexMap<String, TaskOutcome>,
    pub succeeded: bool,
}

impl RunResult {
    /// Names of failed tasks, in execution order
    pub fn failed_tasks(&self) -> Vec<&str> {
        self.task_results
            .iter()
            .filter(|(_, outcome)| !outcome.is_passed())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Format elapsed time as `Nms`, `Ns` or `Mm:SSs`
///
/// ```
/// use rax_core::run::time_since_start;
/// use std::time::Duration;
///
/// assert_eq!(time_since_start(Duration::from_millis(250)), "250ms");
/// assert_eq!(time_since_start(Duration::from_millis(12_400)), "12s");
/// assert_eq!(time_since_start(Duration::from_secs(125)), "2m:05s");
/// ```
pub fn time_since_start(elapsed: Duration) -> String {
    let millis = elapsed.as_millis();
    if millis < 1_000 {
        format!("{}ms", millis)
    } else if millis < 60_000 {
        format!("{}s", (millis + 500) / 1_000)
    } else {
        let minutes = millis / 60_000;
        let seconds = ((millis % 60_000) + 500) / 1_000;
        format!("{}m:{:02}s", minutes, seconds)
    }
}

/// Warnings about compiler caching, in the order they should be logged
pub fn sccache_warnings(host: &HostEnv) -> Vec<String> {
    match (&host.sccache_path, &host.rustc_wrapper) {
        (None, _) => vec![
            "SCCACHE_PATH is not set. Consider using sccache for caching builds.".to_string(),
        ],
        (Some(_), None) => vec![
            "RUSTC_WRAPPER is not set. You may want to set `RUSTC_WRAPPER=sccache` to enable sccache for Rust builds."
                .to_string(),
        ],
        (Some(_), Some(_)) => Vec::new(),
    }
}

/// Channel used by tasks without their own toolchain
///
/// The pin file wins, then the configured global toolchain, then `stable`.
pub fn default_channel(config: &RunConfig, pinned: Option<&PinnedToolchain>) -> String {
    pinned
        .map(|pin| pin.channel.clone())
        .or_else(|| config.toolchain.clone())
        .unwrap_or_else(|| DEFAULT_CHANNEL.to_string())
}

/// Channel `task` runs on; a pin file overrides per-task toolchains too
pub fn task_channel(config: &RunConfig, task: Task, pinned: Option<&PinnedToolchain>) -> String {
    match pinned {
        Some(pin) => pin.channel.clone(),
        None => task
            .settings(&config.flow)
            .toolchain
            .clone()
            .unwrap_or_else(|| default_channel(config, None)),
    }
}

/// Distinct channels to provision, in provisioning order
///
/// The default channel comes first whenever a task uses it, a global
/// toolchain is configured, or no task is selected at all.
pub fn planned_channels(
    config: &RunConfig,
    tasks: &[(Task, &str)],
    default_channel: &str,
) -> Vec<String> {
    let mut channels = IndexSet::new();
    let uses_default = tasks.iter().any(|(_, channel)| *channel == default_channel);
    if tasks.is_empty() || uses_default || config.toolchain.is_some() {
        channels.insert(default_channel.to_string());
    }
    for (_, channel) in tasks {
        channels.insert(channel.to_string());
    }
    channels.into_iter().collect()
}

/// A task with everything needed to run it
struct PlannedTask {
    task: Task,
    channel: String,
    command: CommandSpec,
}

/// Composes the provisioners, the build cache and the task runner
pub struct Orchestrator<'a> {
    config: &'a RunConfig,
    host: &'a HostEnv,
    runner: &'a dyn CommandRunner,
    cache: &'a dyn CacheBackend,
    resolver: &'a dyn VersionResolver,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a RunConfig,
        host: &'a HostEnv,
        runner: &'a dyn CommandRunner,
        cache: &'a dyn CacheBackend,
        resolver: &'a dyn VersionResolver,
    ) -> Self {
        Self {
            config,
            host,
            runner,
            cache,
            resolver,
        }
    }

    fn cache_prefix(&self) -> Option<&str> {
        cache::effective_prefix(Some(&self.config.cache_key))
    }

    /// Execute the run
    ///
    /// Returns `Err` for failures that stop the whole run: missing base
    /// programs, configuration errors and any toolchain or tool that cannot be
    /// provisioned. Task failures are reported per task in the [`RunResult`].
    #[instrument(skip(self), fields(project = %self.config.project))]
    pub async fn run(&self) -> Result<RunResult> {
        let start = Instant::now();
        let project_dir = self.config.project_dir();
        let target_dir = self.host.target_dir(&project_dir);

        info!("project path: {}", project_dir.display());
        info!("cargo home: {}", self.host.cargo_home.display());
        info!("rustup home: {}", self.host.rustup_home.display());
        info!("target dir: {}", target_dir.display());

        for program in BASE_PROGRAMS {
            if self.runner.which(program).is_none() {
                error!("{} is not installed on this machine", program);
                return Err(ToolchainError::ManagerMissing {
                    program: program.to_string(),
                }
                .into());
            }
        }
        for warning in sccache_warnings(self.host) {
            warn!("{}", warning);
        }

        let tasks = Task::select(&self.config.run)?;
        let additional = self
            .config
            .install_additional
            .iter()
            .map(|spec| ToolSpec::parse(spec))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Channel precedence: pin file, per-task, global, built-in default
        let pinned = read_pinned_toolchain(&project_dir)?;
        if let Some(pin) = &pinned {
            info!("Detected {} channel: {}", pin.path.display(), pin.channel);
            if let Some(global) = &self.config.toolchain {
                warn!(
                    "Global toolchain is set to '{}', but {} specifies '{}'. Overriding global toolchain.",
                    global,
                    pin.path.display(),
                    pin.channel
                );
            }
            for task in &tasks {
                if let Some(own) = &task.settings(&self.config.flow).toolchain {
                    warn!(
                        "Toolchain '{}' for {} is overridden by {} ('{}')",
                        own,
                        task,
                        pin.path.display(),
                        pin.channel
                    );
                }
            }
        }
        let default_channel = default_channel(self.config, pinned.as_ref());

        let mut planned = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let channel = task_channel(self.config, *task, pinned.as_ref());
            let command = task.command(&channel, &self.config.flow, &project_dir)?;
            planned.push(PlannedTask {
                task: *task,
                channel,
                command,
            });
        }

        self.ensure_default_toolchain(&default_channel).await;

        let mut result = RunResult::default();

        info!("Installing toolchains: {}", time_since_start(start.elapsed()));
        let pinned_components = pinned.as_ref().map(|pin| pin.components.as_slice());
        let toolchain_specs = self.toolchain_specs(&planned, &default_channel, pinned_components);
        self.provision_toolchains(&toolchain_specs, &mut result).await?;

        info!("Installing tools: {}", time_since_start(start.elapsed()));
        self.provision_tools(&planned, &additional, &mut result).await?;

        if self.config.install_only {
            info!("Install-only mode enabled, skipping task execution.");
            result.succeeded = true;
            return Ok(result);
        }

        let mut build_cache = BuildCache::for_strategy(
            self.config.build_cache_strategy_kind(),
            self.cache_prefix(),
            |prefix| BuildCacheSettings {
                cache_prefix: prefix.to_string(),
                project_dir: project_dir.clone(),
                target_dir: target_dir.clone(),
                toolchains: result.installed_toolchains.clone(),
                fallback_branch: self.config.build_cache_fallback_branch.clone(),
                current_branch: self.host.branch.clone(),
                platform: self.host.platform.clone(),
            },
            self.cache,
        );

        if let Some(build_cache) = build_cache.as_mut() {
            info!("Restoring build cache: {}", time_since_start(start.elapsed()));
            build_cache.restore().await;
        }

        for plan in &planned {
            info!("{}: {}", plan.task, time_since_start(start.elapsed()));
            let outcome = self.run_task(plan).await;
            if let TaskOutcome::Failed { message } = &outcome {
                error!("Task {} failed: {}", plan.task, message);
            }
            result.task_results.insert(plan.task.name().to_string(), outcome);
        }

        if let Some(build_cache) = &build_cache {
            info!("Saving build cache: {}", time_since_start(start.elapsed()));
            build_cache.save().await;
        }

        info!("Finished after: {}", time_since_start(start.elapsed()));

        result.succeeded = result.task_results.values().all(TaskOutcome::is_passed);
        if !result.succeeded {
            error!("The following tasks failed:");
            for name in result.failed_tasks() {
                error!(" - {}", name);
            }
        }

        Ok(result)
    }

    /// Make sure `rustc -vV` works by setting a default when none exists
    async fn ensure_default_toolchain(&self, channel: &str) {
        let rustup = Rustup::new(self.runner);
        match rustup.default_toolchain().await {
            Ok(Some(current)) => info!("Default toolchain: {}", current),
            Ok(None) => {
                info!("No default toolchain configured, setting {}", channel);
                if let Err(e) = rustup.set_default_toolchain(channel).await {
                    warn!("Failed to set default toolchain {}: {}", channel, e);
                }
            }
            Err(e) => warn!("Cannot query default toolchain: {}", e),
        }
    }

    /// One spec per distinct channel, with every component it needs
    fn toolchain_specs(
        &self,
        planned: &[PlannedTask],
        default_channel: &str,
        pinned_components: Option<&[String]>,
    ) -> Vec<ToolchainSpec> {
        let tasks: Vec<(Task, &str)> = planned
            .iter()
            .map(|plan| (plan.task, plan.channel.as_str()))
            .collect();

        planned_channels(self.config, &tasks, default_channel)
            .into_iter()
            .map(|channel| {
                let mut spec = ToolchainSpec::new(channel.as_str())
                    .with_components(self.config.extra_components.iter().cloned());
                if channel == default_channel {
                    if let Some(pinned) = pinned_components {
                        spec = spec.with_components(pinned.iter().cloned());
                    }
                }
                for plan in planned.iter().filter(|plan| plan.channel == channel) {
                    spec = spec.with_components(plan.task.required_components().iter().copied());
                }
                spec
            })
            .collect()
    }

    async fn provision_toolchains(
        &self,
        specs: &[ToolchainSpec],
        result: &mut RunResult,
    ) -> Result<()> {
        let provisioner = ToolchainProvisioner::new(self.runner, self.cache, self.host);
        for spec in specs {
            let outcome = provisioner
                .ensure_toolchain(spec, self.cache_prefix())
                .await
                .map_err(|e| {
                    error!("Toolchain {} could not be provisioned: {}", spec.channel, e);
                    e
                })?;
            info!("Toolchain {} ready ({:?})", outcome.channel, outcome.source);
            result.installed_toolchains.push(spec.channel.clone());
        }
        Ok(())
    }

    /// Task tools first, then `installAdditional`, each name once
    async fn provision_tools(
        &self,
        planned: &[PlannedTask],
        additional: &[ToolSpec],
        result: &mut RunResult,
    ) -> Result<()> {
        let provisioner = ToolProvisioner::new(self.runner, self.cache, self.resolver, self.host);
        let prefix = self.cache_prefix();
        let fast = self.config.fast_install;

        let task_tools = planned.iter().flat_map(|p| p.task.required_tools());
        let mut seen = IndexSet::new();
        for spec in task_tools.chain(additional.iter().cloned()) {
            if !seen.insert(spec.name.clone()) {
                continue;
            }
            let installed = provisioner
                .ensure_tool(&spec, prefix, fast)
                .await
                .map_err(|e| {
                    error!("Tool {} could not be installed: {}", spec, e);
                    e
                })?;
            result
                .installed_tools
                .push((spec.name.clone(), installed_version(&spec, installed.version)));
        }
        Ok(())
    }

    async fn run_task(&self, plan: &PlannedTask) -> TaskOutcome {
        info!(
            "Executing command: {}, in directory: {}",
            plan.command.command_line(),
            self.config.project
        );
        match self.runner.run_checked(&plan.command).await {
            Ok(_) => TaskOutcome::Passed,
            Err(e) => TaskOutcome::Failed {
                message: e.to_string(),
            },
        }
    }
}

/// Concrete version when known, else the requested one
fn installed_version(spec: &ToolSpec, resolved: Option<String>) -> String {
    resolved.unwrap_or_else(|| spec.version.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HostPlatform;
    use std::path::PathBuf;

    fn host(sccache: Option<&str>, wrapper: Option<&str>) -> HostEnv {
        HostEnv {
            cargo_home: PathBuf::from("/c"),
            rustup_home: PathBuf::from("/r"),
            path: None,
            branch: "main".to_string(),
            cargo_target_dir: None,
            sccache_path: sccache.map(str::to_string),
            rustc_wrapper: wrapper.map(str::to_string),
            platform: HostPlatform::new("linux", "x86_64"),
        }
    }

    #[test]
    fn test_time_since_start() {
        assert_eq!(time_since_start(Duration::from_millis(0)), "0ms");
        assert_eq!(time_since_start(Duration::from_millis(999)), "999ms");
        assert_eq!(time_since_start(Duration::from_millis(1_000)), "1s");
        assert_eq!(time_since_start(Duration::from_millis(59_400)), "59s");
        assert_eq!(time_since_start(Duration::from_millis(60_000)), "1m:00s");
        assert_eq!(time_since_start(Duration::from_millis(3_725_000)), "62m:05s");
    }

    #[test]
    fn test_channel_precedence() {
        let mut config = RunConfig::default();
        config.flow.doc.toolchain = Some("nightly".to_string());
        assert_eq!(default_channel(&config, None), "stable");
        assert_eq!(task_channel(&config, Task::Test, None), "stable");
        assert_eq!(task_channel(&config, Task::Doc, None), "nightly");

        config.toolchain = Some("1.79.0".to_string());
        assert_eq!(task_channel(&config, Task::Test, None), "1.79.0");

        let pin = PinnedToolchain {
            path: PathBuf::from("rust-toolchain.toml"),
            channel: "beta".to_string(),
            components: Vec::new(),
        };
        assert_eq!(default_channel(&config, Some(&pin)), "beta");
        assert_eq!(task_channel(&config, Task::Doc, Some(&pin)), "beta");
    }

    #[test]
    fn test_planned_channels() {
        let mut config = RunConfig::default();
        let tasks = [(Task::Fmt, "nightly"), (Task::Test, "stable"), (Task::Doc, "nightly")];
        assert_eq!(
            planned_channels(&config, &tasks, "stable"),
            vec!["stable", "nightly"]
        );

        let only_nightly = [(Task::Fmt, "nightly")];
        assert_eq!(planned_channels(&config, &only_nightly, "stable"), vec!["nightly"]);
        assert_eq!(planned_channels(&config, &[], "stable"), vec!["stable"]);

        config.toolchain = Some("beta".to_string());
        assert_eq!(
            planned_channels(&config, &only_nightly, "beta"),
            vec!["beta", "nightly"]
        );
    }

    #[test]
    fn test_sccache_warnings() {
        assert_eq!(sccache_warnings(&host(None, None)).len(), 1);
        assert!(sccache_warnings(&host(None, None))[0].contains("SCCACHE_PATH"));
        assert!(sccache_warnings(&host(Some("/bin/sccache"), None))[0].contains("RUSTC_WRAPPER"));
        assert!(sccache_warnings(&host(Some("/bin/sccache"), Some("sccache"))).is_empty());
    }

    #[test]
    fn test_run_result_serialization() {
        let mut result = RunResult {
            installed_toolchains: vec!["stable".to_string()],
            installed_tools: vec![("cargo-shear".to_string(), "1.1.0".to_string())],
            ..RunResult::default()
        };
        result.task_results.insert("fmt".to_string(), TaskOutcome::Passed);
        result.task_results.insert(
            "test".to_string(),
            TaskOutcome::Failed {
                message: "boom".to_string(),
            },
        );

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["installedTools"][0][0], "cargo-shear");
        assert_eq!(json["taskResults"]["fmt"]["status"], "passed");
        assert_eq!(json["taskResults"]["test"]["message"], "boom");
        assert_eq!(result.failed_tasks(), vec!["test"]);
    }
}
