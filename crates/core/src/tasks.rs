//! Verification tasks
//!
//! Each task is one `cargo` subcommand run against the project. The table of
//! default arguments, required tools and components lives here so that the
//! orchestrator can provision everything before the first task starts.

use crate::config::{FlowConfig, TaskConfig};
use crate::errors::{ConfigError, Result};
use crate::process::CommandSpec;
use crate::tool::ToolSpec;
use serde::Serialize;
use std::fmt;
use std::path::Path;
use tracing::warn;

/// Selection alias for [`DEFAULT_TASKS`]
pub const ALL_DEFAULT: &str = "all-default";

/// Tasks selected by `all-default`
pub const DEFAULT_TASKS: [Task; 5] = [Task::Fmt, Task::Clippy, Task::Shear, Task::Test, Task::Doc];

const BUILD_ARGS: &[&str] = &["--all", "--locked", "--all-targets", "--all-features"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Fmt,
    Clippy,
    Shear,
    Test,
    Doc,
    Deny,
}

impl Task {
    /// Every task, in execution order
    pub const ALL: [Task; 6] = [
        Task::Fmt,
        Task::Clippy,
        Task::Shear,
        Task::Test,
        Task::Doc,
        Task::Deny,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Task::Fmt => "fmt",
            Task::Clippy => "clippy",
            Task::Shear => "shear",
            Task::Test => "test",
            Task::Doc => "doc",
            Task::Deny => "deny",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|task| task.name() == name)
    }

    /// Cargo tools the task runs through
    pub fn required_tools(self) -> Vec<ToolSpec> {
        match self {
            Task::Shear => vec![ToolSpec::latest("cargo-shear")],
            Task::Deny => vec![ToolSpec::latest("cargo-deny")],
            _ => Vec::new(),
        }
    }

    /// Toolchain components the task needs
    pub fn required_components(self) -> &'static [&'static str] {
        match self {
            Task::Clippy => &["clippy"],
            Task::Fmt => &["rustfmt"],
            _ => &[],
        }
    }

    /// Whether `--profile` may be passed
    pub fn allows_profile(self) -> bool {
        matches!(self, Task::Test | Task::Clippy | Task::Doc)
    }

    pub fn default_args(self, flow: &FlowConfig) -> Vec<String> {
        let mut args: Vec<&str> = match self {
            Task::Test | Task::Clippy => BUILD_ARGS.to_vec(),
            Task::Fmt => vec!["--all", "--", "--check"],
            Task::Doc => vec!["--all", "--locked", "--no-deps"],
            Task::Shear => Vec::new(),
            Task::Deny => vec!["check"],
        };
        if self == Task::Test && !flow.test.fail_fast {
            args.push("--no-fail-fast");
        }
        if self == Task::Clippy && flow.clippy.deny_warnings {
            args.extend(["--", "-D", "warnings"]);
        }
        args.into_iter().map(str::to_string).collect()
    }

    /// Per-task settings
    pub fn settings(self, flow: &FlowConfig) -> &TaskConfig {
        match self {
            Task::Test => &flow.test.common,
            Task::Clippy => &flow.clippy.common,
            Task::Fmt => &flow.fmt,
            Task::Doc => &flow.doc,
            Task::Shear => &flow.shear,
            Task::Deny => &flow.deny,
        }
    }

    /// `cargo +{channel} <subcommand> [--profile P] <args>`
    pub fn command(
        self,
        channel: &str,
        flow: &FlowConfig,
        project_dir: &Path,
    ) -> Result<CommandSpec> {
        let settings = self.settings(flow);
        let mut command = CommandSpec::new("cargo")
            .arg(format!("+{}", channel))
            .arg(self.name())
            .cwd(project_dir);

        if let Some(profile) = settings.profile.as_deref().filter(|p| !p.is_empty()) {
            if self.allows_profile() {
                command = command.args(["--profile", profile]);
            } else {
                warn!("Task {} does not take a profile, ignoring '{}'", self, profile);
            }
        }

        let args = match settings.override_args.as_deref() {
            Some(raw) => shell_words::split(raw).map_err(|e| ConfigError::Validation {
                message: format!("Invalid override args for {}: {}", self, e),
            })?,
            None => self.default_args(flow),
        };
        Ok(command.args(args))
    }

    /// Expand a `run` selection into tasks in execution order
    ///
    /// ```
    /// use rax_core::tasks::Task;
    ///
    /// let tasks = Task::select(&["deny".to_string(), "all-default".to_string()]).unwrap();
    /// let names: Vec<_> = tasks.iter().map(|t| t.name()).collect();
    /// assert_eq!(names, ["fmt", "clippy", "shear", "test", "doc", "deny"]);
    /// ```
    pub fn select(run: &[String]) -> Result<Vec<Task>> {
        let mut selected = Vec::new();
        for name in run.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
            if name == ALL_DEFAULT {
                selected.extend(DEFAULT_TASKS);
                continue;
            }
            let task = Task::from_name(name).ok_or_else(|| ConfigError::Validation {
                message: format!(
                    "Unknown task '{}', expected one of {}, {}",
                    name,
                    Task::ALL.map(Task::name).join(", "),
                    ALL_DEFAULT
                ),
            })?;
            selected.push(task);
        }
        selected.sort();
        selected.dedup();
        Ok(selected)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
