//! `rax run` and `rax install`

use crate::cli::OutputFormat;
use anyhow::Result;
use rax_core::cache::LocalCacheBackend;
use rax_core::config::{HostEnv, RunConfig};
use rax_core::process::SystemCommandRunner;
use rax_core::registry::CratesIoResolver;
use rax_core::run::{Orchestrator, RunResult, TaskOutcome};
use std::fmt::{self, Write as _};
use tracing::debug;

/// One or more verification tasks failed; maps to exit code 1
#[derive(Debug)]
pub struct TasksFailed {
    pub failed: Vec<String>,
}

impl fmt::Display for TasksFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed: {}", self.failed.len(), self.failed.join(", "))
    }
}

impl std::error::Error for TasksFailed {}

/// Run with the production adapters and print the summary
pub async fn execute(config: RunConfig, output: OutputFormat) -> Result<()> {
    let host = HostEnv::capture();
    let runner = match &host.path {
        Some(path) => SystemCommandRunner::with_path(path),
        None => SystemCommandRunner::new(),
    };
    let cache = LocalCacheBackend::new(config.cache_dir());
    let resolver = CratesIoResolver::new()?;
    debug!("Using local cache at {}", cache.root().display());

    let result = Orchestrator::new(&config, &host, &runner, &cache, &resolver)
        .run()
        .await?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print!("{}", render_text(&result)),
    }

    if result.succeeded {
        Ok(())
    } else {
        Err(TasksFailed {
            failed: result.failed_tasks().into_iter().map(str::to_string).collect(),
        }
        .into())
    }
}

fn render_text(result: &RunResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Toolchains: {}", list_or_none(&result.installed_toolchains));

    let tools: Vec<String> = result
        .installed_tools
        .iter()
        .map(|(name, version)| format!("{}@{}", name, version))
        .collect();
    let _ = writeln!(out, "Tools: {}", list_or_none(&tools));

    if !result.task_results.is_empty() {
        let _ = writeln!(out, "Tasks:");
        for (name, outcome) in &result.task_results {
            match outcome {
                TaskOutcome::Passed => {
                    let _ = writeln!(out, "  {:<8} passed", name);
                }
                TaskOutcome::Failed { message } => {
                    let _ = writeln!(out, "  {:<8} FAILED: {}", name, message);
                }
            }
        }
    }
    out
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}
