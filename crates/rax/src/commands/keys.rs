//! `rax keys`: preview the cache keys a run would use
//!
//! Only keys that can be derived without running anything are printed. Tool
//! keys need a concrete version, so `latest` tools are listed without one, and
//! toolchain keys are listed per channel because the host triple comes from
//! `rustc`.

use crate::cli::OutputFormat;
use anyhow::Result;
use rax_core::build_cache::{BuildCache, BuildCacheSettings};
use rax_core::cache::{self, keys::tool_key, LocalCacheBackend};
use rax_core::config::{HostEnv, RunConfig};
use rax_core::errors::RaxError;
use rax_core::run::{default_channel, planned_channels, task_channel};
use rax_core::tasks::Task;
use rax_core::tool::{ToolSpec, VersionRequest};
use rax_core::toolchain::read_pinned_toolchain;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheKeys {
    pub caching_enabled: bool,
    pub toolchains: Vec<String>,
    pub tools: Vec<ToolKey>,
    pub build: Option<BuildKeys>,
}

#[derive(Debug, Serialize)]
pub struct ToolKey {
    pub tool: String,
    /// `None` until the version is resolved at run time
    pub key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BuildKeys {
    pub primary: String,
    pub fallback: String,
}

pub fn execute(config: &RunConfig, host: &HostEnv, output: OutputFormat) -> Result<()> {
    let keys = derive_keys(config, host)?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&keys)?),
        OutputFormat::Text => {
            println!("Caching: {}", if keys.caching_enabled { "enabled" } else { "disabled" });
            println!("Toolchains: {}", keys.toolchains.join(", "));
            for tool in &keys.tools {
                match &tool.key {
                    Some(key) => println!("Tool {}: {}", tool.tool, key),
                    None => println!("Tool {}: resolved at run time", tool.tool),
                }
            }
            if let Some(build) = &keys.build {
                println!("Build: {}", build.primary);
                println!("Build fallback: {}", build.fallback);
            }
        }
    }
    Ok(())
}

pub fn derive_keys(config: &RunConfig, host: &HostEnv) -> Result<CacheKeys> {
    let project_dir = config.project_dir();
    let tasks = Task::select(&config.run)?;
    let pinned = read_pinned_toolchain(&project_dir)?;
    let default = default_channel(config, pinned.as_ref());

    let task_channels: Vec<(Task, String)> = tasks
        .iter()
        .map(|task| (*task, task_channel(config, *task, pinned.as_ref())))
        .collect();
    let borrowed: Vec<(Task, &str)> = task_channels
        .iter()
        .map(|(task, channel)| (*task, channel.as_str()))
        .collect();
    let toolchains = planned_channels(config, &borrowed, &default);

    let prefix = cache::effective_prefix(Some(&config.cache_key));

    let mut specs: Vec<ToolSpec> = tasks.iter().flat_map(|task| task.required_tools()).collect();
    for raw in &config.install_additional {
        specs.push(ToolSpec::parse(raw).map_err(RaxError::from)?);
    }
    let tools = specs
        .into_iter()
        .map(|spec| {
            let key = match (&spec.version, prefix) {
                (VersionRequest::Exact(version), Some(prefix)) => {
                    Some(tool_key(prefix, &spec.name, version, &host.platform))
                }
                _ => None,
            };
            ToolKey {
                tool: spec.to_string(),
                key,
            }
        })
        .collect();

    let backend = LocalCacheBackend::new(config.cache_dir());
    let build = BuildCache::for_strategy(
        config.build_cache_strategy_kind(),
        prefix,
        |prefix| BuildCacheSettings {
            cache_prefix: prefix.to_string(),
            project_dir: project_dir.clone(),
            target_dir: host.target_dir(&project_dir),
            toolchains: toolchains.clone(),
            fallback_branch: config.build_cache_fallback_branch.clone(),
            current_branch: host.branch.clone(),
            platform: host.platform.clone(),
        },
        &backend,
    )
    .map(|cache| BuildKeys {
        primary: cache.primary_key().to_string(),
        fallback: cache.fallback_key().to_string(),
    });

    Ok(CacheKeys {
        caching_enabled: prefix.is_some(),
        toolchains,
        tools,
        build,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rax_core::platform::HostPlatform;

    fn host() -> HostEnv {
        HostEnv::from_vars(
            vec![("GITHUB_REF_NAME".to_string(), "main".to_string())],
            Some("/home/ci".into()),
            HostPlatform::new("linux", "x86_64"),
        )
    }

    #[test]
    fn test_keys_for_default_configuration() {
        let config = RunConfig {
            install_additional: vec!["cargo-audit@0.17.4".to_string()],
            ..RunConfig::default()
        };
        let keys = derive_keys(&config, &host()).unwrap();

        assert!(keys.caching_enabled);
        assert_eq!(keys.toolchains, vec!["stable"]);
        assert_eq!(keys.tools.len(), 2);
        assert_eq!(keys.tools[0].tool, "cargo-shear@latest");
        assert!(keys.tools[0].key.is_none());
        assert_eq!(
            keys.tools[1].key.as_deref(),
            Some("rax-cache-cargo-audit-linux-x86_64-0.17.4")
        );
        assert!(keys.build.is_none());
    }

    #[test]
    fn test_build_keys_when_enabled() {
        let config = RunConfig {
            build_cache_strategy: "github".to_string(),
            run: vec!["test".to_string()],
            ..RunConfig::default()
        };
        let keys = derive_keys(&config, &host()).unwrap();
        let build = keys.build.unwrap();
        assert!(build.primary.starts_with("rax-cache-build-linux-x86_64-"));
        assert_eq!(build.primary, build.fallback);
        assert!(build.primary.ends_with("-root-main"));
    }

    #[test]
    fn test_no_cache() {
        let config = RunConfig {
            cache_key: "no-cache".to_string(),
            build_cache_strategy: "github".to_string(),
            install_additional: vec!["cargo-audit@0.17.4".to_string()],
            ..RunConfig::default()
        };
        let keys = derive_keys(&config, &host()).unwrap();
        assert!(!keys.caching_enabled);
        assert!(keys.build.is_none());
        assert!(keys.tools.iter().all(|tool| tool.key.is_none()));
    }
}
