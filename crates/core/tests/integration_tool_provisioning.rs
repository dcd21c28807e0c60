//! Integration tests for cargo tool provisioning
//!
//! These run the provisioner against the mock command runner, cache and
//! registry, checking which installer commands run and which cache keys are
//! touched.

mod common;

use rax_core::cache::{CacheCall, MockCacheBackend};
use rax_core::errors::{RaxError, ToolError};
use rax_core::process::mock::MockCommandRunner;
use rax_core::process::CommandOutput;
use rax_core::registry::MockVersionResolver;
use rax_core::tool::{ToolProvisioner, ToolSource, ToolSpec};
use tempfile::TempDir;

#[tokio::test]
async fn test_tool_on_path_is_trusted() {
    let home = TempDir::new().unwrap();
    let host = common::host_env(home.path(), "main");
    let runner = MockCommandRunner::with_base_programs();
    runner.add_to_path("cargo-deny");
    let cache = MockCacheBackend::new();
    let resolver = MockVersionResolver::new();

    let provisioner = ToolProvisioner::new(&runner, &cache, &resolver, &host);
    let installed = provisioner
        .ensure_tool(&ToolSpec::exact("cargo-deny", "0.16.1"), Some("myprefix"), true)
        .await
        .unwrap();

    assert_eq!(installed.source, ToolSource::AlreadyPresent);
    assert_eq!(installed.version, None);
    assert!(runner.calls().is_empty());
    assert!(cache.calls().is_empty());
    assert!(resolver.lookups().is_empty());
}

#[tokio::test]
async fn test_exact_version_installed_and_cached() {
    let home = TempDir::new().unwrap();
    let host = common::host_env(home.path(), "main");
    let runner = MockCommandRunner::with_base_programs();
    let cache = MockCacheBackend::new();
    let resolver = MockVersionResolver::new();

    let provisioner = ToolProvisioner::new(&runner, &cache, &resolver, &host);
    let installed = provisioner
        .ensure_tool(&ToolSpec::exact("cargo-audit", "0.17.4"), Some("myprefix"), false)
        .await
        .unwrap();

    assert_eq!(installed.source, ToolSource::Installed);
    assert_eq!(installed.version.as_deref(), Some("0.17.4"));
    assert_eq!(installed.path, host.cargo_home.join("bin").join("cargo-audit"));
    assert_eq!(
        runner.command_lines(),
        vec!["cargo install --version 0.17.4 cargo-audit"]
    );
    assert_eq!(
        cache.saved_keys(),
        vec!["myprefix-cargo-audit-linux-x86_64-0.17.4"]
    );
    assert_eq!(cache.restore_count(), 1);
    assert!(resolver.lookups().is_empty());
}

#[tokio::test]
async fn test_cache_hit_skips_installer() {
    let home = TempDir::new().unwrap();
    let host = common::host_env(home.path(), "main");
    let runner = MockCommandRunner::with_base_programs();
    let cache = MockCacheBackend::new().with_entry("rax-cache-cargo-shear-linux-x86_64-1.1.0");
    let resolver = MockVersionResolver::new().with_version("cargo-shear", "1.1.0");

    let provisioner = ToolProvisioner::new(&runner, &cache, &resolver, &host);
    let installed = provisioner
        .ensure_tool(&ToolSpec::latest("cargo-shear"), Some("rax-cache"), true)
        .await
        .unwrap();

    assert_eq!(installed.source, ToolSource::Cache);
    assert_eq!(installed.version.as_deref(), Some("1.1.0"));
    assert!(runner.calls().is_empty());
    assert!(cache.saved_keys().is_empty());
    assert_eq!(resolver.lookups(), vec!["cargo-shear"]);
}

#[tokio::test]
async fn test_fast_install_bootstraps_binstall() {
    let home = TempDir::new().unwrap();
    let host = common::host_env(home.path(), "main");
    let runner = MockCommandRunner::with_base_programs();
    let cache = MockCacheBackend::new();
    let resolver = MockVersionResolver::new()
        .with_version("cargo-deny", "0.16.1")
        .with_version("cargo-binstall", "1.10.0");

    let provisioner = ToolProvisioner::new(&runner, &cache, &resolver, &host);
    let installed = provisioner
        .ensure_tool(&ToolSpec::latest("cargo-deny"), Some("p"), true)
        .await
        .unwrap();

    assert_eq!(installed.version.as_deref(), Some("0.16.1"));
    assert_eq!(
        runner.command_lines(),
        vec![
            "cargo install cargo-binstall",
            "cargo binstall --no-confirm cargo-deny",
        ]
    );
    assert_eq!(
        cache.saved_keys(),
        vec![
            "p-cargo-binstall-linux-x86_64-1.10.0",
            "p-cargo-deny-linux-x86_64-0.16.1",
        ]
    );
}

#[tokio::test]
async fn test_binstall_on_path_is_reused() {
    let home = TempDir::new().unwrap();
    let host = common::host_env(home.path(), "main");
    let runner = MockCommandRunner::with_base_programs();
    runner.add_to_path("cargo-binstall");
    let cache = MockCacheBackend::new();
    let resolver = MockVersionResolver::new();

    let provisioner = ToolProvisioner::new(&runner, &cache, &resolver, &host);
    provisioner
        .ensure_tool(&ToolSpec::exact("cargo-nextest", "0.9.72"), Some("p"), true)
        .await
        .unwrap();

    assert_eq!(
        runner.command_lines(),
        vec!["cargo binstall --no-confirm --version 0.9.72 cargo-nextest"]
    );
}

#[tokio::test]
async fn test_caching_disabled() {
    let home = TempDir::new().unwrap();
    let host = common::host_env(home.path(), "main");
    let runner = MockCommandRunner::with_base_programs();
    let cache = MockCacheBackend::new();
    let resolver = MockVersionResolver::new();
    let provisioner = ToolProvisioner::new(&runner, &cache, &resolver, &host);

    for prefix in [None, Some("no-cache")] {
        provisioner
            .ensure_tool(&ToolSpec::exact("cargo-audit", "0.17.4"), prefix, false)
            .await
            .unwrap();
    }

    assert!(cache.calls().is_empty());
    assert_eq!(runner.calls().len(), 2);
}

#[tokio::test]
async fn test_installer_failure_is_reported() {
    let home = TempDir::new().unwrap();
    let host = common::host_env(home.path(), "main");
    let runner = MockCommandRunner::with_base_programs();
    runner.respond_prefix(
        "cargo install",
        CommandOutput::failure(101, "error: could not compile `cargo-audit`"),
    );
    let cache = MockCacheBackend::new();
    let resolver = MockVersionResolver::new();

    let provisioner = ToolProvisioner::new(&runner, &cache, &resolver, &host);
    let err = provisioner
        .ensure_tool(&ToolSpec::exact("cargo-audit", "0.17.4"), Some("p"), false)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RaxError::Tool(ToolError::InstallationFailed { .. })
    ));
    assert!(err.to_string().contains("cargo-audit@0.17.4"));
    assert!(cache.saved_keys().is_empty());
}

#[tokio::test]
async fn test_unresolvable_latest_version() {
    let home = TempDir::new().unwrap();
    let host = common::host_env(home.path(), "main");
    let runner = MockCommandRunner::with_base_programs();
    let cache = MockCacheBackend::new();
    let resolver = MockVersionResolver::new();

    let provisioner = ToolProvisioner::new(&runner, &cache, &resolver, &host);
    let err = provisioner
        .ensure_tool(&ToolSpec::latest("cargo-missing"), Some("p"), false)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RaxError::Tool(ToolError::VersionResolution { .. })
    ));
    assert!(runner.calls().is_empty());
    assert!(cache.calls().is_empty());
}

#[tokio::test]
async fn test_cache_failures_are_not_fatal() {
    let home = TempDir::new().unwrap();
    let host = common::host_env(home.path(), "main");
    let runner = MockCommandRunner::with_base_programs();
    let cache = MockCacheBackend::new();
    cache.fail_restores();
    cache.fail_saves();
    let resolver = MockVersionResolver::new();

    let provisioner = ToolProvisioner::new(&runner, &cache, &resolver, &host);
    let installed = provisioner
        .ensure_tool(&ToolSpec::exact("cargo-audit", "0.17.4"), Some("p"), false)
        .await
        .unwrap();

    assert_eq!(installed.source, ToolSource::Installed);
    assert!(cache
        .calls()
        .iter()
        .any(|call| matches!(call, CacheCall::Save { .. })));
}
