//! Shared test helpers for core integration tests.
#![allow(dead_code)]

use rax_core::config::HostEnv;
use rax_core::platform::HostPlatform;
use rax_core::process::mock::MockCommandRunner;
use rax_core::process::CommandOutput;
use std::path::Path;

pub const HOST_TRIPLE: &str = "x86_64-unknown-linux-gnu";

/// Host environment rooted in a scratch home directory
pub fn host_env(home: &Path, branch: &str) -> HostEnv {
    HostEnv {
        cargo_home: home.join(".cargo"),
        rustup_home: home.join(".rustup"),
        path: None,
        branch: branch.to_string(),
        cargo_target_dir: None,
        sccache_path: None,
        rustc_wrapper: None,
        platform: HostPlatform::new("linux", "x86_64"),
    }
}

/// Runner with rustup and cargo on PATH that reports `installed` toolchains
pub fn runner_with_toolchains(installed: &[&str]) -> MockCommandRunner {
    let runner = MockCommandRunner::with_base_programs();
    runner.respond(
        "rustc -vV",
        CommandOutput::with_stdout(format!(
            "rustc 1.79.0 (129f3b996 2024-06-10)\nbinary: rustc\nhost: {}\nrelease: 1.79.0\n",
            HOST_TRIPLE
        )),
    );
    runner.respond(
        "rustup toolchain list",
        CommandOutput::with_stdout(
            installed
                .iter()
                .map(|t| format!("{}-{}\n", t, HOST_TRIPLE))
                .collect::<String>(),
        ),
    );
    runner
}

/// Report `components` as installed for `channel`
pub fn installed_components(runner: &MockCommandRunner, channel: &str, components: &[&str]) {
    runner.respond(
        &format!("rustup +{} component list --installed", channel),
        CommandOutput::with_stdout(
            components
                .iter()
                .map(|c| format!("{}-{}\n", c, HOST_TRIPLE))
                .collect::<String>(),
        ),
    );
}
