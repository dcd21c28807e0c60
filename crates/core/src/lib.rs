//! Core library for the rax CI runner
//!
//! This crate contains the provisioning and caching logic: configuration
//! loading, toolchain and cargo tool provisioning, cache backends and key
//! derivation, build output caching, verification tasks, run orchestration,
//! logging, and error handling. Process execution, cache storage and registry
//! lookups sit behind traits so the policy can be tested with mocks.

pub mod build_cache;
pub mod cache;
pub mod config;
pub mod errors;
pub mod logging;
pub mod platform;
pub mod process;
pub mod registry;
pub mod retry;
pub mod run;
pub mod tasks;
pub mod tool;
pub mod toolchain;

// Re-export IndexMap for use by dependent crates (preserves insertion order for ordered maps)
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
