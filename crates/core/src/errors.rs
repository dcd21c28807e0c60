//! Error types and handling
//!
//! The error taxonomy is structured with specific error enums for each domain
//! (configuration, subprocesses, tools, toolchains, cache) that are then wrapped
//! in the main [`RaxError`] enum for unified error handling.
//!
//! Cache errors never abort a run: callers in the provisioning and build-cache
//! layers downgrade them to warnings. They still have a proper type so that the
//! backends themselves can be tested.

use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration: {message}")]
    Parsing { message: String },

    /// Configuration validation error
    #[error("Configuration validation error: {message}")]
    Validation { message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    NotFound { path: String },
}

/// Subprocess execution errors
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The program could not be started at all
    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The program ran and exited unsuccessfully
    #[error("`{command}` exited with {}{}", exit_code_label(*code), stderr_suffix(stderr))]
    ExitStatus {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

fn exit_code_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

/// Cargo tool provisioning errors
#[derive(Error, Debug)]
pub enum ToolError {
    /// A `tool@version` specification could not be parsed
    #[error("Invalid tool specification '{spec}': {reason}")]
    InvalidSpec { spec: String, reason: String },

    /// The latest version of a crate could not be looked up
    #[error("Unable to resolve latest version of {name}: {message}")]
    VersionResolution { name: String, message: String },

    /// The installer exited unsuccessfully
    #[error("Installation of {name}@{version} failed: {source}")]
    InstallationFailed {
        name: String,
        version: String,
        #[source]
        source: ProcessError,
    },
}

/// Toolchain provisioning errors
#[derive(Error, Debug)]
pub enum ToolchainError {
    /// A required base program (rustup, cargo, rustc) is not on PATH
    #[error("Required program `{program}` was not found on PATH")]
    ManagerMissing { program: String },

    /// Host triple could not be determined
    #[error("Cannot determine host triple: {message}")]
    HostTriple { message: String },

    /// Toolchain installation failed
    #[error("Failed to install toolchain {toolchain}: {source}")]
    Install {
        toolchain: String,
        #[source]
        source: ProcessError,
    },

    /// Component listing or installation failed
    #[error("Failed to add component {component} to toolchain {toolchain}: {source}")]
    Component {
        component: String,
        toolchain: String,
        #[source]
        source: ProcessError,
    },

    /// A toolchain manager query failed
    #[error("Toolchain manager query failed: {0}")]
    Query(#[source] ProcessError),

    /// Toolchain pin file could not be parsed
    #[error("Failed to parse toolchain file {path}: {message}")]
    PinFile { path: String, message: String },
}

/// Cache backend errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Filesystem error while reading or writing cache entries
    #[error("Cache I/O error")]
    Io(#[from] std::io::Error),

    /// Archive could not be created or extracted
    #[error("Cache archive error: {message}")]
    Archive { message: String },

    /// An entry already exists under the key; entries are write-once
    #[error("Cache entry already exists: {key}")]
    AlreadyExists { key: String },

    /// None of the given paths exist, nothing to store
    #[error("No cache paths exist for key {key}")]
    NothingToSave { key: String },

    /// Backend-specific failure
    #[error("Cache backend error: {message}")]
    Backend { message: String },
}

/// Internal/generic fallback errors
#[derive(Error, Debug)]
pub enum InternalError {
    /// Generic internal error
    #[error("Internal error: {message}")]
    Generic { message: String },

    /// Unexpected error condition
    #[error("Unexpected error: {message}")]
    Unexpected { message: String },
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum RaxError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Subprocess errors
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Tool provisioning errors
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    /// Toolchain provisioning errors
    #[error("Toolchain error: {0}")]
    Toolchain(#[from] ToolchainError),

    /// Cache errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Network-related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Internal/generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] InternalError),
}

impl RaxError {
    /// Whether this error stems from user configuration rather than the environment
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            RaxError::Config(_) | RaxError::Tool(ToolError::InvalidSpec { .. })
        )
    }
}

/// Convenience type alias for Results with RaxError
pub type Result<T> = std::result::Result<T, RaxError>;
