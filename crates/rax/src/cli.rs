use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use rax_core::config::{HostEnv, RunConfig, DEFAULT_CONFIG_FILE};
use std::path::PathBuf;

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Provision toolchains and tools, then run the verification tasks
    Run {
        /// Tasks to run, comma separated (replaces the configured `run` list)
        #[arg(long, value_delimiter = ',', value_name = "TASKS")]
        tasks: Vec<String>,
    },
    /// Provision toolchains and tools without running any task
    Install,
    /// Print the cache keys the current configuration resolves to
    Keys,
}

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version,
    about = "Rust CI runner with cached toolchains, tools and build output",
    long_about = "Rust CI runner with cached toolchains, tools and build output\n\nProvisions the Rust toolchains and cargo tools a project needs, restores and saves them through a cache, and runs the project's verification tasks.",
    color = clap::ColorChoice::Auto
)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via RAX_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Configuration file path (defaults to rax.toml in the working directory, if present)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Output format for the summary printed to stdout
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,

    /// Project directory (overrides `project`)
    #[arg(long, global = true, value_name = "PATH")]
    pub project: Option<String>,

    /// Global toolchain channel (overrides `toolchain`)
    #[arg(long, global = true, value_name = "CHANNEL")]
    pub toolchain: Option<String>,

    /// Cache key prefix, `no-cache` disables caching (overrides `cacheKey`)
    #[arg(long, global = true, value_name = "PREFIX")]
    pub cache_key: Option<String>,

    /// Local cache directory (overrides `cacheDir`)
    #[arg(long, global = true, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Compile tools with `cargo install` instead of fetching prebuilt binaries
    #[arg(long, global = true)]
    pub no_fast_install: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        // Initialize logging based on global options
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None, // Let logging module check environment variable
        };

        let log_level = match self.log_level {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };

        // Set environment variable for log level before initializing logging
        if std::env::var_os("RAX_LOG").is_none() && std::env::var_os("RUST_LOG").is_none() {
            std::env::set_var("RUST_LOG", format!("rax={},rax_core={}", log_level, log_level));
        }
        rax_core::logging::init(log_format)?;

        tracing::debug!("CLI initialized with log level: {}", log_level);

        let Some(command) = self.command.clone() else {
            // No subcommand provided - show help-like message
            println!("Rust CI runner");
            println!("Run 'rax --help' to see available commands.");
            return Ok(());
        };

        let mut config = self.load_config()?;
        match command {
            Commands::Run { tasks } => {
                if !tasks.is_empty() {
                    config.run = tasks;
                }
                crate::commands::run::execute(config, self.output).await
            }
            Commands::Install => {
                config.install_only = true;
                crate::commands::run::execute(config, self.output).await
            }
            Commands::Keys => {
                crate::commands::keys::execute(&config, &HostEnv::capture(), self.output)
            }
        }
    }

    /// File, then environment, then flags
    fn load_config(&self) -> Result<RunConfig> {
        let file = match &self.config {
            Some(path) => Some(path.clone()),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.is_file().then_some(default)
            }
        };

        let mut config = RunConfig::load(file.as_deref(), std::env::vars())?;
        self.apply_overrides(&mut config);
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut RunConfig) {
        if let Some(project) = &self.project {
            config.project = project.clone();
        }
        if let Some(toolchain) = &self.toolchain {
            config.toolchain = Some(toolchain.clone());
        }
        if let Some(cache_key) = &self.cache_key {
            config.cache_key = cache_key.clone();
        }
        if let Some(cache_dir) = &self.cache_dir {
            config.cache_dir = Some(cache_dir.clone());
        }
        if self.no_fast_install {
            config.fast_install = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_global_flags_default_values() {
        let cli = Cli::parse_from(["rax"]);
        assert_eq!(cli.output, OutputFormat::Text);
        assert!(cli.config.is_none());
        assert!(!cli.no_fast_install);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_run_tasks_are_comma_separated() {
        let cli = Cli::parse_from(["rax", "run", "--tasks", "fmt,clippy"]);
        match cli.command {
            Some(Commands::Run { tasks }) => assert_eq!(tasks, vec!["fmt", "clippy"]),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "rax",
            "install",
            "--output",
            "json",
            "--cache-key",
            "no-cache",
        ]);
        assert!(matches!(cli.command, Some(Commands::Install)));
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.cache_key.as_deref(), Some("no-cache"));
    }

    #[test]
    fn test_overrides_win_over_configuration() {
        let cli = Cli::parse_from([
            "rax",
            "--project",
            "crates/app",
            "--toolchain",
            "nightly",
            "--cache-dir",
            "/tmp/rax",
            "--no-fast-install",
            "keys",
        ]);
        let mut config = RunConfig {
            toolchain: Some("stable".to_string()),
            ..RunConfig::default()
        };
        cli.apply_overrides(&mut config);

        assert_eq!(config.project, "crates/app");
        assert_eq!(config.toolchain.as_deref(), Some("nightly"));
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/rax"));
        assert!(!config.fast_install);
        assert_eq!(config.cache_key, "rax-cache");
    }

    #[test]
    fn test_unknown_output_format_is_rejected() {
        assert!(Cli::try_parse_from(["rax", "--output", "yaml", "run"]).is_err());
    }
}
