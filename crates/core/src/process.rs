//! Subprocess execution
//!
//! Every external program rax drives (`rustup`, `rustc`, `cargo` and the cargo
//! subcommands it installs) goes through the [`CommandRunner`] trait. The
//! production runner uses `tokio::process`; tests use [`mock::MockCommandRunner`]
//! to script outputs and inspect what would have been executed.

use crate::errors::ProcessError;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::{debug, instrument};

/// A program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    /// Capture stdout/stderr instead of streaming them to the terminal
    pub capture: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            capture: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn captured(mut self) -> Self {
        self.capture = true;
        self
    }

    /// Shell-like rendering used in logs, error messages and mock lookups
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    /// Captured stdout; empty when output was streamed
    pub stdout: String,
    /// Captured stderr; empty when output was streamed
    pub stderr: String,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            code: Some(0),
            ..Self::default()
        }
    }

    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes programs and locates them on PATH
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion. A non-zero exit is not an error here;
    /// only failing to start the program is.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError>;

    /// Locate an executable on the search path
    fn which(&self, program: &str) -> Option<PathBuf>;

    /// Run a command and turn a non-zero exit into [`ProcessError::ExitStatus`]
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let output = self.run(spec).await?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(ProcessError::ExitStatus {
                command: spec.command_line(),
                code: output.code,
                stderr: output.stderr,
            })
        }
    }
}

/// [`CommandRunner`] backed by real subprocesses
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner {
    /// Search path; the process environment's PATH when `None`
    path: Option<OsString>,
}

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit search path for lookups and child processes
    pub fn with_path(path: impl Into<OsString>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    fn search_path(&self) -> Option<OsString> {
        self.path.clone().or_else(|| std::env::var_os("PATH"))
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    #[instrument(level = "debug", skip(self, spec), fields(command = %spec.command_line()))]
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let program = self
            .which(&spec.program)
            .unwrap_or_else(|| PathBuf::from(&spec.program));

        let mut command = tokio::process::Command::new(&program);
        command.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        if let Some(path) = &self.path {
            command.env("PATH", path);
        }
        for (key, value) in &spec.envs {
            command.env(key, value);
        }

        let spawn_error = |source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        };

        if spec.capture {
            command.stdin(Stdio::null());
            let output = command.output().await.map_err(spawn_error)?;
            let result = CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            debug!("Exited with {:?}", result.code);
            Ok(result)
        } else {
            let status = command.status().await.map_err(spawn_error)?;
            debug!("Exited with {:?}", status.code());
            Ok(CommandOutput {
                code: status.code(),
                ..CommandOutput::default()
            })
        }
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        let cwd = std::env::current_dir().ok()?;
        which::which_in(program, self.search_path(), cwd).ok()
    }
}

pub mod mock {
    //! Scripted command runner for tests
    //!
    //! Outputs are keyed by the rendered command line. Commands without a
    //! scripted output succeed with empty output. Every invocation is
    //! recorded so tests can assert on the exact sequence of commands.

    use super::{CommandOutput, CommandRunner, CommandSpec};
    use crate::errors::ProcessError;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct MockState {
        on_path: HashSet<String>,
        exact: HashMap<String, CommandOutput>,
        prefixed: Vec<(String, CommandOutput)>,
        unspawnable: HashSet<String>,
        calls: Vec<CommandSpec>,
    }

    /// Mock command runner
    #[derive(Debug, Clone, Default)]
    pub struct MockCommandRunner {
        state: Arc<Mutex<MockState>>,
    }

    impl MockCommandRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Mock runner where `rustup` and `cargo` are already available
        pub fn with_base_programs() -> Self {
            let runner = Self::new();
            runner.add_to_path("rustup");
            runner.add_to_path("cargo");
            runner
        }

        /// Make `which(program)` succeed
        pub fn add_to_path(&self, program: &str) {
            self.state
                .lock()
                .unwrap()
                .on_path
                .insert(program.to_string());
        }

        /// Script the output for an exact command line
        pub fn respond(&self, command_line: &str, output: CommandOutput) {
            self.state
                .lock()
                .unwrap()
                .exact
                .insert(command_line.to_string(), output);
        }

        /// Script the output for every command line starting with `prefix`
        pub fn respond_prefix(&self, prefix: &str, output: CommandOutput) {
            self.state
                .lock()
                .unwrap()
                .prefixed
                .push((prefix.to_string(), output));
        }

        /// Make spawning `program` fail as if it did not exist
        pub fn fail_spawn(&self, program: &str) {
            self.state
                .lock()
                .unwrap()
                .unspawnable
                .insert(program.to_string());
        }

        /// All invocations so far
        pub fn calls(&self) -> Vec<CommandSpec> {
            self.state.lock().unwrap().calls.clone()
        }

        /// Rendered command lines of all invocations so far
        pub fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(CommandSpec::command_line).collect()
        }

        /// Whether any invocation starts with `prefix`
        pub fn ran(&self, prefix: &str) -> bool {
            self.command_lines().iter().any(|c| c.starts_with(prefix))
        }
    }

    #[async_trait]
    impl CommandRunner for MockCommandRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(spec.clone());

            if state.unspawnable.contains(&spec.program) {
                return Err(ProcessError::Spawn {
                    program: spec.program.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                });
            }

            let line = spec.command_line();
            if let Some(output) = state.exact.get(&line) {
                return Ok(output.clone());
            }
            let prefixed = state
                .prefixed
                .iter()
                .rev()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, output)| output.clone());
            Ok(prefixed.unwrap_or_else(CommandOutput::success))
        }

        fn which(&self, program: &str) -> Option<PathBuf> {
            let state = self.state.lock().unwrap();
            state
                .on_path
                .contains(program)
                .then(|| PathBuf::from("/mock/bin").join(program))
        }
    }
}
