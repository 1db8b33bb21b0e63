//! External command execution.
//!
//! Every disk and monit tool the agent drives goes through [`CmdRunner`], so
//! tests can script tool output and assert on the exact argv that was run.
//! Tool exit codes are not always meaningful (parted, monit), which is why a
//! failed command still carries its captured stdout and stderr.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// A command to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Executable name or path.
    pub name: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Data written to the child's stdin, if any.
    pub stdin: Option<String>,
}

impl Command {
    /// Create a command with arguments.
    pub fn new<S: AsRef<str>>(name: &str, args: &[S]) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|a| a.as_ref().to_string()).collect(),
            stdin: None,
        }
    }

    /// Feed the given input to the command's stdin.
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// The argv as a single vector, name first.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.name.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Space-joined argv, used as the lookup key for scripted results.
    pub fn line(&self) -> String {
        self.argv().join(" ")
    }
}

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

/// Errors from command execution.
#[derive(Debug, Error)]
pub enum CmdError {
    #[error("Running command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Running command '{command}': exit status {}, stderr: {}", .output.exit_status, .output.stderr.trim())]
    Failed { command: String, output: CmdOutput },
}

impl CmdError {
    /// Output captured before the failure, if the command ran at all.
    pub fn output(&self) -> Option<&CmdOutput> {
        match self {
            Self::Spawn { .. } => None,
            Self::Failed { output, .. } => Some(output),
        }
    }
}

/// Command execution interface.
#[async_trait]
pub trait CmdRunner: Send + Sync {
    /// Run a command to completion.
    ///
    /// A non-zero exit status is reported as [`CmdError::Failed`] with the
    /// captured output attached.
    async fn run(&self, cmd: &Command) -> Result<CmdOutput, CmdError>;

    /// Whether an executable with this name can be found.
    fn exists(&self, name: &str) -> bool;

    /// Convenience wrapper for [`CmdRunner::run`].
    async fn run_command(&self, name: &str, args: &[&str]) -> Result<CmdOutput, CmdError> {
        self.run(&Command::new(name, args)).await
    }
}

/// Runs commands as child processes.
pub struct ExecCmdRunner {
    /// Environment overrides for every child.
    env: HashMap<String, String>,
}

impl ExecCmdRunner {
    /// Create a runner that inherits the agent's environment unchanged.
    pub fn new() -> Self {
        Self {
            env: HashMap::new(),
        }
    }

    /// Set an environment variable on every spawned child.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Point children at a private temp directory.
    pub fn with_tmp_dir(self, tmp_dir: &std::path::Path) -> Self {
        let tmp = tmp_dir.to_string_lossy().to_string();
        self.with_env("TMPDIR", &tmp)
    }
}

impl Default for ExecCmdRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CmdRunner for ExecCmdRunner {
    async fn run(&self, cmd: &Command) -> Result<CmdOutput, CmdError> {
        let line = cmd.line();
        debug!(command = %line, "Running command");

        let spawn_err = |source: std::io::Error| CmdError::Spawn {
            command: line.clone(),
            source,
        };

        let mut child = tokio::process::Command::new(&cmd.name)
            .args(&cmd.args)
            .envs(&self.env)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        if let Some(input) = &cmd.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .await
                    .map_err(spawn_err)?;
            }
        }

        let out = child.wait_with_output().await.map_err(spawn_err)?;
        let output = CmdOutput {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            exit_status: out.status.code().unwrap_or(-1),
        };

        if !out.status.success() {
            return Err(CmdError::Failed {
                command: line,
                output,
            });
        }

        Ok(output)
    }

    fn exists(&self, name: &str) -> bool {
        if name.contains('/') {
            return PathBuf::from(name).is_file();
        }

        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
            .unwrap_or(false)
    }
}

/// Scripted result for [`MockCmdRunner`].
#[derive(Debug, Clone, Default)]
pub struct MockCmdResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
    /// Report the command as failed regardless of exit status.
    pub fail: bool,
}

impl MockCmdResult {
    /// A successful result with the given stdout.
    pub fn stdout(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    /// A failed result with the given stderr.
    pub fn failure(stderr: &str) -> Self {
        Self {
            stderr: stderr.to_string(),
            exit_status: 1,
            fail: true,
            ..Default::default()
        }
    }
}

/// Mock command runner for testing.
///
/// Records every command and answers from results queued per command line.
/// Commands with nothing queued succeed with empty output.
pub struct MockCmdRunner {
    results: Mutex<HashMap<String, VecDeque<MockCmdResult>>>,
    commands: Mutex<Vec<Command>>,
    exists: Mutex<bool>,
}

impl MockCmdRunner {
    /// Create a mock runner where every tool exists.
    pub fn new() -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            exists: Mutex::new(true),
        }
    }

    /// Queue a result for a space-joined command line.
    pub fn add_result(&self, line: &str, result: MockCmdResult) {
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        results
            .entry(line.to_string())
            .or_default()
            .push_back(result);
    }

    /// Control the answer of [`CmdRunner::exists`].
    pub fn set_exists(&self, exists: bool) {
        *self.exists.lock().unwrap_or_else(|e| e.into_inner()) = exists;
    }

    /// All commands run so far, as argv vectors.
    pub fn run_commands(&self) -> Vec<Vec<String>> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(Command::argv)
            .collect()
    }

    /// All commands run so far.
    pub fn commands(&self) -> Vec<Command> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for MockCmdRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CmdRunner for MockCmdRunner {
    async fn run(&self, cmd: &Command) -> Result<CmdOutput, CmdError> {
        let line = cmd.line();
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cmd.clone());

        let result = self
            .results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&line)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();

        let output = CmdOutput {
            stdout: result.stdout,
            stderr: result.stderr,
            exit_status: result.exit_status,
        };

        if result.fail || output.exit_status != 0 {
            return Err(CmdError::Failed {
                command: line,
                output,
            });
        }

        Ok(output)
    }

    fn exists(&self, _name: &str) -> bool {
        *self.exists.lock().unwrap_or_else(|e| e.into_inner())
    }
}
