//! External command execution
//!
//! Every external tool (package manager, source builder, image builder,
//! account management) runs through [`CommandRunner`]. The pipeline only
//! sees exit statuses and captured text, so it can be driven by a fake in
//! tests instead of real privileged subprocesses.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use crate::error::ToolInvocationError;

/// How a command's output is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Stream output when verbose, capture it otherwise
    Auto,
    /// Always capture (the caller parses stdout)
    Capture,
}

/// A command to run
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Program name or path
    pub program: String,
    /// Arguments
    pub args: Vec<OsString>,
    /// Working directory
    pub workdir: Option<PathBuf>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Run as this user through `sudo -H -u`
    pub user: Option<String>,
    /// Output handling
    pub output: OutputMode,
}

impl CommandSpec {
    /// Create a command for a program
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            workdir: None,
            env: Vec::new(),
            user: None,
            output: OutputMode::Auto,
        }
    }

    /// Append one argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory
    #[must_use]
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.workdir = Some(dir.to_path_buf());
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }

    /// Run the command as another user
    #[must_use]
    pub fn as_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    /// Always capture output
    #[must_use]
    pub fn capture(mut self) -> Self {
        self.output = OutputMode::Capture;
        self
    }

    /// Arguments as lossy strings, for logging and matching
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "sudo -H -u {user} ")?;
        }
        write!(f, "{}", self.program)?;
        for arg in self.arg_strings() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit status
    pub status: ExitStatus,
    /// Captured stdout (empty when streamed)
    pub stdout: String,
    /// Captured stderr (empty when streamed)
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Human readable exit status
    pub fn status_text(&self) -> String {
        match self.status.code() {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        }
    }

    /// Captured stdout followed by stderr
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Turn a non-zero exit into a [`ToolInvocationError`]
    pub fn check(self, tool: &str) -> Result<Self, ToolInvocationError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ToolInvocationError::Failed {
                tool: tool.to_string(),
                status: self.status_text(),
                output: self.combined(),
            })
        }
    }
}

/// Capability to run external commands
///
/// Commands are blocking from the caller's perspective.
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ToolInvocationError>;
}

/// Runs commands as real child processes
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    verbose: bool,
}

impl SystemRunner {
    /// Create a runner; `verbose` streams child output to the terminal
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    fn build(command: &CommandSpec) -> Command {
        let mut cmd = match &command.user {
            Some(user) => {
                let mut sudo = Command::new("sudo");
                sudo.args(["-H", "-u", user.as_str()]);
                // sudo resets the environment, pass variables explicitly
                if !command.env.is_empty() {
                    sudo.arg("env");
                    sudo.args(command.env.iter().map(|(k, v)| format!("{k}={v}")));
                }
                sudo.arg(&command.program);
                sudo
            }
            None => {
                let mut direct = Command::new(&command.program);
                direct.envs(command.env.iter().map(|(k, v)| (k, v)));
                direct
            }
        };
        cmd.args(&command.args);
        if let Some(dir) = &command.workdir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, ToolInvocationError> {
        tracing::debug!("Running: {command}");
        let mut cmd = Self::build(command);
        let spawn_err = |e: std::io::Error| ToolInvocationError::Spawn {
            tool: command.program.clone(),
            error: e.to_string(),
        };

        let stream = self.verbose && command.output == OutputMode::Auto;
        if stream {
            let status = cmd
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(spawn_err)?;
            return Ok(CommandOutput {
                status,
                stdout: String::new(),
                stderr: String::new(),
            });
        }

        let output = cmd.stdin(Stdio::null()).output().map_err(spawn_err)?;
        let result = CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if !result.stderr.is_empty() {
            tracing::trace!("{}: {}", command.program, result.stderr.trim_end());
        }
        Ok(result)
    }
}
