// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Wrappers around local and privileged command execution.
//!
//! Every external tool this workspace drives (`losetup`, `vgscan`,
//! `qemu-img`, `openstack`, ...) goes through a [`CommandRunner`]. The
//! runner returns the captured output; callers decide whether a non-zero
//! status is fatal with [`CommandRunner::execute`], or whether some stderr
//! conditions are acceptable with [`CommandRunner::execute_tolerating`].

use std::process::Stdio;

use async_trait::async_trait;

pub mod fakes;

pub const SUDO: &str = "sudo";

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// A successful output carrying `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed output with the given exit code and stderr text.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

#[derive(Debug)]
pub struct CommandFailureInfo {
    command: String,
    code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandFailureInfo {
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(
                f,
                "Command [{}] executed and failed with status: {}",
                self.command, code
            )?,
            None => write!(
                f,
                "Command [{}] was terminated by a signal",
                self.command
            )?,
        }
        write!(f, "  stderr: {}", self.stderr.trim())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("Privileged execution unavailable: {0}")]
    PrivilegeUnavailable(String),
}

impl ExecutionError {
    /// Standard error text of a failed command, if there was one.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecutionError::CommandFailure(info) => Some(info.stderr.as_str()),
            _ => None,
        }
    }
}

pub fn command_to_string(argv: &[&str]) -> String {
    argv.join(" ")
}

pub fn output_to_exec_error(
    argv: &[&str],
    output: &CommandOutput,
) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(argv),
        code: output.code,
        stdout: output.stdout.clone(),
        stderr: output.stderr.clone(),
    }))
}

/// A failure condition that is acceptable for a particular command,
/// recognised by a substring of its standard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tolerated {
    pub needle: &'static str,
    pub description: &'static str,
}

impl Tolerated {
    pub const fn new(needle: &'static str, description: &'static str) -> Self {
        Self {
            needle,
            description,
        }
    }

    pub fn matches(&self, output: &CommandOutput) -> bool {
        output.stderr.contains(self.needle)
    }
}

/// Result of running a command against a list of tolerated conditions.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<'a> {
    Completed(CommandOutput),
    Tolerated {
        condition: &'a Tolerated,
        output: CommandOutput,
    },
}

/// Sort a finished command into success, a tolerated failure, or an error.
pub fn classify<'a>(
    argv: &[&str],
    output: CommandOutput,
    tolerated: &'a [Tolerated],
) -> Result<Outcome<'a>, ExecutionError> {
    if output.success() {
        return Ok(Outcome::Completed(output));
    }

    match tolerated.iter().find(|t| t.matches(&output)) {
        Some(condition) => Ok(Outcome::Tolerated { condition, output }),
        None => Err(output_to_exec_error(argv, &output)),
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv` and capture its output whatever the exit status.
    ///
    /// Only a failure to start the process is an error here.
    async fn output(&self, argv: &[&str]) -> Result<CommandOutput, ExecutionError>;

    /// Run `argv`, treating any non-zero exit status as an error.
    async fn execute(&self, argv: &[&str]) -> Result<CommandOutput, ExecutionError> {
        let output = self.output(argv).await?;
        if !output.success() {
            return Err(output_to_exec_error(argv, &output));
        }
        Ok(output)
    }

    /// Run `argv`, accepting failures that match one of `tolerated`.
    async fn execute_tolerating<'a>(
        &self,
        argv: &[&str],
        tolerated: &'a [Tolerated],
    ) -> Result<Outcome<'a>, ExecutionError> {
        let output = self.output(argv).await?;
        classify(argv, output, tolerated)
    }
}

/// Runs commands as the current user.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner {
    envs: Vec<(String, String)>,
}

impl LocalRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add environment variables on top of the inherited environment.
    pub fn with_envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.envs
            .extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn output(&self, argv: &[&str]) -> Result<CommandOutput, ExecutionError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ExecutionError::ExecutionStart {
                command: String::new(),
                err: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "empty command line",
                ),
            });
        };

        tracing::debug!(command = %command_to_string(argv), "Executing");

        let output = tokio::process::Command::new(program)
            .args(args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| ExecutionError::ExecutionStart {
                command: command_to_string(argv),
                err,
            })?;

        Ok(output.into())
    }
}

/// Runs commands through passwordless `sudo`.
///
/// Elevation is checked once, when the runner is built, so that nothing
/// privileged is attempted by a process that cannot finish the job.
#[derive(Debug, Clone)]
pub struct SudoRunner<R = LocalRunner> {
    inner: R,
}

impl SudoRunner<LocalRunner> {
    pub async fn new() -> Result<Self, ExecutionError> {
        Self::with_runner(LocalRunner::new()).await
    }
}

impl<R: CommandRunner> SudoRunner<R> {
    pub async fn with_runner(inner: R) -> Result<Self, ExecutionError> {
        let output = inner
            .output(&[SUDO, "-n", "true"])
            .await
            .map_err(|e| ExecutionError::PrivilegeUnavailable(e.to_string()))?;

        if !output.success() {
            return Err(ExecutionError::PrivilegeUnavailable(format!(
                "check that this user may run sudo without a password: {}",
                output.stderr.trim()
            )));
        }

        Ok(Self { inner })
    }
}

#[async_trait]
impl<R: CommandRunner> CommandRunner for SudoRunner<R> {
    async fn output(&self, argv: &[&str]) -> Result<CommandOutput, ExecutionError> {
        let mut elevated = Vec::with_capacity(argv.len() + 2);
        elevated.push(SUDO);
        elevated.push("-n");
        elevated.extend_from_slice(argv);
        self.inner.output(&elevated).await
    }
}
