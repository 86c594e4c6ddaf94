//! External command execution.
//!
//! Every hypervisor and container-runtime call goes through an [`Executor`].
//! The real one, [`ProcessExecutor`], spawns the program with tokio, captures
//! its output and maps failures onto [`CoreError`] variants.

use crate::error::{CoreError, Result};
use crate::interrupt::Interrupt;
use crate::spinner::show_while;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

/// Maximum stderr kept in a [`CoreError::ProcessFailed`] (64 KiB).
const MAX_STDERR_SIZE: usize = 64 * 1024;

/// Truncate a string to max bytes, preserving UTF-8 boundaries.
fn truncate_output(s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_string();
    truncated.push_str("\n... [output truncated]");
    truncated
}

/// One invocation of an external program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    args: Vec<String>,
    stdin: Option<String>,
    timeout: Option<Duration>,
    env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Start a spec for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            args: vec![program.into()],
            ..Default::default()
        }
    }

    /// Build a spec from a full argument vector (program first).
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed `input` to the program's standard input.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Kill the program if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set or replace one variable on top of the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Full argument vector, program first.
    pub fn argv(&self) -> &[String] {
        &self.args
    }

    /// Configured deadline, if any.
    pub fn deadline(&self) -> Option<Duration> {
        self.timeout
    }

    /// Environment overrides.
    pub fn env_overrides(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Basename of the program, used in log lines and error messages.
    pub fn program_name(&self) -> String {
        self.args
            .first()
            .map(|program| {
                Path::new(program)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| program.clone())
            })
            .unwrap_or_default()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, "\"{arg}\"")?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

/// Runs external commands to completion.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `spec` and return its captured standard output.
    ///
    /// # Errors
    ///
    /// [`CoreError::ProcessFailed`] on a non-zero exit,
    /// [`CoreError::ProcessTimedOut`] when the deadline elapses,
    /// [`CoreError::Interrupted`] on a manual interrupt.
    async fn execute(&self, spec: &CommandSpec) -> Result<String>;

    /// Like [`execute`](Self::execute) but renders a progress indicator on
    /// stderr while the command runs. The indicator is cleared before this
    /// returns, on success and on failure.
    async fn execute_with_indicator(&self, spec: &CommandSpec) -> Result<String> {
        show_while(self.execute(spec)).await
    }
}

/// [`Executor`] backed by real OS processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    interrupt: Interrupt,
}

impl ProcessExecutor {
    /// Executor whose commands only end by exiting or timing out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill running commands and refuse new ones once `interrupt` is set.
    ///
    /// Affected commands fail with [`CoreError::Interrupted`].
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    async fn wait(
        &self,
        child: Child,
        program: &str,
        timeout: Option<Duration>,
    ) -> Result<Output> {
        let interrupt = &self.interrupt;
        let run = async move {
            tokio::select! {
                output = child.wait_with_output() => output.map_err(CoreError::from),
                _ = interrupt.triggered() => {
                    tracing::warn!(program, "Operation aborted");
                    Err(CoreError::Interrupted { program: program.to_string() })
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, run).await.map_err(|_| {
                tracing::debug!(program, timeout_ms = limit.as_millis() as u64, "Command timed out");
                CoreError::ProcessTimedOut {
                    program: program.to_string(),
                    timeout: limit,
                }
            })?,
            None => run.await,
        }
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, spec: &CommandSpec) -> Result<String> {
        let (program, args) = spec.args.split_first().ok_or(CoreError::EmptyCommand)?;
        let name = spec.program_name();

        if self.interrupt.is_triggered() {
            tracing::debug!(command = %spec, "Interrupted, not running");
            return Err(CoreError::Interrupted { program: name });
        }

        tracing::debug!(command = %spec, "Running");

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future (timeout, interrupt) kills the child.
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| CoreError::Spawn {
            program: program.clone(),
            source,
        })?;

        if let (Some(input), Some(mut pipe)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(input.as_bytes()).await {
                    tracing::debug!(error = %e, "Failed to write command stdin");
                }
            });
        }

        let output = self.wait(child, &name, spec.timeout).await?;

        let stderr = truncate_output(
            String::from_utf8_lossy(&output.stderr).into_owned(),
            MAX_STDERR_SIZE,
        );

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.trim().is_empty() {
                tracing::debug!(program = %name, stdout = %stdout.trim(), "Command stdout");
            }
            tracing::debug!(program = %name, code, stderr = %stderr.trim(), "Command failed");
            return Err(CoreError::ProcessFailed {
                program: name,
                code,
                stderr,
            });
        }

        if !stderr.trim().is_empty() {
            tracing::debug!(program = %name, stderr = %stderr.trim(), "Command stderr");
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
