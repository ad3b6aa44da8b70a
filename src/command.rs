//! External tool invocation
//! Every proxy and certificate command goes through a `CommandRunner` with
//! its own timeout, so a hung tool surfaces as a distinct error

use async_trait::async_trait;
use std::fmt;
use std::io::{self, ErrorKind};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

/// A program plus its fixed arguments, parsed from a whitespace separated string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Build an invocation of this command as configured
    pub fn invocation(&self, timeout: Duration) -> Invocation {
        self.invoke(Vec::<String>::new(), timeout)
    }

    /// Build an invocation of this command with extra arguments appended
    pub fn invoke<I, S>(&self, extra: I, timeout: Duration) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = self.args.clone();
        args.extend(extra.into_iter().map(Into::into));
        Invocation {
            program: self.program.clone(),
            args,
            stdin: None,
            timeout,
        }
    }
}

impl FromStr for CommandLine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| "command must not be empty".to_string())?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// A single process execution request
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Rendered command line, for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished process
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Seam between the core and the host's command-line tools
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion or timeout; a non-zero exit is NOT an error here
    async fn run(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError>;

    /// Run and treat any non-zero exit as `ToolError::Failed`
    async fn run_checked(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError> {
        let output = self.run(invocation).await?;
        if !output.success() {
            if !output.stderr.trim().is_empty() {
                warn!(program = %invocation.program, "stderr: {}", output.stderr.trim());
            }
            return Err(ToolError::Failed {
                program: invocation.program.clone(),
                code: output.code,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }
}

/// Runs commands on the local host via `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ToolOutput, ToolError> {
        debug!("Running: {}", invocation.display());

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        // The stdin write runs under the same timeout as the process itself,
        // alongside output collection so neither side can fill a pipe and stall
        let feed = feed_stdin(child.stdin.take(), invocation.stdin.clone());
        let completed = async {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            let output = output?;
            match fed {
                // The tool exited without reading everything it was given
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!(program = %invocation.program, "stdin closed early");
                }
                Err(e) => return Err(e),
                Ok(()) => {}
            }
            Ok::<_, io::Error>(output)
        };

        let output = tokio::time::timeout(invocation.timeout, completed)
            .await
            .map_err(|_| ToolError::Timeout {
                program: invocation.program.clone(),
                timeout: invocation.timeout,
            })?
            .map_err(|source| ToolError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !stderr.trim().is_empty() {
            debug!(program = %invocation.program, "stderr: {}", stderr.trim());
        }

        Ok(ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }
}

/// Write `input` to the child's stdin, then close it so tools like `crontab -` see EOF
async fn feed_stdin(stdin: Option<ChildStdin>, input: Option<String>) -> io::Result<()> {
    if let (Some(mut stdin), Some(input)) = (stdin, input) {
        stdin.write_all(input.as_bytes()).await?;
        stdin.shutdown().await?;
    }
    Ok(())
}
