//! External tool invocation with a hard timeout.
//!
//! Every stage that talks to an external program (the scanner driver, the
//! OCR engine) goes through [`invoke`]. It spawns exactly one process, feeds
//! it optional stdin, collects stdout/stderr and maps an unsuccessful exit
//! to [`ToolError::NonZeroExit`]. There are no retries here; retry policy
//! belongs to the stage.
//!
//! The child is spawned with `kill_on_drop(true)`. When the timeout elapses
//! (or the calling future is dropped because the job was cancelled) the
//! pending `wait_with_output` future is dropped together with the child, so
//! the process is killed instead of leaking.

use crate::error::ToolError;
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// A program plus its arguments and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Renders the command line the way a shell user would retype it.
impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Captured result of a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
}

impl ToolOutput {
    /// Stdout decoded lossily as UTF-8.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Run `cmd` to completion, or kill it once `timeout` elapses.
pub async fn invoke(
    cmd: &ToolCommand,
    input: Option<&[u8]>,
    timeout: Duration,
) -> Result<ToolOutput, ToolError> {
    debug!("Calling: {}", cmd);
    let start = Instant::now();

    let mut command = Command::new(&cmd.program);
    command
        .args(&cmd.args)
        .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| ToolError::SpawnFailed {
        program: cmd.program.clone(),
        source: e,
    })?;

    // Feed stdin concurrently with draining stdout so a chatty child can't
    // deadlock on a full pipe.
    let feeder = match (input, child.stdin.take()) {
        (Some(bytes), Some(mut stdin)) => {
            let bytes = bytes.to_vec();
            Some(tokio::spawn(async move {
                stdin.write_all(&bytes).await?;
                stdin.shutdown().await
            }))
        }
        _ => None,
    };

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ToolError::Io {
            program: cmd.program.clone(),
            source: e,
        })?,
        Err(_) => {
            debug!(
                "'{}' exceeded {}s, killed",
                cmd.program,
                timeout.as_secs()
            );
            return Err(ToolError::TimedOut {
                program: cmd.program.clone(),
                secs: timeout.as_secs(),
            });
        }
    };

    if let Some(feeder) = feeder {
        match feeder.await {
            // A child that exits without reading all of stdin closes the
            // pipe early; its exit status is what matters.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => {
                return Err(ToolError::Io {
                    program: cmd.program.clone(),
                    source: e,
                })
            }
            Ok(Ok(())) | Err(_) => {}
        }
    }

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    debug!(
        "Command exited with: {:?} after {}ms\n    Call: {}\n    Stdout: {} bytes\n    Stderr: {}",
        output.status.code(),
        start.elapsed().as_millis(),
        cmd,
        output.stdout.len(),
        stderr.trim_end()
    );

    if !output.status.success() {
        return Err(ToolError::NonZeroExit {
            program: cmd.program.clone(),
            code: output.status.code(),
            stderr,
        });
    }

    Ok(ToolOutput {
        stdout: output.stdout,
        stderr,
        exit_code: output.status.code().unwrap_or(0),
    })
}

/// Quote `arg` for a POSIX shell if it contains metacharacters.
pub fn shell_quote(arg: &str) -> String {
    const META: &[char] = &[
        '|', '&', ';', '(', ')', '<', '>', ' ', '\t', '\'', '"', '`', '$',
    ];
    if arg.is_empty() {
        return "''".to_string();
    }
    if arg.contains(META) {
        format!("'{}'", arg.replace('\'', r#"'"'"'"#))
    } else {
        arg.to_string()
    }
}
