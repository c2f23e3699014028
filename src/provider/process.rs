//! External tool invocation shared by the provisioners.
//!
//! The multipass and kind provisioners drive CLIs (`multipass`, `go`,
//! `kind`, `kubectl`) and the snapshot uses `git`. [`Tool`] spawns one, optionally feeds it stdin, bounds it with a
//! timeout and turns a non-zero exit into [`ProvisionError::Tool`].
//! [`Tool::stream`] additionally forwards each output line to the current
//! tracing span while the tool runs, which is what long operations such as
//! `kind create cluster` use.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tracing::debug;

use super::{ProvisionError, ProvisionResult};

/// Captured output of a tool that exited successfully.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A command line for an external tool.
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    env: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl Tool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            env: Vec::new(),
            current_dir: None,
            timeout: None,
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

    /// Bytes written to the tool's stdin, which is then closed.
    pub fn stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human readable command line, for logs and errors.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }

    fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(if self.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    fn spawn(&self) -> ProvisionResult<tokio::process::Child> {
        let mut child = self.command().spawn().map_err(|e| ProvisionError::Spawn {
            program: self.program.clone(),
            source: e,
        })?;
        if let (Some(data), Some(mut pipe)) = (self.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&data).await {
                    debug!("Failed to write tool stdin: {}", e);
                }
            });
        }
        Ok(child)
    }

    async fn bounded<F, T>(&self, fut: F) -> ProvisionResult<T>
    where
        F: std::future::Future<Output = ProvisionResult<T>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                ProvisionError::Timeout(format!("`{}` did not finish within {:?}", self.display(), limit))
            })?,
            None => fut.await,
        }
    }

    fn check(&self, status: ExitStatus, out: ToolOutput) -> ProvisionResult<ToolOutput> {
        if status.success() {
            Ok(out)
        } else {
            Err(ProvisionError::Tool {
                command: self.display(),
                status: status.code().unwrap_or(-1),
                stderr: if out.stderr.trim().is_empty() {
                    out.stdout.trim().to_string()
                } else {
                    out.stderr.trim().to_string()
                },
            })
        }
    }

    /// Runs the tool to completion and captures its output.
    pub async fn output(&self) -> ProvisionResult<ToolOutput> {
        let (status, out) = self.output_unchecked().await?;
        self.check(status, out)
    }

    /// Like [`output`](Self::output) but leaves judging the exit status to
    /// the caller, for tools whose non-zero exit still produced results.
    pub async fn output_unchecked(&self) -> ProvisionResult<(ExitStatus, ToolOutput)> {
        debug!("Running {}", self.display());
        let child = self.spawn()?;
        self.bounded(async {
            let output = child.wait_with_output().await?;
            let out = ToolOutput {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            Ok((output.status, out))
        })
        .await
    }

    /// Runs the tool, logging each line as it is produced.
    pub async fn stream(&self) -> ProvisionResult<ToolOutput> {
        debug!("Running {}", self.display());
        let mut child = self.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProvisionError::Parse("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProvisionError::Parse("failed to capture stderr".to_string()))?;

        self.bounded(async move {
            let stdout_lines = LinesStream::new(BufReader::new(stdout).lines())
                .map(|line| (false, line.unwrap_or_default()));
            let stderr_lines = LinesStream::new(BufReader::new(stderr).lines())
                .map(|line| (true, line.unwrap_or_default()));
            let mut merged = stream::select(stdout_lines, stderr_lines);

            let mut out = ToolOutput::default();
            while let Some((is_err, line)) = merged.next().await {
                debug!("{}", line);
                let buf = if is_err { &mut out.stderr } else { &mut out.stdout };
                buf.push_str(&line);
                buf.push('\n');
            }
            let status = child.wait().await?;
            self.check(status, out)
        })
        .await
    }
}
