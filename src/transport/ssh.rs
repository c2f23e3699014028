//! [`RemoteShell`] over the system `ssh` binary.
//!
//! `connect` starts a background master connection bound to a control socket
//! in a private temporary directory. Every `exec`/`copy` then opens a session
//! on that master. When a session fails to open (ssh exits 255 and the
//! master no longer answers `-O check`) the client reconnects once and
//! retries before giving up.
//!
//! # Copy protocol
//!
//! Files are pushed by running `scp -t <dest>` remotely and writing the sink
//! protocol to its stdin:
//!
//! ```text
//! C0644 <size> <name>\n
//! <size raw bytes>
//! \0
//! ```

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ExecOutput, RemoteShell, TransportError, TransportResult, backoff, command_line, shell_escape,
};

/// Exit status ssh uses for its own failures.
const SSH_ERROR_STATUS: i32 = 255;

/// How long a transparent reconnect may take.
const RECONNECT_DEADLINE: Duration = Duration::from_secs(60);

/// SSH client holding a multiplexed master connection.
pub struct SshClient {
    host: String,
    username: String,
    key_path: PathBuf,
    control_dir: Arc<TempDir>,
    cancel: CancellationToken,
    reconnect_lock: tokio::sync::Mutex<()>,
}

impl SshClient {
    /// Creates an unconnected client. Call [`connect`](Self::connect) first.
    pub fn new(
        host: &str,
        username: &str,
        key_path: &Path,
        cancel: CancellationToken,
    ) -> TransportResult<Self> {
        let control_dir = tempfile::Builder::new().prefix("integrun-ssh").tempdir()?;
        Ok(Self {
            host: host.to_string(),
            username: username.to_string(),
            key_path: key_path.to_path_buf(),
            control_dir: Arc::new(control_dir),
            cancel,
            reconnect_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }

    fn control_path(&self) -> PathBuf {
        self.control_dir.path().join("master")
    }

    fn log_path(&self) -> PathBuf {
        self.control_dir.path().join("master.log")
    }

    fn base_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
            "ConnectTimeout=30",
        ]);
        cmd.arg("-i").arg(&self.key_path);
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path().display()));
        cmd.kill_on_drop(true);
        cmd
    }

    /// Dials until connected, retrying with capped exponential backoff until
    /// `deadline` has elapsed or the client is cancelled.
    pub async fn connect(&self, deadline: Duration) -> TransportResult<()> {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            match self.dial().await {
                Ok(()) => {
                    info!("Connected to {}", self.destination());
                    return Ok(());
                }
                Err(e) => {
                    let elapsed = start.elapsed();
                    if elapsed >= deadline {
                        return Err(TransportError::Timeout(format!(
                            "connecting to {}: {}",
                            self.destination(),
                            e
                        )));
                    }
                    let wait = backoff(attempt).min(deadline - elapsed);
                    debug!(
                        "Connect to {} failed ({}), retrying in {:?}",
                        self.destination(),
                        e,
                        wait
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
                    }
                }
            }
        }
    }

    /// Drops the master connection and dials again.
    pub async fn reconnect(&self) -> TransportResult<()> {
        let _guard = self.reconnect_lock.lock().await;
        if self.is_alive().await {
            return Ok(());
        }
        warn!("Reconnecting to {}", self.destination());
        self.stop_master().await;
        self.connect(RECONNECT_DEADLINE).await
    }

    /// Starts the background master. Its output goes to a log file because
    /// the daemonized process would otherwise hold our pipes open.
    async fn dial(&self) -> TransportResult<()> {
        let status = self
            .base_command()
            .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes"])
            .args(["-o", "ServerAliveInterval=30"])
            .arg("-E")
            .arg(self.log_path())
            .args(["-f", "-N"])
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        if status.success() {
            return Ok(());
        }
        let message = tokio::fs::read_to_string(self.log_path())
            .await
            .unwrap_or_default();
        Err(TransportError::Connect {
            host: self.host.clone(),
            message: last_line(&message),
        })
    }

    async fn is_alive(&self) -> bool {
        self.base_command()
            .args(["-O", "check"])
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn stop_master(&self) {
        let result = self
            .base_command()
            .args(["-O", "exit"])
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            debug!("Failed to stop master for {}: {}", self.destination(), e);
        }
    }

    /// Opens one session running `line`.
    async fn session(&self, line: &str, stdin: Option<&[u8]>) -> TransportResult<Output> {
        let mut cmd = self.base_command();
        cmd.args(["-o", "ControlMaster=no"])
            .arg(self.destination())
            .arg("--")
            .arg(line)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let data = data.to_vec();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&data).await {
                    debug!("Failed to write session stdin: {}", e);
                }
            });
        }
        Ok(child.wait_with_output().await?)
    }

    /// True when `output` says the session never reached the remote command.
    async fn session_broken(&self, output: &Output) -> bool {
        output.status.code() == Some(SSH_ERROR_STATUS) && !self.is_alive().await
    }

    async fn copy_once(&self, local: &Path, dest: &str) -> TransportResult<Output> {
        let meta = tokio::fs::metadata(local).await?;
        let name = Path::new(dest)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TransportError::Copy {
                dest: dest.to_string(),
                message: "destination has no file name".to_string(),
            })?;

        let mut child = self
            .base_command()
            .args(["-o", "ControlMaster=no"])
            .arg(self.destination())
            .arg("--")
            .arg(format!("scp -t {}", shell_escape(dest)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or_else(|| TransportError::Copy {
            dest: dest.to_string(),
            message: "failed to capture stdin".to_string(),
        })?;
        let mut file = tokio::fs::File::open(local).await?;
        let written = async {
            stdin
                .write_all(scp_header(file_mode(&meta), meta.len(), &name).as_bytes())
                .await?;
            tokio::io::copy(&mut file, &mut stdin).await?;
            stdin.write_all(b"\0").await?;
            stdin.shutdown().await
        }
        .await;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if let Err(e) = written {
            // A broken pipe means the remote side went away; the exit status
            // below says why.
            debug!("Copy stream to {} ended early: {}", dest, e);
        }
        Ok(output)
    }
}

#[async_trait]
impl RemoteShell for SshClient {
    async fn exec(
        &self,
        cmd: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> TransportResult<ExecOutput> {
        let line = command_line(cmd, args);
        debug!("[{}] {}", self.host, line);

        let mut output = self.session(&line, stdin).await?;
        if self.session_broken(&output).await {
            self.reconnect().await?;
            output = self.session(&line, stdin).await?;
            if self.session_broken(&output).await {
                return Err(TransportError::Session {
                    host: self.host.clone(),
                    message: last_line(&String::from_utf8_lossy(&output.stderr)),
                });
            }
        }

        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                command: line,
                status: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn copy(&self, local: &Path, dest: &str) -> TransportResult<()> {
        debug!("[{}] copy {} -> {}", self.host, local.display(), dest);

        let mut output = self.copy_once(local, dest).await?;
        if self.session_broken(&output).await {
            self.reconnect().await?;
            output = self.copy_once(local, dest).await?;
        }

        if !output.status.success() || scp_rejected(&output.stdout) {
            let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if message.is_empty() {
                message = scp_message(&output.stdout);
            }
            return Err(TransportError::Copy {
                dest: dest.to_string(),
                message,
            });
        }
        Ok(())
    }

    async fn close(&self) {
        self.stop_master().await;
    }
}

impl Drop for SshClient {
    fn drop(&mut self) {
        // The master is persistent; make sure it does not outlive us. The
        // control directory has to survive until the exit request ran.
        let destination = self.destination();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            let result = std::process::Command::new("ssh")
                .arg("-o")
                .arg(format!("ControlPath={}", self.control_path().display()))
                .args(["-O", "exit"])
                .arg(&destination)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if let Err(e) = result {
                debug!("Failed to stop master for {}: {}", destination, e);
            }
            return;
        };

        let mut cmd = self.base_command();
        cmd.args(["-O", "exit"])
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let control_dir = self.control_dir.clone();
        handle.spawn(async move {
            match cmd.output().await {
                Ok(output) if output.status.success() => {}
                Ok(output) => debug!(
                    "Master for {} did not exit: {}",
                    destination,
                    last_line(&String::from_utf8_lossy(&output.stderr))
                ),
                Err(e) => debug!("Failed to stop master for {}: {}", destination, e),
            }
            drop(control_dir);
        });
    }
}

/// Control line announcing one file to an `scp -t` sink.
pub fn scp_header(mode: u32, size: u64, name: &str) -> String {
    format!("C{:04o} {} {}\n", mode & 0o7777, size, name)
}

/// Sink replies are `\0` (ok), `\x01` (warning) or `\x02` (fatal).
fn scp_rejected(stdout: &[u8]) -> bool {
    stdout.iter().any(|b| *b == 1 || *b == 2)
}

fn scp_message(stdout: &[u8]) -> String {
    let text: Vec<u8> = stdout.iter().copied().filter(|b| *b > 2).collect();
    String::from_utf8_lossy(&text).trim().to_string()
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

fn last_line(s: &str) -> String {
    s.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("unknown error")
        .trim()
        .to_string()
}
