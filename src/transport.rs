//! Remote execution over a secure shell.
//!
//! The runners only see the [`RemoteShell`] trait; the orchestrator obtains
//! shells through a [`Connector`]. The built-in implementation,
//! [`ssh::SshClient`], drives the system `ssh` binary with a multiplexed
//! master connection so every command opens a cheap session on an already
//! authenticated link.
//!
//! # Operations
//!
//! | Operation | Behavior |
//! |-----------|----------|
//! | connect | dial with capped exponential backoff until the deadline |
//! | exec | run one command, capturing stdout and stderr separately |
//! | exec_with_retry | repeat `exec` at a fixed interval until it succeeds or is cancelled |
//! | copy | push one file using the `scp` sink protocol over the session's stdin |
//! | get_file_contents | run `cat` (POSIX) or `type` (Windows) and return stdout |
//!
//! A command that runs and exits non-zero is reported as
//! [`TransportError::CommandFailed`], which still carries both output streams
//! so callers can treat test failures as data.

pub mod keys;
pub mod ssh;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::provider::Instance;

pub use keys::{KeyPair, ensure_key_pair};
pub use ssh::SshClient;

/// Command used to read a file on POSIX targets.
pub const READ_CMD_POSIX: &str = "cat";

/// Command used to read a file on Windows targets.
pub const READ_CMD_WINDOWS: &str = "type";

const BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors from remote execution.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Could not establish the connection.
    #[error("failed to connect to {host}: {message}")]
    Connect { host: String, message: String },

    /// A session could not be opened even after reconnecting.
    #[error("failed to open session on {host}: {message}")]
    Session { host: String, message: String },

    /// The command ran and exited non-zero.
    #[error("command `{command}` exited with status {status}")]
    CommandFailed {
        command: String,
        status: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },

    /// The remote side rejected a file copy.
    #[error("failed to copy to {dest}: {message}")]
    Copy { dest: String, message: String },

    /// The key pair could not be created or read.
    #[error("key pair error: {0}")]
    Key(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A connected remote shell.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Runs `cmd` with shell-escaped `args`, optionally feeding `stdin`.
    ///
    /// `cmd` is passed through verbatim so callers can send a full command
    /// line for shells that do not understand POSIX quoting.
    async fn exec(&self, cmd: &str, args: &[String], stdin: Option<&[u8]>)
    -> TransportResult<ExecOutput>;

    /// Repeats [`exec`](Self::exec) every `interval` until it succeeds.
    async fn exec_with_retry(
        &self,
        cmd: &str,
        args: &[String],
        interval: Duration,
        cancel: &CancellationToken,
    ) -> TransportResult<ExecOutput> {
        loop {
            match self.exec(cmd, args, None).await {
                Ok(output) => return Ok(output),
                Err(e) => {
                    warn!("`{}` failed, retrying in {:?}: {}", cmd, interval, e);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
        }
    }

    /// Copies the local file at `local` to the remote path `dest`.
    async fn copy(&self, local: &Path, dest: &str) -> TransportResult<()>;

    /// Returns the contents of a remote file using `read_cmd`.
    async fn get_file_contents(&self, path: &str, read_cmd: &str) -> TransportResult<Vec<u8>> {
        let output = self.exec(read_cmd, &[path.to_string()], None).await?;
        Ok(output.stdout)
    }

    /// Releases the connection. Further calls may fail.
    async fn close(&self) {}
}

/// Opens shells to provisioned instances.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        instance: &Instance,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> TransportResult<Box<dyn RemoteShell>>;
}

/// Connector that dials instances over SSH with a fixed private key.
pub struct SshConnector {
    key_path: PathBuf,
}

impl SshConnector {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        instance: &Instance,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> TransportResult<Box<dyn RemoteShell>> {
        let client = SshClient::new(
            &instance.ip,
            &instance.username,
            &self.key_path,
            cancel.clone(),
        )?;
        client.connect(deadline).await?;
        Ok(Box::new(client))
    }
}

/// Builds the remote command line: `cmd` verbatim, arguments escaped.
pub fn command_line(cmd: &str, args: &[String]) -> String {
    let mut parts = vec![cmd.to_string()];
    parts.extend(args.iter().map(|a| shell_escape(a)));
    parts.join(" ")
}

/// Escape a string for use in a POSIX shell command.
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| {
            c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=' | ':' | ',')
        })
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Delay before connection attempt `attempt` (0-based), with jitter.
pub(crate) fn backoff(attempt: u32) -> Duration {
    let base = BACKOFF_INITIAL
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(BACKOFF_MAX);
    let jitter = rand::thread_rng().gen_range(0..1000);
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FlakyShell {
        failures_left: AtomicUsize,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RemoteShell for FlakyShell {
        async fn exec(
            &self,
            cmd: &str,
            args: &[String],
            _stdin: Option<&[u8]>,
        ) -> TransportResult<ExecOutput> {
            self.calls.lock().unwrap().push(command_line(cmd, args));
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::CommandFailed {
                    command: cmd.to_string(),
                    status: 100,
                    stdout: vec![],
                    stderr: b"lock held".to_vec(),
                });
            }
            Ok(ExecOutput {
                stdout: b"ok".to_vec(),
                stderr: vec![],
            })
        }

        async fn copy(&self, _local: &Path, _dest: &str) -> TransportResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_command_line_escapes_args_only() {
        let line = command_line(
            "sudo apt-get",
            &["install".to_string(), "it's".to_string(), "".to_string()],
        );
        assert_eq!(line, "sudo apt-get install 'it'\\''s' ''");
    }

    #[test]
    fn test_backoff_is_capped() {
        assert!(backoff(0) >= Duration::from_secs(5));
        assert!(backoff(0) < Duration::from_secs(6));
        assert!(backoff(10) >= BACKOFF_MAX);
        assert!(backoff(30) < BACKOFF_MAX + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_exec_with_retry_until_success() {
        let shell = FlakyShell {
            failures_left: AtomicUsize::new(2),
            calls: Mutex::new(vec![]),
        };
        let cancel = CancellationToken::new();
        let out = shell
            .exec_with_retry("apt-get", &["update".to_string()], Duration::from_millis(1), &cancel)
            .await
            .unwrap();
        assert_eq!(out.stdout, b"ok");
        assert_eq!(shell.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_exec_with_retry_cancelled() {
        let shell = FlakyShell {
            failures_left: AtomicUsize::new(usize::MAX),
            calls: Mutex::new(vec![]),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = shell
            .exec_with_retry("true", &[], Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }

    #[tokio::test]
    async fn test_get_file_contents_uses_read_command() {
        let shell = FlakyShell {
            failures_left: AtomicUsize::new(0),
            calls: Mutex::new(vec![]),
        };
        let out = shell
            .get_file_contents("C:\\agent\\out.xml", READ_CMD_WINDOWS)
            .await
            .unwrap();
        assert_eq!(out, b"ok");
        assert_eq!(
            shell.calls.lock().unwrap()[0],
            "type 'C:\\agent\\out.xml'"
        );
    }
}
