//! Line-oriented bridge to a child process over stdin/stdout.
//!
//! Every message is one line. Reads are bounded by a timeout so that a
//! hung worker surfaces as [`BridgeError::Timeout`] instead of blocking the
//! caller forever.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

/// Errors that can occur during process bridge operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BridgeError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Process exited unexpectedly with code {0}")]
    ProcessExited(i32),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Process is not running")]
    NotRunning,
}

/// A bridge for communicating with a child process via stdin/stdout.
pub struct ProcessBridge {
    process: Child,
    stdin: ChildStdin,
    stdout_reader: BufReader<ChildStdout>,
    stderr: Option<ChildStderr>,
    timeout_duration: Duration,
}

impl ProcessBridge {
    /// Spawns `program` with `args` and `env`, capturing all three streams.
    ///
    /// `timeout_duration` bounds every subsequent `send`/`receive`.
    pub fn spawn(
        program: &str,
        args: &[String],
        env: &[(String, String)],
        timeout_duration: Duration,
    ) -> Result<Self, BridgeError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in env {
            command.env(key, value);
        }

        let mut process = command
            .spawn()
            .map_err(|e| BridgeError::SpawnFailed(format!("{}: {}", program, e)))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("Failed to capture stdin".to_string()))?;

        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| BridgeError::SpawnFailed("Failed to capture stdout".to_string()))?;

        let stderr = process.stderr.take();

        Ok(Self {
            process,
            stdin,
            stdout_reader: BufReader::new(stdout),
            stderr,
            timeout_duration,
        })
    }

    /// Hands the stderr stream to the caller. Returns `None` after the
    /// first call.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Writes one line (a trailing newline is appended).
    pub async fn send(&mut self, line: &str) -> Result<(), BridgeError> {
        if !self.is_running() {
            return Err(BridgeError::NotRunning);
        }

        let limit = self.timeout_duration;
        let send_future = async {
            self.stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| BridgeError::IoError(e.to_string()))?;
            self.stdin
                .write_all(b"\n")
                .await
                .map_err(|e| BridgeError::IoError(e.to_string()))?;
            self.stdin
                .flush()
                .await
                .map_err(|e| BridgeError::IoError(e.to_string()))
        };

        timeout(limit, send_future)
            .await
            .map_err(|_| BridgeError::Timeout(limit))?
    }

    /// Reads one line using the default timeout.
    pub async fn receive(&mut self) -> Result<String, BridgeError> {
        let limit = self.timeout_duration;
        self.receive_within(limit).await
    }

    /// Reads one line (without trailing newline), waiting up to `limit`.
    pub async fn receive_within(&mut self, limit: Duration) -> Result<String, BridgeError> {
        let receive_future = async {
            let mut line = String::new();
            let bytes_read = self
                .stdout_reader
                .read_line(&mut line)
                .await
                .map_err(|e| BridgeError::IoError(e.to_string()))?;

            if bytes_read == 0 {
                // EOF
                let code = self
                    .process
                    .try_wait()
                    .ok()
                    .flatten()
                    .and_then(|s| s.code())
                    .unwrap_or(-1);
                return Err(BridgeError::ProcessExited(code));
            }

            if line.ends_with('\n') {
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
            }

            Ok(line)
        };

        timeout(limit, receive_future)
            .await
            .map_err(|_| BridgeError::Timeout(limit))?
    }

    /// Sends a request line and waits for the single-line response.
    pub async fn send_receive(&mut self, line: &str) -> Result<String, BridgeError> {
        self.send(line).await?;
        self.receive().await
    }

    /// Closes stdin and waits for the process to exit, killing it after a
    /// grace period.
    pub async fn close(mut self, grace: Duration) -> Result<(), BridgeError> {
        // A broken pipe here just means the process is already gone.
        let _ = self.stdin.shutdown().await;

        match timeout(grace, self.process.wait()).await {
            Ok(Ok(_status)) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::IoError(e.to_string())),
            Err(_) => {
                self.process
                    .kill()
                    .await
                    .map_err(|e| BridgeError::IoError(format!("Failed to kill process: {}", e)))
            }
        }
    }

    /// Whether the child has not exited yet.
    pub fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_duration
    }
}

impl Drop for ProcessBridge {
    fn drop(&mut self) {
        let _ = self.process.start_kill();
    }
}
