//! Spawn results and the stdout/stderr sink.

use bytes::Bytes;
use remex_remote::OutputSink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::{Mutex, PoisonError};

/// Exit code reported for a timed out action (128 + SIGALRM)
pub const POSIX_TIMEOUT_EXIT_CODE: i32 = 128 + 14;

/// Exit code reported when the remote system failed the action
pub const REMOTE_ERROR_EXIT_CODE: i32 = 34;

/// Outcome class of a spawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpawnStatus {
    /// Exit code zero
    Success,
    /// Ran to completion with a non-zero exit code
    NonZeroExit,
    /// Killed after exceeding its timeout
    Timeout,
    /// Could not be executed
    ExecutionFailed,
    /// The remote system is unavailable
    ExecutionFailedCatastrophically,
    /// The remote cache failed in a way that blocks the action
    RemoteCacheFailed,
}

impl SpawnStatus {
    /// Status for a completed process
    #[must_use]
    pub const fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            Self::Success
        } else {
            Self::NonZeroExit
        }
    }
}

impl fmt::Display for SpawnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::NonZeroExit => "NON_ZERO_EXIT",
            Self::Timeout => "TIMEOUT",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::ExecutionFailedCatastrophically => "EXECUTION_FAILED_CATASTROPHICALLY",
            Self::RemoteCacheFailed => "REMOTE_CACHE_FAILED",
        };
        f.write_str(s)
    }
}

/// Result of one `exec` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnResult {
    /// Outcome class
    pub status: SpawnStatus,
    /// Process exit code
    pub exit_code: i32,
    /// Served from the remote cache
    pub cache_hit: bool,
    /// Name of the runner that produced the result
    pub runner_name: String,
    /// Failure description, if any
    pub failure_message: Option<String>,
}

impl SpawnResult {
    /// Create a result
    #[must_use]
    pub fn new(status: SpawnStatus, exit_code: i32, runner_name: impl Into<String>) -> Self {
        Self {
            status,
            exit_code,
            cache_hit: false,
            runner_name: runner_name.into(),
            failure_message: None,
        }
    }

    /// Result of a completed process
    #[must_use]
    pub fn from_exit_code(exit_code: i32, runner_name: impl Into<String>) -> Self {
        Self::new(SpawnStatus::from_exit_code(exit_code), exit_code, runner_name)
    }

    /// Mark as a cache hit
    #[must_use]
    pub fn with_cache_hit(mut self, cache_hit: bool) -> Self {
        self.cache_hit = cache_hit;
        self
    }

    /// Attach a failure message
    #[must_use]
    pub fn with_failure_message(mut self, message: impl Into<String>) -> Self {
        self.failure_message = Some(message.into());
        self
    }

    /// Status is success and the exit code is zero
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == SpawnStatus::Success && self.exit_code == 0
    }
}

impl fmt::Display for SpawnResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (exit {}) by {}", self.status, self.exit_code, self.runner_name)?;
        if let Some(message) = &self.failure_message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// Thread-safe stdout/stderr buffers of one spawn
#[derive(Debug, Default)]
pub struct FileOutErr {
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl FileOutErr {
    /// Create empty buffers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to stderr
    pub fn print_err(&self, message: &str) {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(message.as_bytes());
    }

    /// Append raw bytes to stdout
    pub fn write_out(&self, data: &[u8]) {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }

    /// Append raw bytes to stderr
    pub fn write_err(&self, data: &[u8]) {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
    }

    /// Stdout as lossy UTF-8
    #[must_use]
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout.lock().unwrap_or_else(PoisonError::into_inner)).into_owned()
    }

    /// Stderr as lossy UTF-8
    #[must_use]
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr.lock().unwrap_or_else(PoisonError::into_inner)).into_owned()
    }
}

impl OutputSink for FileOutErr {
    fn write_stdout(&self, data: &[u8]) -> io::Result<()> {
        self.write_out(data);
        Ok(())
    }

    fn write_stderr(&self, data: &[u8]) -> io::Result<()> {
        self.write_err(data);
        Ok(())
    }

    fn stdout(&self) -> Bytes {
        Bytes::from(self.stdout.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn stderr(&self) -> Bytes {
        Bytes::from(self.stderr.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}
