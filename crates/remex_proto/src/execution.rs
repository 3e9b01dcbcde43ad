//! Execution request/response and action result messages.

use crate::encoding::CanonicalEncode;
use remex_core::Digest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status codes used by the remote services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StatusCode {
    /// Success
    #[default]
    Ok,
    /// The caller cancelled the operation
    Cancelled,
    /// Unknown server error
    Unknown,
    /// Malformed request
    InvalidArgument,
    /// Deadline passed before completion
    DeadlineExceeded,
    /// Requested entity absent
    NotFound,
    /// Quota or capacity exhausted
    ResourceExhausted,
    /// System not in a state to run the operation
    FailedPrecondition,
    /// Aborted, typically by a concurrency conflict
    Aborted,
    /// Internal server invariant broken
    Internal,
    /// Service currently unavailable
    Unavailable,
}

impl StatusCode {
    /// Check for `Ok`
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Status of an RPC
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Code
    pub code: StatusCode,
    /// Developer-facing message
    pub message: String,
}

impl Status {
    /// Create a status
    #[must_use]
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// OK status
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }
}

/// An output file of an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Path relative to the exec root
    pub path: String,
    /// Content digest
    pub digest: Digest,
    /// Executable bit
    pub is_executable: bool,
}

/// An output directory of an action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDirectory {
    /// Path relative to the exec root
    pub path: String,
    /// Digest of the encoded [`crate::Tree`]
    pub tree_digest: Digest,
}

/// Result of running an action, as stored in the action cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
    /// Output files
    pub output_files: Vec<OutputFile>,
    /// Output directories
    pub output_directories: Vec<OutputDirectory>,
    /// Process exit code
    pub exit_code: i32,
    /// Captured stdout, if any
    pub stdout_digest: Option<Digest>,
    /// Captured stderr, if any
    pub stderr_digest: Option<Digest>,
}

impl CanonicalEncode for ActionResult {}

/// A log file produced by the execution service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    /// Content digest
    pub digest: Digest,
    /// Whether the log is meant for humans
    pub human_readable: bool,
}

/// Priority hint for result caching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsCachePolicy {
    /// Server-defined priority
    pub priority: i32,
}

/// Priority hint for execution scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Server-defined priority
    pub priority: i32,
}

/// Request to execute an action remotely
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    /// Instance name
    pub instance_name: String,
    /// Action key
    pub action_digest: Digest,
    /// Do not serve this request from the action cache
    pub skip_cache_lookup: bool,
    /// Optional result cache priority
    pub results_cache_policy: Option<ResultsCachePolicy>,
    /// Optional execution priority
    pub execution_policy: Option<ExecutionPolicy>,
}

/// Response of an execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResponse {
    /// Result, possibly partial when the status is not OK
    pub result: Option<ActionResult>,
    /// The result was served from the action cache
    pub cached_result: bool,
    /// Execution status
    pub status: Status,
    /// Server logs by name
    pub server_logs: BTreeMap<String, LogFile>,
    /// Free-form message for the user
    pub message: String,
}

impl ExecuteResponse {
    /// Exit code of the result, zero when absent
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.result.as_ref().map_or(0, |r| r.exit_code)
    }

    /// The action failed or the execution did not complete
    #[must_use]
    pub fn failed(&self) -> bool {
        self.exit_code() != 0 || !self.status.code.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remex_core::DigestUtil;

    #[test]
    fn test_response_failed() {
        let mut response = ExecuteResponse {
            result: Some(ActionResult::default()),
            ..ExecuteResponse::default()
        };
        assert!(!response.failed());

        response.status = Status::new(StatusCode::Internal, "boom");
        assert!(response.failed());

        response.status = Status::ok();
        response.result = Some(ActionResult {
            exit_code: 2,
            ..ActionResult::default()
        });
        assert!(response.failed());
        assert_eq!(response.exit_code(), 2);
    }

    #[test]
    fn test_response_without_result() {
        let response = ExecuteResponse::default();
        assert_eq!(response.exit_code(), 0);
        assert!(!response.failed());
    }

    #[test]
    fn test_action_result_encoding_is_stable() {
        let util = DigestUtil::default();
        let result = ActionResult {
            output_files: vec![OutputFile {
                path: "out/a".to_string(),
                digest: util.compute(b"a"),
                is_executable: false,
            }],
            exit_code: 0,
            ..ActionResult::default()
        };
        assert_eq!(result.encode().unwrap(), result.clone().encode().unwrap());
    }
}
