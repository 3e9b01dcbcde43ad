//! Remote execution service client seam.

use crate::error::{RemoteError, RemoteResult};
use async_trait::async_trait;
use remex_proto::{ExecuteRequest, ExecuteResponse};

/// Submits actions to a remote execution service
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Execute an action and wait for its response
    ///
    /// A response whose status is not OK may be returned as-is; callers
    /// pass it through [`ExecuteResponseExt::into_result`].
    ///
    /// # Errors
    ///
    /// Returns error if the request could not be completed
    async fn execute_remotely(&self, request: &ExecuteRequest) -> RemoteResult<ExecuteResponse>;
}

/// Status checking for execution responses
pub trait ExecuteResponseExt: Sized {
    /// Turn a non-OK status into a classified error that keeps the response
    ///
    /// # Errors
    ///
    /// Returns error if the response status is not OK
    fn into_result(self) -> RemoteResult<Self>;
}

impl ExecuteResponseExt for ExecuteResponse {
    fn into_result(self) -> RemoteResult<Self> {
        if self.status.code.is_ok() {
            return Ok(self);
        }
        let status = self.status.clone();
        Err(RemoteError::from_status(&status, Some(self)))
    }
}
