//! Remote failure taxonomy.

use remex_core::{CoreError, Digest};
use remex_proto::{ExecuteResponse, Status, StatusCode};
use remex_storage::StoreError;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

/// Remote result type
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Disposition class of a remote failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// Network or server hiccup; worth retrying
    Transient,
    /// The service is unavailable; retried, then catastrophic
    Unavailable,
    /// The action ran on the server but exceeded its timeout
    ExecutionTimeout,
    /// A blob referenced by a cached result is gone
    CacheNotFound,
    /// The caller cancelled the operation
    Interrupted,
    /// Anything else
    Fatal,
}

impl RemoteErrorKind {
    /// Whether the retrier should try again
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient | Self::Unavailable)
    }

    /// Get string representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Unavailable => "unavailable",
            Self::ExecutionTimeout => "execution timeout",
            Self::CacheNotFound => "cache not found",
            Self::Interrupted => "interrupted",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified remote failure
///
/// When the failure came back inside an execution response, the response is
/// kept so its server logs and partial outputs can still be fetched.
#[derive(Debug, Clone)]
pub struct RemoteError {
    kind: RemoteErrorKind,
    message: String,
    response: Option<Box<ExecuteResponse>>,
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl RemoteError {
    /// Create an error of the given kind
    #[must_use]
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            response: None,
            source: None,
        }
    }

    /// Transient failure
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Transient, message)
    }

    /// Service unavailable
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Unavailable, message)
    }

    /// A referenced blob is missing from the cache
    #[must_use]
    pub fn cache_not_found(digest: &Digest) -> Self {
        Self::new(
            RemoteErrorKind::CacheNotFound,
            format!("Missing digest: {digest}"),
        )
    }

    /// Cancelled by the caller
    #[must_use]
    pub fn interrupted() -> Self {
        Self::new(RemoteErrorKind::Interrupted, "Operation interrupted")
    }

    /// Non-recoverable failure
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Fatal, message)
    }

    /// Classify a non-OK status
    ///
    /// `DeadlineExceeded` is an execution timeout only when it arrives
    /// inside an execution response; on a plain call it is transient.
    #[must_use]
    pub fn from_status(status: &Status, response: Option<ExecuteResponse>) -> Self {
        let kind = match status.code {
            StatusCode::Unavailable => RemoteErrorKind::Unavailable,
            StatusCode::DeadlineExceeded if response.is_some() => RemoteErrorKind::ExecutionTimeout,
            StatusCode::Cancelled => RemoteErrorKind::Interrupted,
            StatusCode::NotFound => RemoteErrorKind::CacheNotFound,
            StatusCode::Unknown
            | StatusCode::Aborted
            | StatusCode::Internal
            | StatusCode::ResourceExhausted
            | StatusCode::DeadlineExceeded => RemoteErrorKind::Transient,
            StatusCode::Ok
            | StatusCode::InvalidArgument
            | StatusCode::FailedPrecondition => RemoteErrorKind::Fatal,
        };
        let message = if status.message.is_empty() {
            format!("{:?}", status.code)
        } else {
            format!("{:?}: {}", status.code, status.message)
        };
        Self {
            kind,
            message,
            response: response.map(Box::new),
            source: None,
        }
    }

    /// Classify an I/O failure
    #[must_use]
    pub fn from_io(context: impl Into<String>, err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => RemoteErrorKind::Transient,
            _ => RemoteErrorKind::Fatal,
        };
        let context = context.into();
        Self {
            kind,
            message: format!("{context}: {err}"),
            response: None,
            source: Some(Arc::new(err)),
        }
    }

    /// Attach an execution response
    #[must_use]
    pub fn with_response(mut self, response: ExecuteResponse) -> Self {
        self.response = Some(Box::new(response));
        self
    }

    /// Attach an underlying cause
    #[must_use]
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Failure class
    #[must_use]
    pub const fn kind(&self) -> RemoteErrorKind {
        self.kind
    }

    /// Human readable message without the kind prefix
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The execution response the failure arrived in, if any
    #[must_use]
    pub fn response(&self) -> Option<&ExecuteResponse> {
        self.response.as_deref()
    }

    /// Whether the retrier should try again
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }

    /// Multi-line description including every cause
    #[must_use]
    pub fn detailed(&self) -> String {
        let mut out = self.to_string();
        let mut cause = StdError::source(self);
        while let Some(err) = cause {
            out.push_str("\n  caused by: ");
            out.push_str(&err.to_string());
            cause = err.source();
        }
        if let Some(response) = &self.response {
            out.push_str(&format!("\n  status: {:?}", response.status.code));
            if !response.status.message.is_empty() {
                out.push_str(&format!(" ({})", response.status.message));
            }
            if !response.message.is_empty() {
                out.push_str(&format!("\n  server message: {}", response.message));
            }
        }
        out
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Remote {} error: {}", self.kind, self.message)
    }
}

impl StdError for RemoteError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

impl From<StoreError> for RemoteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(io) => Self::from_io("blob store", io),
            other => Self::fatal(other.to_string()),
        }
    }
}

impl From<CoreError> for RemoteError {
    fn from(err: CoreError) -> Self {
        Self::fatal(err.to_string()).with_source(err)
    }
}
