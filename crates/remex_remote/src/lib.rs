//! remex remote
//!
//! Clients for the remote action cache and the remote execution service.
//! Failures are classified once, at the transport boundary, into a
//! [`RemoteErrorKind`] that callers match on instead of inspecting causes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod error;
pub mod executor;
pub mod retrier;
pub mod transport;

pub use cache::{OutputSink, RemoteActionCache, RemoteCache};
pub use error::{RemoteError, RemoteErrorKind, RemoteResult};
pub use executor::{ExecuteResponseExt, RemoteExecutor};
pub use retrier::{Retrier, RetryPolicy, RetryableOperation};
pub use transport::{CasTransport, DiskCas, InMemoryCas};
