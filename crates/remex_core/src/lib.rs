//! remex core types
//!
//! This crate contains pure types and logic with no network I/O.
//! Digests are the identity of every blob, directory and action that
//! crosses the remote cache boundary.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod digest;
pub mod error;
pub mod id;
pub mod time;

// Re-exports
pub use digest::{Digest, DigestFunction, DigestUtil};
pub use error::{CoreError, CoreResult};
pub use id::{BuildRequestId, CommandId, RequestMetadata};
pub use time::ProtoDuration;
