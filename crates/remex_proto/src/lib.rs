//! remex protocol messages
//!
//! Message shapes exchanged with the remote cache and the remote execution
//! service. Every message that is hashed is canonically encoded, so equal
//! messages always produce equal bytes and equal digests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod encoding;
pub mod execution;
pub mod tree;

pub use action::{Action, ActionKey, Command, EnvironmentVariable, Platform, Property};
pub use encoding::{CanonicalDecode, CanonicalEncode};
pub use execution::{
    ActionResult, ExecuteRequest, ExecuteResponse, ExecutionPolicy, LogFile, OutputDirectory,
    OutputFile, ResultsCachePolicy, Status, StatusCode,
};
pub use tree::{Directory, DirectoryNode, FileNode, Tree};
