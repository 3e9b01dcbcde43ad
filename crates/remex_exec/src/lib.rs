//! remex execution
//!
//! Decides, per spawn, whether its result comes from the remote cache, from
//! the remote execution service, or from a local runner, and feeds locally
//! produced results back into the cache.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod canonical;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod inputs;
pub mod local;
pub mod options;
pub mod platform;
pub mod profile;
pub mod reporter;
pub mod result;
pub mod runner;
pub mod spawn;

#[cfg(test)]
mod testing;

pub use canonical::{build_action, build_command, prepare_action, PreparedAction};
pub use context::{ProgressStatus, SimpleSpawnContext, SpawnExecutionContext};
pub use dispatcher::RemoteSpawnRunner;
pub use error::{SpawnError, SpawnExecError};
pub use inputs::{input_ctimes, inputs_changed, materialize_param_files};
pub use local::ProcessSpawnRunner;
pub use options::RemoteOptions;
pub use platform::{parse_platform, parse_platform_text, PlatformParseError, TextParseError};
pub use profile::ProfileScope;
pub use reporter::{Event, EventKind, Reporter, TracingReporter};
pub use result::{FileOutErr, SpawnResult, SpawnStatus, POSIX_TIMEOUT_EXIT_CODE, REMOTE_ERROR_EXIT_CODE};
pub use runner::{FallbackRunnerCell, SpawnRunner, WarnOnce};
pub use spawn::{requirements, ActionOutput, OutputKind, PlatformInfo, Spawn, SpawnSpec, VirtualInputSpec};
