//! Per-spawn execution context.

use crate::result::FileOutErr;
use crate::spawn::Spawn;
use remex_storage::{ActionInput, MetadataProvider};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Coarse progress of a spawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressStatus {
    /// Waiting for resources
    Scheduling,
    /// Running
    Executing,
    /// Looking for a cached result
    Checking,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Scheduling => "scheduling",
            Self::Executing => "executing",
            Self::Checking => "checking",
        };
        f.write_str(s)
    }
}

/// What a runner needs from its caller to execute one spawn
pub trait SpawnExecutionContext: Send + Sync {
    /// Inputs keyed by exec path
    ///
    /// # Errors
    ///
    /// Returns error if the inputs cannot be enumerated
    fn input_mapping(&self) -> io::Result<BTreeMap<PathBuf, ActionInput>>;

    /// Resolves digests of real input files
    fn metadata_provider(&self) -> &dyn MetadataProvider;

    /// Stdout and stderr of the spawn
    fn file_out_err(&self) -> &FileOutErr;

    /// Effective timeout; zero means none
    fn timeout(&self) -> Duration;

    /// Progress callback
    fn report(&self, status: ProgressStatus, runner: &str);

    /// Cancelled when the build is interrupted
    fn cancellation(&self) -> &CancellationToken;
}

/// Context backed by the spawn's own input list
pub struct SimpleSpawnContext {
    inputs: Vec<ActionInput>,
    timeout: Duration,
    metadata: Arc<dyn MetadataProvider>,
    out_err: FileOutErr,
    cancellation: CancellationToken,
    progress: Mutex<Vec<(ProgressStatus, String)>>,
}

impl SimpleSpawnContext {
    /// Context for `spawn`, resolving file inputs with `metadata`
    #[must_use]
    pub fn for_spawn(spawn: &Spawn, metadata: Arc<dyn MetadataProvider>) -> Self {
        Self {
            inputs: spawn.inputs().to_vec(),
            timeout: spawn.timeout(),
            metadata,
            out_err: FileOutErr::new(),
            cancellation: CancellationToken::new(),
            progress: Mutex::new(Vec::new()),
        }
    }

    /// Use `token` for cancellation
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Override the timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Progress reports received so far
    #[must_use]
    pub fn progress(&self) -> Vec<(ProgressStatus, String)> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl SpawnExecutionContext for SimpleSpawnContext {
    fn input_mapping(&self) -> io::Result<BTreeMap<PathBuf, ActionInput>> {
        Ok(self
            .inputs
            .iter()
            .map(|input| (input.exec_path().to_path_buf(), input.clone()))
            .collect())
    }

    fn metadata_provider(&self) -> &dyn MetadataProvider {
        self.metadata.as_ref()
    }

    fn file_out_err(&self) -> &FileOutErr {
        &self.out_err
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn report(&self, status: ProgressStatus, runner: &str) {
        tracing::trace!(%status, runner, "progress");
        self.progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((status, runner.to_string()));
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

impl fmt::Debug for SimpleSpawnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleSpawnContext")
            .field("inputs", &self.inputs.len())
            .field("timeout", &self.timeout)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}
