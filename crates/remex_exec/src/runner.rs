//! Spawn runner seam and the state shared between concurrent `exec` calls.

use crate::context::SpawnExecutionContext;
use crate::error::SpawnError;
use crate::result::SpawnResult;
use crate::spawn::Spawn;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Something that can execute a spawn
#[async_trait]
pub trait SpawnRunner: Send + Sync {
    /// Runner name used in results and progress reports
    fn name(&self) -> &str;

    /// Whether this runner can execute `spawn`
    fn can_exec(&self, spawn: &Spawn) -> bool;

    /// Execute `spawn`
    ///
    /// # Errors
    ///
    /// Returns `SpawnError::Exec` for unrecoverable action failures,
    /// `SpawnError::Interrupted` on cancellation and `SpawnError::Io` for
    /// local infrastructure failures
    async fn exec(&self, spawn: &Spawn, ctx: &dyn SpawnExecutionContext) -> Result<SpawnResult, SpawnError>;
}

/// Lazily initialised reference to the local fallback runner
///
/// Shared by every concurrent `exec` call of one dispatcher. Updates go
/// through [`compare_and_set`](Self::compare_and_set) or
/// [`get_or_init`](Self::get_or_init) so that racing initialisers agree on a
/// single runner.
#[derive(Default)]
pub struct FallbackRunnerCell {
    runner: RwLock<Option<Arc<dyn SpawnRunner>>>,
}

impl FallbackRunnerCell {
    /// Cell holding `runner`
    #[must_use]
    pub fn new(runner: Arc<dyn SpawnRunner>) -> Self {
        Self {
            runner: RwLock::new(Some(runner)),
        }
    }

    /// Cell with no runner yet
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Current runner
    #[must_use]
    pub fn get(&self) -> Option<Arc<dyn SpawnRunner>> {
        self.runner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the runner unconditionally
    pub fn set(&self, runner: Arc<dyn SpawnRunner>) {
        *self.runner.write().unwrap_or_else(PoisonError::into_inner) = Some(runner);
    }

    /// Install `new` only if the current runner is `expected`
    ///
    /// Identity is pointer identity. Returns whether the swap happened.
    pub fn compare_and_set(&self, expected: Option<&Arc<dyn SpawnRunner>>, new: Arc<dyn SpawnRunner>) -> bool {
        let mut slot = self.runner.write().unwrap_or_else(PoisonError::into_inner);
        let matches = match (slot.as_ref(), expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => Arc::ptr_eq(current, expected),
            _ => false,
        };
        if matches {
            *slot = Some(new);
        }
        matches
    }

    /// Current runner, installing the one built by `init` if there is none
    ///
    /// `init` runs at most once per successful installation; a racing
    /// caller that loses gets the winner's runner.
    pub fn get_or_init<F>(&self, init: F) -> Arc<dyn SpawnRunner>
    where
        F: FnOnce() -> Arc<dyn SpawnRunner>,
    {
        if let Some(runner) = self.get() {
            return runner;
        }
        let mut slot = self.runner.write().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some(runner) => Arc::clone(runner),
            None => {
                let runner = init();
                *slot = Some(Arc::clone(&runner));
                runner
            }
        }
    }
}

impl std::fmt::Debug for FallbackRunnerCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self.get().map(|r| r.name().to_string());
        f.debug_struct("FallbackRunnerCell").field("runner", &name).finish()
    }
}

/// One-shot flag; the first caller of [`first`](Self::first) wins
#[derive(Debug, Default)]
pub struct WarnOnce {
    fired: AtomicBool,
}

impl WarnOnce {
    /// Unfired flag
    #[must_use]
    pub const fn new() -> Self {
        Self {
            fired: AtomicBool::new(false),
        }
    }

    /// True exactly once across all threads
    pub fn first(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the flag has fired
    #[must_use]
    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
