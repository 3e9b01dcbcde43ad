//! Fakes shared by the unit tests of this crate.

use crate::context::SpawnExecutionContext;
use crate::error::SpawnError;
use crate::reporter::{Event, Reporter};
use crate::result::SpawnResult;
use crate::runner::SpawnRunner;
use crate::spawn::Spawn;
use async_trait::async_trait;
use bytes::Bytes;
use remex_core::{Digest, DigestUtil};
use remex_proto::{Action, ActionKey, ActionResult, Command, ExecuteRequest, ExecuteResponse};
use remex_remote::{
    InMemoryCas, OutputSink, RemoteActionCache, RemoteCache, RemoteError, RemoteExecutor, RemoteResult,
};
use remex_storage::MerkleTree;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Remote executor answering from a script
#[derive(Default)]
pub struct FakeExecutor {
    responses: Mutex<VecDeque<RemoteResult<ExecuteResponse>>>,
    requests: Mutex<Vec<ExecuteRequest>>,
}

impl FakeExecutor {
    /// Executor answering with `responses` in order, then with successes
    pub fn new(responses: Vec<RemoteResult<ExecuteResponse>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Executor that always reports `exit_code`
    pub fn exiting(exit_code: i32) -> Self {
        Self::new(vec![Ok(response(exit_code))])
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<ExecuteRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of execute calls
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn execute_remotely(&self, request: &ExecuteRequest) -> RemoteResult<ExecuteResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(response(0)))
    }
}

/// A successful response with `exit_code`
pub fn response(exit_code: i32) -> ExecuteResponse {
    ExecuteResponse {
        result: Some(ActionResult {
            exit_code,
            ..ActionResult::default()
        }),
        ..ExecuteResponse::default()
    }
}

/// Local runner returning a fixed result
pub struct FakeLocalRunner {
    name: String,
    result: SpawnResult,
    calls: AtomicUsize,
    delete_on_run: Option<PathBuf>,
    cancel_on_run: bool,
    writes: Vec<(PathBuf, Bytes)>,
}

impl FakeLocalRunner {
    /// Runner returning `result`
    pub fn new(result: SpawnResult) -> Self {
        Self {
            name: "local".to_string(),
            result,
            calls: AtomicUsize::new(0),
            delete_on_run: None,
            cancel_on_run: false,
            writes: Vec::new(),
        }
    }

    /// Runner that succeeds with exit code zero
    pub fn succeeding() -> Self {
        Self::new(SpawnResult::from_exit_code(0, "local"))
    }

    /// Rename the runner
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self.result.runner_name = name.to_string();
        self
    }

    /// Delete `path` while running, as a racing action would
    pub fn deleting(mut self, path: impl Into<PathBuf>) -> Self {
        self.delete_on_run = Some(path.into());
        self
    }

    /// Cancel the build while running
    pub fn cancelling(mut self) -> Self {
        self.cancel_on_run = true;
        self
    }

    /// Write `contents` to `path` while running
    pub fn writing(mut self, path: impl Into<PathBuf>, contents: &'static str) -> Self {
        self.writes.push((path.into(), Bytes::from_static(contents.as_bytes())));
        self
    }

    /// Number of exec calls
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpawnRunner for FakeLocalRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_exec(&self, _spawn: &Spawn) -> bool {
        true
    }

    async fn exec(&self, _spawn: &Spawn, ctx: &dyn SpawnExecutionContext) -> Result<SpawnResult, SpawnError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(path) = &self.delete_on_run {
            std::fs::remove_file(path)?;
        }
        for (path, contents) in &self.writes {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)?;
        }
        if self.cancel_on_run {
            ctx.cancellation().cancel();
        }
        Ok(self.result.clone())
    }
}

/// Reporter keeping every event
#[derive(Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<Event>>,
}

impl CollectingReporter {
    /// Events received so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Reporter for CollectingReporter {
    fn handle(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// In-memory cache with injectable failures
pub struct FaultyCache {
    inner: RemoteActionCache<InMemoryCas>,
    lookup_error: Mutex<Option<RemoteError>>,
    lookup_failures_left: AtomicUsize,
    upload_error: Mutex<Option<RemoteError>>,
    lookups: AtomicUsize,
    uploads: AtomicUsize,
    uploaded_keys: Mutex<Vec<ActionKey>>,
}

impl FaultyCache {
    /// Healthy cache over a fresh in-memory CAS
    pub fn new(util: DigestUtil) -> Self {
        Self {
            inner: RemoteActionCache::new(Arc::new(InMemoryCas::new()), util),
            lookup_error: Mutex::new(None),
            lookup_failures_left: AtomicUsize::new(usize::MAX),
            upload_error: Mutex::new(None),
            lookups: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            uploaded_keys: Mutex::new(Vec::new()),
        }
    }

    /// Fail every lookup with `err`
    pub fn failing_lookups(self, err: RemoteError) -> Self {
        *self.lookup_error.lock().unwrap() = Some(err);
        self
    }

    /// Fail the first `times` lookups with `err`, then serve normally
    pub fn failing_first_lookups(self, times: usize, err: RemoteError) -> Self {
        self.lookup_failures_left.store(times, Ordering::SeqCst);
        self.failing_lookups(err)
    }

    /// Fail every upload with `err`
    pub fn failing_uploads(self, err: RemoteError) -> Self {
        *self.upload_error.lock().unwrap() = Some(err);
        self
    }

    /// Backing transport
    pub fn cas(&self) -> &Arc<InMemoryCas> {
        self.inner.transport()
    }

    /// Number of lookups
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Number of upload calls, failed ones included
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Keys of successful uploads
    pub fn uploaded_keys(&self) -> Vec<ActionKey> {
        self.uploaded_keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteCache for FaultyCache {
    async fn get_cached_action_result(&self, key: &ActionKey) -> RemoteResult<Option<ActionResult>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let injected = self.lookup_error.lock().unwrap().clone();
        if let Some(err) = injected {
            let fail = self
                .lookup_failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                    0 => None,
                    usize::MAX => Some(usize::MAX),
                    n => Some(n - 1),
                })
                .is_ok();
            if fail {
                return Err(err);
            }
        }
        self.inner.get_cached_action_result(key).await
    }

    async fn download(&self, result: &ActionResult, exec_root: &Path, out_err: &dyn OutputSink) -> RemoteResult<()> {
        self.inner.download(result, exec_root, out_err).await
    }

    async fn download_file(&self, path: &Path, digest: &Digest) -> RemoteResult<()> {
        self.inner.download_file(path, digest).await
    }

    async fn ensure_inputs_present(
        &self,
        tree: &MerkleTree,
        additional: &HashMap<Digest, Bytes>,
        exec_root: &Path,
    ) -> RemoteResult<()> {
        self.inner.ensure_inputs_present(tree, additional, exec_root).await
    }

    async fn upload(
        &self,
        key: &ActionKey,
        action: &Action,
        command: &Command,
        exec_root: &Path,
        outputs: &[PathBuf],
        out_err: &dyn OutputSink,
    ) -> RemoteResult<ActionResult> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let injected = self.upload_error.lock().unwrap().clone();
        if let Some(err) = injected {
            return Err(err);
        }
        let result = self.inner.upload(key, action, command, exec_root, outputs, out_err).await?;
        self.uploaded_keys.lock().unwrap().push(key.clone());
        Ok(result)
    }
}
