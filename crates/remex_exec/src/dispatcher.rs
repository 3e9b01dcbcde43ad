//! Remote spawn dispatch.
//!
//! [`RemoteSpawnRunner`] decides per spawn where its result comes from:
//!
//! 1. Spawns that may not run remotely go straight to the local fallback.
//! 2. Cacheable spawns consult the remote cache. A hit with exit code zero
//!    is downloaded and returned. A hit with a non-zero exit code, or one
//!    whose blobs were evicted, is ignored and the cache is bypassed for the
//!    following execution.
//! 3. Without a remote executor the spawn runs locally and the result is
//!    uploaded.
//! 4. Otherwise inputs are uploaded and the action executed remotely under
//!    the retrier.
//! 5. Failures are classified once: interruptions propagate, recoverable
//!    failures fall back to local execution when enabled, everything else
//!    becomes a [`SpawnExecError`] carrying a concrete exit code.
//!
//! The only state shared between concurrent calls is the fallback runner
//! cell and the one-shot warning flags.

use crate::canonical::{prepare_action, PreparedAction};
use crate::context::{ProgressStatus, SpawnExecutionContext};
use crate::error::{SpawnError, SpawnExecError};
use crate::inputs::{input_ctimes, inputs_changed, materialize_param_files};
use crate::local::ProcessSpawnRunner;
use crate::options::RemoteOptions;
use crate::platform::parse_platform;
use crate::profile::ProfileScope;
use crate::reporter::{Event, Reporter, TracingReporter};
use crate::result::{SpawnResult, SpawnStatus, POSIX_TIMEOUT_EXIT_CODE, REMOTE_ERROR_EXIT_CODE};
use crate::runner::{FallbackRunnerCell, SpawnRunner, WarnOnce};
use crate::spawn::Spawn;
use async_trait::async_trait;
use bytes::Bytes;
use remex_core::{BuildRequestId, CommandId, Digest, DigestUtil, RequestMetadata};
use remex_proto::{ActionKey, ActionResult, ExecuteRequest, ExecuteResponse, ExecutionPolicy, ResultsCachePolicy};
use remex_remote::{
    ExecuteResponseExt, RemoteCache, RemoteError, RemoteErrorKind, RemoteExecutor, RemoteResult,
    Retrier, RetryableOperation,
};
use remex_storage::{ActionInput, MerkleTree};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

const RUNNER_NAME: &str = "remote";
const CACHE_HIT_RUNNER_NAME: &str = "remote cache hit";

const UPLOAD_FAILED_WARNING: &str = "Some artifacts failed to be uploaded to the remote cache.";
const SERVER_LOGS_FAILED_WARNING: &str = "Failed downloading server logs from the remote cache.";

/// Outcome of the cache phase
enum CacheLookup {
    /// Served from the cache
    Hit(SpawnResult),
    /// Nothing cached
    Miss,
    /// A cached result exists but must not be trusted
    Bypass,
}

/// Spawn runner backed by a remote cache and an optional remote executor
pub struct RemoteSpawnRunner {
    exec_root: PathBuf,
    options: RemoteOptions,
    digest_util: DigestUtil,
    cache: Arc<dyn RemoteCache>,
    executor: Option<Arc<dyn RemoteExecutor>>,
    fallback: Arc<FallbackRunnerCell>,
    reporter: Arc<dyn Reporter>,
    upload_warning: WarnOnce,
    server_log_warning: WarnOnce,
    build_request_id: BuildRequestId,
    command_id: CommandId,
}

impl RemoteSpawnRunner {
    /// Cache-only runner; the local fallback is a [`ProcessSpawnRunner`]
    /// created on first use
    #[must_use]
    pub fn new(exec_root: impl Into<PathBuf>, options: RemoteOptions, cache: Arc<dyn RemoteCache>) -> Self {
        let digest_util = DigestUtil::new(options.digest_function);
        Self {
            exec_root: exec_root.into(),
            options,
            digest_util,
            cache,
            executor: None,
            fallback: Arc::new(FallbackRunnerCell::empty()),
            reporter: Arc::new(TracingReporter),
            upload_warning: WarnOnce::new(),
            server_log_warning: WarnOnce::new(),
            build_request_id: BuildRequestId::new(),
            command_id: CommandId::new(),
        }
    }

    /// Execute remotely through `executor`
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn RemoteExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Use `runner` for local execution
    #[must_use]
    pub fn with_fallback(self, runner: Arc<dyn SpawnRunner>) -> Self {
        self.fallback.set(runner);
        self
    }

    /// Share a fallback cell with other runners
    #[must_use]
    pub fn with_fallback_cell(mut self, cell: Arc<FallbackRunnerCell>) -> Self {
        self.fallback = cell;
        self
    }

    /// Send user-facing events to `reporter`
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Tag remote calls with these ids
    #[must_use]
    pub fn with_request_ids(mut self, build_request_id: BuildRequestId, command_id: CommandId) -> Self {
        self.build_request_id = build_request_id;
        self.command_id = command_id;
        self
    }

    /// Options in use
    #[must_use]
    pub const fn options(&self) -> &RemoteOptions {
        &self.options
    }

    /// Fallback runner cell
    #[must_use]
    pub const fn fallback(&self) -> &Arc<FallbackRunnerCell> {
        &self.fallback
    }

    fn fallback_runner(&self) -> Arc<dyn SpawnRunner> {
        self.fallback
            .get_or_init(|| Arc::new(ProcessSpawnRunner::new(self.exec_root.clone())))
    }

    fn spawn_result(exit_code: i32, cache_hit: bool) -> SpawnResult {
        let runner = if cache_hit {
            CACHE_HIT_RUNNER_NAME
        } else {
            RUNNER_NAME
        };
        SpawnResult::from_exit_code(exit_code, runner).with_cache_hit(cache_hit)
    }

    async fn exec_prepared(
        &self,
        spawn: &Spawn,
        ctx: &dyn SpawnExecutionContext,
        inputs: &BTreeMap<PathBuf, ActionInput>,
        prepared: PreparedAction,
    ) -> Result<SpawnResult, SpawnError> {
        let cacheable = spawn.may_be_cached();
        let mut accept_cached = self.options.accept_cached && cacheable;
        let upload = self.options.upload_local_results && cacheable;

        if accept_cached {
            match self.lookup(&prepared, ctx).await {
                Ok(CacheLookup::Hit(result)) => return Ok(result),
                Ok(CacheLookup::Bypass) => accept_cached = false,
                Ok(CacheLookup::Miss) => {}
                Err(err) => {
                    return self
                        .exec_locally_and_upload_or_fail(spawn, ctx, inputs, &prepared, upload, err)
                        .await;
                }
            }
        }

        let Some(executor) = &self.executor else {
            return self.exec_locally_and_upload(spawn, ctx, inputs, &prepared, upload).await;
        };

        let request = ExecuteRequest {
            instance_name: self.options.instance_name.clone(),
            action_digest: prepared.key.digest().clone(),
            skip_cache_lookup: !accept_cached,
            results_cache_policy: (self.options.result_cache_priority != 0).then(|| ResultsCachePolicy {
                priority: self.options.result_cache_priority,
            }),
            execution_policy: (self.options.execution_priority != 0).then(|| ExecutionPolicy {
                priority: self.options.execution_priority,
            }),
        };

        let retrier = Retrier::new(self.options.retry.clone()).with_cancellation(ctx.cancellation().clone());
        let mut attempt = RemoteAttempt {
            runner: self,
            executor: executor.as_ref(),
            ctx,
            prepared: &prepared,
            request: &request,
            additional: prepared.additional_blobs(),
        };
        let outcome = {
            let scope = ProfileScope::new("remote.execute");
            retrier.execute(&mut attempt).instrument(scope.span().clone()).await
        };
        match outcome {
            Ok(result) => Ok(result),
            Err(err) => {
                self.exec_locally_and_upload_or_fail(spawn, ctx, inputs, &prepared, upload, err)
                    .await
            }
        }
    }

    async fn lookup(&self, prepared: &PreparedAction, ctx: &dyn SpawnExecutionContext) -> RemoteResult<CacheLookup> {
        let scope = ProfileScope::new("remote.cache_lookup");
        let retrier = Retrier::new(self.options.retry.clone()).with_cancellation(ctx.cancellation().clone());
        let mut attempt = LookupAttempt {
            cache: self.cache.as_ref(),
            key: &prepared.key,
        };
        let cached = retrier.execute(&mut attempt).instrument(scope.span().clone()).await?;
        let Some(result) = cached else {
            debug!("remote cache miss");
            return Ok(CacheLookup::Miss);
        };
        if result.exit_code != 0 {
            debug!(exit_code = result.exit_code, "ignoring cached failure");
            return Ok(CacheLookup::Bypass);
        }

        let download = {
            let scope = ProfileScope::new("remote.download");
            interruptible(
                ctx.cancellation(),
                self.cache.download(&result, &self.exec_root, ctx.file_out_err()),
            )
            .instrument(scope.span().clone())
            .await
        };
        match download {
            Ok(()) => {
                debug!("remote cache hit");
                Ok(CacheLookup::Hit(Self::spawn_result(result.exit_code, true)))
            }
            Err(err) if err.kind() == RemoteErrorKind::CacheNotFound => {
                debug!(error = %err, "cached outputs evicted");
                Ok(CacheLookup::Bypass)
            }
            Err(err) => Err(err),
        }
    }

    async fn exec_locally_and_upload_or_fail(
        &self,
        spawn: &Spawn,
        ctx: &dyn SpawnExecutionContext,
        inputs: &BTreeMap<PathBuf, ActionInput>,
        prepared: &PreparedAction,
        upload: bool,
        err: RemoteError,
    ) -> Result<SpawnResult, SpawnError> {
        if err.kind() == RemoteErrorKind::Interrupted || ctx.cancellation().is_cancelled() {
            return Err(SpawnError::Interrupted);
        }
        let fallback_eligible = !matches!(
            err.kind(),
            RemoteErrorKind::ExecutionTimeout | RemoteErrorKind::Unavailable
        );
        if self.options.local_fallback && fallback_eligible {
            warn!(error = %err, "remote execution failed, falling back to local execution");
            return self.exec_locally_and_upload(spawn, ctx, inputs, prepared, upload).await;
        }
        self.handle_error(err, &prepared.key, ctx).await
    }

    async fn handle_error(
        &self,
        err: RemoteError,
        key: &ActionKey,
        ctx: &dyn SpawnExecutionContext,
    ) -> Result<SpawnResult, SpawnError> {
        if let Some(response) = err.response() {
            self.maybe_download_server_logs(response, key, ctx).await;
            if let Some(result) = &response.result {
                let partial = interruptible(
                    ctx.cancellation(),
                    self.cache.download(result, &self.exec_root, ctx.file_out_err()),
                )
                .await;
                if let Err(e) = partial {
                    debug!(error = %e, "failed to download partial result");
                }
            }
        }

        if err.kind() == RemoteErrorKind::ExecutionTimeout {
            return Ok(SpawnResult::new(SpawnStatus::Timeout, POSIX_TIMEOUT_EXIT_CODE, RUNNER_NAME)
                .with_failure_message(err.message()));
        }

        let status = match err.kind() {
            RemoteErrorKind::Unavailable => SpawnStatus::ExecutionFailedCatastrophically,
            RemoteErrorKind::CacheNotFound => SpawnStatus::RemoteCacheFailed,
            _ => SpawnStatus::ExecutionFailed,
        };
        let message = if self.options.verbose_failures {
            err.detailed()
        } else {
            err.to_string()
        };
        warn!(status = %status, error = %err, "remote execution failed");
        Err(SpawnExecError {
            result: SpawnResult::new(status, REMOTE_ERROR_EXIT_CODE, RUNNER_NAME).with_failure_message(message.clone()),
            message,
        }
        .into())
    }

    async fn exec_locally_and_upload(
        &self,
        spawn: &Spawn,
        ctx: &dyn SpawnExecutionContext,
        inputs: &BTreeMap<PathBuf, ActionInput>,
        prepared: &PreparedAction,
        upload: bool,
    ) -> Result<SpawnResult, SpawnError> {
        let before = input_ctimes(&self.exec_root, inputs);
        let result = self.fallback_runner().exec(spawn, ctx).await?;
        if ctx.cancellation().is_cancelled() {
            return Err(SpawnError::Interrupted);
        }
        let after = input_ctimes(&self.exec_root, inputs);

        if !upload || !result.succeeded() {
            return Ok(result);
        }
        if inputs_changed(&before, &after) {
            debug!("inputs changed during local execution, not uploading");
            return Ok(result);
        }

        let outputs: Vec<PathBuf> = spawn.outputs().iter().map(|o| o.exec_path.clone()).collect();
        let scope = ProfileScope::new("remote.upload");
        let uploaded = interruptible(
            ctx.cancellation(),
            self.cache.upload(
                &prepared.key,
                &prepared.action,
                &prepared.command,
                &self.exec_root,
                &outputs,
                ctx.file_out_err(),
            ),
        )
        .instrument(scope.span().clone())
        .await;
        match uploaded {
            Ok(_) => debug!(outputs = outputs.len(), "uploaded local result"),
            Err(err) if err.kind() == RemoteErrorKind::Interrupted => return Err(SpawnError::Interrupted),
            Err(err) => self.report_upload_failure(&err),
        }
        Ok(result)
    }

    fn report_upload_failure(&self, err: &RemoteError) {
        if self.options.verbose_failures {
            self.reporter
                .handle(&Event::debug(format!("Upload to remote cache failed: {}", err.detailed())));
        } else if self.upload_warning.first() {
            self.reporter.handle(&Event::warning(UPLOAD_FAILED_WARNING));
        }
    }

    async fn maybe_download_server_logs(
        &self,
        response: &ExecuteResponse,
        key: &ActionKey,
        ctx: &dyn SpawnExecutionContext,
    ) {
        if !response.failed() {
            return;
        }
        let logs: Vec<(&str, &Digest)> = response
            .server_logs
            .iter()
            .filter(|(_, log)| log.human_readable)
            .map(|(name, log)| (name.as_str(), &log.digest))
            .collect();
        if logs.is_empty() {
            return;
        }

        let parent = self.exec_root.join(&self.options.server_log_dir).join(&key.digest().hash);
        let mut last = None;
        let mut count = 0usize;
        for (name, digest) in logs {
            let Some(name) = single_component(name) else {
                warn!(name, "ignoring server log with invalid name");
                continue;
            };
            let path = parent.join(name);
            match interruptible(ctx.cancellation(), self.cache.download_file(&path, digest)).await {
                Ok(()) => {
                    count += 1;
                    last = Some(path);
                }
                Err(err) => {
                    debug!(error = %err, "failed to download server log");
                    if self.server_log_warning.first() {
                        self.reporter.handle(&Event::warning(SERVER_LOGS_FAILED_WARNING));
                    }
                    break;
                }
            }
        }

        if self.options.verbose_failures && count > 0 {
            let location = if count > 1 { Some(parent) } else { last };
            if let Some(location) = location {
                self.reporter.handle(&Event::info(format!(
                    "Server logs of failing action:\n   {}",
                    location.display()
                )));
            }
        }
    }
}

#[async_trait]
impl SpawnRunner for RemoteSpawnRunner {
    fn name(&self) -> &str {
        RUNNER_NAME
    }

    fn can_exec(&self, spawn: &Spawn) -> bool {
        spawn.may_be_executed_remotely()
    }

    async fn exec(&self, spawn: &Spawn, ctx: &dyn SpawnExecutionContext) -> Result<SpawnResult, SpawnError> {
        if !self.can_exec(spawn) {
            return self.fallback_runner().exec(spawn, ctx).await;
        }
        if ctx.cancellation().is_cancelled() {
            return Err(SpawnError::Interrupted);
        }
        ctx.report(ProgressStatus::Executing, RUNNER_NAME);

        let inputs = ctx.input_mapping()?;
        let tree = {
            let _scope = ProfileScope::new("remote.merkle_tree");
            MerkleTree::build(&inputs, ctx.metadata_provider(), &self.digest_util)?
        };
        if self.options.materialize_param_files {
            materialize_param_files(&self.exec_root, spawn.inputs())?;
        }
        let platform = parse_platform(
            spawn.execution_platform(),
            &self.options.default_platform_properties,
        )?;
        let prepared = prepare_action(spawn, tree, platform, ctx.timeout(), &self.digest_util)?;

        let metadata = RequestMetadata::new(
            self.build_request_id,
            self.command_id,
            prepared.key.digest().hash.clone(),
        );
        let span = info_span!(
            "remote_spawn",
            mnemonic = spawn.mnemonic(),
            action = prepared.key.digest().short_hash(),
            build_request_id = %metadata.build_request_id,
            command_id = %metadata.command_id,
            tool = %metadata.tool_name,
        );
        self.exec_prepared(spawn, ctx, &inputs, prepared).instrument(span).await
    }
}

impl std::fmt::Debug for RemoteSpawnRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSpawnRunner")
            .field("exec_root", &self.exec_root)
            .field("remote_execution", &self.executor.is_some())
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

/// One action cache read
struct LookupAttempt<'a> {
    cache: &'a dyn RemoteCache,
    key: &'a ActionKey,
}

#[async_trait]
impl<'a> RetryableOperation for LookupAttempt<'a> {
    type Output = Option<ActionResult>;

    async fn attempt(&mut self) -> RemoteResult<Option<ActionResult>> {
        self.cache.get_cached_action_result(self.key).await
    }
}

/// One "upload inputs, execute, download outputs" round
struct RemoteAttempt<'a> {
    runner: &'a RemoteSpawnRunner,
    executor: &'a dyn RemoteExecutor,
    ctx: &'a dyn SpawnExecutionContext,
    prepared: &'a PreparedAction,
    request: &'a ExecuteRequest,
    additional: HashMap<Digest, Bytes>,
}

#[async_trait]
impl<'a> RetryableOperation for RemoteAttempt<'a> {
    type Output = SpawnResult;

    async fn attempt(&mut self) -> RemoteResult<SpawnResult> {
        let runner = self.runner;
        let out_err = self.ctx.file_out_err();

        runner
            .cache
            .ensure_inputs_present(&self.prepared.tree, &self.additional, &runner.exec_root)
            .await?;

        let response = self.executor.execute_remotely(self.request).await?;
        if response.failed() && !response.message.is_empty() {
            out_err.print_err(&format!("{}\n", response.message));
        }
        let response = response.into_result()?;

        runner.maybe_download_server_logs(&response, &self.prepared.key, self.ctx).await;

        let result = response.result.unwrap_or_default();
        runner.cache.download(&result, &runner.exec_root, out_err).await?;
        Ok(RemoteSpawnRunner::spawn_result(result.exit_code, response.cached_result))
    }
}

/// Race a remote call against cancellation
async fn interruptible<T>(
    token: &CancellationToken,
    call: impl Future<Output = RemoteResult<T>>,
) -> RemoteResult<T> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(RemoteError::interrupted()),
        outcome = call => outcome,
    }
}

fn single_component(name: &str) -> Option<&Path> {
    let path = Path::new(name);
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Some(path),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimpleSpawnContext;
    use crate::reporter::EventKind;
    use crate::spawn::{requirements, ActionOutput};
    use crate::testing::{response, CollectingReporter, FakeExecutor, FakeLocalRunner, FaultyCache};
    use remex_proto::{ActionResult, LogFile, OutputFile, Status, StatusCode};
    use remex_remote::{CasTransport, RetryPolicy};
    use remex_storage::FsMetadataProvider;

    struct Harness {
        dir: tempfile::TempDir,
        util: DigestUtil,
        cache: Arc<FaultyCache>,
        reporter: Arc<CollectingReporter>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_cache(|cache| cache)
        }

        fn with_cache(configure: impl FnOnce(FaultyCache) -> FaultyCache) -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("in.c"), "int main() { return 0; }").unwrap();
            let util = DigestUtil::default();
            Self {
                dir,
                util,
                cache: Arc::new(configure(FaultyCache::new(util))),
                reporter: Arc::new(CollectingReporter::default()),
            }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn spawn(&self) -> Spawn {
            Spawn::new(["cc", "-c", "in.c", "-o", "out.o"])
                .with_mnemonic("CppCompile")
                .with_input(ActionInput::file("in.c"))
                .with_output(ActionOutput::file("out.o"))
        }

        fn ctx(&self, spawn: &Spawn) -> SimpleSpawnContext {
            SimpleSpawnContext::for_spawn(spawn, Arc::new(FsMetadataProvider::new(self.root(), self.util)))
        }

        fn runner(&self, options: RemoteOptions, local: &Arc<FakeLocalRunner>) -> RemoteSpawnRunner {
            RemoteSpawnRunner::new(self.root(), options, self.cache.clone())
                .with_fallback(local.clone())
                .with_reporter(self.reporter.clone())
        }

        fn local_writing_output(&self) -> Arc<FakeLocalRunner> {
            Arc::new(FakeLocalRunner::succeeding().writing(self.root().join("out.o"), "local object"))
        }

        fn prepare(&self, spawn: &Spawn) -> PreparedAction {
            let ctx = self.ctx(spawn);
            let tree = MerkleTree::build(&ctx.input_mapping().unwrap(), ctx.metadata_provider(), &self.util).unwrap();
            prepare_action(spawn, tree, None, spawn.timeout(), &self.util).unwrap()
        }

        async fn seed(&self, spawn: &Spawn, exit_code: i32) -> (ActionKey, Digest) {
            let key = self.prepare(spawn).key;
            let object = self.cache.cas().blobs().put(&self.util, "cached object").unwrap();
            let result = ActionResult {
                exit_code,
                output_files: vec![OutputFile {
                    path: "out.o".to_string(),
                    digest: object.clone(),
                    is_executable: false,
                }],
                ..ActionResult::default()
            };
            self.cache.cas().update_action_result(&key, &result).await.unwrap();
            (key, object)
        }
    }

    fn options() -> RemoteOptions {
        RemoteOptions::default().with_retry(
            RetryPolicy::default()
                .with_max_attempts(3)
                .with_initial_backoff_ms(1)
                .with_jitter(0.0),
        )
    }

    fn exec_error(err: SpawnError) -> SpawnExecError {
        match err {
            SpawnError::Exec(e) => e,
            other => panic!("expected an execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ineligible_spawn_runs_locally() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::new(SpawnResult::from_exit_code(7, "local")));
        let executor = Arc::new(FakeExecutor::exiting(0));
        let runner = h.runner(options(), &local).with_executor(executor.clone());
        let spawn = h.spawn().with_tag(requirements::NO_REMOTE);

        assert!(!runner.can_exec(&spawn));
        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        assert_eq!(result, SpawnResult::from_exit_code(7, "local"));
        assert_eq!(local.calls(), 1);
        assert_eq!(executor.calls(), 0);
        assert_eq!(h.cache.lookups(), 0);
        assert_eq!(h.cache.uploads(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_execution() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::exiting(0));
        let runner = h.runner(options(), &local).with_executor(executor.clone());
        let spawn = h.spawn();
        h.seed(&spawn, 0).await;

        let ctx = h.ctx(&spawn);
        let result = runner.exec(&spawn, &ctx).await.unwrap();

        assert_eq!(result.status, SpawnStatus::Success);
        assert_eq!(result.exit_code, 0);
        assert!(result.cache_hit);
        assert_eq!(result.runner_name, "remote cache hit");
        assert_eq!(executor.calls(), 0);
        assert_eq!(local.calls(), 0);
        assert_eq!(std::fs::read_to_string(h.root().join("out.o")).unwrap(), "cached object");
        assert_eq!(ctx.progress(), vec![(ProgressStatus::Executing, "remote".to_string())]);
    }

    #[tokio::test]
    async fn test_failed_cache_hit_is_reexecuted() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::exiting(0));
        let runner = h.runner(options(), &local).with_executor(executor.clone());
        let spawn = h.spawn();
        h.seed(&spawn, 1).await;

        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        assert_eq!(result.exit_code, 0);
        assert!(!result.cache_hit);
        assert_eq!(result.runner_name, "remote");
        assert_eq!(executor.calls(), 1);
        assert!(executor.requests()[0].skip_cache_lookup);
        assert!(!h.root().join("out.o").exists());
    }

    #[tokio::test]
    async fn test_evicted_cache_hit_is_reexecuted() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::exiting(0));
        let runner = h.runner(options(), &local).with_executor(executor.clone());
        let spawn = h.spawn();
        let (_, object) = h.seed(&spawn, 0).await;
        assert!(h.cache.cas().evict(&object));

        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        assert!(!result.cache_hit);
        assert_eq!(executor.calls(), 1);
        assert!(executor.requests()[0].skip_cache_lookup);
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_execution_uploads_inputs_and_action() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::exiting(0));
        let runner = h
            .runner(options().with_instance_name("main"), &local)
            .with_executor(executor.clone());
        let spawn = h.spawn();
        let prepared = h.prepare(&spawn);

        runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        let request = &executor.requests()[0];
        assert_eq!(request.instance_name, "main");
        assert_eq!(&request.action_digest, prepared.key.digest());
        assert!(!request.skip_cache_lookup);
        assert!(request.results_cache_policy.is_none());
        assert!(request.execution_policy.is_none());

        let cas = h.cache.cas();
        let missing = cas
            .find_missing(&[
                prepared.key.digest().clone(),
                prepared.command_digest.clone(),
                prepared.tree.root_digest().clone(),
                h.util.compute(b"int main() { return 0; }"),
            ])
            .await
            .unwrap();
        assert!(missing.is_empty(), "missing after upload: {missing:?}");
    }

    #[tokio::test]
    async fn test_priorities_set_only_when_non_zero() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::exiting(0));
        let runner = h
            .runner(options().with_priorities(0, 5), &local)
            .with_executor(executor.clone());
        let spawn = h.spawn();

        runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        let request = &executor.requests()[0];
        assert!(request.results_cache_policy.is_none());
        assert_eq!(request.execution_policy, Some(ExecutionPolicy { priority: 5 }));
    }

    #[tokio::test]
    async fn test_no_executor_runs_locally_and_uploads() {
        let h = Harness::new();
        let local = h.local_writing_output();
        let runner = h.runner(options(), &local);
        let spawn = h.spawn();
        let key = h.prepare(&spawn).key;

        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        assert!(result.succeeded());
        assert_eq!(result.runner_name, "local");
        assert_eq!(local.calls(), 1);
        assert_eq!(h.cache.uploaded_keys(), vec![key.clone()]);
        let cached = h.cache.cas().get_action_result(&key).await.unwrap().unwrap();
        assert_eq!(cached.exit_code, 0);
        assert_eq!(cached.output_files.len(), 1);
        assert_eq!(cached.output_files[0].path, "out.o");
    }

    #[tokio::test]
    async fn test_upload_disabled() {
        let h = Harness::new();
        let local = h.local_writing_output();
        let runner = h.runner(options().with_upload_local_results(false), &local);
        let spawn = h.spawn();

        runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();
        assert_eq!(h.cache.uploads(), 0);
    }

    #[tokio::test]
    async fn test_failed_local_run_is_not_uploaded() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::new(SpawnResult::from_exit_code(1, "local")));
        let runner = h.runner(options(), &local);
        let spawn = h.spawn();

        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();
        assert_eq!(result.exit_code, 1);
        assert_eq!(h.cache.uploads(), 0);
    }

    #[tokio::test]
    async fn test_input_change_skips_upload() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding().deleting(h.root().join("in.c")));
        let runner = h.runner(options(), &local);
        let spawn = h.spawn();

        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        assert_eq!(result, SpawnResult::from_exit_code(0, "local"));
        assert_eq!(h.cache.uploads(), 0);
    }

    #[tokio::test]
    async fn test_input_rewritten_in_place_skips_upload() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding().writing(h.root().join("in.c"), "int main() { return 42; }"));
        let runner = h.runner(options(), &local);
        let spawn = h.spawn();

        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        assert_eq!(result, SpawnResult::from_exit_code(0, "local"));
        assert!(h.root().join("in.c").exists());
        assert_eq!(h.cache.uploads(), 0);
    }

    #[tokio::test]
    async fn test_uncacheable_spawn_skips_cache() {
        let h = Harness::new();
        let local = h.local_writing_output();
        let executor = Arc::new(FakeExecutor::exiting(0));
        let spawn = h.spawn().with_tag(requirements::NO_CACHE);

        let remote = h.runner(options(), &local).with_executor(executor.clone());
        remote.exec(&spawn, &h.ctx(&spawn)).await.unwrap();
        assert_eq!(h.cache.lookups(), 0);
        assert!(executor.requests()[0].skip_cache_lookup);

        let cache_only = h.runner(options(), &local);
        cache_only.exec(&spawn, &h.ctx(&spawn)).await.unwrap();
        assert_eq!(h.cache.uploads(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_never_falls_back() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::new(vec![
            Err(RemoteError::unavailable("cluster down")),
            Err(RemoteError::unavailable("cluster down")),
            Err(RemoteError::unavailable("cluster down")),
        ]));
        let runner = h
            .runner(options().with_local_fallback(true), &local)
            .with_executor(executor.clone());
        let spawn = h.spawn();

        let err = exec_error(runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap_err());

        assert_eq!(err.result.status, SpawnStatus::ExecutionFailedCatastrophically);
        assert_eq!(err.result.exit_code, REMOTE_ERROR_EXIT_CODE);
        assert_eq!(executor.calls(), 3);
        assert_eq!(local.calls(), 0);
        assert_eq!(h.cache.uploads(), 0);
    }

    #[tokio::test]
    async fn test_remote_timeout_maps_to_posix_code() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::new(vec![Ok(ExecuteResponse {
            status: Status::new(StatusCode::DeadlineExceeded, "took too long"),
            ..ExecuteResponse::default()
        })]));
        let runner = h
            .runner(options().with_local_fallback(true), &local)
            .with_executor(executor.clone());
        let spawn = h.spawn().with_timeout(std::time::Duration::from_secs(5));

        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        assert_eq!(result.status, SpawnStatus::Timeout);
        assert_eq!(result.exit_code, POSIX_TIMEOUT_EXIT_CODE);
        assert_eq!(result.exit_code, 142);
        assert_eq!(executor.calls(), 1);
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_falls_back_when_enabled() {
        let h = Harness::new();
        let local = h.local_writing_output();
        let executor = Arc::new(FakeExecutor::new(vec![
            Err(RemoteError::transient("connection reset")),
            Err(RemoteError::transient("connection reset")),
            Err(RemoteError::transient("connection reset")),
        ]));
        let runner = h
            .runner(options().with_local_fallback(true), &local)
            .with_executor(executor.clone());
        let spawn = h.spawn();

        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        assert_eq!(result.runner_name, "local");
        assert_eq!(executor.calls(), 3);
        assert_eq!(local.calls(), 1);
        assert_eq!(h.cache.uploads(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_retry() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::new(vec![
            Err(RemoteError::transient("connection reset")),
            Ok(response(0)),
        ]));
        let runner = h.runner(options(), &local).with_executor(executor.clone());
        let spawn = h.spawn();

        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();
        assert_eq!(result.runner_name, "remote");
        assert_eq!(executor.calls(), 2);
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn test_fatal_failure_without_fallback() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::new(vec![Err(RemoteError::fatal("bad request"))]));
        let runner = h.runner(options(), &local).with_executor(executor.clone());
        let spawn = h.spawn();

        let err = exec_error(runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap_err());

        assert_eq!(err.message, "Remote fatal error: bad request");
        assert_eq!(err.result.status, SpawnStatus::ExecutionFailed);
        assert_eq!(err.result.exit_code, REMOTE_ERROR_EXIT_CODE);
        assert_eq!(err.result.runner_name, "remote");
        assert_eq!(executor.calls(), 1);
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn test_verbose_failure_carries_details() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::new(vec![Ok(ExecuteResponse {
            status: Status::new(StatusCode::InvalidArgument, "no such platform"),
            message: "check your platform properties".to_string(),
            ..ExecuteResponse::default()
        })]));
        let runner = h
            .runner(options().with_verbose_failures(true), &local)
            .with_executor(executor.clone());
        let spawn = h.spawn();
        let ctx = h.ctx(&spawn);

        let err = exec_error(runner.exec(&spawn, &ctx).await.unwrap_err());

        assert!(err.message.contains("status: InvalidArgument"));
        assert!(err.message.contains("server message: check your platform properties"));
        assert_eq!(ctx.file_out_err().stderr_string(), "check your platform properties\n");
    }

    #[tokio::test]
    async fn test_lookup_error_falls_back_when_enabled() {
        let h = Harness::with_cache(|c| c.failing_lookups(RemoteError::transient("flaky cache")));
        let local = h.local_writing_output();
        let executor = Arc::new(FakeExecutor::exiting(0));
        let runner = h
            .runner(options().with_local_fallback(true), &local)
            .with_executor(executor.clone());
        let spawn = h.spawn();

        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        assert_eq!(result.runner_name, "local");
        assert_eq!(executor.calls(), 0);
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_lookup_failure_retried_to_hit() {
        let h = Harness::with_cache(|c| c.failing_first_lookups(1, RemoteError::transient("flaky cache")));
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::exiting(0));
        let runner = h.runner(options(), &local).with_executor(executor.clone());
        let spawn = h.spawn();
        h.seed(&spawn, 0).await;

        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        assert!(result.cache_hit);
        assert_eq!(result.runner_name, "remote cache hit");
        assert_eq!(h.cache.lookups(), 2);
        assert_eq!(executor.calls(), 0);
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn test_lookup_retries_exhausted_without_fallback() {
        let h = Harness::with_cache(|c| c.failing_lookups(RemoteError::transient("flaky cache")));
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::exiting(0));
        let runner = h.runner(options(), &local).with_executor(executor.clone());
        let spawn = h.spawn();

        let err = exec_error(runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap_err());

        assert_eq!(err.result.status, SpawnStatus::ExecutionFailed);
        assert_eq!(h.cache.lookups(), 3);
        assert_eq!(executor.calls(), 0);
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_failure_without_fallback() {
        let util = DigestUtil::default();
        let h = Harness::with_cache(|c| c.failing_lookups(RemoteError::cache_not_found(&util.compute(b"gone"))));
        let local = Arc::new(FakeLocalRunner::succeeding());
        let runner = h.runner(options(), &local);
        let spawn = h.spawn();

        let err = exec_error(runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap_err());

        assert_eq!(err.result.status, SpawnStatus::RemoteCacheFailed);
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_before_start() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::exiting(0));
        let runner = h
            .runner(options().with_local_fallback(true), &local)
            .with_executor(executor.clone());
        let spawn = h.spawn();
        let ctx = h.ctx(&spawn);
        ctx.cancellation().cancel();

        let err = runner.exec(&spawn, &ctx).await.unwrap_err();

        assert!(matches!(err, SpawnError::Interrupted));
        assert!(ctx.progress().is_empty());
        assert_eq!(h.cache.lookups(), 0);
        assert_eq!(executor.calls(), 0);
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn test_interrupted_remote_call_skips_fallback() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::new(vec![Err(RemoteError::interrupted())]));
        let runner = h
            .runner(options().with_local_fallback(true), &local)
            .with_executor(executor.clone());
        let spawn = h.spawn();

        let err = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap_err();

        assert!(matches!(err, SpawnError::Interrupted));
        assert_eq!(local.calls(), 0);
        assert_eq!(h.cache.uploads(), 0);
    }

    #[tokio::test]
    async fn test_interrupt_during_local_run_skips_upload() {
        let h = Harness::new();
        let local = Arc::new(
            FakeLocalRunner::succeeding()
                .writing(h.root().join("out.o"), "partial")
                .cancelling(),
        );
        let runner = h.runner(options(), &local);
        let spawn = h.spawn();

        let err = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap_err();

        assert!(matches!(err, SpawnError::Interrupted));
        assert_eq!(local.calls(), 1);
        assert_eq!(h.cache.uploads(), 0);
    }

    #[tokio::test]
    async fn test_upload_failure_warns_once() {
        let h = Harness::with_cache(|c| c.failing_uploads(RemoteError::transient("disk full")));
        let local = h.local_writing_output();
        let runner = h.runner(options(), &local);
        let spawn = h.spawn();

        for _ in 0..2 {
            let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();
            assert!(result.succeeded());
        }

        assert_eq!(h.cache.uploads(), 2);
        assert_eq!(h.reporter.events(), vec![Event::warning(UPLOAD_FAILED_WARNING)]);
    }

    #[tokio::test]
    async fn test_upload_failure_verbose_is_reported_each_time() {
        let h = Harness::with_cache(|c| c.failing_uploads(RemoteError::transient("disk full")));
        let local = h.local_writing_output();
        let runner = h.runner(options().with_verbose_failures(true), &local);
        let spawn = h.spawn();

        for _ in 0..2 {
            runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();
        }

        let events = h.reporter.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::Debug
            && e.message.starts_with("Upload to remote cache failed: ")
            && e.message.contains("disk full")));
    }

    #[tokio::test]
    async fn test_failed_action_downloads_server_logs() {
        let h = Harness::new();
        let log = h.cache.cas().blobs().put(&h.util, "worker ran out of memory").unwrap();
        let skipped = h.cache.cas().blobs().put(&h.util, "binary profile").unwrap();
        let mut failed = response(1);
        failed.message = "compilation failed".to_string();
        failed.server_logs.insert(
            "worker.log".to_string(),
            LogFile {
                digest: log,
                human_readable: true,
            },
        );
        failed.server_logs.insert(
            "profile.bin".to_string(),
            LogFile {
                digest: skipped,
                human_readable: false,
            },
        );
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::new(vec![Ok(failed)]));
        let runner = h
            .runner(options().with_verbose_failures(true), &local)
            .with_executor(executor.clone());
        let spawn = h.spawn();
        let key = h.prepare(&spawn).key;
        let ctx = h.ctx(&spawn);

        let result = runner.exec(&spawn, &ctx).await.unwrap();

        assert_eq!(result.status, SpawnStatus::NonZeroExit);
        assert_eq!(result.exit_code, 1);
        assert_eq!(ctx.file_out_err().stderr_string(), "compilation failed\n");

        let log_dir = h.root().join(".remex/server-logs").join(&key.digest().hash);
        let log_path = log_dir.join("worker.log");
        assert_eq!(std::fs::read_to_string(&log_path).unwrap(), "worker ran out of memory");
        assert!(!log_dir.join("profile.bin").exists());
        assert_eq!(
            h.reporter.events(),
            vec![Event::info(format!(
                "Server logs of failing action:\n   {}",
                log_path.display()
            ))]
        );
    }

    #[tokio::test]
    async fn test_successful_action_skips_server_logs() {
        let h = Harness::new();
        let log = h.cache.cas().blobs().put(&h.util, "all good").unwrap();
        let mut ok = response(0);
        ok.server_logs.insert(
            "worker.log".to_string(),
            LogFile {
                digest: log,
                human_readable: true,
            },
        );
        let local = Arc::new(FakeLocalRunner::succeeding());
        let runner = h
            .runner(options().with_verbose_failures(true), &local)
            .with_executor(Arc::new(FakeExecutor::new(vec![Ok(ok)])));
        let spawn = h.spawn();

        runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();
        assert!(!h.root().join(".remex").exists());
        assert!(h.reporter.events().is_empty());
    }

    #[tokio::test]
    async fn test_missing_server_log_warns_once() {
        let h = Harness::new();
        let mut failed = response(2);
        failed.server_logs.insert(
            "worker.log".to_string(),
            LogFile {
                digest: h.util.compute(b"never uploaded"),
                human_readable: true,
            },
        );
        let local = Arc::new(FakeLocalRunner::succeeding());
        let executor = Arc::new(FakeExecutor::new(vec![Ok(failed.clone()), Ok(failed)]));
        let runner = h.runner(options(), &local).with_executor(executor);
        let spawn = h.spawn().with_tag(requirements::NO_CACHE);

        for _ in 0..2 {
            let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();
            assert_eq!(result.exit_code, 2);
        }
        assert_eq!(h.reporter.events(), vec![Event::warning(SERVER_LOGS_FAILED_WARNING)]);
    }

    #[tokio::test]
    async fn test_missing_input_is_io_error() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let runner = h.runner(options(), &local);
        let spawn = h.spawn().with_input(ActionInput::file("absent.h"));

        let err = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap_err();
        assert!(matches!(err, SpawnError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn test_bad_default_platform_is_user_error() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let runner = h.runner(options().with_default_platform_properties("properties {"), &local);
        let spawn = h.spawn();

        let err = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap_err();
        assert!(matches!(err, SpawnError::User { .. }));
    }

    #[tokio::test]
    async fn test_param_files_materialized() {
        let h = Harness::new();
        let local = Arc::new(FakeLocalRunner::succeeding());
        let runner = h.runner(options().with_materialize_param_files(true), &local);
        let spawn = h.spawn().with_input(ActionInput::Virtual(
            remex_storage::VirtualActionInput::param_file("cc.params", "-O2\n"),
        ));

        runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();
        assert_eq!(std::fs::read_to_string(h.root().join("cc.params")).unwrap(), "-O2\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fallback_runner_created_lazily() {
        let h = Harness::new();
        let runner = RemoteSpawnRunner::new(h.root(), options(), h.cache.clone());
        assert!(runner.fallback().get().is_none());
        let spawn = Spawn::new(["/bin/sh", "-c", "exit 0"]).with_tag(requirements::LOCAL);

        let result = runner.exec(&spawn, &h.ctx(&spawn)).await.unwrap();

        assert!(result.succeeded());
        assert_eq!(runner.fallback().get().unwrap().name(), "local");
    }

    #[test]
    fn test_single_component_names() {
        assert!(single_component("worker.log").is_some());
        assert!(single_component("../escape").is_none());
        assert!(single_component("a/b").is_none());
        assert!(single_component("/abs").is_none());
        assert!(single_component("").is_none());
    }
}
