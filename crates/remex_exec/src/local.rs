//! Local process runner.

use crate::context::{ProgressStatus, SpawnExecutionContext};
use crate::error::SpawnError;
use crate::result::{SpawnResult, SpawnStatus, POSIX_TIMEOUT_EXIT_CODE};
use crate::runner::SpawnRunner;
use crate::spawn::{OutputKind, Spawn};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::{debug, warn};

const RUNNER_NAME: &str = "local";

/// Exit code when the process could not be started
const COMMAND_NOT_FOUND_EXIT_CODE: i32 = 127;

/// Runs spawns as child processes inside the exec root
#[derive(Debug, Clone)]
pub struct ProcessSpawnRunner {
    exec_root: PathBuf,
}

impl ProcessSpawnRunner {
    /// Runner executing in `exec_root`
    #[must_use]
    pub fn new(exec_root: impl Into<PathBuf>) -> Self {
        Self {
            exec_root: exec_root.into(),
        }
    }

    /// Exec root
    #[must_use]
    pub fn exec_root(&self) -> &Path {
        &self.exec_root
    }

    async fn prepare_outputs(&self, spawn: &Spawn) -> Result<(), SpawnError> {
        for output in spawn.outputs() {
            let path = self.exec_root.join(&output.exec_path);
            let dir = match output.kind {
                OutputKind::File => path.parent().map(Path::to_path_buf),
                OutputKind::Directory => Some(path),
            };
            if let Some(dir) = dir {
                tokio::fs::create_dir_all(&dir).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SpawnRunner for ProcessSpawnRunner {
    fn name(&self) -> &str {
        RUNNER_NAME
    }

    fn can_exec(&self, _spawn: &Spawn) -> bool {
        true
    }

    async fn exec(&self, spawn: &Spawn, ctx: &dyn SpawnExecutionContext) -> Result<SpawnResult, SpawnError> {
        let Some((program, args)) = spawn.arguments().split_first() else {
            return Err(SpawnError::user("spawn has an empty argument vector"));
        };
        if ctx.cancellation().is_cancelled() {
            return Err(SpawnError::Interrupted);
        }
        ctx.report(ProgressStatus::Executing, RUNNER_NAME);
        self.prepare_outputs(spawn).await?;

        let child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(spawn.environment())
            .current_dir(&self.exec_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %program, error = %e, "failed to start process");
                return Ok(SpawnResult::new(
                    SpawnStatus::ExecutionFailed,
                    COMMAND_NOT_FOUND_EXIT_CODE,
                    RUNNER_NAME,
                )
                .with_failure_message(format!("failed to start {program}: {e}")));
            }
        };

        let timeout = ctx.timeout();
        let deadline = async {
            if timeout.is_zero() {
                std::future::pending::<()>().await;
            } else {
                tokio::time::sleep(timeout).await;
            }
        };

        // Dropping the wait future kills the child.
        let output = tokio::select! {
            biased;
            () = ctx.cancellation().cancelled() => return Err(SpawnError::Interrupted),
            () = deadline => {
                debug!(program = %program, timeout_s = timeout.as_secs(), "process timed out");
                return Ok(SpawnResult::new(SpawnStatus::Timeout, POSIX_TIMEOUT_EXIT_CODE, RUNNER_NAME)
                    .with_failure_message(format!("timed out after {}s", timeout.as_secs())));
            }
            output = child.wait_with_output() => output?,
        };

        let out_err = ctx.file_out_err();
        out_err.write_out(&output.stdout);
        out_err.write_err(&output.stderr);

        let exit_code = exit_code(output.status);
        debug!(program = %program, exit_code, "process finished");
        Ok(SpawnResult::from_exit_code(exit_code, RUNNER_NAME))
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}
