//! Remote action cache client.

use crate::error::{RemoteError, RemoteErrorKind, RemoteResult};
use crate::transport::CasTransport;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, TryStreamExt};
use remex_core::{Digest, DigestUtil};
use remex_proto::{
    Action, ActionKey, ActionResult, CanonicalDecode, CanonicalEncode, Command, Directory,
    OutputDirectory, OutputFile, Tree,
};
use remex_storage::{MerkleError, MerkleTree, TreeInput};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

const UPLOAD_CONCURRENCY: usize = 8;

/// Destination for an action's stdout and stderr
pub trait OutputSink: Send + Sync {
    /// Append to stdout
    ///
    /// # Errors
    ///
    /// Returns error if the sink cannot be written
    fn write_stdout(&self, data: &[u8]) -> io::Result<()>;

    /// Append to stderr
    ///
    /// # Errors
    ///
    /// Returns error if the sink cannot be written
    fn write_stderr(&self, data: &[u8]) -> io::Result<()>;

    /// Everything written to stdout so far
    fn stdout(&self) -> Bytes;

    /// Everything written to stderr so far
    fn stderr(&self) -> Bytes;
}

/// Cache operations the dispatcher relies on
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Look up a cached result
    ///
    /// # Errors
    ///
    /// Returns error if the lookup fails; a miss is `Ok(None)`
    async fn get_cached_action_result(&self, key: &ActionKey) -> RemoteResult<Option<ActionResult>>;

    /// Materialise a result's outputs under `exec_root` and its stdout and
    /// stderr into `out_err`
    ///
    /// Every blob is fetched before anything is written, so a missing blob
    /// leaves the exec root untouched.
    ///
    /// # Errors
    ///
    /// Returns a `CacheNotFound` error if a referenced blob is gone
    async fn download(&self, result: &ActionResult, exec_root: &Path, out_err: &dyn OutputSink) -> RemoteResult<()>;

    /// Download a single blob to `path`
    ///
    /// # Errors
    ///
    /// Returns error if the blob is missing or cannot be written
    async fn download_file(&self, path: &Path, digest: &Digest) -> RemoteResult<()>;

    /// Upload every blob of `tree` and `additional` the server is missing
    ///
    /// # Errors
    ///
    /// Returns error if an input cannot be read or uploaded
    async fn ensure_inputs_present(
        &self,
        tree: &MerkleTree,
        additional: &HashMap<Digest, Bytes>,
        exec_root: &Path,
    ) -> RemoteResult<()>;

    /// Upload the outputs of a successful local run and record the result
    /// under `key`
    ///
    /// Declared outputs that were not produced are skipped.
    ///
    /// # Errors
    ///
    /// Returns error if an output cannot be read or uploaded
    async fn upload(
        &self,
        key: &ActionKey,
        action: &Action,
        command: &Command,
        exec_root: &Path,
        outputs: &[PathBuf],
        out_err: &dyn OutputSink,
    ) -> RemoteResult<ActionResult>;
}

/// [`RemoteCache`] over any [`CasTransport`]
pub struct RemoteActionCache<T: CasTransport> {
    transport: Arc<T>,
    digest_util: DigestUtil,
}

impl<T: CasTransport> RemoteActionCache<T> {
    /// Create a cache client
    #[must_use]
    pub const fn new(transport: Arc<T>, digest_util: DigestUtil) -> Self {
        Self {
            transport,
            digest_util,
        }
    }

    /// The underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    async fn fetch(&self, digest: &Digest) -> RemoteResult<Bytes> {
        if digest.size_bytes == 0 {
            return Ok(Bytes::new());
        }
        let data = self
            .transport
            .download_blob(digest)
            .await?
            .ok_or_else(|| RemoteError::cache_not_found(digest))?;
        if !self.digest_util.verify(digest, &data) {
            return Err(RemoteError::new(
                RemoteErrorKind::CacheNotFound,
                format!("Corrupt blob: {digest}"),
            ));
        }
        Ok(data)
    }

    async fn input_blob(
        &self,
        tree: &MerkleTree,
        additional: &HashMap<Digest, Bytes>,
        exec_root: &Path,
        digest: &Digest,
    ) -> RemoteResult<Bytes> {
        if let Some(bytes) = tree.directory_bytes(digest) {
            return Ok(bytes.clone());
        }
        if let Some(bytes) = additional.get(digest) {
            return Ok(bytes.clone());
        }
        match tree.input(digest) {
            Some(TreeInput::Bytes(bytes)) => Ok(bytes.clone()),
            Some(TreeInput::File(path)) => {
                let full = exec_root.join(path);
                let data = tokio::fs::read(&full)
                    .await
                    .map_err(|e| RemoteError::from_io(format!("read {}", full.display()), e))?;
                Ok(Bytes::from(data))
            }
            None => Err(RemoteError::fatal(format!("No source for missing blob {digest}"))),
        }
    }

    async fn collect_tree(
        &self,
        root: &Path,
        tree: &Tree,
        files: &mut Vec<PendingFile>,
        dirs: &mut Vec<PathBuf>,
    ) -> RemoteResult<()> {
        let mut children = HashMap::new();
        for child in &tree.children {
            let (digest, _) = child.digest_with(&self.digest_util)?;
            children.insert(digest, child);
        }

        let mut stack: Vec<(PathBuf, &Directory)> = vec![(root.to_path_buf(), &tree.root)];
        while let Some((path, dir)) = stack.pop() {
            dirs.push(path.clone());
            for file in &dir.files {
                files.push(PendingFile {
                    path: path.join(checked_name(&file.name)?),
                    data: self.fetch(&file.digest).await?,
                    is_executable: file.is_executable,
                });
            }
            for sub in &dir.directories {
                let child = children.get(&sub.digest).ok_or_else(|| {
                    RemoteError::fatal(format!("Tree is missing directory {}", sub.digest))
                })?;
                stack.push((path.join(checked_name(&sub.name)?), *child));
            }
        }
        Ok(())
    }
}

struct PendingFile {
    path: PathBuf,
    data: Bytes,
    is_executable: bool,
}

#[async_trait]
impl<T: CasTransport> RemoteCache for RemoteActionCache<T> {
    async fn get_cached_action_result(&self, key: &ActionKey) -> RemoteResult<Option<ActionResult>> {
        self.transport.get_action_result(key).await
    }

    #[instrument(skip_all, fields(outputs = result.output_files.len() + result.output_directories.len()))]
    async fn download(&self, result: &ActionResult, exec_root: &Path, out_err: &dyn OutputSink) -> RemoteResult<()> {
        let mut files = Vec::with_capacity(result.output_files.len());
        let mut dirs = Vec::new();

        for output in &result.output_files {
            files.push(PendingFile {
                path: exec_root.join(checked_relative(&output.path)?),
                data: self.fetch(&output.digest).await?,
                is_executable: output.is_executable,
            });
        }
        for output in &result.output_directories {
            let bytes = self.fetch(&output.tree_digest).await?;
            let tree = Tree::decode(&bytes)?;
            let root = exec_root.join(checked_relative(&output.path)?);
            self.collect_tree(&root, &tree, &mut files, &mut dirs).await?;
        }
        let stdout = match &result.stdout_digest {
            Some(d) => Some(self.fetch(d).await?),
            None => None,
        };
        let stderr = match &result.stderr_digest {
            Some(d) => Some(self.fetch(d).await?),
            None => None,
        };

        for dir in &dirs {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| RemoteError::from_io(format!("create {}", dir.display()), e))?;
        }
        for file in files {
            write_file(&file.path, &file.data, file.is_executable).await?;
        }
        if let Some(data) = stdout {
            out_err
                .write_stdout(&data)
                .map_err(|e| RemoteError::from_io("write stdout", e))?;
        }
        if let Some(data) = stderr {
            out_err
                .write_stderr(&data)
                .map_err(|e| RemoteError::from_io("write stderr", e))?;
        }
        debug!("downloaded action outputs");
        Ok(())
    }

    async fn download_file(&self, path: &Path, digest: &Digest) -> RemoteResult<()> {
        let data = self.fetch(digest).await?;
        write_file(path, &data, false).await
    }

    #[instrument(skip_all, fields(root = %tree.root_digest()))]
    async fn ensure_inputs_present(
        &self,
        tree: &MerkleTree,
        additional: &HashMap<Digest, Bytes>,
        exec_root: &Path,
    ) -> RemoteResult<()> {
        let mut digests = tree.all_digests();
        digests.extend(additional.keys().cloned());
        digests.sort();
        digests.dedup();

        let missing = self.transport.find_missing(&digests).await?;
        debug!(total = digests.len(), missing = missing.len(), "uploading missing inputs");

        stream::iter(missing.into_iter().map(Ok::<_, RemoteError>))
            .try_for_each_concurrent(UPLOAD_CONCURRENCY, |digest| async move {
                let data = self.input_blob(tree, additional, exec_root, &digest).await?;
                self.transport.upload_blob(&digest, data).await
            })
            .await
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn upload(
        &self,
        key: &ActionKey,
        action: &Action,
        command: &Command,
        exec_root: &Path,
        outputs: &[PathBuf],
        out_err: &dyn OutputSink,
    ) -> RemoteResult<ActionResult> {
        let util = &self.digest_util;
        let mut blobs: BTreeMap<Digest, Bytes> = BTreeMap::new();
        let mut result = ActionResult::default();

        for output in outputs {
            let full = exec_root.join(output);
            let meta = match tokio::fs::metadata(&full).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %output.display(), "skipping missing output");
                    continue;
                }
                Err(e) => return Err(RemoteError::from_io(format!("stat {}", full.display()), e)),
            };
            let path = output
                .to_str()
                .ok_or_else(|| RemoteError::fatal(format!("Output path is not UTF-8: {}", output.display())))?
                .to_string();

            if meta.is_dir() {
                let tree = MerkleTree::build_from_dir(&full, util).map_err(merkle_error)?;
                for digest in tree.all_digests() {
                    if let Some(TreeInput::File(rel)) = tree.input(&digest) {
                        let file = full.join(rel);
                        let data = tokio::fs::read(&file)
                            .await
                            .map_err(|e| RemoteError::from_io(format!("read {}", file.display()), e))?;
                        blobs.insert(digest, Bytes::from(data));
                    }
                }
                let (tree_digest, tree_bytes) = tree.to_tree().digest_with(util)?;
                blobs.insert(tree_digest.clone(), Bytes::from(tree_bytes));
                result.output_directories.push(OutputDirectory { path, tree_digest });
            } else {
                let data = tokio::fs::read(&full)
                    .await
                    .map_err(|e| RemoteError::from_io(format!("read {}", full.display()), e))?;
                let digest = util.compute(&data);
                blobs.insert(digest.clone(), Bytes::from(data));
                result.output_files.push(OutputFile {
                    path,
                    digest,
                    is_executable: is_executable(&meta),
                });
            }
        }
        result.output_files.sort_by(|a, b| a.path.cmp(&b.path));
        result.output_directories.sort_by(|a, b| a.path.cmp(&b.path));

        let stdout = out_err.stdout();
        if !stdout.is_empty() {
            let digest = util.compute(&stdout);
            blobs.insert(digest.clone(), stdout);
            result.stdout_digest = Some(digest);
        }
        let stderr = out_err.stderr();
        if !stderr.is_empty() {
            let digest = util.compute(&stderr);
            blobs.insert(digest.clone(), stderr);
            result.stderr_digest = Some(digest);
        }

        let (command_digest, command_bytes) = command.digest_with(util)?;
        blobs.insert(command_digest, Bytes::from(command_bytes));
        let (action_digest, action_bytes) = action.digest_with(util)?;
        blobs.insert(action_digest, Bytes::from(action_bytes));

        let digests: Vec<Digest> = blobs.keys().cloned().collect();
        let missing: HashSet<Digest> = self.transport.find_missing(&digests).await?.into_iter().collect();
        let uploads = blobs
            .into_iter()
            .filter(|(digest, _)| missing.contains(digest))
            .map(Ok::<_, RemoteError>);
        stream::iter(uploads)
            .try_for_each_concurrent(UPLOAD_CONCURRENCY, |(digest, data)| async move {
                self.transport.upload_blob(&digest, data).await
            })
            .await?;

        self.transport.update_action_result(key, &result).await?;
        debug!(
            files = result.output_files.len(),
            directories = result.output_directories.len(),
            "uploaded action result"
        );
        Ok(result)
    }
}

fn merkle_error(err: MerkleError) -> RemoteError {
    match err {
        MerkleError::Metadata { path, source } => {
            RemoteError::from_io(format!("read {}", path.display()), source)
        }
        other => RemoteError::fatal(other.to_string()),
    }
}

fn checked_relative(path: &str) -> RemoteResult<&Path> {
    let p = Path::new(path);
    if p.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) && !path.is_empty() {
        Ok(p)
    } else {
        Err(RemoteError::fatal(format!("Refusing output path {path:?}")))
    }
}

fn checked_name(name: &str) -> RemoteResult<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(RemoteError::fatal(format!("Invalid tree entry name {name:?}")));
    }
    Ok(name)
}

async fn write_file(path: &Path, data: &[u8], executable: bool) -> RemoteResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RemoteError::from_io(format!("create {}", parent.display()), e))?;
    }
    // Existing outputs may be read-only.
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(RemoteError::from_io(format!("remove {}", path.display()), e)),
    }
    tokio::fs::write(path, data)
        .await
        .map_err(|e| RemoteError::from_io(format!("write {}", path.display()), e))?;
    set_executable(path, executable).await
}

#[cfg(unix)]
async fn set_executable(path: &Path, executable: bool) -> RemoteResult<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if executable { 0o755 } else { 0o644 };
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| RemoteError::from_io(format!("chmod {}", path.display()), e))
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path, _executable: bool) -> RemoteResult<()> {
    Ok(())
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    false
}
