//! Blob and action-cache transport.
//!
//! [`CasTransport`] is the seam between the cache client and whatever moves
//! bytes (gRPC, HTTP, a local directory). Implementations classify their
//! own failures into [`RemoteError`]s before returning them.

use crate::error::{RemoteError, RemoteResult};
use async_trait::async_trait;
use bytes::Bytes;
use remex_core::Digest;
use remex_proto::{ActionKey, ActionResult, CanonicalDecode, CanonicalEncode};
use remex_storage::{BlobStore, ContentStore, FsContentStore, StoreConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Content-addressed storage plus action cache
#[async_trait]
pub trait CasTransport: Send + Sync {
    /// Digests from `digests` the server does not have
    ///
    /// # Errors
    ///
    /// Returns error if the query fails
    async fn find_missing(&self, digests: &[Digest]) -> RemoteResult<Vec<Digest>>;

    /// Upload a blob
    ///
    /// # Errors
    ///
    /// Returns error if the upload fails
    async fn upload_blob(&self, digest: &Digest, data: Bytes) -> RemoteResult<()>;

    /// Download a blob, `None` if absent
    ///
    /// # Errors
    ///
    /// Returns error if the download fails
    async fn download_blob(&self, digest: &Digest) -> RemoteResult<Option<Bytes>>;

    /// Look up an action result
    ///
    /// # Errors
    ///
    /// Returns error if the lookup fails
    async fn get_action_result(&self, key: &ActionKey) -> RemoteResult<Option<ActionResult>>;

    /// Store an action result
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    async fn update_action_result(&self, key: &ActionKey, result: &ActionResult) -> RemoteResult<()>;
}

/// In-process CAS, for tests and embedding
#[derive(Default)]
pub struct InMemoryCas {
    blobs: ContentStore,
    action_cache: RwLock<HashMap<ActionKey, ActionResult>>,
}

impl InMemoryCas {
    /// Create an empty CAS
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The underlying blob store
    #[must_use]
    pub const fn blobs(&self) -> &ContentStore {
        &self.blobs
    }

    /// Number of cached action results
    pub async fn action_count(&self) -> usize {
        self.action_cache.read().await.len()
    }

    /// Drop a blob, simulating eviction
    pub fn evict(&self, digest: &Digest) -> bool {
        self.blobs.delete(digest)
    }
}

#[async_trait]
impl CasTransport for InMemoryCas {
    async fn find_missing(&self, digests: &[Digest]) -> RemoteResult<Vec<Digest>> {
        Ok(digests
            .iter()
            .filter(|d| d.size_bytes > 0 && !self.blobs.contains(d))
            .cloned()
            .collect())
    }

    async fn upload_blob(&self, digest: &Digest, data: Bytes) -> RemoteResult<()> {
        self.blobs.write(digest, data)?;
        Ok(())
    }

    async fn download_blob(&self, digest: &Digest) -> RemoteResult<Option<Bytes>> {
        Ok(self.blobs.read(digest)?)
    }

    async fn get_action_result(&self, key: &ActionKey) -> RemoteResult<Option<ActionResult>> {
        Ok(self.action_cache.read().await.get(key).cloned())
    }

    async fn update_action_result(&self, key: &ActionKey, result: &ActionResult) -> RemoteResult<()> {
        self.action_cache.write().await.insert(key.clone(), result.clone());
        Ok(())
    }
}

/// CAS in a local directory
///
/// Blobs live under `cas/`, action results under `ac/`.
pub struct DiskCas {
    blobs: FsContentStore,
    ac_dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl DiskCas {
    /// Open or create a cache rooted at `root`
    ///
    /// # Errors
    ///
    /// Returns error if the directories cannot be created
    pub fn open(root: &Path) -> RemoteResult<Self> {
        let config = StoreConfig::default().with_storage_dir(root.join("cas"));
        let blobs = FsContentStore::new(config)?;
        let ac_dir = root.join("ac");
        std::fs::create_dir_all(&ac_dir)
            .map_err(|e| RemoteError::from_io(format!("create {}", ac_dir.display()), e))?;
        Ok(Self {
            blobs,
            ac_dir,
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn ac_path(&self, key: &ActionKey) -> PathBuf {
        let digest = key.digest();
        self.ac_dir.join(format!("{}-{}", digest.hash, digest.size_bytes))
    }
}

#[async_trait]
impl CasTransport for DiskCas {
    async fn find_missing(&self, digests: &[Digest]) -> RemoteResult<Vec<Digest>> {
        Ok(digests
            .iter()
            .filter(|d| d.size_bytes > 0 && !self.blobs.contains(d))
            .cloned()
            .collect())
    }

    async fn upload_blob(&self, digest: &Digest, data: Bytes) -> RemoteResult<()> {
        self.blobs.write(digest, data)?;
        Ok(())
    }

    async fn download_blob(&self, digest: &Digest) -> RemoteResult<Option<Bytes>> {
        Ok(self.blobs.read(digest)?)
    }

    async fn get_action_result(&self, key: &ActionKey) -> RemoteResult<Option<ActionResult>> {
        let path = self.ac_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RemoteError::from_io(format!("read {}", path.display()), e)),
        };
        match ActionResult::decode(&bytes) {
            Ok(result) => Ok(Some(result)),
            Err(e) => {
                // A torn or stale entry is a miss, not a failure.
                debug!(key = %key, error = %e, "discarding undecodable action cache entry");
                Ok(None)
            }
        }
    }

    async fn update_action_result(&self, key: &ActionKey, result: &ActionResult) -> RemoteResult<()> {
        let path = self.ac_path(key);
        let bytes = result.encode()?;
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp.{}.{}", std::process::id(), n));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| RemoteError::from_io(format!("write {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| RemoteError::from_io(format!("rename {}", path.display()), e))?;
        debug!(key = %key, "updated action cache");
        Ok(())
    }
}
