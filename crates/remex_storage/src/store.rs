//! Content-addressed blob stores.

use bytes::Bytes;
use remex_core::{Digest, DigestUtil};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum blob size in bytes (0 = unlimited)
    pub max_blob_size: u64,
    /// Maximum total storage in bytes (0 = unlimited)
    pub max_storage: u64,
    /// Storage directory for filesystem-backed stores
    pub storage_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_blob_size: 100 * 1024 * 1024, // 100 MB
            max_storage: 10 * 1024 * 1024 * 1024, // 10 GB
            storage_dir: PathBuf::from(".remex/cache"),
        }
    }
}

impl StoreConfig {
    /// Set storage directory
    #[must_use]
    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    /// Set maximum blob size
    #[must_use]
    pub fn with_max_blob_size(mut self, size: u64) -> Self {
        self.max_blob_size = size;
        self
    }
}

/// Store error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Blob too large
    #[error("Blob too large: {size} bytes (limit: {limit})")]
    BlobTooLarge {
        /// Blob size
        size: u64,
        /// Configured limit
        limit: u64,
    },
    /// Storage full
    #[error("Storage full")]
    StorageFull,
    /// Blob contents do not match the digest
    #[error("Invalid blob {digest}: {reason}")]
    InvalidBlob {
        /// Claimed digest
        digest: Digest,
        /// Reason
        reason: String,
    },
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Total number of blobs
    pub blob_count: usize,
    /// Total bytes stored
    pub total_bytes: u64,
    /// Number of reads
    pub read_count: u64,
    /// Number of writes that added a new blob
    pub write_count: u64,
}

/// A content-addressed blob store keyed by [`Digest`]
///
/// Writes are idempotent: writing the same digest twice keeps one blob.
pub trait BlobStore: Send + Sync {
    /// Store `data` under `digest`
    ///
    /// # Errors
    ///
    /// Returns error if the blob is rejected or cannot be persisted
    fn write(&self, digest: &Digest, data: Bytes) -> StoreResult<()>;

    /// Read a blob, `None` if absent
    ///
    /// # Errors
    ///
    /// Returns error if the backing storage fails
    fn read(&self, digest: &Digest) -> StoreResult<Option<Bytes>>;

    /// Check if a blob exists
    fn contains(&self, digest: &Digest) -> bool;
}

fn check_blob(config: &StoreConfig, digest: &Digest, data: &Bytes) -> StoreResult<()> {
    let size = data.len() as u64;
    if config.max_blob_size > 0 && size > config.max_blob_size {
        return Err(StoreError::BlobTooLarge {
            size,
            limit: config.max_blob_size,
        });
    }
    if digest.size_bytes != data.len() as i64 {
        return Err(StoreError::InvalidBlob {
            digest: digest.clone(),
            reason: format!("size mismatch, got {} bytes", data.len()),
        });
    }
    Ok(())
}

/// In-memory content store
pub struct ContentStore {
    /// Store configuration
    config: StoreConfig,
    /// Blob storage indexed by digest
    blobs: RwLock<HashMap<Digest, Bytes>>,
    /// Store statistics
    stats: RwLock<StoreStats>,
}

impl ContentStore {
    /// Create a new content store
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create with custom configuration
    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            blobs: RwLock::new(HashMap::new()),
            stats: RwLock::new(StoreStats::default()),
        }
    }

    /// Digest `data` with `util` and store it
    ///
    /// # Errors
    ///
    /// Returns error if the blob is rejected
    pub fn put(&self, util: &DigestUtil, data: impl Into<Bytes>) -> StoreResult<Digest> {
        let data = data.into();
        let digest = util.compute(&data);
        self.write(&digest, data)?;
        Ok(digest)
    }

    /// Delete a blob, returning whether it existed
    pub fn delete(&self, digest: &Digest) -> bool {
        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(blob) = blobs.remove(digest) {
            let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
            stats.blob_count -= 1;
            stats.total_bytes -= blob.len() as u64;
            true
        } else {
            false
        }
    }

    /// Get store statistics
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.stats.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// List all digests
    #[must_use]
    pub fn list(&self) -> Vec<Digest> {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Clear all blobs from the store
    pub fn clear(&self) {
        self.blobs.write().unwrap_or_else(PoisonError::into_inner).clear();
        *self.stats.write().unwrap_or_else(PoisonError::into_inner) = StoreStats::default();
    }

    /// Get total blob count
    #[must_use]
    pub fn count(&self) -> usize {
        self.stats().blob_count
    }
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobStore for ContentStore {
    fn write(&self, digest: &Digest, data: Bytes) -> StoreResult<()> {
        check_blob(&self.config, digest, &data)?;
        let size = data.len() as u64;

        let mut blobs = self.blobs.write().unwrap_or_else(PoisonError::into_inner);
        if blobs.contains_key(digest) {
            return Ok(());
        }

        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        if self.config.max_storage > 0 && stats.total_bytes + size > self.config.max_storage {
            return Err(StoreError::StorageFull);
        }
        blobs.insert(digest.clone(), data);
        stats.blob_count += 1;
        stats.total_bytes += size;
        stats.write_count += 1;
        Ok(())
    }

    fn read(&self, digest: &Digest) -> StoreResult<Option<Bytes>> {
        let blob = self
            .blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(digest)
            .cloned();
        if blob.is_some() {
            self.stats.write().unwrap_or_else(PoisonError::into_inner).read_count += 1;
        }
        Ok(blob)
    }

    fn contains(&self, digest: &Digest) -> bool {
        self.blobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(digest)
    }
}

/// Persistent content store backed by a directory
///
/// Blobs live at `<dir>/<first two hex chars>/<hash>-<size>`.
pub struct FsContentStore {
    config: StoreConfig,
    dir: PathBuf,
    tmp_counter: AtomicU64,
}

impl FsContentStore {
    /// Create a filesystem-backed store rooted at `config.storage_dir`
    ///
    /// # Errors
    ///
    /// Returns error if directory creation fails
    pub fn new(config: StoreConfig) -> StoreResult<Self> {
        std::fs::create_dir_all(&config.storage_dir)?;
        Ok(Self {
            dir: config.storage_dir.clone(),
            config,
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// Root directory of the store
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let shard = &digest.hash[..digest.hash.len().min(2)];
        self.dir
            .join(shard)
            .join(format!("{}-{}", digest.hash, digest.size_bytes))
    }
}

impl BlobStore for FsContentStore {
    fn write(&self, digest: &Digest, data: Bytes) -> StoreResult<()> {
        check_blob(&self.config, digest, &data)?;
        let path = self.blob_path(digest);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so concurrent readers never observe a partial blob.
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp.{}.{}", std::process::id(), n));
        std::fs::write(&tmp, &data)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!(digest = %digest, "stored blob");
        Ok(())
    }

    fn read(&self, digest: &Digest) -> StoreResult<Option<Bytes>> {
        match std::fs::read(self.blob_path(digest)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }
}
