//! Action inputs and the metadata that identifies their content.

use bytes::Bytes;
use remex_core::{Digest, DigestUtil};
use std::io;
use std::path::{Path, PathBuf};

/// An in-memory input that has no file on disk until materialised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualActionInput {
    /// Path relative to the exec root
    pub exec_path: PathBuf,
    /// File contents
    pub contents: Bytes,
    /// Parameter file holding command-line arguments
    pub is_param_file: bool,
}

impl VirtualActionInput {
    /// Create a virtual input
    #[must_use]
    pub fn new(exec_path: impl Into<PathBuf>, contents: impl Into<Bytes>) -> Self {
        Self {
            exec_path: exec_path.into(),
            contents: contents.into(),
            is_param_file: false,
        }
    }

    /// Create a parameter file input
    #[must_use]
    pub fn param_file(exec_path: impl Into<PathBuf>, contents: impl Into<Bytes>) -> Self {
        Self {
            is_param_file: true,
            ..Self::new(exec_path, contents)
        }
    }
}

/// A single input of an action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionInput {
    /// A file under the exec root
    File {
        /// Path relative to the exec root
        exec_path: PathBuf,
    },
    /// In-memory content
    Virtual(VirtualActionInput),
}

impl ActionInput {
    /// A real file input
    #[must_use]
    pub fn file(exec_path: impl Into<PathBuf>) -> Self {
        Self::File {
            exec_path: exec_path.into(),
        }
    }

    /// Path relative to the exec root
    #[must_use]
    pub fn exec_path(&self) -> &Path {
        match self {
            Self::File { exec_path } => exec_path,
            Self::Virtual(v) => &v.exec_path,
        }
    }

    /// Check for an in-memory input
    #[must_use]
    pub const fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual(_))
    }
}

/// Content identity of an input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Content digest
    pub digest: Digest,
    /// Executable bit
    pub is_executable: bool,
}

/// Resolves the content digest of action inputs
///
/// Implementations may cache digests; the Merkle builder calls this once per
/// input per build.
pub trait MetadataProvider: Send + Sync {
    /// Metadata for `input`
    ///
    /// # Errors
    ///
    /// Returns error if the input cannot be read
    fn metadata(&self, input: &ActionInput) -> io::Result<FileMetadata>;
}

/// Metadata provider that hashes files under an exec root on every call
#[derive(Debug, Clone)]
pub struct FsMetadataProvider {
    exec_root: PathBuf,
    digest_util: DigestUtil,
}

impl FsMetadataProvider {
    /// Create a provider rooted at `exec_root`
    #[must_use]
    pub fn new(exec_root: impl Into<PathBuf>, digest_util: DigestUtil) -> Self {
        Self {
            exec_root: exec_root.into(),
            digest_util,
        }
    }

    /// The exec root
    #[must_use]
    pub fn exec_root(&self) -> &Path {
        &self.exec_root
    }
}

impl MetadataProvider for FsMetadataProvider {
    fn metadata(&self, input: &ActionInput) -> io::Result<FileMetadata> {
        match input {
            ActionInput::Virtual(v) => Ok(FileMetadata {
                digest: self.digest_util.compute(&v.contents),
                is_executable: false,
            }),
            ActionInput::File { exec_path } => {
                let path = self.exec_root.join(exec_path);
                let meta = std::fs::metadata(&path)?;
                if !meta.is_file() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} is not a regular file", path.display()),
                    ));
                }
                Ok(FileMetadata {
                    digest: self.digest_util.compute_file(&path)?,
                    is_executable: is_executable(&meta),
                })
            }
        }
    }
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
