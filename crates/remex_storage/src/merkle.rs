//! Merkle tree over an action's input set.
//!
//! Inputs are grouped by path segment into nested [`Directory`] messages.
//! Each directory is encoded canonically and digested bottom-up, so the
//! root digest is a pure function of the set of (path, content, executable
//! bit) triples and never of the order the inputs were enumerated in.

use crate::input::{ActionInput, FileMetadata, FsMetadataProvider, MetadataProvider};
use bytes::Bytes;
use remex_core::{CoreError, Digest, DigestUtil};
use remex_proto::{CanonicalEncode, Directory, DirectoryNode, FileNode, Tree};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Merkle tree construction error
#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    /// Path is absolute, escapes the root or is not valid UTF-8
    #[error("Invalid input path {path}: {reason}")]
    InvalidPath {
        /// Offending path
        path: PathBuf,
        /// Reason
        reason: String,
    },
    /// Path is used both as a file and as a directory
    #[error("Input path {path} is both a file and a directory")]
    Conflict {
        /// Offending path
        path: PathBuf,
    },
    /// Input content could not be resolved
    #[error("Failed to resolve input {path}: {source}")]
    Metadata {
        /// Input path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// Directory encoding failed
    #[error(transparent)]
    Encoding(#[from] CoreError),
}

/// Where the bytes of a tree leaf come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeInput {
    /// A file, relative to the root the tree was built over
    File(PathBuf),
    /// In-memory contents
    Bytes(Bytes),
}

#[derive(Default)]
struct PendingDir {
    files: BTreeMap<String, FileMetadata>,
    dirs: BTreeMap<String, PendingDir>,
}

/// Content-addressed tree of an input set
#[derive(Debug, Clone)]
pub struct MerkleTree {
    root_digest: Digest,
    root: Directory,
    directories: HashMap<Digest, (Directory, Bytes)>,
    inputs: HashMap<Digest, TreeInput>,
    input_count: usize,
}

impl MerkleTree {
    /// Build the tree of `inputs`, keyed by path relative to the exec root
    ///
    /// # Errors
    ///
    /// Returns error if a path is invalid, two paths conflict, or an
    /// input's content cannot be resolved
    pub fn build(
        inputs: &BTreeMap<PathBuf, ActionInput>,
        provider: &dyn MetadataProvider,
        util: &DigestUtil,
    ) -> Result<Self, MerkleError> {
        let mut root = PendingDir::default();
        let mut leaves = HashMap::new();

        for (path, input) in inputs {
            let (parents, name) = split_path(path)?;
            let metadata = provider.metadata(input).map_err(|source| MerkleError::Metadata {
                path: path.clone(),
                source,
            })?;

            let leaf = match input {
                ActionInput::File { exec_path } => TreeInput::File(exec_path.clone()),
                ActionInput::Virtual(v) => TreeInput::Bytes(v.contents.clone()),
            };
            leaves.entry(metadata.digest.clone()).or_insert(leaf);

            let mut dir = &mut root;
            for segment in parents {
                if dir.files.contains_key(&segment) {
                    return Err(MerkleError::Conflict { path: path.clone() });
                }
                dir = dir.dirs.entry(segment).or_default();
            }
            if dir.dirs.contains_key(&name) {
                return Err(MerkleError::Conflict { path: path.clone() });
            }
            dir.files.insert(name, metadata);
        }

        let mut directories = HashMap::new();
        let (root_digest, root) = finish(root, util, &mut directories)?;
        debug!(
            root = %root_digest,
            inputs = inputs.len(),
            directories = directories.len(),
            "built merkle tree"
        );

        Ok(Self {
            root_digest,
            root,
            directories,
            inputs: leaves,
            input_count: inputs.len(),
        })
    }

    /// Build the tree of every regular file below `dir`
    ///
    /// Empty directories are not represented.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be walked or a file read
    pub fn build_from_dir(dir: &Path, util: &DigestUtil) -> Result<Self, MerkleError> {
        let mut inputs = BTreeMap::new();
        collect_files(dir, Path::new(""), &mut inputs).map_err(|source| MerkleError::Metadata {
            path: dir.to_path_buf(),
            source,
        })?;
        let provider = FsMetadataProvider::new(dir, *util);
        Self::build(&inputs, &provider, util)
    }

    /// Digest of the root directory
    #[must_use]
    pub const fn root_digest(&self) -> &Digest {
        &self.root_digest
    }

    /// The root directory
    #[must_use]
    pub const fn root(&self) -> &Directory {
        &self.root
    }

    /// Number of leaf inputs
    #[must_use]
    pub const fn input_count(&self) -> usize {
        self.input_count
    }

    /// Look up a directory by digest
    #[must_use]
    pub fn directory(&self, digest: &Digest) -> Option<&Directory> {
        self.directories.get(digest).map(|(dir, _)| dir)
    }

    /// Canonical bytes of a directory
    #[must_use]
    pub fn directory_bytes(&self, digest: &Digest) -> Option<&Bytes> {
        self.directories.get(digest).map(|(_, bytes)| bytes)
    }

    /// Source of a leaf's bytes
    #[must_use]
    pub fn input(&self, digest: &Digest) -> Option<&TreeInput> {
        self.inputs.get(digest)
    }

    /// Every digest needed to reconstruct the tree, sorted
    #[must_use]
    pub fn all_digests(&self) -> Vec<Digest> {
        let all: BTreeSet<&Digest> = self.directories.keys().chain(self.inputs.keys()).collect();
        all.into_iter().cloned().collect()
    }

    /// The tree as a single [`Tree`] message
    ///
    /// Children are ordered by digest so the encoding is stable.
    #[must_use]
    pub fn to_tree(&self) -> Tree {
        let mut children: Vec<(&Digest, &Directory)> = self
            .directories
            .iter()
            .filter(|(digest, _)| **digest != self.root_digest)
            .map(|(digest, (dir, _))| (digest, dir))
            .collect();
        children.sort_by(|a, b| a.0.cmp(b.0));
        Tree {
            root: self.root.clone(),
            children: children.into_iter().map(|(_, dir)| dir.clone()).collect(),
        }
    }
}

fn finish(
    pending: PendingDir,
    util: &DigestUtil,
    out: &mut HashMap<Digest, (Directory, Bytes)>,
) -> Result<(Digest, Directory), MerkleError> {
    let mut directory = Directory::default();
    for (name, child) in pending.dirs {
        let (digest, _) = finish(child, util, out)?;
        directory.directories.push(DirectoryNode { name, digest });
    }
    for (name, meta) in pending.files {
        directory.files.push(FileNode {
            name,
            digest: meta.digest,
            is_executable: meta.is_executable,
        });
    }
    // BTreeMap iteration already yields names in order.
    let (digest, bytes) = directory.digest_with(util)?;
    out.insert(digest.clone(), (directory.clone(), Bytes::from(bytes)));
    Ok((digest, directory))
}

fn split_path(path: &Path) -> Result<(Vec<String>, String), MerkleError> {
    let invalid = |reason: &str| MerkleError::InvalidPath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let mut segments = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(s) => {
                let s = s.to_str().ok_or_else(|| invalid("not valid UTF-8"))?;
                segments.push(s.to_string());
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("contains '..'")),
            Component::RootDir | Component::Prefix(_) => return Err(invalid("must be relative")),
        }
    }
    let name = segments.pop().ok_or_else(|| invalid("empty path"))?;
    Ok((segments, name))
}

fn collect_files(root: &Path, rel: &Path, out: &mut BTreeMap<PathBuf, ActionInput>) -> io::Result<()> {
    for entry in std::fs::read_dir(root.join(rel))? {
        let entry = entry?;
        let rel_path = rel.join(entry.file_name());
        let meta = std::fs::metadata(entry.path())?;
        if meta.is_dir() {
            collect_files(root, &rel_path, out)?;
        } else if meta.is_file() {
            out.insert(rel_path.clone(), ActionInput::file(rel_path));
        }
    }
    Ok(())
}
