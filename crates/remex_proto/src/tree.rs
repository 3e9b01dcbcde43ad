//! Directory and Tree messages.
//!
//! A [`Directory`] lists its files and subdirectories by name; children are
//! referenced by digest, so a directory digest covers its whole subtree.

use crate::encoding::CanonicalEncode;
use remex_core::Digest;
use serde::{Deserialize, Serialize};

/// A file entry in a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// Name within the parent directory
    pub name: String,
    /// Content digest
    pub digest: Digest,
    /// Executable bit
    pub is_executable: bool,
}

/// A subdirectory entry in a directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    /// Name within the parent directory
    pub name: String,
    /// Digest of the encoded child [`Directory`]
    pub digest: Digest,
}

/// One level of a content-addressed directory tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    /// Files, sorted by name
    pub files: Vec<FileNode>,
    /// Subdirectories, sorted by name
    pub directories: Vec<DirectoryNode>,
}

impl Directory {
    /// Sort both entry lists by name
    pub fn sort(&mut self) {
        self.files.sort_by(|a, b| a.name.cmp(&b.name));
        self.directories.sort_by(|a, b| a.name.cmp(&b.name));
    }

    /// Check if the directory has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }
}

impl CanonicalEncode for Directory {}

/// A whole directory tree in one message, used for output directories
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    /// Root directory
    pub root: Directory,
    /// Every directory reachable from the root, in any order
    pub children: Vec<Directory>,
}

impl CanonicalEncode for Tree {}
