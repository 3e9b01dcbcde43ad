//! remex storage
//!
//! Content-addressed blob stores and the Merkle tree builder that turns an
//! action's input set into a single input-root digest.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod input;
pub mod merkle;
pub mod store;

pub use input::{ActionInput, FileMetadata, FsMetadataProvider, MetadataProvider, VirtualActionInput};
pub use merkle::{MerkleError, MerkleTree, TreeInput};
pub use store::{BlobStore, ContentStore, FsContentStore, StoreConfig, StoreError, StoreResult, StoreStats};
