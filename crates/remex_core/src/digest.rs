//! Content digests for blobs, directories and actions.
//!
//! A digest is the pair (hash, size). Two blobs with the same digest are
//! treated as the same blob everywhere in remex.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::fmt;
use std::io::{self, Read};
use std::path::Path;

const READ_CHUNK: usize = 64 * 1024;

/// Content digest: lower-case hex hash plus size in bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    /// Lower-case hex encoded hash
    pub hash: String,
    /// Size of the content in bytes
    pub size_bytes: i64,
}

impl Digest {
    /// Create a digest from its parts
    #[must_use]
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
        }
    }

    /// Parse the `hash/size` form produced by `Display`
    ///
    /// # Errors
    ///
    /// Returns error if the string is not `hex/size` or the hex is invalid
    pub fn parse(s: &str) -> CoreResult<Self> {
        let (hash, size) = s.split_once('/').ok_or_else(|| CoreError::InvalidDigest {
            reason: format!("expected hash/size, got {s:?}"),
        })?;
        if hash.is_empty() || hex::decode(hash).is_err() {
            return Err(CoreError::InvalidDigest {
                reason: format!("invalid hex hash {hash:?}"),
            });
        }
        let size_bytes = size.parse::<i64>().map_err(|e| CoreError::InvalidDigest {
            reason: format!("invalid size {size:?}: {e}"),
        })?;
        if size_bytes < 0 {
            return Err(CoreError::InvalidDigest {
                reason: format!("negative size {size_bytes}"),
            });
        }
        Ok(Self {
            hash: hash.to_ascii_lowercase(),
            size_bytes,
        })
    }

    /// First 16 hex chars, for log lines
    #[must_use]
    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(16)]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

/// Hash function used to compute digests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DigestFunction {
    /// SHA-256, the remote execution API default
    #[default]
    Sha256,
    /// BLAKE3
    Blake3,
}

impl DigestFunction {
    /// Parse function from string
    ///
    /// # Errors
    ///
    /// Returns error if the function is unknown
    pub fn parse(s: &str) -> CoreResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" => Ok(Self::Sha256),
            "blake3" => Ok(Self::Blake3),
            _ => Err(CoreError::Validation {
                field: "digest_function".to_string(),
                reason: format!("Unknown digest function: {s}"),
            }),
        }
    }

    /// Get string representation
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Blake3 => "blake3",
        }
    }

    /// Hash data and return the lower-case hex encoding
    #[must_use]
    pub fn hash_hex(&self, data: &[u8]) -> String {
        match self {
            Self::Sha256 => hex::encode(sha2::Sha256::digest(data)),
            Self::Blake3 => blake3::hash(data).to_hex().to_string(),
        }
    }

    fn hasher(&self) -> StreamingHasher {
        match self {
            Self::Sha256 => StreamingHasher::Sha256(sha2::Sha256::new()),
            Self::Blake3 => StreamingHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }
}

impl fmt::Display for DigestFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

enum StreamingHasher {
    Sha256(sha2::Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl StreamingHasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }
}

/// Computes digests with a fixed hash function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DigestUtil {
    function: DigestFunction,
}

impl DigestUtil {
    /// Create a digest util for the given function
    #[must_use]
    pub const fn new(function: DigestFunction) -> Self {
        Self { function }
    }

    /// The hash function in use
    #[must_use]
    pub const fn function(&self) -> DigestFunction {
        self.function
    }

    /// Digest arbitrary bytes
    #[must_use]
    pub fn compute(&self, data: &[u8]) -> Digest {
        Digest {
            hash: self.function.hash_hex(data),
            size_bytes: data.len() as i64,
        }
    }

    /// Digest of the empty blob
    #[must_use]
    pub fn empty(&self) -> Digest {
        self.compute(&[])
    }

    /// Digest a file by streaming its contents
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or read
    pub fn compute_file(&self, path: &Path) -> io::Result<Digest> {
        let mut file = std::fs::File::open(path)?;
        self.compute_reader(&mut file)
    }

    /// Digest everything readable from `reader`
    ///
    /// # Errors
    ///
    /// Returns error if reading fails
    pub fn compute_reader<R: Read>(&self, reader: &mut R) -> io::Result<Digest> {
        let mut hasher = self.function.hasher();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut size: i64 = 0;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            hasher.update(&buf[..n]);
            size += n as i64;
        }
        Ok(Digest {
            hash: hasher.finalize_hex(),
            size_bytes: size,
        })
    }

    /// Check that `data` matches `digest`
    #[must_use]
    pub fn verify(&self, digest: &Digest, data: &[u8]) -> bool {
        self.compute(data) == *digest
    }
}
