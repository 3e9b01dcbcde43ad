//! Command, Action and Platform messages.

use crate::encoding::CanonicalEncode;
use remex_core::{CoreResult, Digest, DigestUtil, ProtoDuration};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single platform property
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Property {
    /// Property name
    pub name: String,
    /// Property value
    pub value: String,
}

impl Property {
    /// Create a property
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Requirements on the machine that executes an action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// Properties, sorted by name before hashing
    pub properties: Vec<Property>,
}

impl Platform {
    /// Create a platform from properties in any order
    #[must_use]
    pub fn new(properties: Vec<Property>) -> Self {
        Self { properties }.sorted()
    }

    /// Stable sort of the properties by name
    ///
    /// Properties sharing a name keep their relative order.
    #[must_use]
    pub fn sorted(mut self) -> Self {
        self.properties.sort_by(|a, b| a.name.cmp(&b.name));
        self
    }

    /// Check if there are no properties
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

/// Environment variable of a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
}

/// The command an action runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Argument vector; order is significant
    pub arguments: Vec<String>,
    /// Environment, sorted by name
    pub environment_variables: Vec<EnvironmentVariable>,
    /// Output files, sorted
    pub output_files: Vec<String>,
    /// Output directories, sorted
    pub output_directories: Vec<String>,
    /// Target platform
    pub platform: Option<Platform>,
}

impl CanonicalEncode for Command {}

/// An action: a command over an input root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Digest of the encoded [`Command`]
    pub command_digest: Digest,
    /// Root digest of the input Merkle tree
    pub input_root_digest: Digest,
    /// Execution timeout, absent when unbounded
    pub timeout: Option<ProtoDuration>,
    /// Results of this action must not be cached
    pub do_not_cache: bool,
}

impl CanonicalEncode for Action {}

/// Digest of an encoded [`Action`]; the action cache lookup key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionKey(Digest);

impl ActionKey {
    /// Wrap a digest that is known to be an action digest
    #[must_use]
    pub const fn new(digest: Digest) -> Self {
        Self(digest)
    }

    /// Compute the key of an action
    ///
    /// # Errors
    ///
    /// Returns error if the action cannot be encoded
    pub fn compute(util: &DigestUtil, action: &Action) -> CoreResult<Self> {
        let (digest, _) = action.digest_with(util)?;
        Ok(Self(digest))
    }

    /// Underlying digest
    #[must_use]
    pub const fn digest(&self) -> &Digest {
        &self.0
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
