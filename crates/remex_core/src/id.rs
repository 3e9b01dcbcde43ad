//! Identifiers attached to remote requests.
//!
//! Every remote call made on behalf of a spawn carries the build request id,
//! the command id and the action id so server-side logs can be correlated.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Build request identifier - one per build invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildRequestId(Uuid);

impl BuildRequestId {
    /// Create a new random BuildRequestId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for BuildRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BuildRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command identifier - one per client command (e.g. one `build`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(Uuid);

impl CommandId {
    /// Create a new random CommandId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from UUID bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata sent with every remote request for one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Build request id
    pub build_request_id: BuildRequestId,
    /// Command id
    pub command_id: CommandId,
    /// Action key hash
    pub action_id: String,
    /// Client tool name
    pub tool_name: String,
}

impl RequestMetadata {
    /// Create metadata for one action
    #[must_use]
    pub fn new(build_request_id: BuildRequestId, command_id: CommandId, action_id: impl Into<String>) -> Self {
        Self {
            build_request_id,
            command_id,
            action_id: action_id.into(),
            tool_name: "remex".to_string(),
        }
    }
}
