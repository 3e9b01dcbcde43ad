//! Canonical Command and Action construction.
//!
//! Everything that does not carry meaning through its order is sorted here,
//! so equal spawns always produce byte-identical commands and equal action
//! keys.

use crate::spawn::{ActionOutput, OutputKind, Spawn};
use bytes::Bytes;
use remex_core::{CoreResult, Digest, DigestUtil, ProtoDuration};
use remex_proto::{Action, ActionKey, CanonicalEncode, Command, EnvironmentVariable, Platform};
use remex_storage::MerkleTree;
use std::collections::HashMap;
use std::time::Duration;

/// Build the command for a spawn
///
/// Output files and output directories are sorted independently and the
/// environment is sorted by name. Arguments keep their order.
#[must_use]
pub fn build_command(
    outputs: &[ActionOutput],
    arguments: &[String],
    env: &HashMap<String, String>,
    platform: Option<Platform>,
) -> Command {
    let mut output_files = Vec::new();
    let mut output_directories = Vec::new();
    for output in outputs {
        let path = output.exec_path.to_string_lossy().into_owned();
        match output.kind {
            OutputKind::File => output_files.push(path),
            OutputKind::Directory => output_directories.push(path),
        }
    }
    output_files.sort();
    output_files.dedup();
    output_directories.sort();
    output_directories.dedup();

    let mut environment_variables: Vec<EnvironmentVariable> = env
        .iter()
        .map(|(name, value)| EnvironmentVariable {
            name: name.clone(),
            value: value.clone(),
        })
        .collect();
    environment_variables.sort_by(|a, b| a.name.cmp(&b.name));

    Command {
        arguments: arguments.to_vec(),
        environment_variables,
        output_files,
        output_directories,
        platform,
    }
}

/// Build the action for a command over an input root
///
/// The timeout is recorded in whole seconds and only when non-zero.
#[must_use]
pub fn build_action(command_digest: Digest, input_root: Digest, timeout: Duration, cacheable: bool) -> Action {
    let timeout = (!timeout.is_zero()).then(|| ProtoDuration::from_std_secs(timeout));
    Action {
        command_digest,
        input_root_digest: input_root,
        timeout,
        do_not_cache: !cacheable,
    }
}

/// A spawn turned into wire messages, ready for lookup or execution
#[derive(Debug, Clone)]
pub struct PreparedAction {
    /// Input tree
    pub tree: MerkleTree,
    /// Command
    pub command: Command,
    /// Digest of the encoded command
    pub command_digest: Digest,
    /// Encoded command
    pub command_bytes: Bytes,
    /// Action
    pub action: Action,
    /// Encoded action
    pub action_bytes: Bytes,
    /// Action cache key
    pub key: ActionKey,
}

impl PreparedAction {
    /// Blobs that are not part of the input tree but must be on the server
    /// before execution
    #[must_use]
    pub fn additional_blobs(&self) -> HashMap<Digest, Bytes> {
        HashMap::from([
            (self.key.digest().clone(), self.action_bytes.clone()),
            (self.command_digest.clone(), self.command_bytes.clone()),
        ])
    }
}

/// Canonicalise `spawn` over an already built input tree
///
/// # Errors
///
/// Returns error if a message cannot be encoded
pub fn prepare_action(
    spawn: &Spawn,
    tree: MerkleTree,
    platform: Option<Platform>,
    timeout: Duration,
    util: &DigestUtil,
) -> CoreResult<PreparedAction> {
    let command = build_command(spawn.outputs(), spawn.arguments(), spawn.environment(), platform);
    let (command_digest, command_bytes) = command.digest_with(util)?;
    let action = build_action(
        command_digest.clone(),
        tree.root_digest().clone(),
        timeout,
        spawn.may_be_cached(),
    );
    let (action_digest, action_bytes) = action.digest_with(util)?;
    Ok(PreparedAction {
        tree,
        command,
        command_digest,
        command_bytes: Bytes::from(command_bytes),
        action,
        action_bytes: Bytes::from(action_bytes),
        key: ActionKey::new(action_digest),
    })
}
