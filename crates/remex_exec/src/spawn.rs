//! Spawn model: one command with its inputs, outputs and constraints.

use bytes::Bytes;
use remex_core::{CoreError, CoreResult};
use remex_storage::{ActionInput, VirtualActionInput};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Execution requirement tags understood by the dispatcher
pub mod requirements {
    /// Neither execute remotely nor use the remote cache
    pub const NO_REMOTE: &str = "no-remote";
    /// Do not execute remotely; the remote cache may still be used
    pub const NO_REMOTE_EXEC: &str = "no-remote-exec";
    /// Run locally, bypassing every cache
    pub const LOCAL: &str = "local";
    /// Never cache results
    pub const NO_CACHE: &str = "no-cache";
    /// Do not use the remote cache
    pub const NO_REMOTE_CACHE: &str = "no-remote-cache";
}

/// Whether an output is a single file or a whole directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputKind {
    /// Regular file
    File,
    /// Directory tree
    Directory,
}

/// A declared output of a spawn
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionOutput {
    /// Path relative to the exec root
    pub exec_path: PathBuf,
    /// File or directory
    pub kind: OutputKind,
}

impl ActionOutput {
    /// A file output
    #[must_use]
    pub fn file(exec_path: impl Into<PathBuf>) -> Self {
        Self {
            exec_path: exec_path.into(),
            kind: OutputKind::File,
        }
    }

    /// A directory output
    #[must_use]
    pub fn directory(exec_path: impl Into<PathBuf>) -> Self {
        Self {
            exec_path: exec_path.into(),
            kind: OutputKind::Directory,
        }
    }
}

/// The execution platform a spawn was configured for
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformInfo {
    /// Label naming the platform, used in error messages
    pub label: String,
    /// Platform properties in protobuf text form
    pub remote_execution_properties: String,
}

impl PlatformInfo {
    /// Create platform info
    #[must_use]
    pub fn new(label: impl Into<String>, remote_execution_properties: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            remote_execution_properties: remote_execution_properties.into(),
        }
    }
}

/// A single command to run, immutable once built
#[derive(Debug, Clone, Default)]
pub struct Spawn {
    mnemonic: String,
    arguments: Vec<String>,
    environment: HashMap<String, String>,
    inputs: Vec<ActionInput>,
    outputs: Vec<ActionOutput>,
    execution_platform: Option<PlatformInfo>,
    execution_info: BTreeSet<String>,
    timeout: Duration,
}

impl Spawn {
    /// Create a spawn running `arguments`
    #[must_use]
    pub fn new<I, S>(arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mnemonic: "Spawn".to_string(),
            arguments: arguments.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the mnemonic used in logs
    #[must_use]
    pub fn with_mnemonic(mut self, mnemonic: impl Into<String>) -> Self {
        self.mnemonic = mnemonic.into();
        self
    }

    /// Add an environment variable, replacing any previous value
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(name.into(), value.into());
        self
    }

    /// Add an input
    #[must_use]
    pub fn with_input(mut self, input: ActionInput) -> Self {
        self.inputs.push(input);
        self
    }

    /// Add an output
    #[must_use]
    pub fn with_output(mut self, output: ActionOutput) -> Self {
        self.outputs.push(output);
        self
    }

    /// Set the execution platform
    #[must_use]
    pub fn with_platform(mut self, platform: PlatformInfo) -> Self {
        self.execution_platform = Some(platform);
        self
    }

    /// Add an execution requirement tag
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.execution_info.insert(tag.into());
        self
    }

    /// Set the timeout; zero means none
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Mnemonic
    #[must_use]
    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    /// Argument vector
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Environment
    #[must_use]
    pub const fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    /// Inputs in declaration order
    #[must_use]
    pub fn inputs(&self) -> &[ActionInput] {
        &self.inputs
    }

    /// Declared outputs
    #[must_use]
    pub fn outputs(&self) -> &[ActionOutput] {
        &self.outputs
    }

    /// Execution platform, if any
    #[must_use]
    pub const fn execution_platform(&self) -> Option<&PlatformInfo> {
        self.execution_platform.as_ref()
    }

    /// Execution requirement tags
    #[must_use]
    pub const fn execution_info(&self) -> &BTreeSet<String> {
        &self.execution_info
    }

    /// Timeout; zero means none
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check for an execution requirement tag
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.execution_info.contains(tag)
    }

    /// The spawn may run on a remote executor
    #[must_use]
    pub fn may_be_executed_remotely(&self) -> bool {
        !self.has_tag(requirements::LOCAL)
            && !self.has_tag(requirements::NO_REMOTE)
            && !self.has_tag(requirements::NO_REMOTE_EXEC)
    }

    /// Results of the spawn may be looked up in and written to the cache
    #[must_use]
    pub fn may_be_cached(&self) -> bool {
        !self.has_tag(requirements::NO_CACHE)
            && !self.has_tag(requirements::LOCAL)
            && !self.has_tag(requirements::NO_REMOTE)
            && !self.has_tag(requirements::NO_REMOTE_CACHE)
    }
}

/// A virtual input written in a spawn description
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualInputSpec {
    /// Path relative to the exec root
    pub path: PathBuf,
    /// Contents
    pub contents: String,
    /// Treat as a parameter file
    pub param_file: bool,
}

/// Serializable description of a spawn
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpawnSpec {
    /// Mnemonic
    pub mnemonic: Option<String>,
    /// Argument vector
    pub arguments: Vec<String>,
    /// Environment
    pub environment: BTreeMap<String, String>,
    /// Input files relative to the exec root
    pub inputs: Vec<PathBuf>,
    /// In-memory inputs
    pub virtual_inputs: Vec<VirtualInputSpec>,
    /// Output files
    pub output_files: Vec<PathBuf>,
    /// Output directories
    pub output_directories: Vec<PathBuf>,
    /// Execution requirement tags
    pub tags: Vec<String>,
    /// Execution platform
    pub platform: Option<PlatformInfo>,
    /// Timeout in seconds; zero means none
    pub timeout_secs: u64,
}

impl SpawnSpec {
    /// Parse a JSON spawn description
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or has no arguments
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let spec: Self = serde_json::from_str(json)?;
        if spec.arguments.is_empty() {
            return Err(CoreError::Validation {
                field: "arguments".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        Ok(spec)
    }

    /// Build the spawn
    #[must_use]
    pub fn into_spawn(self) -> Spawn {
        let mut spawn = Spawn::new(self.arguments).with_timeout(Duration::from_secs(self.timeout_secs));
        if let Some(mnemonic) = self.mnemonic {
            spawn = spawn.with_mnemonic(mnemonic);
        }
        for (name, value) in self.environment {
            spawn = spawn.with_env(name, value);
        }
        for path in self.inputs {
            spawn = spawn.with_input(ActionInput::file(path));
        }
        for v in self.virtual_inputs {
            let contents = Bytes::from(v.contents.into_bytes());
            let input = if v.param_file {
                VirtualActionInput::param_file(v.path, contents)
            } else {
                VirtualActionInput::new(v.path, contents)
            };
            spawn = spawn.with_input(ActionInput::Virtual(input));
        }
        for path in self.output_files {
            spawn = spawn.with_output(ActionOutput::file(path));
        }
        for path in self.output_directories {
            spawn = spawn.with_output(ActionOutput::directory(path));
        }
        for tag in self.tags {
            spawn = spawn.with_tag(tag);
        }
        if let Some(platform) = self.platform {
            spawn = spawn.with_platform(platform);
        }
        spawn
    }
}
