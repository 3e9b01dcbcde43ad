//! Remote execution options.

use remex_core::{CoreError, CoreResult, DigestFunction};
use remex_remote::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options controlling cache use, remote execution and fallback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteOptions {
    /// Serve results from the remote cache
    pub accept_cached: bool,
    /// Upload results of local executions
    pub upload_local_results: bool,
    /// Run locally when remote execution fails in a recoverable way
    pub local_fallback: bool,
    /// Remote instance name
    pub instance_name: String,
    /// Platform properties used when a spawn's platform has none
    pub default_platform_properties: String,
    /// Result cache priority; zero leaves it unset
    pub result_cache_priority: i32,
    /// Execution priority; zero leaves it unset
    pub execution_priority: i32,
    /// Retry policy for remote execution
    pub retry: RetryPolicy,
    /// Include full cause chains in failure messages
    pub verbose_failures: bool,
    /// Write parameter files into the exec root before execution
    pub materialize_param_files: bool,
    /// Digest function
    pub digest_function: DigestFunction,
    /// Where server logs of failed actions are stored
    pub server_log_dir: PathBuf,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            accept_cached: true,
            upload_local_results: true,
            local_fallback: false,
            instance_name: String::new(),
            default_platform_properties: String::new(),
            result_cache_priority: 0,
            execution_priority: 0,
            retry: RetryPolicy::default(),
            verbose_failures: false,
            materialize_param_files: false,
            digest_function: DigestFunction::default(),
            server_log_dir: PathBuf::from(".remex/server-logs"),
        }
    }
}

impl RemoteOptions {
    /// Parse options from JSON; absent fields keep their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or a value is out of range
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid field
    pub fn validate(&self) -> CoreResult<()> {
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(CoreError::Validation {
                field: "retry.jitter".to_string(),
                reason: format!("must be within [0, 1], got {}", self.retry.jitter),
            });
        }
        if self.retry.multiplier < 1.0 {
            return Err(CoreError::Validation {
                field: "retry.multiplier".to_string(),
                reason: format!("must be at least 1, got {}", self.retry.multiplier),
            });
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(CoreError::Validation {
                field: "retry.initial_backoff_ms".to_string(),
                reason: "must not exceed retry.max_backoff_ms".to_string(),
            });
        }
        Ok(())
    }

    /// Set cache acceptance
    #[must_use]
    pub fn with_accept_cached(mut self, accept: bool) -> Self {
        self.accept_cached = accept;
        self
    }

    /// Set local result upload
    #[must_use]
    pub fn with_upload_local_results(mut self, upload: bool) -> Self {
        self.upload_local_results = upload;
        self
    }

    /// Set local fallback
    #[must_use]
    pub fn with_local_fallback(mut self, fallback: bool) -> Self {
        self.local_fallback = fallback;
        self
    }

    /// Set instance name
    #[must_use]
    pub fn with_instance_name(mut self, name: impl Into<String>) -> Self {
        self.instance_name = name.into();
        self
    }

    /// Set default platform properties
    #[must_use]
    pub fn with_default_platform_properties(mut self, properties: impl Into<String>) -> Self {
        self.default_platform_properties = properties.into();
        self
    }

    /// Set priorities
    #[must_use]
    pub fn with_priorities(mut self, result_cache: i32, execution: i32) -> Self {
        self.result_cache_priority = result_cache;
        self.execution_priority = execution;
        self
    }

    /// Set retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set verbose failures
    #[must_use]
    pub fn with_verbose_failures(mut self, verbose: bool) -> Self {
        self.verbose_failures = verbose;
        self
    }

    /// Set parameter file materialisation
    #[must_use]
    pub fn with_materialize_param_files(mut self, materialize: bool) -> Self {
        self.materialize_param_files = materialize;
        self
    }

    /// Set digest function
    #[must_use]
    pub fn with_digest_function(mut self, function: DigestFunction) -> Self {
        self.digest_function = function;
        self
    }

    /// Set server log directory
    #[must_use]
    pub fn with_server_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.server_log_dir = dir.into();
        self
    }
}
