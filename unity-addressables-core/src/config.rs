//! Resource manager configuration

use serde::{Deserialize, Serialize};

use crate::error::{AddressablesError, Result};

/// Configuration for a [`ResourceManager`](crate::ResourceManager)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    /// Host platform name, used in error messages
    pub platform: String,
    /// Whether the host can block in `wait_for_completion`
    pub synchronous_wait_supported: bool,
    /// Post diagnostic events to registered diagnostic callbacks
    pub post_profiler_events: bool,
    /// Install the default exception handler that logs operation failures
    pub log_operation_exceptions: bool,
    /// Maximum bin swaps per deferred flush
    pub max_flush_passes: usize,
    /// Spin limit for `wait_for_completion`; `None` spins until done
    pub max_wait_spins: Option<usize>,
    /// Default for `complete` when the caller does not say otherwise
    pub release_dependencies_on_failure: bool,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            platform: "Standalone".to_string(),
            synchronous_wait_supported: true,
            post_profiler_events: false,
            log_operation_exceptions: true,
            max_flush_passes: 100,
            max_wait_spins: Some(10_000),
            release_dependencies_on_failure: true,
        }
    }
}

impl ResourceManagerConfig {
    /// Editor play mode: profiler events on
    pub fn for_editor() -> Self {
        Self {
            platform: "Editor".to_string(),
            post_profiler_events: true,
            ..Self::default()
        }
    }

    /// Hosts without blocking waits (e.g. WebGL)
    pub fn for_single_threaded_host<S: Into<String>>(platform: S) -> Self {
        Self {
            platform: platform.into(),
            synchronous_wait_supported: false,
            ..Self::default()
        }
    }

    /// Check the configuration for values the kernel cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_flush_passes == 0 {
            return Err(AddressablesError::config(
                "max_flush_passes must be at least 1",
            ));
        }
        if self.max_wait_spins == Some(0) {
            return Err(AddressablesError::config(
                "max_wait_spins must be at least 1 (use None for no limit)",
            ));
        }
        if self.platform.trim().is_empty() {
            return Err(AddressablesError::config("platform must not be empty"));
        }
        Ok(())
    }
}
