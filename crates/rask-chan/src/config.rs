// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Defaults suit tests and small programs. Embedders either deserialize a
//! `RuntimeConfig` from their own config file or call `from_env()`.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Stack size override for task threads, in bytes.
pub const ENV_STACK_SIZE: &str = "RASK_TASK_STACK_SIZE";
/// `EnvFilter` directives for the runtime's tracing output.
pub const ENV_LOG: &str = "RASK_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Task threads are named `{prefix}-{task id}`.
    pub thread_name_prefix: String,
    /// `None` keeps the platform default.
    pub stack_size: Option<usize>,
    /// Filter used by `install_tracing()`.
    pub log_filter: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "rask-task".to_string(),
            stack_size: None,
            log_filter: "warn".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `RASK_TASK_STACK_SIZE` / `RASK_LOG`.
    ///
    /// Unparseable stack sizes are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(ENV_STACK_SIZE) {
            match raw.trim().parse::<usize>() {
                Ok(bytes) => config.stack_size = Some(bytes),
                Err(e) => tracing::warn!(value = %raw, error = %e, "ignoring {}", ENV_STACK_SIZE),
            }
        }
        if let Ok(filter) = std::env::var(ENV_LOG) {
            config.log_filter = filter;
        }
        config
    }

    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = filter.into();
        self
    }

    /// Install a global fmt subscriber writing to stderr, filtered by
    /// `log_filter`.
    ///
    /// Returns false if a subscriber was already installed (not an error:
    /// the first one wins).
    pub fn install_tracing(&self) -> bool {
        let filter = EnvFilter::try_new(&self.log_filter).unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok()
    }
}
