//! VM configuration

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gc::GcConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Limits and switches for a VM instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Load the standard library into the globals table
    pub open_libs: bool,
    pub gc: GcConfig,
    /// Script frames per thread before "stack overflow"
    pub max_call_depth: usize,
    /// Value slots per thread before "stack overflow"
    pub max_stack_slots: usize,
    /// Nested host re-entries (metamethods, host calls, resumes)
    pub max_native_depth: usize,
    /// Instructions between interrupt hook invocations
    pub interrupt_interval: u32,
    /// Heap size in bytes beyond which the VM fails with out-of-memory
    pub memory_limit: Option<usize>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            open_libs: true,
            gc: GcConfig::default(),
            max_call_depth: 20_000,
            max_stack_slots: 1_000_000,
            max_native_depth: 200,
            interrupt_interval: 1024,
            memory_limit: None,
        }
    }
}

impl VmConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
