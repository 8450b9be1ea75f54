//! Compiler options

use serde::{Deserialize, Serialize};

use super::error::{CompileError, CompileErrorKind};

/// Vector width the compiler and VM agree on
pub const VECTOR_SIZE: u8 = 3;

/// Options controlling code generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// 0 strips line info and names, 1 keeps them, 2 also records locals
    pub debug_level: u8,
    /// 0 disables folding, 1 folds constants, 2 also drops dead branches
    pub optimization_level: u8,
    /// Components per vector value; only 3 is supported
    pub vector_size: u8,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            debug_level: 1,
            optimization_level: 1,
            vector_size: VECTOR_SIZE,
        }
    }
}

impl CompileOptions {
    /// Reject option values the compiler cannot honor
    pub fn validate(&self, chunk_name: &str) -> Result<(), CompileError> {
        let kind = if self.debug_level > 2 {
            CompileErrorKind::InvalidOption(format!("debug level {} (expected 0-2)", self.debug_level))
        } else if self.optimization_level > 2 {
            CompileErrorKind::InvalidOption(format!(
                "optimization level {} (expected 0-2)",
                self.optimization_level
            ))
        } else if self.vector_size != VECTOR_SIZE {
            CompileErrorKind::UnsupportedVectorSize(self.vector_size)
        } else {
            return Ok(());
        };
        Err(CompileError::new(kind, chunk_name, 0, 0))
    }
}
