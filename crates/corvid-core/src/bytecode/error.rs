//! Compiler error types

use std::fmt;

use thiserror::Error;

use crate::parser::ParseErrorKind;

/// A compilation error, located by chunk name, line and column
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub chunk: String,
    /// 1-based; 0 when the error is not tied to a source position
    pub line: u32,
    pub column: u32,
    pub hint: Option<String>,
}

impl CompileError {
    #[must_use]
    pub fn new(kind: CompileErrorKind, chunk: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            kind,
            chunk: chunk.into(),
            line,
            column,
            hint: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// The message without location, as scripts see it from `load`
    #[must_use]
    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "{}:{}: {}", self.chunk, self.line, self.kind)?;
        } else {
            write!(f, "{}: {}", self.chunk, self.kind)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileErrorKind {
    #[error("{0}")]
    Syntax(ParseErrorKind),

    #[error("out of constant slots (limit is 65535)")]
    TooManyConstants,

    #[error("out of local registers when trying to allocate {0} (limit is 200)")]
    TooManyLocals(String),

    #[error("out of upvalue registers when trying to capture {0} (limit is 255)")]
    TooManyUpvalues(String),

    #[error("too many parameters (limit is 255)")]
    TooManyParameters,

    #[error("too many arguments (limit is 255)")]
    TooManyArguments,

    #[error("too many nested functions (limit is 65535)")]
    TooManyFunctions,

    #[error("jump distance exceeds 32767 bytes")]
    JumpTooLarge,

    #[error("expression is too complex")]
    ExpressionTooComplex,

    #[error("local {0} used in the repeat..until condition is declared after continue")]
    ContinueSkipsLocal(String),

    #[error("unsupported vector size {0} (only 3 is supported)")]
    UnsupportedVectorSize(u8),

    #[error("invalid compile option: {0}")]
    InvalidOption(String),
}

pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_location() {
        let err = CompileError::new(CompileErrorKind::JumpTooLarge, "main", 4, 2);
        assert_eq!(err.to_string(), "main:4: jump distance exceeds 32767 bytes");
        let err = CompileError::new(CompileErrorKind::UnsupportedVectorSize(4), "main", 0, 0)
            .with_hint("use 3");
        assert_eq!(
            err.to_string(),
            "main: unsupported vector size 4 (only 3 is supported)\n  hint: use 3"
        );
    }
}
