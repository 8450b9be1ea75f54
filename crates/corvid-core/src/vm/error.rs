//! Errors surfaced by the virtual machine

use std::fmt;

use thiserror::Error;

use crate::bytecode::CompileError;
use crate::value::Value;

/// Every failure the host can observe
#[derive(Debug, Error)]
pub enum Error {
    /// Source failed to compile
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// Malformed or version-mismatched bytecode
    #[error("load error: {0}")]
    Load(String),

    /// A typed stack read found a value of another type
    #[error("stack index {index}: expected {expected}, found {found}")]
    TypeMismatch {
        index: i32,
        expected: &'static str,
        found: &'static str,
    },

    /// A script error that reached a protected call
    #[error("{0}")]
    Runtime(Box<RuntimeError>),

    /// The heap limit was exceeded even after a full collection
    #[error("not enough memory")]
    OutOfMemory,

    /// A reference handle was used with a VM other than the one that made it
    #[error("reference handle belongs to a different VM")]
    StateMismatch,

    /// The interrupt hook asked for execution to stop
    #[error("execution interrupted")]
    Interrupted,
}

impl Error {
    /// Whether script-level `pcall` may catch this error
    #[must_use]
    pub fn is_catchable(&self) -> bool {
        !matches!(self, Error::OutOfMemory | Error::Interrupted)
    }

    /// The runtime error payload, if this is one
    #[must_use]
    pub fn as_runtime(&self) -> Option<&RuntimeError> {
        match self {
            Error::Runtime(err) => Some(err),
            _ => None,
        }
    }
}

/// Result alias used throughout the VM
pub type VmResult<T> = Result<T, Error>;

/// A raised script error.
///
/// `value` is the error object exactly as raised. It stays valid while the
/// VM keeps it rooted, which lasts until the next protected call.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub value: Value,
    /// The value rendered for humans: the string itself, or a description
    pub message: String,
    /// Chunk of the innermost script frame when raised
    pub chunk: Option<String>,
    pub line: Option<u32>,
    /// Innermost frame first
    pub traceback: Vec<TraceFrame>,
}

impl RuntimeError {
    #[must_use]
    pub fn new(value: Value, message: impl Into<String>) -> Self {
        Self {
            value,
            message: message.into(),
            chunk: None,
            line: None,
            traceback: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_location(mut self, chunk: Option<String>, line: Option<u32>) -> Self {
        self.chunk = chunk;
        self.line = line;
        self
    }

    #[must_use]
    pub fn with_trace(mut self, traceback: Vec<TraceFrame>) -> Self {
        self.traceback = traceback;
        self
    }

    /// Multi-line rendering with the traceback
    #[must_use]
    pub fn report(&self) -> String {
        let mut out = self.message.clone();
        if !self.traceback.is_empty() {
            out.push_str("\nstack traceback:");
            let frames = self.traceback.len();
            for (level, frame) in self.traceback.iter().enumerate() {
                if frames > TRACE_HEAD + TRACE_TAIL && level >= TRACE_HEAD && level < frames - TRACE_TAIL {
                    if level == TRACE_HEAD {
                        let skipped = frames - TRACE_HEAD - TRACE_TAIL;
                        out.push_str(&format!("\n  ...\t(skipping {skipped} levels)"));
                    }
                    continue;
                }
                out.push_str("\n  ");
                out.push_str(&frame.to_string());
            }
        }
        out
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Innermost and outermost frames kept when a report elides the middle
const TRACE_HEAD: usize = 10;
const TRACE_TAIL: usize = 11;

/// One frame of a traceback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub function: String,
    pub chunk: Option<String>,
    pub line: Option<u32>,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.chunk, self.line) {
            (Some(chunk), Some(line)) => write!(f, "{}:{}: in {}", chunk, line, self.function),
            (Some(chunk), None) => write!(f, "{}: in {}", chunk, self.function),
            _ => write!(f, "[native]: in {}", self.function),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lists_frames() {
        let err = RuntimeError::new(Value::Nil, "main:3: boom").with_trace(vec![
            TraceFrame {
                function: "function 'f'".into(),
                chunk: Some("main".into()),
                line: Some(3),
            },
            TraceFrame {
                function: "function 'error'".into(),
                chunk: None,
                line: None,
            },
        ]);
        assert_eq!(
            err.report(),
            "main:3: boom\nstack traceback:\n  main:3: in function 'f'\n  [native]: in function 'error'"
        );
        assert_eq!(err.to_string(), "main:3: boom");
    }

    #[test]
    fn test_report_elides_deep_tracebacks() {
        let frames = (0..100)
            .map(|i| TraceFrame {
                function: format!("function 'f{i}'"),
                chunk: Some("deep".into()),
                line: Some(1),
            })
            .collect();
        let report = RuntimeError::new(Value::Nil, "deep:1: stack overflow").with_trace(frames).report();
        assert!(report.contains("in function 'f9'\n  ...\t(skipping 79 levels)\n  deep:1: in function 'f89'"));
        assert!(!report.contains("'f10'"));
        assert_eq!(report.lines().count(), 2 + 10 + 1 + 11);
    }

    #[test]
    fn test_catchable() {
        assert!(Error::Load("x".into()).is_catchable());
        assert!(!Error::Interrupted.is_catchable());
        assert!(!Error::OutOfMemory.is_catchable());
    }
}
