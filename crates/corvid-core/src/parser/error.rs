//! Parser error types

use crate::lexer::{LexError, Span, TokenKind};
use thiserror::Error;

/// A parser error with location information
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub span: Span,
    /// Optional hint for fixing the error
    pub hint: Option<String>,
}

impl ParseError {
    #[must_use]
    pub fn new(kind: ParseErrorKind, span: Span) -> Self {
        Self {
            kind,
            span,
            hint: None,
        }
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(hint) = &self.hint {
            write!(f, " ({hint})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseErrorKind {
    #[error("expected {expected}, got {found}")]
    UnexpectedToken { found: TokenKind, expected: TokenKind },

    #[error("expected {expected} (to close {opener} at line {line}), got {found}")]
    Unclosed {
        found: TokenKind,
        expected: TokenKind,
        opener: &'static str,
        line: u32,
    },

    #[error("expected expression, got {0}")]
    ExpectedExpression(TokenKind),

    #[error("expected identifier, got {0}")]
    ExpectedIdentifier(TokenKind),

    #[error("expected type, got {0}")]
    ExpectedType(TokenKind),

    #[error("incomplete statement: expected assignment or a function call")]
    IncompleteStatement,

    #[error("assigned expression must be a variable or a field")]
    InvalidAssignmentTarget,

    #[error("malformed number near '{0}'")]
    InvalidNumber(String),

    #[error("{0}")]
    InvalidString(LexError),

    #[error("{0}")]
    Lex(LexError),

    #[error("expected {expected} after 'return', got {found}")]
    ReturnNotLast {
        found: TokenKind,
        expected: &'static str,
    },

    #[error("break statement must be inside a loop")]
    BreakOutsideLoop,

    #[error("continue statement must be inside a loop")]
    ContinueOutsideLoop,

    #[error("cannot use '...' outside of a vararg function")]
    VarArgOutsideVararg,

    #[error("ambiguous syntax: this looks like an argument list for a function call, but could also be a start of new statement")]
    AmbiguousCall,
}
