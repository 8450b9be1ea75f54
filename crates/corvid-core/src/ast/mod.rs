//! Abstract syntax tree for corvid source code
//!
//! Every node carries a [`Span`] so the compiler can stamp instructions with
//! line information and report errors at the right place. Type annotations
//! are accepted by the parser but never reach the tree.

mod expr;
mod stmt;

pub use expr::*;
pub use stmt::*;

pub use crate::lexer::Span;

/// A trait for AST nodes that have associated source location information
pub trait Spanned {
    fn span(&self) -> Span;
}

/// An identifier with its source location
#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

impl Ident {
    #[must_use]
    pub fn new(name: impl Into<String>, span: Span) -> Self {
        Self {
            name: name.into(),
            span,
        }
    }
}

impl Spanned for Ident {
    fn span(&self) -> Span {
        self.span
    }
}

/// A sequence of statements sharing one lexical scope
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

impl Block {
    #[must_use]
    pub fn new(stmts: Vec<Stmt>, span: Span) -> Self {
        Self { stmts, span }
    }
}

impl Spanned for Block {
    fn span(&self) -> Span {
        self.span
    }
}

/// A parsed chunk: the body of the implicit vararg main function
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub body: Block,
}
