//! Statement AST nodes

use crate::lexer::Span;

use super::{BinOp, Block, Expr, FunctionBody, Ident, Spanned};

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    #[must_use]
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

impl Spanned for Stmt {
    fn span(&self) -> Span {
        self.span
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// `local a, b = x, y`
    Local {
        names: Vec<Ident>,
        values: Vec<Expr>,
    },
    /// `local function f() end`; the name is in scope inside the body
    LocalFunction {
        name: Ident,
        func: FunctionBody,
    },
    /// `function a.b:c() end`; the target is a name or field chain
    Function {
        target: Expr,
        func: FunctionBody,
    },
    /// `a, b.c = x, y`
    Assign {
        targets: Vec<Expr>,
        values: Vec<Expr>,
    },
    /// `a += x` and friends
    CompoundAssign {
        target: Expr,
        op: BinOp,
        value: Expr,
    },
    /// Function call used as a statement
    Call(Expr),
    Do(Block),
    While {
        condition: Expr,
        body: Block,
    },
    /// `repeat body until condition`; the condition sees the body's locals
    Repeat {
        body: Block,
        condition: Expr,
    },
    If {
        branches: Vec<(Expr, Block)>,
        otherwise: Option<Block>,
    },
    NumericFor {
        var: Ident,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
    },
    GenericFor {
        vars: Vec<Ident>,
        exprs: Vec<Expr>,
        body: Block,
    },
    Break,
    Continue,
    Return(Vec<Expr>),
    /// `type X = ...`; produces no code
    TypeAlias,
}
