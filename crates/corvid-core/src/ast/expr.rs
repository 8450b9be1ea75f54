//! Expression AST nodes

use crate::lexer::Span;

use super::{Block, Ident, Spanned};

/// Binary operators, including the short-circuiting `and`/`or`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    /// Left and right binding power used by precedence climbing.
    ///
    /// A right power lower than the left one makes the operator right associative.
    #[must_use]
    pub const fn binding_power(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => (3, 3),
            BinOp::Concat => (5, 4),
            BinOp::Add | BinOp::Sub => (6, 6),
            BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod => (7, 7),
            BinOp::Pow => (10, 9),
        }
    }

    #[must_use]
    pub const fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod | BinOp::Pow
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::IDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "^",
            BinOp::Concat => "..",
            BinOp::Eq => "==",
            BinOp::Ne => "~=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binding power of unary operators; `^` binds tighter on its left
pub const UNARY_PRIORITY: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// Arithmetic negation (-)
    Neg,
    /// Logical not
    Not,
    /// Length (#)
    Len,
}

impl UnaryOp {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Not => "not",
            UnaryOp::Len => "#",
        }
    }
}

/// One piece of an interpolated string
#[derive(Debug, Clone, PartialEq)]
pub enum InterpPart {
    Text(Vec<u8>),
    Expr(Expr),
}

/// One entry of a table constructor
#[derive(Debug, Clone, PartialEq)]
pub enum TableField {
    /// `value`
    Positional(Expr),
    /// `name = value`
    Named(Ident, Expr),
    /// `[key] = value`
    Keyed(Expr, Expr),
}

/// Parameters and body shared by function literals and declarations
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBody {
    pub params: Vec<Ident>,
    pub is_vararg: bool,
    pub body: Block,
    /// Debug name derived from the declaration, if any
    pub name: Option<String>,
    pub span: Span,
}

/// An expression with its source span
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    #[must_use]
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Calls and `...` may produce any number of values
    #[must_use]
    pub fn is_multi(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Call { .. } | ExprKind::MethodCall { .. } | ExprKind::VarArg
        )
    }

    /// Expressions that may appear on the left of `=`
    #[must_use]
    pub fn is_assignable(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Name(_) | ExprKind::Index { .. } | ExprKind::Field { .. }
        )
    }
}

impl Spanned for Expr {
    fn span(&self) -> Span {
        self.span
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Nil,
    True,
    False,
    /// `...`
    VarArg,
    Number(f64),
    /// Decoded string bytes
    String(Vec<u8>),
    Interpolated(Vec<InterpPart>),
    Function(Box<FunctionBody>),
    Table(Vec<TableField>),

    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    Name(Ident),
    /// `object[key]`
    Index {
        object: Box<Expr>,
        key: Box<Expr>,
    },
    /// `object.name`
    Field {
        object: Box<Expr>,
        name: Ident,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// `object:method(args)`
    MethodCall {
        object: Box<Expr>,
        method: Ident,
        args: Vec<Expr>,
    },
    /// Parenthesized expression; truncates multiple results to one
    Paren(Box<Expr>),

    /// `if c then a elseif d then b else e`
    IfElse {
        branches: Vec<(Expr, Expr)>,
        otherwise: Box<Expr>,
    },
}

impl FunctionBody {
    #[must_use]
    pub fn new(params: Vec<Ident>, is_vararg: bool, body: Block, span: Span) -> Self {
        Self {
            params,
            is_vararg,
            body,
            name: None,
            span,
        }
    }
}
