//! Abstract Syntax Tree definitions for Melee
//!
//! Every node owns its children and carries the span of the token that
//! introduced it.

use crate::token::Span;

/// Whether a function literal builds a plain function or a generator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Fn,
    Gen,
}

/// Expression nodes
#[derive(Debug, Clone)]
pub enum Expr {
    /// Integer literal: 42
    Int { value: i64, span: Span },

    /// Boolean literal: true, false
    Bool { value: bool, span: Span },

    /// null
    Null { span: Span },

    /// Array literal: [a, b, c]
    Array { items: Vec<Expr>, span: Span },

    /// Variable reference: foo
    Ident { name: String, span: Span },

    /// Prefix operation: -x, !y
    Prefix {
        op: PrefixOp,
        operand: Box<Expr>,
        span: Span,
    },

    /// Infix operation: a + b, x && y
    Infix {
        left: Box<Expr>,
        op: InfixOp,
        right: Box<Expr>,
        span: Span,
    },

    /// Assignment to an existing binding or array slot: x = 1, a[0] = 1
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
        span: Span,
    },

    /// Compound assignment: x += 1, a[i] *= 2
    CompoundAssign {
        target: Box<Expr>,
        op: InfixOp,
        value: Box<Expr>,
        span: Span,
    },

    /// Function or generator literal. `name` is set when the literal is the
    /// right-hand side of a declaration, enabling self-recursion.
    Function {
        kind: FunctionKind,
        name: Option<String>,
        params: Vec<String>,
        body: Vec<Stmt>,
        span: Span,
    },

    /// Call: f(a, b)
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },

    /// Index: a[i]
    Index {
        collection: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },

    /// if cond { } else { }
    If {
        condition: Box<Expr>,
        consequence: Vec<Stmt>,
        alternative: Option<Vec<Stmt>>,
        span: Span,
    },

    /// next seq
    Next { operand: Option<Box<Expr>>, span: Span },

    /// note [pitch, duration, velocity]
    Note { operand: Option<Box<Expr>>, span: Span },

    /// skip duration
    Skip { duration: Option<Box<Expr>>, span: Span },

    /// cc [key, value]
    Cc { operand: Option<Box<Expr>>, span: Span },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Int { span, .. }
            | Expr::Bool { span, .. }
            | Expr::Null { span }
            | Expr::Array { span, .. }
            | Expr::Ident { span, .. }
            | Expr::Prefix { span, .. }
            | Expr::Infix { span, .. }
            | Expr::Assign { span, .. }
            | Expr::CompoundAssign { span, .. }
            | Expr::Function { span, .. }
            | Expr::Call { span, .. }
            | Expr::Index { span, .. }
            | Expr::If { span, .. }
            | Expr::Next { span, .. }
            | Expr::Note { span, .. }
            | Expr::Skip { span, .. }
            | Expr::Cc { span, .. } => *span,
        }
    }
}

/// Prefix operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrefixOp {
    Minus, // -
    Bang,  // !
}

/// Infix operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InfixOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl std::fmt::Display for InfixOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InfixOp::Add => "+",
            InfixOp::Sub => "-",
            InfixOp::Mul => "*",
            InfixOp::Div => "/",
            InfixOp::Mod => "%",
            InfixOp::Eq => "==",
            InfixOp::Ne => "!=",
            InfixOp::Lt => "<",
            InfixOp::Le => "<=",
            InfixOp::Gt => ">",
            InfixOp::Ge => ">=",
            InfixOp::And => "&&",
            InfixOp::Or => "||",
        };
        write!(f, "{}", s)
    }
}

/// Statement nodes
#[derive(Debug, Clone)]
pub enum Stmt {
    /// Expression statement; its value is discarded
    Expr { expr: Expr, span: Span },

    /// Declaration: x := expr
    Declare {
        name: String,
        value: Expr,
        span: Span,
    },

    /// return [expr]
    Return { value: Option<Expr>, span: Span },

    /// yield expr
    Yield { value: Option<Expr>, span: Span },

    /// while cond { }
    While {
        condition: Expr,
        body: Vec<Stmt>,
        span: Span,
    },

    /// loop { }, sugar for while true
    Loop { body: Vec<Stmt>, span: Span },

    /// for x in expr { }
    For {
        var: String,
        iterable: Expr,
        body: Vec<Stmt>,
        span: Span,
    },

    Break { span: Span },

    Continue { span: Span },

    /// Bare block: { stmt* }
    Block { stmts: Vec<Stmt>, span: Span },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Expr { span, .. }
            | Stmt::Declare { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Yield { span, .. }
            | Stmt::While { span, .. }
            | Stmt::Loop { span, .. }
            | Stmt::For { span, .. }
            | Stmt::Break { span }
            | Stmt::Continue { span }
            | Stmt::Block { span, .. } => *span,
        }
    }
}

/// A complete program
#[derive(Debug, Clone)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new(statements: Vec<Stmt>) -> Self {
        Self { statements }
    }
}
