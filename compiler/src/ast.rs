// AST node types for kfuse .kfs schedule files.
//
// One statement per line: settings, runtime params, stage definitions, the
// output declaration, per-stage placement directives, and declared bounds.
// Every node carries a `SimpleSpan` for error reporting in downstream phases.
//
// Preconditions: produced by the parser from a valid or partially-valid token stream.
// Postconditions: each node's span covers the source range of the construct.
// Failure modes: none (data-only module).
// Side effects: none.

use chumsky::span::SimpleSpan;

/// Byte-offset span (alias for chumsky's `SimpleSpan`).
pub type Span = SimpleSpan;

// ── Root ──

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Statement>,
    pub span: Span,
}

// ── Statements ──

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub kind: StatementKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Set(SetStmt),
    Param(ParamStmt),
    Stage(StageStmt),
    Output(OutputStmt),
    Compute(ComputeStmt),
    Bound(BoundStmt),
}

// ── set_stmt: 'set' IDENT '=' set_value ──

#[derive(Debug, Clone, PartialEq)]
pub struct SetStmt {
    pub name: Ident,
    pub value: SetValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetValue {
    Number(i64, Span),
    /// Size literal in bytes (`48KB`).
    Size(u64, Span),
    /// Bare word such as `true` or `false`.
    Ident(Ident),
}

// ── param_stmt: 'param' IDENT ('=' NUMBER)? ──

/// A runtime parameter. The optional value is a default binding used when
/// the plan is evaluated without an explicit `--bind`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamStmt {
    pub name: Ident,
    pub default: Option<(i64, Span)>,
}

// ── stage_stmt: 'stage' IDENT '(' IDENT,* ')' (':' IDENT)? '=' expr ──

#[derive(Debug, Clone, PartialEq)]
pub struct StageStmt {
    pub name: Ident,
    pub dims: Vec<Ident>,
    /// Element type name (`u8`, `i32`, ...); the configured default if absent.
    pub elem: Option<Ident>,
    pub body: Expr,
}

// ── output_stmt: 'output' IDENT '[' extent,+ ']' tile? threads? ──

#[derive(Debug, Clone, PartialEq)]
pub struct OutputStmt {
    pub name: Ident,
    pub extents: Vec<Extent>,
    pub tile: Vec<DimValue>,
    pub threads: Vec<DimValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Extent {
    Number(i64, Span),
    Param(Ident),
}

impl Extent {
    pub fn span(&self) -> Span {
        match self {
            Extent::Number(_, span) => *span,
            Extent::Param(id) => id.span,
        }
    }
}

/// `x: 16` inside `tile(...)` or `threads(...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct DimValue {
    pub dim: Ident,
    pub value: i64,
    pub span: Span,
}

// ── compute_stmt ──
//
//   'compute' IDENT 'root' tile? threads?
//   'compute' IDENT 'at' IDENT 'block' threads?
//   'compute' IDENT 'at' IDENT 'thread'

#[derive(Debug, Clone, PartialEq)]
pub struct ComputeStmt {
    pub name: Ident,
    pub placement: PlacementSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlacementSpec {
    Root {
        tile: Vec<DimValue>,
        threads: Vec<DimValue>,
    },
    At {
        anchor: Ident,
        level: Level,
        threads: Vec<DimValue>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Block,
    Thread,
}

// ── bound_stmt: 'bound' IDENT IDENT '[' INT ',' INT ']' ──

#[derive(Debug, Clone, PartialEq)]
pub struct BoundStmt {
    pub stage: Ident,
    pub dim: Ident,
    pub lo: i64,
    pub hi: i64,
}

// ── Expressions ──

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Number(i64),
    /// Stage variable or runtime parameter (resolved later).
    Ident(Ident),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// Stage read, or the built-ins `min` / `max`.
    Call(Ident, Vec<Expr>),
}

// ── Identifier ──

#[derive(Debug, Clone, PartialEq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}
