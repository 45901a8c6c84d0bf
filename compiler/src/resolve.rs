// resolve.rs — Name resolution and schedule construction for .kfs programs
//
// Walks the parsed AST, resolves stage, variable, and parameter names,
// classifies every call argument into an axis access, and assembles the
// stage graph together with the declared schedule and settings.
//
// Preconditions: `program` is a well-formed AST from the parser.
// Postconditions: `resolved` is `Some` iff no error-level diagnostic was produced.
// Failure modes: unknown or duplicate names, arity mismatches, invalid
//                factors, missing or duplicate directives, and dependency
//                cycles produce `Diagnostic` entries. Resolution continues
//                past errors.
// Side effects: none.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::ast::{self, *};
use crate::diag::{codes, has_errors, DiagCode, Diagnostic};
use crate::graph::{AxisAccess, BinOp, Body, ElemType, GraphBuilder, Read, StageGraph};
use crate::id::{ReadId, StageId};
use crate::placement::{Placement, Schedule};
use crate::sym::{floor_div, Bindings, Symbol, SymExpr};
use crate::transform::IndexTransform;

/// Shared memory available per block when no limit is configured.
pub const DEFAULT_SHARED_LIMIT: u64 = 48 * 1024;

/// Largest magnitude of an index constant or factor. Emitted kernels index
/// with 32-bit `int`.
pub const MAX_INDEX_CONSTANT: i64 = i32::MAX as i64;

// ── Public types ────────────────────────────────────────────────────────────

/// Knobs set with `set name = value` and overridable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    /// Let buffers with disjoint lifetimes share arena slots.
    pub reuse: bool,
    /// Width of the default element type (1, 2, 4 or 8 bytes, signed).
    pub elem_bytes: u64,
    /// Per-block shared memory budget in bytes.
    pub shared_limit: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            reuse: true,
            elem_bytes: 4,
            shared_limit: DEFAULT_SHARED_LIMIT,
        }
    }
}

impl Settings {
    /// Element type of stages that do not declare one.
    pub fn default_elem(&self) -> ElemType {
        ElemType::signed(self.elem_bytes).unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct ResolveResult {
    pub resolved: Option<Resolved>,
    pub diagnostics: Vec<Diagnostic>,
}

/// A fully resolved program: the graph, the schedule over it, and settings.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub graph: StageGraph,
    pub schedule: Schedule,
    pub settings: Settings,
    /// Declared runtime parameters and their default values.
    pub params: BTreeMap<String, Option<i64>>,
    /// Span of the directive that placed each stage.
    pub directive_spans: HashMap<StageId, Span>,
}

impl Resolved {
    /// Bindings for every parameter that declares a default.
    pub fn default_bindings(&self) -> Bindings {
        let mut b = Bindings::new();
        for (name, value) in &self.params {
            if let Some(v) = value {
                b.set(Symbol::Param(name.clone()), *v);
            }
        }
        b
    }

    /// Best span to report a problem with `stage` at.
    pub fn span_of(&self, stage: StageId) -> Span {
        self.directive_spans
            .get(&stage)
            .copied()
            .unwrap_or(self.graph.stage(stage).span)
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

pub fn resolve(program: &Program) -> ResolveResult {
    let mut ctx = ResolveCtx::default();

    // Pass 1: settings, params, stage names
    ctx.collect_globals(program);

    // Pass 2: stage bodies and read edges
    ctx.resolve_bodies(program);

    // Pass 3: bounds, output, and compute directives
    ctx.resolve_directives(program);

    let resolved = ctx.finish(program.span);
    ResolveResult {
        resolved,
        diagnostics: ctx.diagnostics,
    }
}

// ── Internal context ────────────────────────────────────────────────────────

/// Argument of a call, classified for region analysis.
#[derive(Debug, Clone, PartialEq)]
enum Index {
    Const(i64),
    Along(usize, IndexTransform),
    Opaque,
}

/// A directive before defaults are filled in. `None` entries take defaults.
#[derive(Debug, Clone)]
enum Pending {
    Root {
        tile: Vec<Option<i64>>,
        threads: Vec<Option<i64>>,
    },
    Block {
        anchor: StageId,
        threads: Vec<Option<i64>>,
    },
    Thread {
        anchor: StageId,
    },
}

#[derive(Default)]
struct ResolveCtx {
    builder: GraphBuilder,
    settings: Settings,
    params: BTreeMap<String, Option<i64>>,
    diagnostics: Vec<Diagnostic>,
    output: Option<(StageId, Vec<SymExpr>, Span)>,
    directives: BTreeMap<StageId, (Pending, Span)>,
}

impl ResolveCtx {
    fn error(&mut self, code: DiagCode, span: Span, message: String) {
        self.diagnostics.push(Diagnostic::error(code, span, message));
    }

    fn warning(&mut self, code: DiagCode, span: Span, message: String) {
        self.diagnostics.push(Diagnostic::warning(code, span, message));
    }

    fn stage_by_name(&mut self, id: &Ident) -> Option<StageId> {
        let found = self.builder.lookup(&id.name);
        if found.is_none() {
            self.error(codes::E0100, id.span, format!("unknown stage '{}'", id.name));
        }
        found
    }

    // ── Pass 1: collect globals ─────────────────────────────────────────

    fn collect_globals(&mut self, program: &Program) {
        for stmt in &program.statements {
            match &stmt.kind {
                StatementKind::Set(s) => self.apply_setting(s),
                StatementKind::Param(p) => {
                    let name = &p.name.name;
                    if self.params.contains_key(name) {
                        self.error(codes::E0101, p.name.span, format!("duplicate param '{name}'"));
                    } else {
                        self.params.insert(name.clone(), p.default.map(|(v, _)| v));
                    }
                }
                StatementKind::Stage(s) => {
                    let name = &s.name.name;
                    if self.builder.lookup(name).is_some() {
                        self.error(codes::E0101, s.name.span, format!("duplicate stage '{name}'"));
                        continue;
                    }
                    let mut dims: Vec<String> = Vec::with_capacity(s.dims.len());
                    for d in &s.dims {
                        if dims.contains(&d.name) {
                            self.error(
                                codes::E0101,
                                d.span,
                                format!("dimension '{}' appears twice in stage '{name}'", d.name),
                            );
                        }
                        dims.push(d.name.clone());
                    }
                    self.builder.declare(name, dims, s.name.span);
                }
                StatementKind::Output(_) | StatementKind::Compute(_) | StatementKind::Bound(_) => {}
            }
        }

        let collisions: Vec<(Span, String)> = program
            .statements
            .iter()
            .filter_map(|stmt| match &stmt.kind {
                StatementKind::Stage(s) if self.params.contains_key(&s.name.name) => Some((
                    s.name.span,
                    format!("'{}' is defined as both a param and a stage", s.name.name),
                )),
                _ => None,
            })
            .collect();
        for (span, message) in collisions {
            self.error(codes::E0101, span, message);
        }
    }

    fn apply_setting(&mut self, s: &SetStmt) {
        match (s.name.name.as_str(), &s.value) {
            ("reuse", SetValue::Ident(v)) if v.name == "true" || v.name == "false" => {
                self.settings.reuse = v.name == "true";
            }
            ("elem_bytes", SetValue::Number(n, _)) if matches!(*n, 1 | 2 | 4 | 8) => {
                self.settings.elem_bytes = *n as u64;
            }
            ("elem_bytes", SetValue::Number(n, span)) => self.diagnostics.push(
                Diagnostic::error(codes::E0108, *span, format!("invalid element width {n}"))
                    .with_hint("elem_bytes must be 1, 2, 4 or 8"),
            ),
            ("shared_limit", SetValue::Size(bytes, _)) => self.settings.shared_limit = *bytes,
            ("shared_limit", SetValue::Number(n, _)) if *n >= 0 => {
                self.settings.shared_limit = *n as u64;
            }
            ("reuse" | "elem_bytes" | "shared_limit", _) => self.error(
                codes::E0108,
                s.name.span,
                format!("invalid value for setting '{}'", s.name.name),
            ),
            (other, _) => self.error(codes::E0108, s.name.span, format!("unknown setting '{other}'")),
        }
    }

    // ── Pass 2: stage bodies ────────────────────────────────────────────

    fn resolve_bodies(&mut self, program: &Program) {
        for stmt in &program.statements {
            let StatementKind::Stage(s) = &stmt.kind else {
                continue;
            };
            let Some(id) = self.builder.lookup(&s.name.name) else {
                continue;
            };
            // A duplicate declaration keeps the first body.
            if self.builder.stage(id).span != s.name.span {
                continue;
            }
            let elem = match &s.elem {
                None => self.settings.default_elem(),
                Some(t) => match ElemType::from_name(&t.name) {
                    Some(elem) => elem,
                    None => {
                        self.diagnostics.push(
                            Diagnostic::error(
                                codes::E0110,
                                t.span,
                                format!("unknown element type '{}'", t.name),
                            )
                            .with_hint("use one of i8, u8, i16, u16, i32, u32, i64, u64"),
                        );
                        self.settings.default_elem()
                    }
                },
            };
            self.builder.set_elem(id, elem);
            let dims = self.builder.stage(id).dims.clone();
            let mut reads = Vec::new();
            let body = self.lower_expr(&s.body, &dims, &mut reads);
            debug!(stage = %s.name.name, %elem, reads = reads.len(), "stage resolved");
            self.builder.define(id, body, reads);
        }
    }

    fn lower_expr(&mut self, expr: &Expr, dims: &[String], reads: &mut Vec<Read>) -> Body {
        match &expr.kind {
            ExprKind::Number(n) => Body::Const(*n),
            ExprKind::Ident(id) => {
                if let Some(d) = dims.iter().position(|v| *v == id.name) {
                    Body::Var(d)
                } else if self.params.contains_key(&id.name) {
                    Body::Param(id.name.clone())
                } else {
                    self.error(
                        codes::E0103,
                        id.span,
                        format!("unknown variable or param '{}'", id.name),
                    );
                    Body::Const(0)
                }
            }
            ExprKind::Neg(inner) => Body::Neg(Box::new(self.lower_expr(inner, dims, reads))),
            ExprKind::Binary(op, l, r) => {
                let l = self.lower_expr(l, dims, reads);
                let r = self.lower_expr(r, dims, reads);
                Body::binary(lower_op(*op), l, r)
            }
            ExprKind::Call(name, args) => self.lower_call(name, args, expr.span, dims, reads),
        }
    }

    fn lower_call(
        &mut self,
        name: &Ident,
        args: &[Expr],
        span: Span,
        dims: &[String],
        reads: &mut Vec<Read>,
    ) -> Body {
        if let Some(producer) = self.builder.lookup(&name.name) {
            let arity = self.builder.stage(producer).arity();
            if args.len() != arity {
                self.error(
                    codes::E0102,
                    span,
                    format!(
                        "stage '{}' has {} dimension(s) but is called with {} argument(s)",
                        name.name,
                        arity,
                        args.len()
                    ),
                );
                return Body::Const(0);
            }
            let bodies: Vec<Body> = args.iter().map(|a| self.lower_expr(a, dims, reads)).collect();
            let axes: Vec<AxisAccess> = args
                .iter()
                .map(|a| match self.classify(a, dims) {
                    Index::Const(c) => AxisAccess::constant(c),
                    Index::Along(d, t) => AxisAccess::along(d, t),
                    Index::Opaque => AxisAccess::opaque(),
                })
                .collect();
            let id = ReadId(reads.len() as u32);
            reads.push(Read::with_args(producer, axes, bodies));
            return Body::Read(id);
        }

        let op = match name.name.as_str() {
            "min" => BinOp::Min,
            "max" => BinOp::Max,
            _ => {
                self.error(codes::E0100, name.span, format!("unknown stage '{}'", name.name));
                return Body::Const(0);
            }
        };
        if args.len() != 2 {
            self.error(
                codes::E0102,
                span,
                format!("'{}' takes 2 arguments, got {}", name.name, args.len()),
            );
            return Body::Const(0);
        }
        let l = self.lower_expr(&args[0], dims, reads);
        let r = self.lower_expr(&args[1], dims, reads);
        Body::binary(op, l, r)
    }

    /// Classify one call argument. Affine forms in a single variable keep
    /// their transform; everything else is opaque.
    fn classify(&mut self, expr: &Expr, dims: &[String]) -> Index {
        match &expr.kind {
            ExprKind::Number(n) if *n > MAX_INDEX_CONSTANT => self.index_overflow(expr.span),
            ExprKind::Number(n) => Index::Const(*n),
            ExprKind::Ident(id) => match dims.iter().position(|v| *v == id.name) {
                Some(d) => Index::Along(d, IndexTransform::Identity),
                None => Index::Opaque,
            },
            ExprKind::Neg(inner) => match self.classify(inner, dims) {
                Index::Const(c) => Index::Const(-c),
                _ => Index::Opaque,
            },
            ExprKind::Binary(op, l, r) => {
                let l = self.classify(l, dims);
                let r = self.classify(r, dims);
                self.combine(*op, l, r, expr.span)
            }
            ExprKind::Call(..) => Index::Opaque,
        }
    }

    fn combine(&mut self, op: ast::BinOp, l: Index, r: Index, span: Span) -> Index {
        use ast::BinOp as Op;
        match (op, l, r) {
            (Op::Div, _, Index::Const(k)) | (Op::Mul, Index::Const(k), Index::Along(..))
                if k < 1 =>
            {
                self.invalid_factor(span, k)
            }
            (Op::Mul, Index::Along(..), Index::Const(k)) if k < 1 => self.invalid_factor(span, k),
            (Op::Add, Index::Const(a), Index::Const(b)) => self.folded(a.checked_add(b), span),
            (Op::Sub, Index::Const(a), Index::Const(b)) => self.folded(a.checked_sub(b), span),
            (Op::Mul, Index::Const(a), Index::Const(b)) => self.folded(a.checked_mul(b), span),
            (Op::Div, Index::Const(a), Index::Const(b)) => Index::Const(floor_div(a, b)),
            (Op::Add, Index::Along(d, t), Index::Const(k))
            | (Op::Add, Index::Const(k), Index::Along(d, t)) => {
                self.composed(d, t.try_then(&IndexTransform::Offset(k)), span)
            }
            (Op::Sub, Index::Along(d, t), Index::Const(k)) => {
                self.composed(d, t.try_then(&IndexTransform::Offset(-k)), span)
            }
            (Op::Mul, Index::Along(d, t), Index::Const(k))
            | (Op::Mul, Index::Const(k), Index::Along(d, t)) => {
                self.composed(d, t.try_then(&IndexTransform::Scale(k)), span)
            }
            (Op::Div, Index::Along(d, t), Index::Const(k)) => {
                self.composed(d, t.try_then(&IndexTransform::Div(k)), span)
            }
            _ => Index::Opaque,
        }
    }

    /// A folded constant, if it neither overflowed nor left the index range.
    fn folded(&mut self, value: Option<i64>, span: Span) -> Index {
        match value {
            Some(v) if v.unsigned_abs() <= MAX_INDEX_CONSTANT as u64 => Index::Const(v),
            _ => self.index_overflow(span),
        }
    }

    fn composed(&mut self, dim: usize, transform: Option<IndexTransform>, span: Span) -> Index {
        match transform {
            Some(t) if t.max_constant() <= MAX_INDEX_CONSTANT => Index::Along(dim, t),
            _ => self.index_overflow(span),
        }
    }

    fn index_overflow(&mut self, span: Span) -> Index {
        self.diagnostics.push(
            Diagnostic::error(codes::E0104, span, "index arithmetic overflows".to_string())
                .with_hint("index constants and factors must fit in a 32-bit int"),
        );
        Index::Opaque
    }

    fn invalid_factor(&mut self, span: Span, k: i64) -> Index {
        self.diagnostics.push(
            Diagnostic::error(codes::E0104, span, format!("invalid index factor {k}"))
                .with_hint("scale and divide factors must be at least 1"),
        );
        Index::Opaque
    }

    // ── Pass 3: directives ──────────────────────────────────────────────

    fn resolve_directives(&mut self, program: &Program) {
        for stmt in &program.statements {
            match &stmt.kind {
                StatementKind::Bound(b) => self.resolve_bound(b),
                StatementKind::Output(o) => self.resolve_output(o, stmt.span),
                StatementKind::Compute(c) => self.resolve_compute(c, stmt.span),
                _ => {}
            }
        }
    }

    fn dim_index(&mut self, stage: StageId, dim: &Ident) -> Option<usize> {
        let s = self.builder.stage(stage);
        let found = s.dims.iter().position(|d| *d == dim.name);
        if found.is_none() {
            let message = format!("stage '{}' has no dimension '{}'", s.name, dim.name);
            self.error(codes::E0109, dim.span, message);
        }
        found
    }

    fn resolve_bound(&mut self, b: &BoundStmt) {
        let Some(stage) = self.stage_by_name(&b.stage) else {
            return;
        };
        let Some(dim) = self.dim_index(stage, &b.dim) else {
            return;
        };
        if b.lo > b.hi {
            self.error(
                codes::E0104,
                b.dim.span,
                format!("empty bound [{}, {}]", b.lo, b.hi),
            );
            return;
        }
        self.builder.set_bound(stage, dim, b.lo, b.hi);
    }

    /// Per-dimension values of a `tile(...)` or `threads(...)` list.
    fn dim_values(&mut self, stage: StageId, values: &[DimValue]) -> Vec<Option<i64>> {
        let mut out = vec![None; self.builder.stage(stage).arity()];
        for v in values {
            let Some(d) = self.dim_index(stage, &v.dim) else {
                continue;
            };
            if v.value < 1 {
                self.error(codes::E0104, v.span, format!("'{}' must be at least 1", v.dim.name));
            } else if out[d].is_some() {
                self.error(codes::E0106, v.span, format!("'{}' is given twice", v.dim.name));
            } else {
                out[d] = Some(v.value);
            }
        }
        out
    }

    fn place(&mut self, stage: StageId, pending: Pending, span: Span) {
        if self.directives.contains_key(&stage) {
            let name = self.builder.stage(stage).name.clone();
            self.error(codes::E0106, span, format!("stage '{name}' is placed twice"));
            return;
        }
        self.directives.insert(stage, (pending, span));
    }

    fn resolve_output(&mut self, o: &OutputStmt, span: Span) {
        if let Some((prev, _, _)) = &self.output {
            let prev = self.builder.stage(*prev).name.clone();
            self.error(
                codes::E0106,
                span,
                format!("output already declared as '{prev}'"),
            );
            return;
        }
        let Some(stage) = self.stage_by_name(&o.name) else {
            return;
        };
        let arity = self.builder.stage(stage).arity();
        if o.extents.len() != arity {
            self.error(
                codes::E0102,
                span,
                format!(
                    "output '{}' has {} dimension(s) but {} extent(s)",
                    o.name.name,
                    arity,
                    o.extents.len()
                ),
            );
            return;
        }
        let mut extents = Vec::with_capacity(arity);
        for e in &o.extents {
            match e {
                Extent::Number(n, s) if *n < 1 => {
                    self.error(codes::E0104, *s, format!("extent must be at least 1, got {n}"));
                    extents.push(SymExpr::Const(1));
                }
                Extent::Number(n, _) => extents.push(SymExpr::Const(*n)),
                Extent::Param(id) if self.params.contains_key(&id.name) => {
                    extents.push(SymExpr::param(id.name.clone()));
                }
                Extent::Param(id) => {
                    self.error(codes::E0103, id.span, format!("unknown param '{}'", id.name));
                    extents.push(SymExpr::Const(1));
                }
            }
        }
        let tile = self.dim_values(stage, &o.tile);
        let threads = self.dim_values(stage, &o.threads);
        self.output = Some((stage, extents, span));
        self.place(stage, Pending::Root { tile, threads }, span);
    }

    fn resolve_compute(&mut self, c: &ComputeStmt, span: Span) {
        let Some(stage) = self.stage_by_name(&c.name) else {
            return;
        };
        let pending = match &c.placement {
            PlacementSpec::Root { tile, threads } => Pending::Root {
                tile: self.dim_values(stage, tile),
                threads: self.dim_values(stage, threads),
            },
            PlacementSpec::At {
                anchor,
                level,
                threads,
            } => {
                let Some(anchor) = self.stage_by_name(anchor) else {
                    return;
                };
                match level {
                    Level::Block => Pending::Block {
                        anchor,
                        threads: self.dim_values(stage, threads),
                    },
                    Level::Thread => Pending::Thread { anchor },
                }
            }
        };
        self.place(stage, pending, span);
    }

    // ── Finish: graph and schedule ──────────────────────────────────────

    fn finish(&mut self, program_span: Span) -> Option<Resolved> {
        let Some((output, extents, _)) = self.output.clone() else {
            self.error(
                codes::E0105,
                program_span,
                "no output declared".to_string(),
            );
            return None;
        };

        let mut missing = Vec::new();
        for i in 0..self.builder.len() {
            let id = StageId(i as u32);
            if !self.directives.contains_key(&id) {
                let s = self.builder.stage(id);
                missing.push((s.span, s.name.clone()));
            }
        }
        for (span, name) in missing {
            self.diagnostics.push(
                Diagnostic::error(codes::E0107, span, format!("stage '{name}' has no placement"))
                    .with_hint("add `compute <stage> root`, `at <kernel> block`, or `at <stage> thread`"),
            );
        }

        let placements = self.finalize_placements();
        if has_errors(&self.diagnostics) {
            return None;
        }

        let builder = std::mem::take(&mut self.builder);
        let spans: HashMap<String, Span> = (0..builder.len())
            .map(|i| {
                let s = builder.stage(StageId(i as u32));
                (s.name.clone(), s.span)
            })
            .collect();
        let graph = match builder.build() {
            Ok(g) => g,
            Err(err) => {
                let span = match &err {
                    crate::error::FuseError::Cycle { stages } => stages
                        .first()
                        .and_then(|n| spans.get(n).copied())
                        .unwrap_or(program_span),
                    _ => program_span,
                };
                self.diagnostics.push(Diagnostic::from_error(&err, span));
                return None;
            }
        };

        for stage in graph.stages() {
            if stage.id != output && graph.consumers(stage.id).is_empty() {
                self.warning(
                    codes::W0101,
                    stage.span,
                    format!("stage '{}' is never read", stage.name),
                );
            }
        }

        debug!(
            stages = graph.len(),
            output = %graph.name(output),
            reuse = self.settings.reuse,
            "program resolved"
        );
        Some(Resolved {
            schedule: Schedule {
                output,
                extents,
                placements,
            },
            graph,
            settings: self.settings,
            params: self.params.clone(),
            directive_spans: self
                .directives
                .iter()
                .map(|(id, (_, span))| (*id, *span))
                .collect(),
        })
    }

    /// Fill defaults: tiles of 1, root threads equal to the tile, block
    /// threads inherited dimension-wise from the anchor.
    fn finalize_placements(&self) -> BTreeMap<StageId, Placement> {
        let mut out = BTreeMap::new();
        for (&id, (pending, _)) in &self.directives {
            if let Pending::Root { tile, threads } = pending {
                let tile: Vec<i64> = tile.iter().map(|t| t.unwrap_or(1)).collect();
                let threads = threads
                    .iter()
                    .zip(&tile)
                    .map(|(th, t)| th.unwrap_or(*t))
                    .collect();
                out.insert(id, Placement::Root { tile, threads });
            }
        }
        for (&id, (pending, _)) in &self.directives {
            let placement = match pending {
                Pending::Root { .. } => continue,
                Pending::Block { anchor, threads } => {
                    let inherited: Vec<i64> = match out.get(anchor) {
                        Some(p) => p.threads().to_vec(),
                        None => Vec::new(),
                    };
                    let threads = threads
                        .iter()
                        .enumerate()
                        .map(|(d, th)| th.unwrap_or_else(|| inherited.get(d).copied().unwrap_or(1)))
                        .collect();
                    Placement::Block {
                        anchor: *anchor,
                        threads,
                    }
                }
                Pending::Thread { anchor } => Placement::Thread { anchor: *anchor },
            };
            out.insert(id, placement);
        }
        out
    }
}

fn lower_op(op: ast::BinOp) -> BinOp {
    match op {
        ast::BinOp::Add => BinOp::Add,
        ast::BinOp::Sub => BinOp::Sub,
        ast::BinOp::Mul => BinOp::Mul,
        ast::BinOp::Div => BinOp::Div,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_source(source: &str) -> ResolveResult {
        let result = crate::parser::parse(source);
        assert!(
            result.errors.is_empty(),
            "parse errors in test: {:?}",
            result.errors
        );
        let program = result.program.expect("parse failed in test");
        resolve(&program)
    }

    fn resolve_ok(source: &str) -> Resolved {
        let result = resolve_source(source);
        assert!(
            !has_errors(&result.diagnostics),
            "unexpected errors: {:#?}",
            result.diagnostics
        );
        result.resolved.expect("resolved program")
    }

    fn error_codes(source: &str) -> Vec<&'static str> {
        let result = resolve_source(source);
        assert!(result.resolved.is_none());
        result
            .diagnostics
            .iter()
            .filter(|d| d.is_error())
            .filter_map(|d| d.code.map(|c| c.0))
            .collect()
    }

    /// Axes of the only read of stage `name`'s `index`-th call site.
    fn axes(r: &Resolved, name: &str, index: usize) -> Vec<AxisAccess> {
        let id = r.graph.lookup(name).unwrap();
        r.graph.stage(id).reads[index].axes.clone()
    }

    const DOUBLING: &str = "\
param n = 500
stage f1(x) = x
stage f2(x) = f1(x) + f1(2*x)
output f2 [n] tile(x: 16) threads(x: 16)
compute f1 at f2 block
";

    #[test]
    fn doubling_chain_resolves() {
        let r = resolve_ok(DOUBLING);
        assert_eq!(r.graph.len(), 2);
        assert_eq!(r.schedule.output, StageId(1));
        assert_eq!(r.schedule.extents, vec![SymExpr::param("n")]);
        assert_eq!(axes(&r, "f2", 0), vec![AxisAccess::identity(0)]);
        assert_eq!(
            axes(&r, "f2", 1),
            vec![AxisAccess::along(0, IndexTransform::Scale(2))]
        );
        assert_eq!(
            r.default_bindings().get(&Symbol::Param("n".into())),
            Some(500)
        );
    }

    #[test]
    fn block_threads_inherit_from_anchor() {
        let r = resolve_ok(DOUBLING);
        assert_eq!(
            r.schedule.placement(StageId(0)),
            Some(&Placement::Block {
                anchor: StageId(1),
                threads: vec![16],
            })
        );
    }

    #[test]
    fn root_threads_default_to_tile() {
        let r = resolve_ok("stage f(x, y) = x\noutput f [8, 8] tile(x: 4)");
        assert_eq!(
            r.schedule.placement(StageId(0)),
            Some(&Placement::Root {
                tile: vec![4, 1],
                threads: vec![4, 1],
            })
        );
    }

    #[test]
    fn argument_classification() {
        let r = resolve_ok(
            "stage g(x) = x\n\
             stage f(x, y) = g(2*x + 1) + g((x + 1) / 2) + g(3) + g(x + y) + g(y - 4)\n\
             output f [4, 4]\n\
             compute g root",
        );
        assert_eq!(
            axes(&r, "f", 0)[0].transform,
            IndexTransform::Compose(vec![IndexTransform::Scale(2), IndexTransform::Offset(1)])
        );
        assert_eq!(
            axes(&r, "f", 1)[0].transform,
            IndexTransform::Compose(vec![IndexTransform::Offset(1), IndexTransform::Div(2)])
        );
        assert_eq!(axes(&r, "f", 2)[0], AxisAccess::constant(3));
        assert!(axes(&r, "f", 3)[0].is_opaque());
        assert_eq!(
            axes(&r, "f", 4)[0],
            AxisAccess::along(1, IndexTransform::Offset(-4))
        );
    }

    #[test]
    fn params_and_calls_in_arguments_are_opaque() {
        let r = resolve_ok(
            "param k\nstage g(x) = x\nstage f(x) = g(x + k) + g(g(x))\n\
             output f [4]\ncompute g root\nbound g x [0, 9]",
        );
        let f = r.graph.stage(r.graph.lookup("f").unwrap());
        assert_eq!(f.reads.len(), 3);
        // inner call first, so the outer read refers to it in its argument
        assert_eq!(f.reads[2].args, vec![Body::Read(ReadId(1))]);
        assert!(f.reads.iter().filter(|r| r.axes[0].is_opaque()).count() == 2);
        let g = r.graph.stage(r.graph.lookup("g").unwrap());
        assert_eq!(g.bounds, vec![Some((0, 9))]);
    }

    #[test]
    fn min_and_max_are_builtins() {
        let r = resolve_ok("stage f(x) = max(x - 3, min(x, 2))\noutput f [4]");
        let f = r.graph.stage(StageId(0));
        assert!(f.reads.is_empty());
        assert_eq!(
            f.body.render(&f.dims, &|_| String::new()),
            "max((x - 3), min(x, 2))"
        );
    }

    #[test]
    fn settings_apply() {
        let r = resolve_ok("set reuse = false\nset shared_limit = 16KB\nset elem_bytes = 8\nstage f(x) = x\noutput f [4]");
        assert_eq!(
            r.settings,
            Settings {
                reuse: false,
                elem_bytes: 8,
                shared_limit: 16 * 1024,
            }
        );
    }

    #[test]
    fn unknown_names() {
        assert_eq!(error_codes("stage f(x) = g(x)\noutput f [4]"), vec!["E0100"]);
        assert_eq!(error_codes("stage f(x) = y\noutput f [4]"), vec!["E0103"]);
        assert_eq!(error_codes("stage f(x) = x\noutput f [m]"), vec!["E0103"]);
        assert_eq!(error_codes("set speed = 3\nstage f(x) = x\noutput f [4]"), vec!["E0108"]);
        assert_eq!(
            error_codes("stage f(x) = x\noutput f [4] tile(y: 2)"),
            vec!["E0109"]
        );
    }

    #[test]
    fn duplicates_and_arity() {
        assert_eq!(
            error_codes("stage f(x) = x\nstage f(x) = x\noutput f [4]"),
            vec!["E0101"]
        );
        assert_eq!(
            error_codes("stage g(x) = x\nstage f(x) = g(x, x)\noutput f [4]\ncompute g root"),
            vec!["E0102"]
        );
        assert_eq!(
            error_codes("stage g(x) = x\nstage f(x) = g(x)\noutput f [4]\ncompute g root\ncompute g root"),
            vec!["E0106"]
        );
    }

    #[test]
    fn invalid_factors() {
        assert_eq!(
            error_codes("stage g(x) = x\nstage f(x) = g(x / 0)\noutput f [4]\ncompute g root"),
            vec!["E0104"]
        );
        assert_eq!(
            error_codes("stage g(x) = x\nstage f(x) = g(0 * x)\noutput f [4]\ncompute g root"),
            vec!["E0104"]
        );
    }

    #[test]
    fn huge_index_constants_are_rejected() {
        assert_eq!(
            error_codes(
                "stage g(x) = x\nstage f(x) = g(4611686018427387904 * 4 + x)\noutput f [4]\ncompute g root"
            ),
            vec!["E0104"]
        );
        assert_eq!(
            error_codes(
                "stage g(x) = x\nstage f(x) = g(x * 2000000000 * 2000000000)\noutput f [4]\ncompute g root"
            ),
            vec!["E0104"]
        );
        assert_eq!(
            error_codes(
                "stage g(x) = x\nstage f(x) = g(x + 9223372036854775807 + 1)\noutput f [4]\ncompute g root"
            ),
            vec!["E0104"]
        );
        // Large but representable offsets still resolve.
        let r = resolve_ok("stage g(x) = x\nstage f(x) = g(x + 1000000)\noutput f [4]\ncompute g root");
        assert_eq!(
            axes(&r, "f", 0),
            vec![AxisAccess::along(0, IndexTransform::Offset(1_000_000))]
        );
    }

    #[test]
    fn element_types_resolve() {
        let r = resolve_ok(
            "set elem_bytes = 2\nstage a(x): u8 = x\nstage f(x) = a(x)\noutput f [4]\ncompute a at f block",
        );
        let elem = |name: &str| r.graph.stage(r.graph.lookup(name).unwrap()).elem;
        assert_eq!(elem("a"), ElemType::U8);
        assert_eq!(elem("f"), ElemType::I16);
        assert_eq!(
            error_codes("stage f(x): f32 = x\noutput f [4]"),
            vec!["E0110"]
        );
    }

    #[test]
    fn element_width_must_be_a_power_of_two() {
        assert_eq!(
            error_codes("set elem_bytes = 3\nstage f(x) = x\noutput f [4]"),
            vec!["E0108"]
        );
        assert_eq!(
            error_codes("set elem_bytes = 16\nstage f(x) = x\noutput f [4]"),
            vec!["E0108"]
        );
    }

    #[test]
    fn missing_output_and_placement() {
        assert_eq!(error_codes("stage f(x) = x"), vec!["E0105"]);
        assert_eq!(
            error_codes("stage g(x) = x\nstage f(x) = g(x)\noutput f [4]"),
            vec!["E0107"]
        );
    }

    #[test]
    fn cycle_is_reported_at_a_stage() {
        let result = resolve_source(
            "stage a(x) = b(x)\nstage b(x) = a(x)\noutput b [4]\ncompute a root",
        );
        assert!(result.resolved.is_none());
        let d = &result.diagnostics[0];
        assert_eq!(d.code, Some(codes::E0200));
        assert!(d.message.starts_with("dependency cycle:"), "{}", d.message);
    }

    #[test]
    fn unread_stage_warns() {
        let result = resolve_source("stage g(x) = x\nstage f(x) = x\noutput f [4]\ncompute g root");
        assert!(result.resolved.is_some());
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].code, Some(codes::W0101));
    }
}
