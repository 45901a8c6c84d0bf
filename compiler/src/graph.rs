// graph.rs — Stage graph: stages, read edges, and dependency order
//
// Every stage is a pure function over an N-dimensional integer domain. Its
// body may read other stages at coordinates derived from its own variables;
// each such call site is a `Read` edge carrying one `AxisAccess` per producer
// dimension. The graph is an arena keyed by `StageId`; edges point from a
// consumer to its producers.
//
// Preconditions: every `Read::producer` names a stage declared in the same builder.
// Postconditions: a built `StageGraph` is acyclic and its consumer lists are
//                 sorted and deduplicated.
// Failure modes: a dependency cycle → `FuseError::Cycle` naming one cycle.
// Side effects: none.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;

use serde::Serialize;

use crate::ast::Span;
use crate::error::{FuseError, Result};
use crate::id::{IdAllocator, ReadId, StageId};
use crate::sym::floor_div;
use crate::transform::IndexTransform;

// ── Element types ───────────────────────────────────────────────────────────

/// Integer type a stage stores its values as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElemType {
    I8,
    U8,
    I16,
    U16,
    #[default]
    I32,
    U32,
    I64,
    U64,
}

impl ElemType {
    pub const ALL: [ElemType; 8] = [
        ElemType::I8,
        ElemType::U8,
        ElemType::I16,
        ElemType::U16,
        ElemType::I32,
        ElemType::U32,
        ElemType::I64,
        ElemType::U64,
    ];

    pub fn from_name(name: &str) -> Option<ElemType> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Signed type of the given width, for `set elem_bytes`.
    pub fn signed(bytes: u64) -> Option<ElemType> {
        match bytes {
            1 => Some(ElemType::I8),
            2 => Some(ElemType::I16),
            4 => Some(ElemType::I32),
            8 => Some(ElemType::I64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ElemType::I8 => "i8",
            ElemType::U8 => "u8",
            ElemType::I16 => "i16",
            ElemType::U16 => "u16",
            ElemType::I32 => "i32",
            ElemType::U32 => "u32",
            ElemType::I64 => "i64",
            ElemType::U64 => "u64",
        }
    }

    pub fn bytes(self) -> i64 {
        match self {
            ElemType::I8 | ElemType::U8 => 1,
            ElemType::I16 | ElemType::U16 => 2,
            ElemType::I32 | ElemType::U32 => 4,
            ElemType::I64 | ElemType::U64 => 8,
        }
    }

    pub fn c_type(self) -> &'static str {
        match self {
            ElemType::I8 => "int8_t",
            ElemType::U8 => "uint8_t",
            ElemType::I16 => "int16_t",
            ElemType::U16 => "uint16_t",
            ElemType::I32 => "int32_t",
            ElemType::U32 => "uint32_t",
            ElemType::I64 => "int64_t",
            ElemType::U64 => "uint64_t",
        }
    }

    /// `v` converted to this type the way a C store truncates it. `u64`
    /// keeps the two's complement bits.
    pub fn wrap(self, v: i64) -> i64 {
        match self {
            ElemType::I8 => v as i8 as i64,
            ElemType::U8 => v as u8 as i64,
            ElemType::I16 => v as i16 as i64,
            ElemType::U16 => v as u16 as i64,
            ElemType::I32 => v as i32 as i64,
            ElemType::U32 => v as u32 as i64,
            ElemType::I64 | ElemType::U64 => v,
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ── Stage body ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

impl BinOp {
    /// Integer semantics. Division floors and yields 0 for a zero divisor.
    pub fn apply(self, a: i64, b: i64) -> i64 {
        match self {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div if b == 0 => 0,
            BinOp::Div => floor_div(a, b),
            BinOp::Min => a.min(b),
            BinOp::Max => a.max(b),
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Min => "min",
            BinOp::Max => "max",
        }
    }
}

/// Scalar expression computed at one point of a stage's domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Const(i64),
    /// The stage's own variable, by dimension index.
    Var(usize),
    /// Runtime parameter.
    Param(String),
    /// Value of a producer at the coordinates recorded in the read edge.
    Read(ReadId),
    Neg(Box<Body>),
    Binary(BinOp, Box<Body>, Box<Body>),
}

impl Body {
    pub fn binary(op: BinOp, lhs: Body, rhs: Body) -> Body {
        Body::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn read(index: u32) -> Body {
        Body::Read(ReadId(index))
    }

    /// Sum of the given terms, left associated. Empty sums are 0.
    pub fn sum(terms: impl IntoIterator<Item = Body>) -> Body {
        let mut iter = terms.into_iter();
        let Some(first) = iter.next() else {
            return Body::Const(0);
        };
        iter.fold(first, |acc, t| Body::binary(BinOp::Add, acc, t))
    }

    /// Every read edge the body refers to, in visiting order.
    pub fn read_ids(&self) -> Vec<ReadId> {
        let mut out = Vec::new();
        self.collect_reads(&mut out);
        out
    }

    fn collect_reads(&self, out: &mut Vec<ReadId>) {
        match self {
            Body::Read(id) => out.push(*id),
            Body::Neg(inner) => inner.collect_reads(out),
            Body::Binary(_, l, r) => {
                l.collect_reads(out);
                r.collect_reads(out);
            }
            Body::Const(_) | Body::Var(_) | Body::Param(_) => {}
        }
    }

    /// Render with `dims` naming the variables and `read` rendering call sites.
    pub fn render(&self, dims: &[String], read: &dyn Fn(ReadId) -> String) -> String {
        match self {
            Body::Const(c) => c.to_string(),
            Body::Var(d) => dims.get(*d).cloned().unwrap_or_else(|| format!("v{d}")),
            Body::Param(name) => name.clone(),
            Body::Read(id) => read(*id),
            Body::Neg(inner) => format!("-({})", inner.render(dims, read)),
            Body::Binary(op @ (BinOp::Min | BinOp::Max), l, r) => format!(
                "{}({}, {})",
                op.symbol(),
                l.render(dims, read),
                r.render(dims, read)
            ),
            Body::Binary(op, l, r) => format!(
                "({} {} {})",
                l.render(dims, read),
                op.symbol(),
                r.render(dims, read)
            ),
        }
    }
}

// ── Read edges ──────────────────────────────────────────────────────────────

/// How one producer dimension is indexed by a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisAccess {
    /// Consumer dimension feeding the index, or `None` for a constant or
    /// data-dependent index.
    pub dim: Option<usize>,
    /// Maps the consumer coordinate to the producer coordinate. For a
    /// constant index (`dim == None`) this is `Offset(c)` applied to 0.
    pub transform: IndexTransform,
}

impl AxisAccess {
    pub fn identity(dim: usize) -> Self {
        AxisAccess {
            dim: Some(dim),
            transform: IndexTransform::Identity,
        }
    }

    pub fn along(dim: usize, transform: IndexTransform) -> Self {
        AxisAccess {
            dim: Some(dim),
            transform,
        }
    }

    pub fn constant(at: i64) -> Self {
        AxisAccess {
            dim: None,
            transform: IndexTransform::Offset(at),
        }
    }

    pub fn opaque() -> Self {
        AxisAccess {
            dim: None,
            transform: IndexTransform::Opaque,
        }
    }

    pub fn is_opaque(&self) -> bool {
        !self.transform.has_inverse()
    }

    /// Index expression as a body over the consumer variables, when the
    /// access can be expressed without the original call arguments.
    pub fn to_body(&self) -> Option<Body> {
        match self.dim {
            Some(d) => transform_body(&self.transform, Body::Var(d)),
            None => transform_body(&self.transform, Body::Const(0)),
        }
    }

    /// Render against the consumer's dimension names.
    pub fn render(&self, dims: &[String]) -> String {
        match self.dim {
            Some(d) => {
                let var = dims.get(d).map(String::as_str).unwrap_or("?");
                self.transform.render(var)
            }
            None => match &self.transform {
                IndexTransform::Offset(c) => c.to_string(),
                _ => "?".to_string(),
            },
        }
    }
}

fn transform_body(transform: &IndexTransform, input: Body) -> Option<Body> {
    match transform {
        IndexTransform::Identity => Some(input),
        IndexTransform::Offset(k) => Some(match input {
            Body::Const(c) => Body::Const(c + k),
            other => Body::binary(BinOp::Add, other, Body::Const(*k)),
        }),
        IndexTransform::Scale(k) => Some(Body::binary(BinOp::Mul, Body::Const(*k), input)),
        IndexTransform::Div(k) => Some(Body::binary(BinOp::Div, input, Body::Const(*k))),
        IndexTransform::Compose(steps) => steps
            .iter()
            .try_fold(input, |acc, step| transform_body(step, acc)),
        IndexTransform::Opaque => None,
    }
}

/// One call site `producer(args...)` inside a consumer body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Read {
    pub id: ReadId,
    pub producer: StageId,
    /// One entry per producer dimension.
    pub axes: Vec<AxisAccess>,
    /// The argument expressions as written. Evaluated pointwise; the
    /// `axes` are their classification for region analysis.
    pub args: Vec<Body>,
}

impl Read {
    /// A read whose arguments are fully described by `axes`.
    /// The id is assigned when the read is attached to a stage.
    pub fn affine(producer: StageId, axes: Vec<AxisAccess>) -> Self {
        let args = axes
            .iter()
            .map(|a| a.to_body().unwrap_or(Body::Const(0)))
            .collect();
        Read {
            id: ReadId(0),
            producer,
            axes,
            args,
        }
    }

    /// A read with explicit argument expressions, used when some axis is opaque.
    pub fn with_args(producer: StageId, axes: Vec<AxisAccess>, args: Vec<Body>) -> Self {
        Read {
            id: ReadId(0),
            producer,
            axes,
            args,
        }
    }
}

// ── Stages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    pub name: String,
    pub dims: Vec<String>,
    pub elem: ElemType,
    pub body: Body,
    pub reads: Vec<Read>,
    /// Declared bounds per dimension, used when a reader's access is opaque.
    pub bounds: Vec<Option<(i64, i64)>>,
    pub span: Span,
}

impl Stage {
    pub fn arity(&self) -> usize {
        self.dims.len()
    }

    pub fn read(&self, id: ReadId) -> Option<&Read> {
        self.reads.get(id.0 as usize)
    }

    /// Distinct producers, in id order.
    pub fn producers(&self) -> Vec<StageId> {
        let mut out: Vec<StageId> = self.reads.iter().map(|r| r.producer).collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn reads_from(&self, producer: StageId) -> impl Iterator<Item = &Read> {
        self.reads.iter().filter(move |r| r.producer == producer)
    }
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Incremental construction of a `StageGraph`. Stages may be declared before
/// their bodies are known so that reads can refer forward.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    ids: IdAllocator,
    stages: Vec<Stage>,
    by_name: HashMap<String, StageId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id for a stage with the given dimensions and an empty body.
    pub fn declare(&mut self, name: &str, dims: Vec<String>, span: Span) -> StageId {
        let id = self.ids.alloc_stage();
        let arity = dims.len();
        self.stages.push(Stage {
            id,
            name: name.to_string(),
            dims,
            elem: ElemType::default(),
            body: Body::Const(0),
            reads: Vec::new(),
            bounds: vec![None; arity],
            span,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Attach a body and its read edges. Read ids are their positions.
    pub fn define(&mut self, id: StageId, body: Body, reads: Vec<Read>) {
        let stage = &mut self.stages[id.index()];
        stage.body = body;
        stage.reads = reads
            .into_iter()
            .enumerate()
            .map(|(i, mut r)| {
                r.id = ReadId(i as u32);
                r
            })
            .collect();
    }

    /// Declare and define in one step.
    pub fn add_stage(&mut self, name: &str, dims: &[&str], body: Body, reads: Vec<Read>) -> StageId {
        let dims = dims.iter().map(|d| d.to_string()).collect();
        let id = self.declare(name, dims, Span::from(0..0));
        self.define(id, body, reads);
        id
    }

    pub fn set_elem(&mut self, id: StageId, elem: ElemType) {
        self.stages[id.index()].elem = elem;
    }

    pub fn set_bound(&mut self, id: StageId, dim: usize, lo: i64, hi: i64) {
        if let Some(slot) = self.stages[id.index()].bounds.get_mut(dim) {
            *slot = Some((lo, hi));
        }
    }

    pub fn lookup(&self, name: &str) -> Option<StageId> {
        self.by_name.get(name).copied()
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id.index()]
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Freeze the graph, rejecting cycles.
    pub fn build(self) -> Result<StageGraph> {
        let mut consumers = vec![Vec::new(); self.stages.len()];
        for stage in &self.stages {
            for p in stage.producers() {
                consumers[p.index()].push(stage.id);
            }
        }
        for list in &mut consumers {
            list.sort();
            list.dedup();
        }
        let graph = StageGraph {
            stages: self.stages,
            by_name: self.by_name,
            consumers,
        };

        let ordered = graph.topological_order().count();
        if ordered < graph.len() {
            return Err(FuseError::Cycle {
                stages: graph.find_cycle(),
            });
        }
        Ok(graph)
    }
}

// ── Graph ───────────────────────────────────────────────────────────────────

/// An acyclic set of stages. Immutable once built.
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<Stage>,
    by_name: HashMap<String, StageId>,
    consumers: Vec<Vec<StageId>>,
}

impl StageGraph {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id.index()]
    }

    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    pub fn lookup(&self, name: &str) -> Option<StageId> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: StageId) -> &str {
        &self.stages[id.index()].name
    }

    /// Distinct stages reading `id`, in id order.
    pub fn consumers(&self, id: StageId) -> &[StageId] {
        &self.consumers[id.index()]
    }

    pub fn producers(&self, id: StageId) -> Vec<StageId> {
        self.stage(id).producers()
    }

    /// Producers before consumers; among ready stages the smallest id first.
    /// Each call starts a fresh traversal.
    pub fn topological_order(&self) -> TopoOrder<'_> {
        let pending: Vec<usize> = self.stages.iter().map(|s| s.producers().len()).collect();
        let ready = pending
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| Reverse(StageId(i as u32)))
            .collect();
        TopoOrder {
            graph: self,
            pending,
            ready,
        }
    }

    /// True if `to` is reachable from `from` by following producer edges
    /// (i.e. `from` depends on `to`, directly or transitively).
    pub fn depends_on(&self, from: StageId, to: StageId) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.len()];
        while let Some(id) = stack.pop() {
            for p in self.producers(id) {
                if p == to {
                    return true;
                }
                if !seen[p.index()] {
                    seen[p.index()] = true;
                    stack.push(p);
                }
            }
        }
        false
    }

    /// Walk producer edges among stages Kahn's algorithm could not order
    /// until a stage repeats.
    fn find_cycle(&self) -> Vec<String> {
        let mut blocked = vec![true; self.len()];
        for id in self.topological_order() {
            blocked[id.index()] = false;
        }
        let Some(start) = blocked.iter().position(|b| *b) else {
            return Vec::new();
        };

        let mut path: Vec<StageId> = Vec::new();
        let mut position: HashMap<StageId, usize> = HashMap::new();
        let mut cur = StageId(start as u32);
        loop {
            if let Some(&at) = position.get(&cur) {
                let mut names: Vec<String> =
                    path[at..].iter().map(|id| self.name(*id).to_string()).collect();
                names.push(self.name(cur).to_string());
                return names;
            }
            position.insert(cur, path.len());
            path.push(cur);
            // A blocked stage always has a blocked producer.
            match self
                .producers(cur)
                .into_iter()
                .find(|p| blocked[p.index()])
            {
                Some(next) => cur = next,
                None => return path.iter().map(|id| self.name(*id).to_string()).collect(),
            }
        }
    }
}

/// Lazy Kahn traversal over a `StageGraph`.
pub struct TopoOrder<'a> {
    graph: &'a StageGraph,
    pending: Vec<usize>,
    ready: BinaryHeap<Reverse<StageId>>,
}

impl Iterator for TopoOrder<'_> {
    type Item = StageId;

    fn next(&mut self) -> Option<StageId> {
        let Reverse(id) = self.ready.pop()?;
        for &c in self.graph.consumers(id) {
            let n = &mut self.pending[c.index()];
            *n -= 1;
            if *n == 0 {
                self.ready.push(Reverse(c));
            }
        }
        Some(id)
    }
}

// ── Display ─────────────────────────────────────────────────────────────────

impl fmt::Display for StageGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StageGraph ({} stages)", self.len())?;
        for stage in &self.stages {
            let reads: Vec<String> = stage
                .reads
                .iter()
                .map(|r| {
                    let idx: Vec<String> = r.axes.iter().map(|a| a.render(&stage.dims)).collect();
                    format!("{}({})", self.name(r.producer), idx.join(", "))
                })
                .collect();
            let reads = if reads.is_empty() {
                "-".to_string()
            } else {
                reads.join(", ")
            };
            writeln!(f, "  {}({}) <- {}", stage.name, stage.dims.join(", "), reads)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// f1(x) = x; f2(x) = f1(x) + f1(2x); f3 likewise over f2.
    fn chain() -> StageGraph {
        let mut b = GraphBuilder::new();
        let f1 = b.add_stage("f1", &["x"], Body::Var(0), vec![]);
        let f2 = b.add_stage(
            "f2",
            &["x"],
            Body::sum([Body::read(0), Body::read(1)]),
            vec![
                Read::affine(f1, vec![AxisAccess::identity(0)]),
                Read::affine(f1, vec![AxisAccess::along(0, IndexTransform::Scale(2))]),
            ],
        );
        b.add_stage(
            "f3",
            &["x"],
            Body::sum([Body::read(0), Body::read(1)]),
            vec![
                Read::affine(f2, vec![AxisAccess::identity(0)]),
                Read::affine(f2, vec![AxisAccess::along(0, IndexTransform::Scale(2))]),
            ],
        );
        b.build().unwrap()
    }

    #[test]
    fn topological_order_puts_producers_first() {
        let g = chain();
        let order: Vec<StageId> = g.topological_order().collect();
        assert_eq!(order, vec![StageId(0), StageId(1), StageId(2)]);
    }

    #[test]
    fn topological_order_is_restartable() {
        let g = chain();
        let mut first = g.topological_order();
        assert_eq!(first.next(), Some(StageId(0)));
        let second: Vec<StageId> = g.topological_order().collect();
        assert_eq!(second.len(), 3);
        assert_eq!(first.count(), 2);
    }

    #[test]
    fn ready_stages_are_ordered_by_id() {
        let mut b = GraphBuilder::new();
        let a = b.add_stage("a", &["x"], Body::Const(1), vec![]);
        let c = b.add_stage("c", &["x"], Body::Const(2), vec![]);
        b.add_stage(
            "out",
            &["x"],
            Body::sum([Body::read(0), Body::read(1)]),
            vec![
                Read::affine(c, vec![AxisAccess::identity(0)]),
                Read::affine(a, vec![AxisAccess::identity(0)]),
            ],
        );
        let g = b.build().unwrap();
        let names: Vec<&str> = g.topological_order().map(|id| g.name(id)).collect();
        assert_eq!(names, vec!["a", "c", "out"]);
    }

    #[test]
    fn consumers_are_deduplicated() {
        let g = chain();
        assert_eq!(g.consumers(StageId(0)), &[StageId(1)]);
        assert_eq!(g.producers(StageId(1)), vec![StageId(0)]);
        assert!(g.consumers(StageId(2)).is_empty());
        assert!(g.depends_on(StageId(2), StageId(0)));
        assert!(!g.depends_on(StageId(0), StageId(2)));
    }

    #[test]
    fn cycle_is_rejected_with_path() {
        let mut b = GraphBuilder::new();
        let a = b.declare("a", vec!["x".into()], Span::from(0..0));
        let c = b.declare("b", vec!["x".into()], Span::from(0..0));
        b.define(a, Body::read(0), vec![Read::affine(c, vec![AxisAccess::identity(0)])]);
        b.define(c, Body::read(0), vec![Read::affine(a, vec![AxisAccess::identity(0)])]);
        match b.build() {
            Err(FuseError::Cycle { stages }) => {
                assert_eq!(stages.first(), stages.last());
                assert_eq!(stages.len(), 3);
            }
            other => panic!("expected cycle, got {:?}", other.map(|g| g.len())),
        }
    }

    #[test]
    fn self_read_is_a_cycle() {
        let mut b = GraphBuilder::new();
        let f = b.declare("f", vec!["x".into()], Span::from(0..0));
        b.define(
            f,
            Body::read(0),
            vec![Read::affine(f, vec![AxisAccess::along(0, IndexTransform::Offset(-1))])],
        );
        let err = b.build().unwrap_err();
        assert_eq!(err.to_string(), "dependency cycle: f -> f");
    }

    #[test]
    fn affine_read_derives_argument_bodies() {
        let r = Read::affine(
            StageId(0),
            vec![
                AxisAccess::along(0, IndexTransform::Div(2)),
                AxisAccess::constant(3),
            ],
        );
        assert_eq!(
            r.args[0],
            Body::binary(BinOp::Div, Body::Var(0), Body::Const(2))
        );
        assert_eq!(r.args[1], Body::Const(3));
    }

    #[test]
    fn floor_division_rounds_down() {
        assert_eq!(BinOp::Div.apply(-3, 2), -2);
        assert_eq!(BinOp::Div.apply(3, 2), 1);
        assert_eq!(BinOp::Div.apply(3, -2), -2);
        assert_eq!(BinOp::Div.apply(5, 0), 0);
    }

    #[test]
    fn display_lists_reads() {
        let g = chain();
        let text = g.to_string();
        assert!(text.contains("f2(x) <- f1(x), f1(2*x)"), "{text}");
        assert!(text.contains("f1(x) <- -"));
    }

    #[test]
    fn element_types_truncate_like_c_stores() {
        assert_eq!(ElemType::U8.wrap(300), 44);
        assert_eq!(ElemType::I8.wrap(200), -56);
        assert_eq!(ElemType::U16.wrap(-1), 65535);
        assert_eq!(ElemType::U32.wrap(1 << 32), 0);
        assert_eq!(ElemType::I64.wrap(-7), -7);
        assert_eq!(ElemType::from_name("u16"), Some(ElemType::U16));
        assert_eq!(ElemType::from_name("float"), None);
        assert_eq!(ElemType::signed(2), Some(ElemType::I16));
        assert_eq!(ElemType::signed(3), None);
        assert_eq!(ElemType::default().bytes(), 4);
    }

    #[test]
    fn stages_default_to_i32() {
        let mut b = GraphBuilder::new();
        let a = b.add_stage("a", &["x"], Body::Var(0), vec![]);
        b.set_elem(a, ElemType::U8);
        let f = b.add_stage("f", &["x"], Body::read(0), vec![Read::affine(a, vec![AxisAccess::identity(0)])]);
        let g = b.build().unwrap();
        assert_eq!(g.stage(a).elem, ElemType::U8);
        assert_eq!(g.stage(f).elem, ElemType::I32);
    }
}
