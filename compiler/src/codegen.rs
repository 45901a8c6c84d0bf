// codegen.rs — CUDA-flavoured kernel source for a program plan
//
// One `__global__` function per kernel. The grid and the thread block are
// launched one-dimensional and decoded into per-dimension block indices
// (`bx`, `by`, ...) and thread indices (`t0`, `t1`, ...). Shared stages are
// filled cooperatively, each thread taking the points congruent to its index
// among the stage's own threads, and every barrier action becomes exactly one
// `__syncthreads()`. The shared arena is raw bytes; each buffer is a typed
// view at its aligned offset. Private stages are inlined into their readers
// by substitution and cast to their element type. Root stores are clamped to
// the root's domain.
//
// Preconditions: `plan` was produced by `lower` for `graph`.
// Postconditions: returns the generated source; emission never fails.
// Failure modes: none.
// Side effects: none.

use std::fmt::Write as _;

use crate::graph::{BinOp, Body, Read, Stage, StageGraph};
use crate::id::{ReadId, StageId};
use crate::lower::{KernelPlan, ProgramPlan};
use crate::placement::StorageClass;
use crate::sym::{Symbol, SymExpr};
use crate::sync::Action;

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct GeneratedCode {
    pub cuda_source: String,
}

// ── Public entry point ──────────────────────────────────────────────────────

pub fn codegen(
    graph: &StageGraph,
    plan: &ProgramPlan,
    params: &[String],
) -> GeneratedCode {
    let mut ctx = CodegenCtx {
        graph,
        plan,
        params,
        out: String::with_capacity(4096),
    };
    ctx.emit_all();
    GeneratedCode {
        cuda_source: ctx.out,
    }
}

/// C rendering of a symbolic size or bound.
pub fn c_expr(e: &SymExpr) -> String {
    match e {
        SymExpr::Const(c) => c.to_string(),
        SymExpr::Sym(s) => s.to_string(),
        SymExpr::Sum(terms, c) => {
            let mut out = String::new();
            for (i, (atom, k)) in terms.iter().enumerate() {
                let a = c_expr(atom);
                let term = match k.abs() {
                    1 => a,
                    m => format!("{m} * {}", paren(atom, a)),
                };
                match (i, *k < 0) {
                    (0, true) => out.push_str(&format!("-{term}")),
                    (0, false) => out.push_str(&term),
                    (_, true) => out.push_str(&format!(" - {term}")),
                    (_, false) => out.push_str(&format!(" + {term}")),
                }
            }
            if *c > 0 {
                out.push_str(&format!(" + {c}"));
            } else if *c < 0 {
                out.push_str(&format!(" - {}", -c));
            }
            out
        }
        SymExpr::Mul(a, b) => format!("{} * {}", paren(a, c_expr(a)), paren(b, c_expr(b))),
        SymExpr::FloorDiv(a, k) => format!("kf_fdiv({}, {k})", c_expr(a)),
        SymExpr::Min(a, b) => format!("min({}, {})", c_expr(a), c_expr(b)),
        SymExpr::Max(a, b) => format!("max({}, {})", c_expr(a), c_expr(b)),
    }
}

fn paren(e: &SymExpr, rendered: String) -> String {
    match e {
        SymExpr::Sum(..) | SymExpr::Mul(..) => format!("({rendered})"),
        _ => rendered,
    }
}

// ── Internal context ────────────────────────────────────────────────────────

struct CodegenCtx<'a> {
    graph: &'a StageGraph,
    plan: &'a ProgramPlan,
    params: &'a [String],
    out: String,
}

impl<'a> CodegenCtx<'a> {
    fn emit_all(&mut self) {
        self.emit_preamble();
        let plan = self.plan;
        for kernel in &plan.kernels {
            self.emit_kernel(kernel);
        }
    }

    fn emit_preamble(&mut self) {
        self.out.push_str("// Generated by kfuse\n");
        self.out.push_str("#include <cuda_runtime.h>\n#include <stdint.h>\n\n");
        self.out.push_str(
            "__device__ __forceinline__ long long kf_fdiv(long long a, long long b) {\n    \
             long long q = a / b;\n    \
             return (a % b != 0 && ((a < 0) != (b < 0))) ? q - 1 : q;\n}\n\n",
        );
    }

    fn name(&self, id: StageId) -> &'a str {
        self.graph.name(id)
    }

    fn c_type(&self, id: StageId) -> &'static str {
        self.plan.elem(id).c_type()
    }

    /// Global inputs of a kernel: producers computed by other kernels.
    fn inputs(&self, kernel: &KernelPlan) -> Vec<StageId> {
        let b = &kernel.bounds;
        b.regions
            .keys()
            .copied()
            .filter(|id| *id != b.root && self.plan.class(*id) == StorageClass::Global)
            .collect()
    }

    fn emit_kernel(&mut self, kernel: &KernelPlan) {
        let b = &kernel.bounds;
        let root = b.root;
        let inputs = self.inputs(kernel);

        let _ = writeln!(
            self.out,
            "// kernel {}: grid [{}] x threads [{}], shared arena {} byte(s)",
            self.name(root),
            b.grid.iter().map(c_expr).collect::<Vec<_>>().join(", "),
            b.threads
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            c_expr(&kernel.allocation.arena)
        );
        let mut sig = vec![format!("{}* __restrict__ g_{}", self.c_type(root), self.name(root))];
        for id in &inputs {
            sig.push(format!(
                "const {}* __restrict__ g_{}",
                self.c_type(*id),
                self.name(*id)
            ));
        }
        for p in self.params {
            sig.push(format!("int {p}"));
        }
        let _ = writeln!(
            self.out,
            "__global__ void kf_{}({}) {{",
            self.name(root),
            sig.join(", ")
        );

        self.emit_indices(kernel);
        for id in std::iter::once(root).chain(inputs.iter().copied()) {
            self.emit_domain(id);
        }
        self.emit_arena(kernel);

        for action in &kernel.actions {
            match action {
                Action::Compute { stage } if *stage == root => self.emit_root_store(kernel),
                Action::Compute { stage } => self.emit_fill(kernel, *stage),
                Action::Barrier { after } => {
                    let _ = writeln!(self.out, "    __syncthreads(); // {} complete", self.name(*after));
                }
            }
        }
        self.out.push_str("}\n\n");
    }

    fn emit_indices(&mut self, kernel: &KernelPlan) {
        let b = &kernel.bounds;
        self.out.push_str("    int kf_block = blockIdx.x;\n");
        for (d, g) in b.grid.iter().enumerate() {
            let _ = writeln!(
                self.out,
                "    const int {} = kf_block % ({}); kf_block /= ({});",
                Symbol::Block(d),
                c_expr(g),
                c_expr(g)
            );
        }
        self.out.push_str("    int kf_thread = threadIdx.x;\n");
        for (d, t) in b.threads.iter().enumerate() {
            let _ = writeln!(
                self.out,
                "    const int t{d} = kf_thread % {t}; kf_thread /= {t};"
            );
        }
    }

    /// Bounds of a globally stored stage's domain, for indexing its array.
    fn emit_domain(&mut self, id: StageId) {
        let Some(k) = self.plan.kernel(id) else {
            return;
        };
        let name = self.name(id).to_string();
        for (d, iv) in k.bounds.domain.dims().iter().enumerate() {
            let _ = writeln!(
                self.out,
                "    const int g_{name}_lo{d} = {}, g_{name}_hi{d} = {}, g_{name}_ext{d} = {};",
                c_expr(&iv.lo),
                c_expr(&iv.hi),
                c_expr(&iv.extent())
            );
        }
    }

    fn emit_arena(&mut self, kernel: &KernelPlan) {
        let alloc = &kernel.allocation;
        if alloc.is_empty() {
            return;
        }
        match alloc.arena.as_const() {
            Some(n) => {
                let _ = writeln!(self.out, "    __shared__ __align__(16) unsigned char kf_arena[{n}];");
            }
            None => self
                .out
                .push_str("    extern __shared__ __align__(16) unsigned char kf_arena[];\n"),
        }
        for buf in &alloc.buffers {
            let name = self.name(buf.stage).to_string();
            let ty = self.c_type(buf.stage);
            let _ = writeln!(
                self.out,
                "    {ty}* s_{name} = ({ty}*)(kf_arena + {}); // slot {}",
                c_expr(&buf.offset),
                buf.slot
            );
            let Some(region) = kernel.bounds.regions.get(&buf.stage) else {
                continue;
            };
            for (d, (iv, ext)) in region.dims().iter().zip(&buf.extents).enumerate() {
                let _ = writeln!(
                    self.out,
                    "    const int s_{name}_lo{d} = {}, s_{name}_n{d} = {}, s_{name}_ext{d} = {};",
                    c_expr(&iv.lo),
                    c_expr(&iv.extent()),
                    c_expr(ext)
                );
            }
        }
    }

    /// Loop nest over `extents`, strided by the threads `stage` fills with.
    /// Block threads beyond that count sit out. Returns the closing text and
    /// the indentation of the body.
    fn open_loops(
        &mut self,
        kernel: &KernelPlan,
        stage: StageId,
        extents: &[String],
    ) -> (String, String) {
        let threads = &kernel.bounds.threads;
        let fill = kernel.bounds.threads_of(stage);
        let mut indent = "    ".to_string();

        // dimensions the stage lacks count as one thread
        let width = |d: usize| {
            if d < extents.len() {
                fill.get(d).copied().unwrap_or(1).max(1)
            } else {
                1
            }
        };
        let idle: Vec<String> = threads
            .iter()
            .enumerate()
            .filter(|(d, t)| width(*d) < **t)
            .map(|(d, _)| match width(d) {
                1 => format!("t{d} == 0"),
                w => format!("t{d} < {w}"),
            })
            .collect();
        let mut close = String::new();
        if !idle.is_empty() {
            let _ = writeln!(self.out, "{indent}if ({}) {{", idle.join(" && "));
            close.insert_str(0, &format!("{indent}}}\n"));
            indent.push_str("    ");
        }
        for (d, n) in extents.iter().enumerate() {
            let (start, step) = match threads.get(d) {
                Some(_) => (format!("t{d}"), width(d).to_string()),
                None => ("0".to_string(), "1".to_string()),
            };
            let _ = writeln!(
                self.out,
                "{indent}for (int i{d} = {start}; i{d} < {n}; i{d} += {step}) {{"
            );
            close.insert_str(0, &format!("{indent}}}\n"));
            indent.push_str("    ");
        }
        (close, indent)
    }

    fn emit_fill(&mut self, kernel: &KernelPlan, id: StageId) {
        let graph = self.graph;
        let stage = graph.stage(id);
        let name = stage.name.clone();
        let _ = writeln!(self.out, "    // {name}: shared");
        let extents: Vec<String> = (0..stage.arity()).map(|d| format!("s_{name}_n{d}")).collect();
        let (close, indent) = self.open_loops(kernel, id, &extents);
        for (d, var) in stage.dims.iter().enumerate() {
            let _ = writeln!(self.out, "{indent}const int {var} = s_{name}_lo{d} + i{d};");
        }
        let index = linear_index(
            &(0..stage.arity()).map(|d| format!("i{d}")).collect::<Vec<_>>(),
            &(0..stage.arity()).map(|d| format!("s_{name}_ext{d}")).collect::<Vec<_>>(),
        );
        let value = self.render_body(stage, &stage.body, &stage.dims);
        let _ = writeln!(
            self.out,
            "{indent}s_{name}[{index}] = ({})({value});",
            stage.elem.c_type()
        );
        self.out.push_str(&close);
    }

    fn emit_root_store(&mut self, kernel: &KernelPlan) {
        let b = &kernel.bounds;
        let graph = self.graph;
        let stage = graph.stage(b.root);
        let name = stage.name.clone();
        let _ = writeln!(self.out, "    // {name}: global");
        let tile: Vec<String> = b.tile.iter().map(|t| t.to_string()).collect();
        let (close, indent) = self.open_loops(kernel, b.root, &tile);
        let mut coords = Vec::with_capacity(stage.arity());
        for (d, var) in stage.dims.iter().enumerate() {
            let _ = writeln!(
                self.out,
                "{indent}const int {var} = g_{name}_lo{d} + {} * {} + i{d};",
                b.tile[d],
                Symbol::Block(d)
            );
            coords.push(format!("{var} <= g_{name}_hi{d}"));
        }
        let index = self.global_index(b.root, &stage.dims);
        let value = self.render_body(stage, &stage.body, &stage.dims);
        let _ = writeln!(
            self.out,
            "{indent}if ({}) g_{name}[{index}] = ({})({value});",
            coords.join(" && "),
            stage.elem.c_type()
        );
        self.out.push_str(&close);
    }

    fn global_index(&self, id: StageId, coords: &[String]) -> String {
        let name = self.name(id);
        let rel: Vec<String> = coords
            .iter()
            .enumerate()
            .map(|(d, c)| format!("({c}) - g_{name}_lo{d}"))
            .collect();
        let ext: Vec<String> = (0..coords.len()).map(|d| format!("g_{name}_ext{d}")).collect();
        linear_index(&rel, &ext)
    }

    // ── Body rendering ──────────────────────────────────────────────────

    fn render_body(&self, stage: &Stage, body: &Body, vars: &[String]) -> String {
        match body {
            Body::Const(c) => c.to_string(),
            Body::Var(d) => vars.get(*d).cloned().unwrap_or_else(|| "0".to_string()),
            Body::Param(name) => name.clone(),
            Body::Read(id) => self.render_read(stage, *id, vars),
            Body::Neg(inner) => format!("-({})", self.render_body(stage, inner, vars)),
            Body::Binary(op, l, r) => {
                let l = self.render_body(stage, l, vars);
                let r = self.render_body(stage, r, vars);
                match op {
                    BinOp::Div => format!("kf_fdiv({l}, {r})"),
                    BinOp::Min => format!("min({l}, {r})"),
                    BinOp::Max => format!("max({l}, {r})"),
                    other => format!("({l} {} {r})", other.symbol()),
                }
            }
        }
    }

    fn render_read(&self, stage: &Stage, id: ReadId, vars: &[String]) -> String {
        let Some(read) = stage.read(id) else {
            return "0".to_string();
        };
        let args: Vec<String> = read
            .args
            .iter()
            .map(|a| self.render_body(stage, a, vars))
            .collect();
        self.render_access(read, &args)
    }

    fn render_access(&self, read: &Read, args: &[String]) -> String {
        let producer = self.graph.stage(read.producer);
        let name = &producer.name;
        match self.plan.class(read.producer) {
            StorageClass::Private => {
                let wrapped: Vec<String> = args.iter().map(|a| format!("({a})")).collect();
                format!(
                    "(({})({}))",
                    producer.elem.c_type(),
                    self.render_body(producer, &producer.body, &wrapped)
                )
            }
            StorageClass::Shared => {
                let rel: Vec<String> = args
                    .iter()
                    .enumerate()
                    .map(|(d, a)| format!("({a}) - s_{name}_lo{d}"))
                    .collect();
                let ext: Vec<String> = (0..args.len()).map(|d| format!("s_{name}_ext{d}")).collect();
                format!("s_{name}[{}]", linear_index(&rel, &ext))
            }
            StorageClass::Global => format!("g_{name}[{}]", self.global_index(read.producer, args)),
        }
    }
}

/// Row-major offset of `coords` in an array of `extents`.
fn linear_index(coords: &[String], extents: &[String]) -> String {
    match coords.len() {
        0 => "0".to_string(),
        _ => coords[1..]
            .iter()
            .zip(&extents[1..])
            .fold(coords[0].clone(), |acc, (c, e)| format!("({acc}) * {e} + {c}")),
    }
}
