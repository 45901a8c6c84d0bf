// sim.rs — Reference block executor for program plans
//
// Runs a plan on the CPU with the grid/block/thread model the kernels are
// emitted for. Kernels run in plan order; blocks run independently, each with
// a fresh arena of the planned size; inside a block every action runs for all
// threads, each thread taking the points congruent to its index exactly as
// the emitted fill loops do, and threads beyond a stage's own thread count
// sitting out. Barriers advance the epoch. The arena is addressed in bytes and
// an element covers as many cells as its type is wide. Every cell remembers
// which stage wrote it, and which thread in which epoch last wrote and read
// it, so the executor catches reads outside a propagated region, reads of
// cells the plan never filled (or already handed to another buffer, even in
// part), and unsynchronized cross-thread access. Stored values are truncated
// to their stage's element type.
//
// Preconditions: `plan` was produced for `graph`; `bindings` binds every
//                runtime parameter the plan mentions.
// Postconditions: on success, every Global stage holds one value per point
//                 of its domain.
// Failure modes: `SimError` for coverage, initialization, and race faults;
//                `SimError::Fuse` for unbound parameters.
// Side effects: none.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use thiserror::Error;
use tracing::{debug, trace};

use crate::error::FuseError;
use crate::graph::{Body, Stage, StageGraph};
use crate::id::StageId;
use crate::lower::{KernelPlan, ProgramPlan};
use crate::placement::StorageClass;
use crate::region::Region;
use crate::sym::{Bindings, Symbol};
use crate::sync::Action;

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    /// A read fell outside the region planned for its producer.
    #[error("'{consumer}' read '{producer}' at {coords:?}, outside the region planned for block {block:?}")]
    UncoveredRead {
        producer: String,
        consumer: String,
        coords: Vec<i64>,
        block: Vec<i64>,
    },

    /// A read found no value, or a value another buffer left behind.
    #[error("'{consumer}' read '{producer}' at {coords:?} before it was written (block {block:?})")]
    UninitializedRead {
        producer: String,
        consumer: String,
        coords: Vec<i64>,
        block: Vec<i64>,
    },

    /// Two threads touched the same cell within one barrier epoch and at
    /// least one of them wrote it.
    #[error("race on '{stage}' at {coords:?} in block {block:?}: threads {first} and {second} in epoch {epoch}")]
    Race {
        stage: String,
        coords: Vec<i64>,
        block: Vec<i64>,
        first: usize,
        second: usize,
        epoch: usize,
    },

    /// A buffer access landed past the end of its buffer or the arena.
    #[error("buffer of '{stage}' overflows at {coords:?} in block {block:?}")]
    ArenaOverflow {
        stage: String,
        coords: Vec<i64>,
        block: Vec<i64>,
    },

    #[error(transparent)]
    Fuse(#[from] FuseError),
}

pub type SimResult<T> = std::result::Result<T, SimError>;

// ── Global arrays ───────────────────────────────────────────────────────────

/// Values of one globally stored stage over its domain, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalArray {
    pub lo: Vec<i64>,
    pub hi: Vec<i64>,
    data: Vec<Option<i64>>,
}

impl GlobalArray {
    fn new(bounds: &[(i64, i64)]) -> Self {
        let lo: Vec<i64> = bounds.iter().map(|b| b.0).collect();
        let hi: Vec<i64> = bounds.iter().map(|b| b.1).collect();
        let len = bounds
            .iter()
            .map(|(l, h)| (h - l + 1).max(0) as usize)
            .product();
        GlobalArray {
            lo,
            hi,
            data: vec![None; len],
        }
    }

    pub fn extents(&self) -> Vec<i64> {
        self.lo
            .iter()
            .zip(&self.hi)
            .map(|(l, h)| (h - l + 1).max(0))
            .collect()
    }

    fn index(&self, coords: &[i64]) -> Option<usize> {
        if coords.len() != self.lo.len() {
            return None;
        }
        let ext = self.extents();
        let mut idx = 0usize;
        for d in 0..coords.len() {
            if coords[d] < self.lo[d] || coords[d] > self.hi[d] {
                return None;
            }
            idx = idx * ext[d] as usize + (coords[d] - self.lo[d]) as usize;
        }
        Some(idx)
    }

    /// Value at `coords`, if the point is in the domain and was stored.
    pub fn get(&self, coords: &[i64]) -> Option<i64> {
        self.data.get(self.index(coords)?).copied().flatten()
    }

    fn set(&mut self, coords: &[i64], value: i64) -> bool {
        match self.index(coords) {
            Some(i) => {
                self.data[i] = Some(value);
                true
            }
            None => false,
        }
    }

    /// Number of points that hold a value.
    pub fn written(&self) -> usize {
        self.data.iter().filter(|v| v.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Every point of the domain with its value, row-major.
    pub fn points(&self) -> impl Iterator<Item = (Vec<i64>, Option<i64>)> + '_ {
        let ext = self.extents();
        self.data.iter().enumerate().map(move |(mut i, v)| {
            let mut coords = vec![0; ext.len()];
            for d in (0..ext.len()).rev() {
                let e = ext[d].max(1) as usize;
                coords[d] = self.lo[d] + (i % e) as i64;
                i /= e;
            }
            (coords, *v)
        })
    }
}

// ── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimReport {
    pub output: String,
    /// Every Global stage, by name.
    pub globals: BTreeMap<String, GlobalArray>,
    /// Smallest and largest value each stage produced.
    pub ranges: BTreeMap<String, (i64, i64)>,
    /// Largest arena any block used, in bytes.
    pub peak_arena: usize,
    pub blocks: usize,
}

impl SimReport {
    pub fn output(&self) -> Option<&GlobalArray> {
        self.globals.get(&self.output)
    }
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "blocks      {}", self.blocks)?;
        writeln!(f, "peak arena  {} byte(s)", self.peak_arena)?;
        for (name, (lo, hi)) in &self.ranges {
            writeln!(f, "range       {:<8} [{}, {}]", name, lo, hi)?;
        }
        if let Some(out) = self.output() {
            writeln!(
                f,
                "output      {} {} of {} point(s) written",
                self.output,
                out.written(),
                out.len()
            )?;
        }
        Ok(())
    }
}

// ── Entry point ─────────────────────────────────────────────────────────────

/// Execute every kernel of `plan` in order.
pub fn simulate(graph: &StageGraph, plan: &ProgramPlan, bindings: &Bindings) -> SimResult<SimReport> {
    let mut globals: BTreeMap<StageId, GlobalArray> = BTreeMap::new();
    let mut ranges: BTreeMap<StageId, (i64, i64)> = BTreeMap::new();
    let mut peak_arena = 0usize;
    let mut blocks = 0usize;

    for kernel in &plan.kernels {
        let mut run = KernelRun::new(graph, plan, kernel, bindings, &globals)?;
        run.execute(&mut ranges)?;
        peak_arena = peak_arena.max(run.arena_len);
        blocks += run.blocks;
        debug!(
            kernel = %graph.name(kernel.root()),
            blocks = run.blocks,
            arena = run.arena_len,
            "kernel simulated"
        );
        let out = run.out;
        globals.insert(kernel.root(), out);
    }

    Ok(SimReport {
        output: graph.name(plan.output).to_string(),
        globals: globals
            .into_iter()
            .map(|(id, a)| (graph.name(id).to_string(), a))
            .collect(),
        ranges: ranges
            .into_iter()
            .map(|(id, r)| (graph.name(id).to_string(), r))
            .collect(),
        peak_arena,
        blocks,
    })
}

// ── Kernel execution ────────────────────────────────────────────────────────

/// One byte of the arena. Only the first byte of an element holds its value.
#[derive(Debug, Clone, Default)]
struct Cell {
    value: Option<i64>,
    owner: Option<StageId>,
    /// (epoch, thread) of the last write.
    written: Option<(usize, usize)>,
    read_epoch: usize,
    readers: Vec<usize>,
}

struct KernelRun<'a> {
    graph: &'a StageGraph,
    plan: &'a ProgramPlan,
    kernel: &'a KernelPlan,
    bindings: &'a Bindings,
    globals: &'a BTreeMap<StageId, GlobalArray>,
    out: GlobalArray,
    grid: Vec<i64>,
    arena_len: usize,
    blocks: usize,
}

/// Per-block state: evaluated regions, buffer placement, and the arena.
struct BlockState {
    block: Vec<i64>,
    regions: HashMap<StageId, Vec<(i64, i64)>>,
    /// Byte offset, row-major extents and element width per Shared stage.
    buffers: HashMap<StageId, (usize, Vec<i64>, usize)>,
    arena: Vec<Cell>,
    epoch: usize,
}

fn eval_region(region: &Region, env: &Bindings) -> SimResult<Vec<(i64, i64)>> {
    region
        .dims()
        .iter()
        .map(|iv| Ok((iv.lo.eval(env)?, iv.hi.eval(env)?)))
        .collect()
}

fn decode(mut linear: usize, sizes: &[i64]) -> Vec<i64> {
    sizes
        .iter()
        .map(|&s| {
            let s = s.max(1) as usize;
            let v = (linear % s) as i64;
            linear /= s;
            v
        })
        .collect()
}

/// Points `0..extents` that block thread `t` visits for a stage filled by
/// `fill` threads. `t` is decoded by the block's `threads`; a thread whose
/// index reaches the stage's count along any dimension idles, the others
/// stride by that count. Dimensions past `extents` count as one thread.
fn thread_points(extents: &[i64], threads: &[i64], fill: &[i64], t: usize) -> Vec<Vec<i64>> {
    let tid = decode(t, threads);
    let width = |d: usize| {
        if d < extents.len() {
            fill.get(d).copied().unwrap_or(1).max(1)
        } else {
            1
        }
    };
    if tid.iter().enumerate().any(|(d, &i)| i >= width(d)) {
        return Vec::new();
    }
    let axes: Vec<Vec<i64>> = extents
        .iter()
        .enumerate()
        .map(|(d, &n)| {
            let (start, step) = match tid.get(d) {
                Some(&i) => (i, width(d)),
                None => (0, 1),
            };
            (start..n.max(0)).step_by(step as usize).collect()
        })
        .collect();
    let mut points = vec![Vec::with_capacity(extents.len())];
    for axis in &axes {
        points = points
            .into_iter()
            .flat_map(|p| {
                axis.iter().map(move |&i| {
                    let mut q = p.clone();
                    q.push(i);
                    q
                })
            })
            .collect();
    }
    points
}

fn observe(ranges: &mut BTreeMap<StageId, (i64, i64)>, id: StageId, v: i64) {
    ranges
        .entry(id)
        .and_modify(|r| {
            r.0 = r.0.min(v);
            r.1 = r.1.max(v);
        })
        .or_insert((v, v));
}

impl<'a> KernelRun<'a> {
    fn new(
        graph: &'a StageGraph,
        plan: &'a ProgramPlan,
        kernel: &'a KernelPlan,
        bindings: &'a Bindings,
        globals: &'a BTreeMap<StageId, GlobalArray>,
    ) -> SimResult<Self> {
        let b = &kernel.bounds;
        let domain = eval_region(&b.domain, bindings)?;
        let grid = b
            .grid
            .iter()
            .map(|g| Ok(g.eval(bindings)?.max(0)))
            .collect::<SimResult<Vec<i64>>>()?;
        let arena_len = if kernel.allocation.is_empty() {
            0
        } else {
            kernel.allocation.arena.eval(bindings)?.max(0) as usize
        };
        Ok(KernelRun {
            graph,
            plan,
            kernel,
            bindings,
            globals,
            out: GlobalArray::new(&domain),
            grid,
            arena_len,
            blocks: 0,
        })
    }

    fn thread_count(&self) -> usize {
        self.kernel
            .bounds
            .threads
            .iter()
            .map(|t| (*t).max(1) as usize)
            .product()
    }

    fn execute(&mut self, ranges: &mut BTreeMap<StageId, (i64, i64)>) -> SimResult<()> {
        let total: usize = self.grid.iter().map(|g| *g as usize).product();
        for linear in 0..total {
            let block = decode(linear, &self.grid);
            self.run_block(block, ranges)?;
            self.blocks += 1;
        }
        Ok(())
    }

    fn run_block(
        &mut self,
        block: Vec<i64>,
        ranges: &mut BTreeMap<StageId, (i64, i64)>,
    ) -> SimResult<()> {
        let kernel = self.kernel;
        let mut env = self.bindings.clone();
        for (d, &b) in block.iter().enumerate() {
            env.set(Symbol::Block(d), b);
        }
        let mut regions = HashMap::new();
        for (&id, region) in &kernel.bounds.regions {
            regions.insert(id, eval_region(region, &env)?);
        }
        let mut buffers = HashMap::new();
        for buf in &kernel.allocation.buffers {
            let offset = buf.offset.eval(&env)?.max(0) as usize;
            let ext = buf
                .extents
                .iter()
                .map(|e| e.eval(&env))
                .collect::<Result<Vec<i64>, FuseError>>()?;
            buffers.insert(buf.stage, (offset, ext, buf.elem_bytes.max(1) as usize));
        }
        trace!(block = ?block, "block start");
        let mut st = BlockState {
            block,
            regions,
            buffers,
            arena: vec![Cell::default(); self.arena_len],
            epoch: 0,
        };

        for action in &kernel.actions {
            match *action {
                Action::Compute { stage } if stage == kernel.root() => {
                    self.store_root(&mut st, ranges)?
                }
                Action::Compute { stage } => self.fill(&mut st, stage, ranges)?,
                Action::Barrier { .. } => st.epoch += 1,
            }
        }
        Ok(())
    }

    /// Cooperative fill of one Shared stage's region.
    fn fill(
        &self,
        st: &mut BlockState,
        id: StageId,
        ranges: &mut BTreeMap<StageId, (i64, i64)>,
    ) -> SimResult<()> {
        let graph = self.graph;
        let stage = graph.stage(id);
        let Some(region) = st.regions.get(&id).cloned() else {
            return Ok(());
        };
        let extents: Vec<i64> = region.iter().map(|(l, h)| h - l + 1).collect();
        let b = &self.kernel.bounds;
        for t in 0..self.thread_count() {
            for i in thread_points(&extents, &b.threads, b.threads_of(id), t) {
                let coords: Vec<i64> = i.iter().zip(&region).map(|(i, r)| r.0 + i).collect();
                let v = stage.elem.wrap(self.eval(st, stage, &stage.body, &coords, t, ranges)?);
                observe(ranges, id, v);
                let cell = self.cell(st, id, &coords)?;
                self.write(st, id, cell, &coords, t, v)?;
            }
        }
        Ok(())
    }

    /// The root's tile, clamped to its domain.
    fn store_root(
        &mut self,
        st: &mut BlockState,
        ranges: &mut BTreeMap<StageId, (i64, i64)>,
    ) -> SimResult<()> {
        let kernel = self.kernel;
        let b = &kernel.bounds;
        let graph = self.graph;
        let stage = graph.stage(b.root);
        for t in 0..self.thread_count() {
            for i in thread_points(&b.tile, &b.threads, b.threads_of(b.root), t) {
                let coords: Vec<i64> = (0..i.len())
                    .map(|d| self.out.lo[d] + b.tile[d] * st.block[d] + i[d])
                    .collect();
                if coords.iter().zip(&self.out.hi).any(|(c, h)| c > h) {
                    continue;
                }
                let v = stage.elem.wrap(self.eval(st, stage, &stage.body, &coords, t, ranges)?);
                observe(ranges, b.root, v);
                self.out.set(&coords, v);
            }
        }
        Ok(())
    }

    fn eval(
        &self,
        st: &mut BlockState,
        stage: &Stage,
        body: &Body,
        coords: &[i64],
        thread: usize,
        ranges: &mut BTreeMap<StageId, (i64, i64)>,
    ) -> SimResult<i64> {
        Ok(match body {
            Body::Const(c) => *c,
            Body::Var(d) => coords.get(*d).copied().unwrap_or(0),
            Body::Param(name) => self
                .bindings
                .get(&Symbol::Param(name.clone()))
                .ok_or_else(|| FuseError::UnboundSymbol { name: name.clone() })?,
            Body::Neg(inner) => self.eval(st, stage, inner, coords, thread, ranges)?.wrapping_neg(),
            Body::Binary(op, l, r) => {
                let l = self.eval(st, stage, l, coords, thread, ranges)?;
                let r = self.eval(st, stage, r, coords, thread, ranges)?;
                op.apply(l, r)
            }
            Body::Read(id) => {
                let Some(read) = stage.read(*id) else {
                    return Ok(0);
                };
                let args = read
                    .args
                    .iter()
                    .map(|a| self.eval(st, stage, a, coords, thread, ranges))
                    .collect::<SimResult<Vec<i64>>>()?;
                self.fetch(st, stage, read.producer, &args, thread, ranges)?
            }
        })
    }

    fn fetch(
        &self,
        st: &mut BlockState,
        consumer: &Stage,
        producer: StageId,
        coords: &[i64],
        thread: usize,
        ranges: &mut BTreeMap<StageId, (i64, i64)>,
    ) -> SimResult<i64> {
        let name = || self.graph.name(producer).to_string();
        let covered = st.regions.get(&producer).is_some_and(|r| {
            r.len() == coords.len() && r.iter().zip(coords).all(|((l, h), c)| l <= c && c <= h)
        });
        if !covered {
            return Err(SimError::UncoveredRead {
                producer: name(),
                consumer: consumer.name.clone(),
                coords: coords.to_vec(),
                block: st.block.clone(),
            });
        }
        let uninit = |st: &BlockState| SimError::UninitializedRead {
            producer: name(),
            consumer: consumer.name.clone(),
            coords: coords.to_vec(),
            block: st.block.clone(),
        };

        match self.plan.class(producer) {
            StorageClass::Private => {
                let p = self.graph.stage(producer);
                let v = p.elem.wrap(self.eval(st, p, &p.body, coords, thread, ranges)?);
                observe(ranges, producer, v);
                Ok(v)
            }
            StorageClass::Global => self
                .globals
                .get(&producer)
                .and_then(|a| a.get(coords))
                .ok_or_else(|| uninit(st)),
            StorageClass::Shared => {
                let (base, width) = self.cell(st, producer, coords)?;
                let epoch = st.epoch;
                let whole = st.arena[base..base + width]
                    .iter()
                    .all(|c| c.owner == Some(producer));
                let value = match st.arena[base].value {
                    Some(v) if whole => v,
                    _ => return Err(uninit(st)),
                };
                for cell in &mut st.arena[base..base + width] {
                    if let Some((e, w)) = cell.written {
                        if e == epoch && w != thread {
                            return Err(SimError::Race {
                                stage: name(),
                                coords: coords.to_vec(),
                                block: st.block.clone(),
                                first: w,
                                second: thread,
                                epoch,
                            });
                        }
                    }
                    if cell.read_epoch != epoch {
                        cell.read_epoch = epoch;
                        cell.readers.clear();
                    }
                    if !cell.readers.contains(&thread) {
                        cell.readers.push(thread);
                    }
                }
                Ok(value)
            }
        }
    }

    /// First arena byte of `coords` in `id`'s buffer, and the element width.
    fn cell(&self, st: &BlockState, id: StageId, coords: &[i64]) -> SimResult<(usize, usize)> {
        let overflow = || SimError::ArenaOverflow {
            stage: self.graph.name(id).to_string(),
            coords: coords.to_vec(),
            block: st.block.clone(),
        };
        let (Some((offset, ext, width)), Some(region)) = (st.buffers.get(&id), st.regions.get(&id))
        else {
            return Err(overflow());
        };
        let mut idx = 0usize;
        for d in 0..coords.len() {
            let rel = coords[d] - region[d].0;
            let e = ext.get(d).copied().unwrap_or(0);
            if rel < 0 || rel >= e {
                return Err(overflow());
            }
            idx = idx * e as usize + rel as usize;
        }
        let footprint: usize = ext.iter().map(|e| (*e).max(0) as usize).product();
        let base = offset + idx * width;
        if idx >= footprint || base + width > st.arena.len() {
            return Err(overflow());
        }
        Ok((base, *width))
    }

    fn write(
        &self,
        st: &mut BlockState,
        id: StageId,
        (base, width): (usize, usize),
        coords: &[i64],
        thread: usize,
        value: i64,
    ) -> SimResult<()> {
        let epoch = st.epoch;
        for cell in &st.arena[base..base + width] {
            let other_writer = cell.written.filter(|(e, w)| *e == epoch && *w != thread);
            let other_reader = if cell.read_epoch == epoch {
                cell.readers.iter().copied().find(|r| *r != thread)
            } else {
                None
            };
            if let Some(first) = other_writer.map(|(_, w)| w).or(other_reader) {
                return Err(SimError::Race {
                    stage: self.graph.name(id).to_string(),
                    coords: coords.to_vec(),
                    block: st.block.clone(),
                    first,
                    second: thread,
                    epoch,
                });
            }
        }
        for (k, cell) in st.arena[base..base + width].iter_mut().enumerate() {
            cell.value = (k == 0).then_some(value);
            cell.owner = Some(id);
            cell.written = Some((epoch, thread));
        }
        Ok(())
    }
}
