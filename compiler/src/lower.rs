// lower.rs — Kernel planning: bounds, buffers, and barriers per kernel
//
// Every root (Global) stage is one kernel whose grid tiles the root's domain.
// Roots are visited consumers-first so that a root's domain is known before
// its own kernel is planned: the output's domain is declared, every other
// root's domain is the union of what its readers need over their whole grid.
// Inside a kernel, the block tile of the root is propagated through the
// stages fused into it (Shared and Private), and the resulting per-block
// regions size the shared buffers.
//
// Preconditions: placements validated by `placement::assign_all`.
// Postconditions: kernels are listed in execution order (producers first);
//                 buffer extents mention runtime parameters only.
// Failure modes: `FuseError::UnboundedRegion` from region propagation.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::alloc::{allocate, liveness, AllocOptions, Allocation, BufferRequest};
use crate::error::Result;
use crate::graph::{ElemType, StageGraph};
use crate::id::StageId;
use crate::placement::{Placement, Placements, Schedule, StorageClass};
use crate::region::{propagate, Region, RegionMap};
use crate::sym::{Bindings, Symbol, SymExpr};
use crate::sync::{insert_barriers, Action};
use crate::transform::{Interval, IntervalEvaluator, TransformAlgebra};

// ── Bounds ──────────────────────────────────────────────────────────────────

/// Geometry and per-block regions of one kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelBounds {
    pub root: StageId,
    /// The root's full domain; stores are clamped to it.
    pub domain: Region,
    pub tile: Vec<i64>,
    /// Blocks per dimension.
    pub grid: Vec<SymExpr>,
    /// Threads per block per dimension (max over the kernel's stages).
    pub threads: Vec<i64>,
    /// Threads each step fills with; never more than `threads` per dimension.
    pub stage_threads: BTreeMap<StageId, Vec<i64>>,
    /// Regions for one block, symbolic in the block index. Includes the
    /// requirements on producers computed by other kernels.
    pub regions: RegionMap,
    /// Block execution order: Shared stages, then the root.
    pub steps: Vec<StageId>,
    /// Thread-private stages evaluated inline in this kernel.
    pub private: Vec<StageId>,
}

impl KernelBounds {
    /// Index of the last block per dimension.
    pub fn grid_last(&self) -> Vec<SymExpr> {
        self.grid.iter().map(|g| g.add_const(-1)).collect()
    }

    /// Worst-case extent of `stage`'s per-block region over the whole grid.
    pub fn max_extents(&self, stage: StageId) -> Option<Vec<SymExpr>> {
        let region = self.regions.get(&stage)?;
        let zero = SymExpr::Const(0);
        let last = self.grid_last();
        Some(
            region
                .extents()
                .into_iter()
                .map(|e| {
                    last.iter().enumerate().fold(e, |acc, (d, hi)| {
                        acc.range_over(&Symbol::Block(d), &zero, hi).1
                    })
                })
                .collect(),
        )
    }

    /// Threads that fill `stage`; the whole block when it names none.
    pub fn threads_of(&self, stage: StageId) -> &[i64] {
        self.stage_threads
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or(&self.threads)
    }

    /// Total blocks, for a given binding of runtime parameters.
    pub fn block_count(&self, bindings: &Bindings) -> Result<i64> {
        self.grid
            .iter()
            .try_fold(1, |acc, g| Ok(acc * g.eval(bindings)?.max(0)))
    }
}

fn root_tile(schedule: &Schedule, root: StageId, arity: usize) -> (Vec<i64>, Vec<i64>) {
    match schedule.placement(root) {
        Some(Placement::Root { tile, threads }) => (tile.clone(), threads.clone()),
        _ => (vec![1; arity], vec![1; arity]),
    }
}

/// Tile of block `b` along each dimension: `[lo + t*b, lo + t*b + t - 1]`.
fn block_tile(domain: &Region, tile: &[i64]) -> Region {
    Region::new(
        domain
            .dims()
            .iter()
            .zip(tile)
            .enumerate()
            .map(|(d, (iv, &t))| {
                let start = iv.lo.add(&SymExpr::block(d).scale(t));
                Interval::new(start.clone(), start.add_const(t - 1))
            })
            .collect(),
    )
}

/// Per-dimension max of thread counts over the given stages.
fn block_threads(schedule: &Schedule, stages: &[StageId]) -> Vec<i64> {
    let mut out: Vec<i64> = Vec::new();
    for id in stages {
        let Some(p) = schedule.placement(*id) else {
            continue;
        };
        for (d, &t) in p.threads().iter().enumerate() {
            if d >= out.len() {
                out.push(t);
            } else {
                out[d] = out[d].max(t);
            }
        }
    }
    out
}

/// Plan the geometry and regions of every kernel.
pub fn infer_bounds(
    graph: &StageGraph,
    schedule: &Schedule,
    placements: &Placements,
    evaluator: &dyn IntervalEvaluator,
) -> Result<Vec<KernelBounds>> {
    let order: Vec<StageId> = graph.topological_order().collect();
    let mut domains: BTreeMap<StageId, Region> = BTreeMap::new();
    domains.insert(schedule.output, Region::from_extents(&schedule.extents));

    let mut kernels = Vec::new();
    for &root in order.iter().rev() {
        if placements.class(root) != StorageClass::Global {
            continue;
        }
        let Some(domain) = domains.get(&root).cloned() else {
            debug!(stage = %graph.name(root), "root is never read; no kernel");
            continue;
        };
        let arity = graph.stage(root).arity();
        let (tile, _) = root_tile(schedule, root, arity);
        let grid: Vec<SymExpr> = domain
            .dims()
            .iter()
            .zip(&tile)
            .map(|(iv, &t)| iv.extent().ceil_div(t))
            .collect();

        let fused = placements.fused_into(root);
        let regions = propagate(
            graph,
            root,
            block_tile(&domain, &tile),
            &|id| fused.contains(&id),
            evaluator,
        )?;

        let mut bounds = KernelBounds {
            root,
            domain,
            tile,
            grid,
            threads: Vec::new(),
            stage_threads: BTreeMap::new(),
            regions,
            steps: Vec::new(),
            private: Vec::new(),
        };

        // Requirements on producers owned by other kernels, over the whole grid.
        let last = bounds.grid_last();
        for (&producer, region) in &bounds.regions {
            if producer == root || fused.contains(&producer) {
                continue;
            }
            let need = region.over_blocks(&last);
            let merged = match domains.get(&producer) {
                Some(existing) => existing.union(&need),
                None => need,
            };
            domains.insert(producer, merged);
        }

        bounds.steps = order
            .iter()
            .copied()
            .filter(|id| {
                fused.contains(id)
                    && placements.class(*id) == StorageClass::Shared
                    && bounds.regions.contains_key(id)
            })
            .chain(std::iter::once(root))
            .collect();
        bounds.private = fused
            .iter()
            .copied()
            .filter(|id| placements.class(*id) == StorageClass::Private)
            .collect();
        bounds.threads = block_threads(schedule, &bounds.steps);
        bounds.stage_threads = bounds
            .steps
            .iter()
            .filter_map(|id| Some((*id, schedule.placement(*id)?.threads().to_vec())))
            .collect();

        debug!(
            kernel = %graph.name(root),
            domain = %bounds.domain,
            grid = ?bounds.grid.iter().map(|g| g.to_string()).collect::<Vec<_>>(),
            steps = bounds.steps.len(),
            "kernel bounds"
        );
        kernels.push(bounds);
    }

    kernels.reverse();
    Ok(kernels)
}

// ── Buffers and barriers ────────────────────────────────────────────────────

/// Shared buffers of one kernel, sized for the worst block.
pub fn allocate_kernel(
    graph: &StageGraph,
    schedule: &Schedule,
    placements: &Placements,
    bounds: &KernelBounds,
    options: AllocOptions,
) -> Allocation {
    let requests: Vec<BufferRequest> = liveness(graph, schedule, placements, &bounds.steps)
        .into_iter()
        .map(|(stage, live)| BufferRequest {
            stage,
            extents: bounds.max_extents(stage).unwrap_or_default(),
            elem_bytes: graph.stage(stage).elem.bytes(),
            live,
        })
        .collect();
    allocate(&requests, options)
}

// ── Program plan ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct KernelPlan {
    pub bounds: KernelBounds,
    pub allocation: Allocation,
    pub actions: Vec<Action>,
}

impl KernelPlan {
    pub fn root(&self) -> StageId {
        self.bounds.root
    }
}

/// Everything the emitters need, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramPlan {
    pub output: StageId,
    pub names: Vec<String>,
    pub classes: Vec<StorageClass>,
    pub elems: Vec<ElemType>,
    pub kernels: Vec<KernelPlan>,
}

impl ProgramPlan {
    pub fn name(&self, id: StageId) -> &str {
        &self.names[id.index()]
    }

    pub fn class(&self, id: StageId) -> StorageClass {
        self.classes[id.index()]
    }

    pub fn elem(&self, id: StageId) -> ElemType {
        self.elems[id.index()]
    }

    pub fn kernel(&self, root: StageId) -> Option<&KernelPlan> {
        self.kernels.iter().find(|k| k.root() == root)
    }
}

/// Combine per-pass results into a plan.
pub fn assemble(
    graph: &StageGraph,
    schedule: &Schedule,
    placements: &Placements,
    bounds: Vec<KernelBounds>,
    allocations: Vec<Allocation>,
    actions: Vec<Vec<Action>>,
) -> ProgramPlan {
    let kernels = bounds
        .into_iter()
        .zip(allocations)
        .zip(actions)
        .map(|((bounds, allocation), actions)| KernelPlan {
            bounds,
            allocation,
            actions,
        })
        .collect();
    ProgramPlan {
        output: schedule.output,
        names: graph.stages().map(|s| s.name.clone()).collect(),
        classes: graph.stages().map(|s| placements.class(s.id)).collect(),
        elems: graph.stages().map(|s| s.elem).collect(),
        kernels,
    }
}

/// Plan every kernel in one call.
pub fn plan(
    graph: &StageGraph,
    schedule: &Schedule,
    placements: &Placements,
    options: AllocOptions,
) -> Result<ProgramPlan> {
    let bounds = infer_bounds(graph, schedule, placements, &TransformAlgebra)?;
    let allocations = bounds
        .iter()
        .map(|b| allocate_kernel(graph, schedule, placements, b, options))
        .collect();
    let actions = bounds
        .iter()
        .map(|b| insert_barriers(&b.steps, placements))
        .collect();
    Ok(assemble(graph, schedule, placements, bounds, allocations, actions))
}

// ── Display ─────────────────────────────────────────────────────────────────

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for ProgramPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, kernel) in self.kernels.iter().enumerate() {
            let b = &kernel.bounds;
            writeln!(f, "kernel {} ({})", k, self.name(b.root))?;
            writeln!(f, "  domain  {}", b.domain)?;
            writeln!(
                f,
                "  grid    [{}] tile [{}] threads [{}]",
                join(&b.grid),
                join(&b.tile),
                join(&b.threads)
            )?;
            for (&id, region) in &b.regions {
                let class = if id == b.root || b.steps.contains(&id) || b.private.contains(&id) {
                    self.class(id).to_string()
                } else {
                    "input".to_string()
                };
                write!(f, "  {:<7} {:<8} {}", class, self.name(id), region)?;
                if let Some(buf) = kernel.allocation.buffer(id) {
                    write!(
                        f,
                        "  buffer {}[{}] slot {} @ {} live {}..{}",
                        self.elem(id),
                        join(&buf.extents),
                        buf.slot,
                        buf.offset,
                        buf.live.write,
                        buf.live.last_read
                    )?;
                }
                if let Some(t) = b.stage_threads.get(&id).filter(|t| **t != b.threads) {
                    write!(f, "  threads [{}]", join(t))?;
                }
                writeln!(f)?;
            }
            writeln!(
                f,
                "  arena   {} bytes in {} slot(s)",
                kernel.allocation.arena,
                kernel.allocation.slots.len()
            )?;
            let actions: Vec<String> = kernel
                .actions
                .iter()
                .map(|a| match a {
                    Action::Compute { stage } => self.name(*stage).to_string(),
                    Action::Barrier { .. } => "|barrier|".to_string(),
                })
                .collect();
            writeln!(f, "  actions {}", actions.join(" "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AxisAccess, Body, GraphBuilder, Read};
    use crate::placement::assign_all;
    use crate::transform::IndexTransform;

    /// The doubling chain f1..f4 over [n], output tiled by 16, all fused.
    fn doubling(reuse: bool) -> (StageGraph, ProgramPlan) {
        doubling_with(reuse, [16, 16, 16])
    }

    fn doubling_with(reuse: bool, fill_threads: [i64; 3]) -> (StageGraph, ProgramPlan) {
        let mut b = GraphBuilder::new();
        let mut ids = vec![b.add_stage("f1", &["x"], Body::Var(0), vec![])];
        for i in 1..4 {
            let prev = ids[i - 1];
            ids.push(b.add_stage(
                &format!("f{}", i + 1),
                &["x"],
                Body::sum([Body::read(0), Body::read(1)]),
                vec![
                    Read::affine(prev, vec![AxisAccess::identity(0)]),
                    Read::affine(prev, vec![AxisAccess::along(0, IndexTransform::Scale(2))]),
                ],
            ));
        }
        let g = b.build().unwrap();
        let out = ids[3];
        let mut placements = BTreeMap::new();
        placements.insert(
            out,
            Placement::Root {
                tile: vec![16],
                threads: vec![16],
            },
        );
        for (&id, &t) in ids[..3].iter().zip(&fill_threads) {
            placements.insert(
                id,
                Placement::Block {
                    anchor: out,
                    threads: vec![t],
                },
            );
        }
        let schedule = Schedule {
            output: out,
            extents: vec![SymExpr::param("n")],
            placements,
        };
        let placed = assign_all(&g, &schedule).unwrap();
        let plan = plan(&g, &schedule, &placed, AllocOptions { reuse }).unwrap();
        (g, plan)
    }

    fn n(v: i64) -> Bindings {
        Bindings::new().with(Symbol::Param("n".into()), v)
    }

    #[test]
    fn single_kernel_with_three_shared_steps() {
        let (_, plan) = doubling(true);
        assert_eq!(plan.kernels.len(), 1);
        let k = &plan.kernels[0];
        assert_eq!(k.bounds.steps, vec![StageId(0), StageId(1), StageId(2), StageId(3)]);
        assert_eq!(k.bounds.grid[0].eval(&n(500)).unwrap(), 32);
        assert_eq!(k.bounds.threads, vec![16]);
        assert_eq!(k.actions.len(), 7);
    }

    #[test]
    fn dynamic_extents_are_maximized_over_the_grid() {
        let (_, plan) = doubling(true);
        let alloc = &plan.kernels[0].allocation;
        let f1 = alloc.buffer(StageId(0)).unwrap();
        assert!(!f1.extents[0].mentions_block());
        assert_eq!(f1.extents[0].eval(&n(500)).unwrap(), 3593);
        assert_eq!(alloc.buffer(StageId(1)).unwrap().extents[0].eval(&n(500)).unwrap(), 1549);
        assert_eq!(alloc.buffer(StageId(2)).unwrap().extents[0].eval(&n(500)).unwrap(), 527);
        // f1 and f3 share a slot, f2 has its own.
        assert_eq!(alloc.slots.len(), 2);
        assert_eq!(alloc.arena.eval(&n(500)).unwrap(), 4 * (3593 + 1549));
        assert_eq!(alloc.buffer(StageId(1)).unwrap().offset.eval(&n(500)).unwrap(), 4 * 3593);
    }

    #[test]
    fn steps_keep_their_own_thread_counts() {
        let (_, plan) = doubling_with(true, [4, 32, 16]);
        let b = &plan.kernels[0].bounds;
        assert_eq!(b.threads, vec![32]);
        assert_eq!(b.threads_of(StageId(0)), &[4]);
        assert_eq!(b.threads_of(StageId(1)), &[32]);
        assert_eq!(b.threads_of(StageId(3)), &[16]);
        let text = plan.to_string();
        assert!(text.contains("threads [4]"), "{text}");
        // the grid line, f1, f3 and the root
        assert_eq!(text.matches("threads [").count(), 4, "{text}");
    }

    #[test]
    fn without_reuse_the_arena_stacks() {
        let (_, plan) = doubling(false);
        let alloc = &plan.kernels[0].allocation;
        assert_eq!(alloc.slots.len(), 3);
        assert_eq!(alloc.arena.eval(&n(500)).unwrap(), 4 * (3593 + 1549 + 527));
    }

    #[test]
    fn separate_roots_get_domains_from_readers() {
        // g(x) = x at root, out(x) = g(x / 2) + g(x / 2 + 1) over [0, 63]
        let mut b = GraphBuilder::new();
        let g = b.add_stage("g", &["x"], Body::Var(0), vec![]);
        let out = b.add_stage(
            "out",
            &["x"],
            Body::sum([Body::read(0), Body::read(1)]),
            vec![
                Read::affine(g, vec![AxisAccess::along(0, IndexTransform::Div(2))]),
                Read::affine(
                    g,
                    vec![AxisAccess::along(
                        0,
                        IndexTransform::Div(2).then(&IndexTransform::Offset(1)),
                    )],
                ),
            ],
        );
        let graph = b.build().unwrap();
        let mut placements = BTreeMap::new();
        placements.insert(
            out,
            Placement::Root {
                tile: vec![16],
                threads: vec![16],
            },
        );
        placements.insert(
            g,
            Placement::Root {
                tile: vec![8],
                threads: vec![8],
            },
        );
        let schedule = Schedule {
            output: out,
            extents: vec![SymExpr::Const(64)],
            placements,
        };
        let placed = assign_all(&graph, &schedule).unwrap();
        let plan = plan(&graph, &schedule, &placed, AllocOptions::default()).unwrap();
        assert_eq!(plan.kernels.len(), 2);
        assert_eq!(plan.kernels[0].root(), g);
        assert_eq!(
            plan.kernels[0].bounds.domain,
            Region::new(vec![Interval::constant(0, 32)])
        );
        assert_eq!(plan.kernels[0].bounds.grid, vec![SymExpr::Const(5)]);
        assert!(plan.kernels[1].allocation.is_empty());
        let text = plan.to_string();
        assert!(text.contains("input   g"), "{text}");
    }
}
