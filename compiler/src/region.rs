// region.rs — Backward region propagation through read edges
//
// Given the region of a consumer that one block (or the whole grid) must
// produce, computes the region of every producer that the computation
// touches. A read edge records the access expression consumer -> producer,
// so the producer's requirement is the hull of that expression's image over
// the consumer's region. Reads of the same producer are merged by
// per-dimension interval union. Transitive propagation visits stages in
// reverse dependency order, so every consumer of a stage has contributed
// before the stage itself is expanded.
//
// Preconditions: `graph` is acyclic; regions have one interval per stage dimension.
// Postconditions: each producer region contains every coordinate read.
// Failure modes: an opaque access on an undeclared-bound dimension → `FuseError::UnboundedRegion`.
// Side effects: none. Recomputing with the same inputs yields the same regions.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::trace;

use crate::error::{FuseError, Result};
use crate::graph::{Read, Stage, StageGraph};
use crate::id::StageId;
use crate::sym::{Symbol, SymExpr};
use crate::transform::{IndexTransform, Interval, IntervalEvaluator};

// ── Region ──────────────────────────────────────────────────────────────────

/// One closed interval per dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Region(pub Vec<Interval>);

impl Region {
    pub fn new(dims: Vec<Interval>) -> Self {
        Region(dims)
    }

    /// `[0, extent - 1]` per dimension.
    pub fn from_extents(extents: &[SymExpr]) -> Self {
        Region(
            extents
                .iter()
                .map(|e| Interval::new(SymExpr::Const(0), e.add_const(-1)))
                .collect(),
        )
    }

    pub fn dims(&self) -> &[Interval] {
        &self.0
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn union(&self, other: &Region) -> Region {
        Region(
            self.0
                .iter()
                .zip(&other.0)
                .map(|(a, b)| a.union(b))
                .collect(),
        )
    }

    /// Size per dimension.
    pub fn extents(&self) -> Vec<SymExpr> {
        self.0.iter().map(Interval::extent).collect()
    }

    /// Product of the per-dimension extents.
    pub fn volume(&self) -> SymExpr {
        self.extents()
            .iter()
            .fold(SymExpr::Const(1), |acc, e| acc.mul(e))
    }

    pub fn mentions_block(&self) -> bool {
        self.0.iter().any(Interval::mentions_block)
    }

    /// Bounds while block symbol `d` ranges over `[0, last]`: the hull of
    /// this region over every block of the grid along that dimension.
    pub fn over_blocks(&self, grid_last: &[SymExpr]) -> Region {
        let zero = SymExpr::Const(0);
        Region(
            self.0
                .iter()
                .map(|iv| {
                    let mut lo = iv.lo.clone();
                    let mut hi = iv.hi.clone();
                    for (d, last) in grid_last.iter().enumerate() {
                        let sym = Symbol::Block(d);
                        lo = lo.range_over(&sym, &zero, last).0;
                        hi = hi.range_over(&sym, &zero, last).1;
                    }
                    Interval::new(lo, hi)
                })
                .collect(),
        )
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|iv| iv.to_string()).collect();
        write!(f, "{}", parts.join(" x "))
    }
}

/// Regions keyed by stage.
pub type RegionMap = BTreeMap<StageId, Region>;

fn merge_into(map: &mut RegionMap, id: StageId, region: Region) {
    match map.get_mut(&id) {
        Some(existing) => *existing = existing.union(&region),
        None => {
            map.insert(id, region);
        }
    }
}

// ── Direct producers ────────────────────────────────────────────────────────

/// Region of `producer` read by one call site while the consumer covers `region`.
pub fn read_region(
    graph: &StageGraph,
    consumer: &Stage,
    read: &Read,
    region: &Region,
    evaluator: &dyn IntervalEvaluator,
) -> Result<Region> {
    let producer = graph.stage(read.producer);
    let mut dims = Vec::with_capacity(read.axes.len());
    for (j, axis) in read.axes.iter().enumerate() {
        let mapped = match (axis.dim, &axis.transform) {
            (None, IndexTransform::Offset(c)) => Some(Interval::point(SymExpr::Const(*c))),
            (Some(d), transform) => region
                .dims()
                .get(d)
                .and_then(|iv| evaluator.image(transform, iv)),
            (None, _) => None,
        };
        let interval = match mapped {
            Some(iv) => iv,
            None => match producer.bounds.get(j).copied().flatten() {
                Some((lo, hi)) => Interval::constant(lo, hi),
                None => {
                    return Err(FuseError::UnboundedRegion {
                        stage: producer.name.clone(),
                        consumer: consumer.name.clone(),
                        dim: j,
                        reason: format!(
                            "index `{}` has no inverse and no bound is declared",
                            axis.render(&consumer.dims)
                        ),
                    })
                }
            },
        };
        dims.push(interval);
    }
    Ok(Region(dims))
}

/// Regions of every direct producer of `consumer` while it covers `region`.
/// Producers read at several call sites get the union of their reads.
pub fn required_region(
    graph: &StageGraph,
    consumer: StageId,
    region: &Region,
    evaluator: &dyn IntervalEvaluator,
) -> Result<RegionMap> {
    let stage = graph.stage(consumer);
    let mut out = RegionMap::new();
    for read in &stage.reads {
        let r = read_region(graph, stage, read, region, evaluator)?;
        trace!(
            consumer = %stage.name,
            producer = %graph.name(read.producer),
            region = %r,
            "read requires"
        );
        merge_into(&mut out, read.producer, r);
    }
    Ok(out)
}

// ── Transitive propagation ──────────────────────────────────────────────────

/// Propagate `region` of `root` to every stage it transitively reads.
///
/// Stages for which `expand` is false are recorded with the region required
/// of them but not expanded further: they are produced elsewhere (another
/// kernel) and only their requirement is of interest. The result always
/// includes `root`.
pub fn propagate(
    graph: &StageGraph,
    root: StageId,
    region: Region,
    expand: &dyn Fn(StageId) -> bool,
    evaluator: &dyn IntervalEvaluator,
) -> Result<RegionMap> {
    let mut regions = RegionMap::new();
    regions.insert(root, region);

    let order: Vec<StageId> = graph.topological_order().collect();
    for &id in order.iter().rev() {
        if id != root && !expand(id) {
            continue;
        }
        let Some(own) = regions.get(&id).cloned() else {
            continue;
        };
        for (producer, r) in required_region(graph, id, &own, evaluator)? {
            merge_into(&mut regions, producer, r);
        }
    }

    for (id, r) in &regions {
        trace!(stage = %graph.name(*id), region = %r, "propagated");
    }
    Ok(regions)
}
