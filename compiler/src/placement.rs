// placement.rs — Storage class assignment and schedule consistency
//
// A schedule places every stage at one of three scopes: `root` (computed
// once over its whole domain into global memory, the kernel's grid is tiled
// over it), `at K block` (computed once per block of root stage K into
// shared memory), or `at A thread` (recomputed inline by each thread that
// evaluates A, held in registers). This module maps placements to storage
// classes and rejects schedules where some reader would not see the value.
// Nothing is ever widened implicitly.
//
// Preconditions: `graph` is acyclic; every non-output stage has a placement.
// Postconditions: on success, every stage has a storage class and a kernel root.
// Failure modes: a reader outside the stage's scope → `FuseError::Placement`.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::error::{FuseError, Result};
use crate::graph::StageGraph;
use crate::id::StageId;
use crate::sym::SymExpr;

// ── Types ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Grid scope. `tile` and `threads` have one entry per stage dimension.
    Root { tile: Vec<i64>, threads: Vec<i64> },
    /// Block scope of root stage `anchor`.
    Block { anchor: StageId, threads: Vec<i64> },
    /// Thread scope of `anchor`: recomputed wherever `anchor` is computed.
    Thread { anchor: StageId },
}

impl Placement {
    pub fn anchor(&self) -> Option<StageId> {
        match self {
            Placement::Root { .. } => None,
            Placement::Block { anchor, .. } | Placement::Thread { anchor } => Some(*anchor),
        }
    }

    pub fn storage_class(&self) -> StorageClass {
        match self {
            Placement::Root { .. } => StorageClass::Global,
            Placement::Block { .. } => StorageClass::Shared,
            Placement::Thread { .. } => StorageClass::Private,
        }
    }

    /// Threads cooperating on this stage per dimension (empty for `Thread`).
    pub fn threads(&self) -> &[i64] {
        match self {
            Placement::Root { threads, .. } | Placement::Block { threads, .. } => threads,
            Placement::Thread { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageClass {
    Global,
    Shared,
    Private,
}

impl StorageClass {
    /// Name of the execution scope the class corresponds to.
    pub fn scope(self) -> &'static str {
        match self {
            StorageClass::Global => "grid",
            StorageClass::Shared => "block",
            StorageClass::Private => "thread",
        }
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageClass::Global => "global",
            StorageClass::Shared => "shared",
            StorageClass::Private => "private",
        };
        write!(f, "{name}")
    }
}

/// The declared schedule: what to compute and where.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub output: StageId,
    /// Output domain size per dimension; the domain is `[0, extent - 1]`.
    pub extents: Vec<SymExpr>,
    pub placements: BTreeMap<StageId, Placement>,
}

impl Schedule {
    pub fn placement(&self, id: StageId) -> Option<&Placement> {
        self.placements.get(&id)
    }
}

// ── Validated result ────────────────────────────────────────────────────────

/// Storage class and owning kernel per stage, after validation.
#[derive(Debug, Clone)]
pub struct Placements {
    classes: Vec<StorageClass>,
    kernels: Vec<StageId>,
}

impl Placements {
    pub fn class(&self, id: StageId) -> StorageClass {
        self.classes[id.index()]
    }

    /// Root stage whose kernel computes `id`. Roots are their own kernel.
    pub fn kernel_of(&self, id: StageId) -> StageId {
        self.kernels[id.index()]
    }

    /// Root stages in id order.
    pub fn roots(&self) -> Vec<StageId> {
        self.ids_where(|id| self.class(id) == StorageClass::Global)
    }

    /// Non-root stages computed inside `root`'s kernel, in id order.
    pub fn fused_into(&self, root: StageId) -> Vec<StageId> {
        self.ids_where(|id| id != root && self.kernel_of(id) == root)
    }

    fn ids_where(&self, keep: impl Fn(StageId) -> bool) -> Vec<StageId> {
        (0..self.classes.len() as u32)
            .map(StageId)
            .filter(|id| keep(*id))
            .collect()
    }
}

// ── Assignment ──────────────────────────────────────────────────────────────

/// Storage class of one stage, validated against every reader of it.
pub fn assign(graph: &StageGraph, schedule: &Schedule, stage: StageId) -> Result<StorageClass> {
    let name = graph.name(stage).to_string();
    let placement = schedule.placement(stage).ok_or_else(|| FuseError::Placement {
        stage: name.clone(),
        scope: "no".into(),
        reader: name.clone(),
        reason: "has no placement".into(),
    })?;
    let class = placement.storage_class();
    let violation = |reader: StageId, reason: String| FuseError::Placement {
        stage: name.clone(),
        scope: class.scope().into(),
        reader: graph.name(reader).to_string(),
        reason,
    };

    if stage == schedule.output && class != StorageClass::Global {
        return Err(violation(
            stage,
            "is the pipeline output and must be stored globally".into(),
        ));
    }

    match placement {
        Placement::Root { .. } => {}
        Placement::Block { anchor, .. } => {
            let anchor_class = class_of(schedule, *anchor);
            if anchor_class != Some(StorageClass::Global) {
                return Err(violation(
                    *anchor,
                    "is not a root stage and has no blocks of its own".into(),
                ));
            }
            check_anchor_reads(graph, stage, *anchor).map_err(|r| violation(*anchor, r))?;
            for &reader in graph.consumers(stage) {
                let inside = reader == *anchor
                    || (class_of(schedule, reader) != Some(StorageClass::Global)
                        && kernel_of(schedule, reader) == Some(*anchor));
                if !inside {
                    return Err(violation(
                        reader,
                        format!("reads it from outside the blocks of '{}'", graph.name(*anchor)),
                    ));
                }
            }
        }
        Placement::Thread { anchor } => {
            if class_of(schedule, *anchor) == Some(StorageClass::Private) || *anchor == stage {
                return Err(violation(
                    *anchor,
                    "is itself thread-private and cannot host another stage".into(),
                ));
            }
            check_anchor_reads(graph, stage, *anchor).map_err(|r| violation(*anchor, r))?;
            for &reader in graph.consumers(stage) {
                let same_thread = reader == *anchor
                    || schedule.placement(reader) == Some(&Placement::Thread { anchor: *anchor });
                if !same_thread {
                    return Err(violation(reader, "reads it from another thread".into()));
                }
            }
        }
    }

    Ok(class)
}

fn check_anchor_reads(
    graph: &StageGraph,
    stage: StageId,
    anchor: StageId,
) -> std::result::Result<(), String> {
    if graph.depends_on(anchor, stage) {
        Ok(())
    } else {
        Err("never reads it".into())
    }
}

fn class_of(schedule: &Schedule, id: StageId) -> Option<StorageClass> {
    schedule.placement(id).map(Placement::storage_class)
}

/// Follow anchors up to a root. `None` for malformed anchor chains.
fn kernel_of(schedule: &Schedule, id: StageId) -> Option<StageId> {
    let mut cur = id;
    for _ in 0..=schedule.placements.len() {
        match schedule.placement(cur)? {
            Placement::Root { .. } => return Some(cur),
            Placement::Block { anchor, .. } | Placement::Thread { anchor } => cur = *anchor,
        }
    }
    None
}

/// Validate every stage and record its class and kernel. Returns every
/// violation found, in stage id order.
pub fn assign_all(
    graph: &StageGraph,
    schedule: &Schedule,
) -> std::result::Result<Placements, Vec<FuseError>> {
    let mut classes = Vec::with_capacity(graph.len());
    let mut kernels = Vec::with_capacity(graph.len());
    let mut errors = Vec::new();

    for stage in graph.stages() {
        match assign(graph, schedule, stage.id) {
            Ok(class) => {
                classes.push(class);
                kernels.push(kernel_of(schedule, stage.id).unwrap_or(stage.id));
            }
            Err(e) => errors.push(e),
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }
    for stage in graph.stages() {
        debug!(
            stage = %stage.name,
            class = %classes[stage.id.index()],
            kernel = %graph.name(kernels[stage.id.index()]),
            "storage class assigned"
        );
    }
    Ok(Placements { classes, kernels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AxisAccess, Body, GraphBuilder, Read};

    /// producer -> mid -> out, each reading the previous at x.
    fn chain() -> (StageGraph, [StageId; 3]) {
        let mut b = GraphBuilder::new();
        let p = b.add_stage("producer", &["x"], Body::Var(0), vec![]);
        let m = b.add_stage(
            "mid",
            &["x"],
            Body::read(0),
            vec![Read::affine(p, vec![AxisAccess::identity(0)])],
        );
        let o = b.add_stage(
            "out",
            &["x"],
            Body::read(0),
            vec![Read::affine(m, vec![AxisAccess::identity(0)])],
        );
        (b.build().unwrap(), [p, m, o])
    }

    fn root() -> Placement {
        Placement::Root {
            tile: vec![16],
            threads: vec![16],
        }
    }

    fn schedule(out: StageId, entries: Vec<(StageId, Placement)>) -> Schedule {
        let mut placements: BTreeMap<StageId, Placement> = entries.into_iter().collect();
        placements.insert(out, root());
        Schedule {
            output: out,
            extents: vec![SymExpr::Const(64)],
            placements,
        }
    }

    #[test]
    fn fused_chain_is_shared() {
        let (g, [p, m, o]) = chain();
        let block = |a| Placement::Block {
            anchor: a,
            threads: vec![16],
        };
        let s = schedule(o, vec![(p, block(o)), (m, block(o))]);
        let placed = assign_all(&g, &s).unwrap();
        assert_eq!(placed.class(p), StorageClass::Shared);
        assert_eq!(placed.class(o), StorageClass::Global);
        assert_eq!(placed.kernel_of(p), o);
        assert_eq!(placed.roots(), vec![o]);
        assert_eq!(placed.fused_into(o), vec![p, m]);
    }

    #[test]
    fn private_read_by_other_thread_is_rejected() {
        let (g, [p, m, o]) = chain();
        // producer is private to out's threads, but mid reads it.
        let s = schedule(
            o,
            vec![
                (p, Placement::Thread { anchor: o }),
                (
                    m,
                    Placement::Block {
                        anchor: o,
                        threads: vec![16],
                    },
                ),
            ],
        );
        let err = assign(&g, &s, p).unwrap_err();
        assert!(matches!(&err, FuseError::Placement { reader, .. } if reader == "mid"));
        assert!(err.to_string().contains("another thread"));
    }

    #[test]
    fn private_inside_private_chain_is_accepted() {
        let (g, [p, m, o]) = chain();
        let s = schedule(
            o,
            vec![
                (p, Placement::Thread { anchor: o }),
                (m, Placement::Thread { anchor: o }),
            ],
        );
        let placed = assign_all(&g, &s).unwrap();
        assert_eq!(placed.class(p), StorageClass::Private);
        assert_eq!(placed.kernel_of(p), o);
    }

    #[test]
    fn shared_read_from_another_kernel_is_rejected() {
        let (g, [p, m, o]) = chain();
        // producer lives in out's blocks but mid is its own kernel.
        let s = schedule(
            o,
            vec![
                (
                    p,
                    Placement::Block {
                        anchor: o,
                        threads: vec![16],
                    },
                ),
                (m, root()),
            ],
        );
        let errs = assign_all(&g, &s).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs[0].to_string().contains("outside the blocks of 'out'"));
    }

    #[test]
    fn block_anchor_must_be_root() {
        let (g, [p, m, o]) = chain();
        let s = schedule(
            o,
            vec![
                (
                    p,
                    Placement::Block {
                        anchor: m,
                        threads: vec![1],
                    },
                ),
                (
                    m,
                    Placement::Block {
                        anchor: o,
                        threads: vec![16],
                    },
                ),
            ],
        );
        assert!(assign(&g, &s, p).is_err());
        assert!(assign(&g, &s, m).is_ok());
    }

    #[test]
    fn output_must_be_global() {
        let (g, [p, m, o]) = chain();
        let mut s = schedule(o, vec![(p, root()), (m, root())]);
        s.placements.insert(o, Placement::Thread { anchor: m });
        let err = assign(&g, &s, o).unwrap_err();
        assert!(err.to_string().contains("pipeline output"));
    }

    #[test]
    fn global_is_visible_everywhere() {
        let (g, [p, m, o]) = chain();
        let s = schedule(o, vec![(p, root()), (m, root())]);
        let placed = assign_all(&g, &s).unwrap();
        assert_eq!(placed.roots(), vec![p, m, o]);
        assert!(placed.fused_into(o).is_empty());
    }
}
