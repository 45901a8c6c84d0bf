// manifest.rs — Machine-readable plan (`--emit json`)
//
// Everything the kernel emitter consumes, keyed by stage name: element type,
// storage class, fill threads, per-block region, buffer extent, byte offset
// and reuse candidates per stage; geometry, arena bytes, and the action list
// per kernel. Sizes
// that are compile-time constants serialize as numbers, symbolic ones as
// expression strings.
//
// Preconditions: `plan` was produced for `graph`.
// Postconditions: field order and stage order are deterministic, so equal
//                 plans serialize to identical bytes.
// Failure modes: none beyond `serde_json` serialization.
// Side effects: none.

use serde::Serialize;

use crate::graph::{ElemType, StageGraph};
use crate::lower::ProgramPlan;
use crate::placement::StorageClass;
use crate::region::Region;
use crate::resolve::Settings;
use crate::sym::SymExpr;
use crate::sync::Action;

/// Bumped whenever a field changes meaning.
pub const MANIFEST_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub output: String,
    /// Width of stages declared without an element type.
    pub elem_bytes: u64,
    pub stages: Vec<StageEntry>,
    pub kernels: Vec<KernelEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageEntry {
    pub name: String,
    pub dims: Vec<String>,
    pub elem: ElemType,
    pub class: StorageClass,
    /// Root of the kernel that computes the stage.
    pub kernel: Option<String>,
    /// Region needed by one block, in block index symbols.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
    /// Threads that fill the stage, when it is a block step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferEntry {
    pub extent: Vec<SymExpr>,
    pub bytes: SymExpr,
    /// Byte offset in the arena.
    pub offset: SymExpr,
    pub slot: usize,
    pub live: [usize; 2],
    pub reuse_candidates: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KernelEntry {
    pub root: String,
    pub domain: Region,
    pub grid: Vec<SymExpr>,
    pub tile: Vec<i64>,
    pub threads: Vec<i64>,
    /// Shared arena per block, in bytes.
    pub arena: SymExpr,
    pub slots: usize,
    pub actions: Vec<ActionEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ActionEntry {
    Compute { stage: String },
    Barrier { after: String },
}

pub fn build_manifest(graph: &StageGraph, plan: &ProgramPlan, settings: &Settings) -> Manifest {
    let stages = graph
        .stages()
        .map(|s| {
            let kernel = plan.kernels.iter().find(|k| {
                k.root() == s.id || k.bounds.steps.contains(&s.id) || k.bounds.private.contains(&s.id)
            });
            let buffer = kernel.and_then(|k| k.allocation.buffer(s.id)).map(|b| BufferEntry {
                extent: b.extents.clone(),
                bytes: b.bytes.clone(),
                offset: b.offset.clone(),
                slot: b.slot,
                live: [b.live.write, b.live.last_read],
                reuse_candidates: b
                    .reuse_candidates
                    .iter()
                    .map(|id| graph.name(*id).to_string())
                    .collect(),
            });
            StageEntry {
                name: s.name.clone(),
                dims: s.dims.clone(),
                elem: s.elem,
                class: plan.class(s.id),
                kernel: kernel.map(|k| graph.name(k.root()).to_string()),
                region: kernel.and_then(|k| k.bounds.regions.get(&s.id).cloned()),
                threads: kernel.and_then(|k| k.bounds.stage_threads.get(&s.id).cloned()),
                buffer,
            }
        })
        .collect();

    let kernels = plan
        .kernels
        .iter()
        .map(|k| {
            let b = &k.bounds;
            KernelEntry {
                root: graph.name(b.root).to_string(),
                domain: b.domain.clone(),
                grid: b.grid.clone(),
                tile: b.tile.clone(),
                threads: b.threads.clone(),
                arena: k.allocation.arena.clone(),
                slots: k.allocation.slots.len(),
                actions: k
                    .actions
                    .iter()
                    .map(|a| match a {
                        Action::Compute { stage } => ActionEntry::Compute {
                            stage: graph.name(*stage).to_string(),
                        },
                        Action::Barrier { after } => ActionEntry::Barrier {
                            after: graph.name(*after).to_string(),
                        },
                    })
                    .collect(),
            }
        })
        .collect();

    Manifest {
        schema_version: MANIFEST_SCHEMA_VERSION,
        output: graph.name(plan.output).to_string(),
        elem_bytes: settings.elem_bytes,
        stages,
        kernels,
    }
}

impl Manifest {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Canonical compact form, used for fingerprinting.
    pub fn canonical_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
