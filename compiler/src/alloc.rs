// alloc.rs — Shared buffer allocation with depth-bounded reuse
//
// Every Shared stage of a kernel gets a buffer in the block's shared-memory
// arena. A buffer is live from the block step that writes it until the last
// step that reads it. Buffers are packed into slots: a slot freed after step
// t can host a buffer first written at step t + 1 or later. A slot is as large
// as the largest buffer it ever hosts and the arena is the sum of the slots.
// For a linear chain this needs two slots regardless of its depth.
//
// Sizes are in bytes. Each slot starts at a multiple of the widest element
// type among its occupants, so stages of mixed widths can share the arena.
//
// Sizes are symbolic (`SymExpr`) so that blocks whose footprint depends on a
// runtime parameter are sized for the worst block of the grid.
//
// Preconditions: requests are given in write-step order; extents are free of
//                block symbols (already maximized over the grid).
// Postconditions: two buffers share a slot only if their liveness intervals
//                 are disjoint; offsets are aligned slot prefix sums.
// Failure modes: none.
// Side effects: none.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use serde::Serialize;
use tracing::{debug, trace};

use crate::graph::StageGraph;
use crate::id::StageId;
use crate::placement::{Placement, Placements, Schedule, StorageClass};
use crate::sym::SymExpr;

// ── Liveness ────────────────────────────────────────────────────────────────

/// Inclusive range of block steps during which a buffer must hold its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Liveness {
    pub write: usize,
    pub last_read: usize,
}

impl Liveness {
    pub fn overlaps(&self, other: &Liveness) -> bool {
        !(self.last_read < other.write || other.last_read < self.write)
    }
}

/// Step at which a reader's read happens. Thread-private stages are
/// evaluated inline by their anchor, so they read at the anchor's step.
fn read_step(
    reader: StageId,
    steps: &[StageId],
    schedule: &Schedule,
) -> Option<usize> {
    let mut cur = reader;
    for _ in 0..=steps.len() + schedule.placements.len() {
        if let Some(pos) = steps.iter().position(|s| *s == cur) {
            return Some(pos);
        }
        match schedule.placement(cur)? {
            Placement::Thread { anchor } => cur = *anchor,
            _ => return None,
        }
    }
    None
}

/// Liveness of every Shared stage among `steps` (the block's execution order).
pub fn liveness(
    graph: &StageGraph,
    schedule: &Schedule,
    placements: &Placements,
    steps: &[StageId],
) -> Vec<(StageId, Liveness)> {
    steps
        .iter()
        .enumerate()
        .filter(|(_, id)| placements.class(**id) == StorageClass::Shared)
        .map(|(write, &id)| {
            let last_read = graph
                .consumers(id)
                .iter()
                .filter_map(|&r| read_step(r, steps, schedule))
                .max()
                .unwrap_or(write)
                .max(write);
            trace!(stage = %graph.name(id), write, last_read, "liveness");
            (id, Liveness { write, last_read })
        })
        .collect()
}

// ── Allocation ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocOptions {
    /// Pack buffers with disjoint liveness into shared slots.
    pub reuse: bool,
}

impl Default for AllocOptions {
    fn default() -> Self {
        AllocOptions { reuse: true }
    }
}

#[derive(Debug, Clone)]
pub struct BufferRequest {
    pub stage: StageId,
    /// Worst-case size per dimension over the whole grid.
    pub extents: Vec<SymExpr>,
    /// Width of one element; 1, 2, 4 or 8.
    pub elem_bytes: i64,
    pub live: Liveness,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Buffer {
    pub stage: StageId,
    pub extents: Vec<SymExpr>,
    /// Elements, the product of `extents`.
    pub footprint: SymExpr,
    pub elem_bytes: i64,
    /// `footprint * elem_bytes`.
    pub bytes: SymExpr,
    pub slot: usize,
    /// Byte offset of the buffer in the arena.
    pub offset: SymExpr,
    pub live: Liveness,
    /// Stages whose buffers are never live at the same time as this one.
    pub reuse_candidates: Vec<StageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub offset: SymExpr,
    pub size: SymExpr,
    /// Widest element among the occupants; `offset` is a multiple of it.
    pub align: i64,
    pub occupants: Vec<StageId>,
}

/// Buffers of one kernel plus its per-block arena size (in bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub buffers: Vec<Buffer>,
    pub slots: Vec<Slot>,
    pub arena: SymExpr,
}

impl Allocation {
    pub fn buffer(&self, stage: StageId) -> Option<&Buffer> {
        self.buffers.iter().find(|b| b.stage == stage)
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Place every requested buffer in the arena.
pub fn allocate(requests: &[BufferRequest], options: AllocOptions) -> Allocation {
    let footprints: Vec<SymExpr> = requests
        .iter()
        .map(|r| {
            r.extents
                .iter()
                .fold(SymExpr::Const(1), |acc, e| acc.mul(e))
        })
        .collect();
    let bytes: Vec<SymExpr> = footprints
        .iter()
        .zip(requests)
        .map(|(f, r)| f.scale(r.elem_bytes))
        .collect();

    // Frees happen the step after the last read; at equal steps frees come
    // before allocations.
    let mut events: Vec<(usize, bool, usize)> = Vec::with_capacity(requests.len() * 2);
    for (i, r) in requests.iter().enumerate() {
        events.push((r.live.write, true, i));
        events.push((r.live.last_read + 1, false, i));
    }
    events.sort();

    let mut slot_of = vec![0usize; requests.len()];
    let mut slot_sizes: Vec<SymExpr> = Vec::new();
    let mut slot_align: Vec<i64> = Vec::new();
    let mut occupants: Vec<Vec<StageId>> = Vec::new();
    let mut free: BinaryHeap<Reverse<usize>> = BinaryHeap::new();

    for (step, is_alloc, i) in events {
        if !is_alloc {
            if options.reuse {
                free.push(Reverse(slot_of[i]));
            }
            continue;
        }
        let slot = match free.pop() {
            Some(Reverse(s)) => {
                trace!(step, stage = requests[i].stage.0, slot = s, "reusing slot");
                slot_sizes[s] = slot_sizes[s].sym_max(&bytes[i]);
                slot_align[s] = slot_align[s].max(requests[i].elem_bytes);
                s
            }
            None => {
                slot_sizes.push(bytes[i].clone());
                slot_align.push(requests[i].elem_bytes.max(1));
                occupants.push(Vec::new());
                slot_sizes.len() - 1
            }
        };
        slot_of[i] = slot;
        occupants[slot].push(requests[i].stage);
    }

    let mut slots = Vec::with_capacity(slot_sizes.len());
    let mut offset = SymExpr::Const(0);
    for ((size, align), occ) in slot_sizes.into_iter().zip(slot_align).zip(occupants) {
        let start = offset.align_up(align);
        let next = start.add(&size);
        slots.push(Slot {
            offset: start,
            size,
            align,
            occupants: occ,
        });
        offset = next;
    }
    let arena = offset;

    let buffers = requests
        .iter()
        .enumerate()
        .map(|(i, r)| Buffer {
            stage: r.stage,
            extents: r.extents.clone(),
            footprint: footprints[i].clone(),
            elem_bytes: r.elem_bytes,
            bytes: bytes[i].clone(),
            slot: slot_of[i],
            offset: slots[slot_of[i]].offset.clone(),
            live: r.live,
            reuse_candidates: requests
                .iter()
                .filter(|o| o.stage != r.stage && !o.live.overlaps(&r.live))
                .map(|o| o.stage)
                .collect(),
        })
        .collect();

    debug!(
        buffers = requests.len(),
        slots = slots.len(),
        arena = %arena,
        reuse = options.reuse,
        "shared arena allocated"
    );
    Allocation {
        buffers,
        slots,
        arena,
    }
}
