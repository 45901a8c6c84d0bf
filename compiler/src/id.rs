// id.rs — Stable identifiers for stages and read edges
//
// Stages live in an arena inside `StageGraph`; every cross-reference between
// stages (read edges, placement anchors, buffer ownership) is a `StageId`
// rather than a pointer, so the graph has no ownership cycles.
// IDs are allocated in declaration order, which makes every derived artifact
// (topological order, slot assignment, emitted code) deterministic.

use serde::Serialize;

/// Stable identifier for a stage. Doubles as its index in the stage arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StageId(pub u32);

impl StageId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identifies one call site (`g(x + 1)`) inside a stage body.
/// The same producer read at two offsets produces two distinct `ReadId`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ReadId(pub u32);

/// Allocator for stable IDs. Produces monotonically increasing IDs in
/// allocation (source) order.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next_stage: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_stage(&mut self) -> StageId {
        let id = StageId(self.next_stage);
        self.next_stage += 1;
        id
    }

    /// Number of stage IDs handed out so far.
    pub fn stage_count(&self) -> usize {
        self.next_stage as usize
    }
}
