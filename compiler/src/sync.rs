// sync.rs — Block barrier insertion
//
// Inside one block, each step is a collective computation of one stage by
// all threads. A Shared stage's buffer is read by other threads, so its
// write phase is followed by exactly one block-wide barrier before the next
// step runs. Barriers are never coalesced across stage boundaries and no
// barrier is emitted for Global or Private stages.
//
// Preconditions: `steps` are in dependency order.
// Postconditions: every Shared step is immediately followed by one barrier.
// Failure modes: none (verification is a separate check).
// Side effects: none.

use std::fmt;

use serde::Serialize;

use crate::id::StageId;
use crate::placement::{Placements, StorageClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Action {
    Compute { stage: StageId },
    Barrier { after: StageId },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Compute { stage } => write!(f, "compute s{}", stage.0),
            Action::Barrier { after } => write!(f, "barrier (after s{})", after.0),
        }
    }
}

pub fn insert_barriers(steps: &[StageId], placements: &Placements) -> Vec<Action> {
    let mut actions = Vec::with_capacity(steps.len() * 2);
    for &stage in steps {
        actions.push(Action::Compute { stage });
        if placements.class(stage) == StorageClass::Shared {
            actions.push(Action::Barrier { after: stage });
        }
    }
    actions
}

/// Ways an action list can violate the barrier discipline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierFault {
    /// A Shared stage is not followed by exactly one barrier.
    Missing(StageId),
    /// A barrier follows something other than the Shared stage it names.
    Stray(usize),
}

/// Check an action list against the placement classes.
pub fn verify_barriers(actions: &[Action], placements: &Placements) -> Vec<BarrierFault> {
    let mut faults = Vec::new();
    for (i, action) in actions.iter().enumerate() {
        match *action {
            Action::Compute { stage } if placements.class(stage) == StorageClass::Shared => {
                let next = actions.get(i + 1);
                let after_next = actions.get(i + 2);
                let ok = next == Some(&Action::Barrier { after: stage })
                    && !matches!(after_next, Some(Action::Barrier { .. }));
                if !ok {
                    faults.push(BarrierFault::Missing(stage));
                }
            }
            Action::Barrier { after } => {
                let prev = i.checked_sub(1).and_then(|p| actions.get(p));
                let owned = prev == Some(&Action::Compute { stage: after })
                    && placements.class(after) == StorageClass::Shared;
                if !owned {
                    faults.push(BarrierFault::Stray(i));
                }
            }
            Action::Compute { .. } => {}
        }
    }
    faults
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AxisAccess, Body, GraphBuilder, Read};
    use crate::placement::{assign_all, Placement, Schedule};
    use crate::sym::SymExpr;
    use std::collections::BTreeMap;

    /// s0 (shared) -> s1 (private) -> s2 (shared) -> s3 (root)
    fn placed() -> Placements {
        let mut b = GraphBuilder::new();
        let mut prev = b.add_stage("s0", &["x"], Body::Var(0), vec![]);
        for name in ["s1", "s2", "s3"] {
            prev = b.add_stage(
                name,
                &["x"],
                Body::read(0),
                vec![Read::affine(prev, vec![AxisAccess::identity(0)])],
            );
        }
        let g = b.build().unwrap();
        let out = StageId(3);
        let mut placements = BTreeMap::new();
        placements.insert(
            out,
            Placement::Root {
                tile: vec![8],
                threads: vec![8],
            },
        );
        let block = Placement::Block {
            anchor: out,
            threads: vec![8],
        };
        placements.insert(StageId(0), block.clone());
        placements.insert(StageId(1), Placement::Thread { anchor: StageId(2) });
        placements.insert(StageId(2), block);
        let s = Schedule {
            output: out,
            extents: vec![SymExpr::Const(32)],
            placements,
        };
        assign_all(&g, &s).unwrap()
    }

    #[test]
    fn one_barrier_per_shared_stage() {
        let p = placed();
        let actions = insert_barriers(&[StageId(0), StageId(2), StageId(3)], &p);
        assert_eq!(
            actions,
            vec![
                Action::Compute { stage: StageId(0) },
                Action::Barrier { after: StageId(0) },
                Action::Compute { stage: StageId(2) },
                Action::Barrier { after: StageId(2) },
                Action::Compute { stage: StageId(3) },
            ]
        );
        assert!(verify_barriers(&actions, &p).is_empty());
    }

    #[test]
    fn verification_flags_missing_and_doubled_barriers() {
        let p = placed();
        let missing = vec![
            Action::Compute { stage: StageId(0) },
            Action::Compute { stage: StageId(2) },
            Action::Barrier { after: StageId(2) },
            Action::Compute { stage: StageId(3) },
        ];
        assert_eq!(
            verify_barriers(&missing, &p),
            vec![BarrierFault::Missing(StageId(0))]
        );

        let doubled = vec![
            Action::Compute { stage: StageId(0) },
            Action::Barrier { after: StageId(0) },
            Action::Barrier { after: StageId(0) },
            Action::Compute { stage: StageId(3) },
        ];
        let faults = verify_barriers(&doubled, &p);
        assert!(faults.contains(&BarrierFault::Missing(StageId(0))));
        assert!(faults.contains(&BarrierFault::Stray(2)));
    }

    #[test]
    fn root_stage_gets_no_barrier() {
        let p = placed();
        let actions = insert_barriers(&[StageId(3)], &p);
        assert_eq!(actions, vec![Action::Compute { stage: StageId(3) }]);
    }
}
