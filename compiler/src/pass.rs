// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the compiler's semantic passes (parse is outside the runner),
// their dependency edges, and the artifacts they produce. Used by the
// pipeline runner to compute minimal pass subsets for each --emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each compiler pass (parse excluded, handled before the runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Resolve,
    Place,
    Bounds,
    Allocate,
    Synchronize,
    Codegen,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type
/// in the compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Resolved,    // Resolved (graph + schedule + settings)
    Placements,  // Placements
    Bounds,      // Vec<KernelBounds>
    Allocations, // Vec<Allocation>
    Actions,     // Vec<Vec<Action>>
    Generated,   // GeneratedCode
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a compiler pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics/verbose output.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Pre/post conditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Resolve => PassDescriptor {
            name: "resolve",
            inputs: &[],
            outputs: &[ArtifactId::Resolved],
            invalidation_key: "source",
            invariants: "names resolved, reads classified, graph acyclic",
        },
        PassId::Place => PassDescriptor {
            name: "place",
            inputs: &[PassId::Resolve],
            outputs: &[ArtifactId::Placements],
            invalidation_key: "graph + schedule",
            invariants: "every stage visible to all of its readers",
        },
        PassId::Bounds => PassDescriptor {
            name: "bounds",
            inputs: &[PassId::Place],
            outputs: &[ArtifactId::Bounds],
            invalidation_key: "graph + schedule + placements",
            invariants: "every read covered by its producer's region",
        },
        PassId::Allocate => PassDescriptor {
            name: "allocate",
            inputs: &[PassId::Bounds],
            outputs: &[ArtifactId::Allocations],
            invalidation_key: "bounds + settings",
            invariants: "overlapping lifetimes never share a slot",
        },
        PassId::Synchronize => PassDescriptor {
            name: "synchronize",
            inputs: &[PassId::Allocate],
            outputs: &[ArtifactId::Actions],
            invalidation_key: "bounds + placements",
            invariants: "exactly one barrier after every shared stage",
        },
        PassId::Codegen => PassDescriptor {
            name: "codegen",
            inputs: &[PassId::Synchronize],
            outputs: &[ArtifactId::Generated],
            invalidation_key: "graph + plan + settings",
            invariants: "one __syncthreads() per barrier action",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order (used for iteration).
pub const ALL_PASSES: [PassId; 6] = [
    PassId::Resolve,
    PassId::Place,
    PassId::Bounds,
    PassId::Allocate,
    PassId::Synchronize,
    PassId::Codegen,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_passes_synchronize_skips_codegen() {
        let passes = required_passes(PassId::Synchronize);
        assert_eq!(
            passes,
            vec![
                PassId::Resolve,
                PassId::Place,
                PassId::Bounds,
                PassId::Allocate,
                PassId::Synchronize
            ]
        );
        assert!(!passes.contains(&PassId::Codegen));
    }

    #[test]
    fn required_passes_codegen_includes_all() {
        let passes = required_passes(PassId::Codegen);
        assert_eq!(passes.len(), 6);
        assert_eq!(passes, ALL_PASSES.to_vec());
    }

    #[test]
    fn required_passes_bounds() {
        let passes = required_passes(PassId::Bounds);
        assert_eq!(passes, vec![PassId::Resolve, PassId::Place, PassId::Bounds]);
    }

    #[test]
    fn required_passes_resolve_is_minimal() {
        let passes = required_passes(PassId::Resolve);
        assert_eq!(passes, vec![PassId::Resolve]);
    }

    #[test]
    fn no_parse_in_pass_id() {
        for pass in &ALL_PASSES {
            assert_ne!(descriptor(*pass).name, "parse");
        }
    }

    #[test]
    fn all_descriptors_have_outputs() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            assert!(
                !desc.outputs.is_empty(),
                "pass {:?} has no outputs declared",
                pass
            );
        }
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            for dep in desc.inputs {
                let dep_passes = required_passes(*pass);
                let dep_pos = dep_passes.iter().position(|p| p == dep);
                let self_pos = dep_passes.iter().position(|p| p == pass);
                assert!(
                    dep_pos.unwrap() < self_pos.unwrap(),
                    "{:?} depends on {:?} but it comes later in topological order",
                    pass,
                    dep
                );
            }
        }
    }
}
