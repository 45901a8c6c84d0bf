// dot.rs — Graphviz DOT output for planned stage graphs
//
// Renders each kernel as a cluster holding its root and fused stages. Nodes
// are coloured by storage class; every read edge is labelled with the access
// expression in the consumer's variables.
//
// Preconditions: `plan` was produced for `graph`.
// Postconditions: returns a valid DOT string; output is deterministic.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::collections::BTreeSet;
use std::fmt::Write;

use crate::graph::{Stage, StageGraph};
use crate::id::StageId;
use crate::lower::ProgramPlan;
use crate::placement::StorageClass;

/// Emit the stage graph with its kernel partition as a Graphviz DOT string.
pub fn emit_dot(graph: &StageGraph, plan: &ProgramPlan) -> String {
    let mut buf = String::new();
    let _ = writeln!(buf, "digraph kfuse {{");
    let _ = writeln!(buf, "    rankdir=LR;");
    let _ = writeln!(buf, "    node [fontname=\"Helvetica\", fontsize=10];");
    let _ = writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];");

    let mut placed: BTreeSet<StageId> = BTreeSet::new();
    for (k, kernel) in plan.kernels.iter().enumerate() {
        let b = &kernel.bounds;
        let members: BTreeSet<StageId> = std::iter::once(b.root)
            .chain(b.steps.iter().copied())
            .chain(b.private.iter().copied())
            .collect();
        let _ = writeln!(buf);
        let _ = writeln!(buf, "    subgraph cluster_k{k} {{");
        let _ = writeln!(buf, "        label=\"kernel: {}\";", sanitize(graph.name(b.root)));
        let _ = writeln!(buf, "        style=rounded;");
        let _ = writeln!(buf, "        color=gray50;");
        for id in &members {
            write_node(&mut buf, graph.stage(*id), plan.class(*id), "        ");
        }
        let _ = writeln!(buf, "    }}");
        placed.extend(members);
    }

    let loose: Vec<&Stage> = graph.stages().filter(|s| !placed.contains(&s.id)).collect();
    if !loose.is_empty() {
        let _ = writeln!(buf);
        for stage in loose {
            write_node(&mut buf, stage, plan.class(stage.id), "    ");
        }
    }

    let _ = writeln!(buf);
    for stage in graph.stages() {
        for read in &stage.reads {
            let label: Vec<String> = read.axes.iter().map(|a| a.render(&stage.dims)).collect();
            let _ = writeln!(
                buf,
                "    s{} -> s{} [label=\"{}\"];",
                read.producer.0,
                stage.id.0,
                escape(&label.join(", "))
            );
        }
    }

    let _ = writeln!(buf, "}}");
    buf
}

// ── Helpers ─────────────────────────────────────────────────────────────────

/// Sanitize a name for use inside a quoted DOT label.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn escape(label: &str) -> String {
    label.replace('\\', "\\\\").replace('"', "\\\"")
}

fn node_attrs(class: StorageClass) -> &'static str {
    match class {
        StorageClass::Global => "shape=box, style=filled, fillcolor=\"#cfe2f3\"",
        StorageClass::Shared => "shape=box, style=\"rounded,filled\", fillcolor=\"#d9ead3\"",
        StorageClass::Private => "shape=ellipse, style=filled, fillcolor=\"#fff2cc\"",
    }
}

fn write_node(buf: &mut String, stage: &Stage, class: StorageClass, indent: &str) {
    let _ = writeln!(
        buf,
        "{indent}s{} [label=\"{}({})\\n{}\", {}];",
        stage.id.0,
        sanitize(&stage.name),
        stage.dims.join(", "),
        class,
        node_attrs(class)
    );
}
