// End-to-end scenarios over the schedules in demos/.
//
// Each schedule is planned through the full pass pipeline and then executed
// on the reference executor, which fails on any read outside a planned
// region, any read of an unfilled buffer cell, and any unsynchronized
// cross-thread access. The tests then check the computed values.

use std::path::{Path, PathBuf};

use kfuse::pass::PassId;
use kfuse::pipeline::{run_pipeline, CompilationState, PipelineOptions};
use kfuse::placement::StorageClass;
use kfuse::sim::{simulate, SimReport};
use kfuse::graph::ElemType;
use kfuse::sym::Symbol;

// ── Test helpers ────────────────────────────────────────────────────────────

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn demo(name: &str) -> String {
    let path = project_root().join("demos").join(name);
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e))
}

fn plan_demo(name: &str, options: PipelineOptions) -> CompilationState {
    plan_source(name, &demo(name), options)
}

fn plan_source(name: &str, source: &str, options: PipelineOptions) -> CompilationState {
    let parsed = kfuse::parser::parse(source);
    assert!(parsed.errors.is_empty(), "{name}: {:?}", parsed.errors);
    let mut state = CompilationState::new(parsed.program.expect("program"));
    let result = run_pipeline(&mut state, PassId::Synchronize, &options, false, |_, _| {});
    assert!(
        result.is_ok(),
        "{name} failed to plan: {:#?}",
        state.diagnostics
    );
    state
}

fn run_demo(name: &str, options: PipelineOptions) -> (CompilationState, SimReport) {
    let state = plan_demo(name, options);
    let resolved = state.resolved.as_ref().unwrap();
    let plan = state.plan.as_ref().unwrap();
    let report = simulate(&resolved.graph, plan, &resolved.default_bindings())
        .unwrap_or_else(|e| panic!("{name}: {e}"));
    (state, report)
}

fn assert_output_everywhere(report: &SimReport, expected: impl Fn(&[i64]) -> i64) {
    let out = report.output().expect("output array");
    assert_eq!(out.written(), out.len(), "output not fully written");
    for (coords, value) in out.points() {
        assert_eq!(value, Some(expected(&coords)), "at {coords:?}");
    }
}

// ── Doubling chain ──────────────────────────────────────────────────────────

#[test]
fn doubling_chain_values() {
    let (state, report) = run_demo("doubling_chain.kfs", PipelineOptions::default());
    assert_eq!(report.output().unwrap().len(), 500);
    assert_output_everywhere(&report, |c| 27 * c[0]);
    assert_eq!(report.blocks, 32);

    let plan = state.plan.as_ref().unwrap();
    assert_eq!(plan.kernels.len(), 1);
    let graph = &state.resolved.as_ref().unwrap().graph;
    for name in ["f1", "f2", "f3"] {
        assert_eq!(plan.class(graph.lookup(name).unwrap()), StorageClass::Shared);
    }
}

#[test]
fn doubling_chain_arena_reuses_the_first_buffer() {
    let (state, report) = run_demo("doubling_chain.kfs", PipelineOptions::default());
    let resolved = state.resolved.as_ref().unwrap();
    let kernel = &state.plan.as_ref().unwrap().kernels[0];
    let bindings = resolved.default_bindings();

    let extent = |name: &str| {
        let id = resolved.graph.lookup(name).unwrap();
        let buffer = kernel.allocation.buffer(id).unwrap();
        buffer.footprint.eval(&bindings).unwrap()
    };
    assert_eq!(extent("f1"), 3593);
    assert_eq!(extent("f2"), 1549);
    assert_eq!(extent("f3"), 527);

    // f3 takes the slot f1 vacated; every buffer holds 4-byte elements.
    assert_eq!(kernel.allocation.slots.len(), 2);
    assert_eq!(kernel.allocation.arena.eval(&bindings).unwrap(), 4 * 5142);
    assert_eq!(report.peak_arena, 4 * 5142);
}

#[test]
fn doubling_chain_without_reuse() {
    let options = PipelineOptions {
        reuse: Some(false),
        shared_limit: None,
    };
    let (state, report) = run_demo("doubling_chain.kfs", options);
    assert_output_everywhere(&report, |c| 27 * c[0]);
    let kernel = &state.plan.as_ref().unwrap().kernels[0];
    assert_eq!(kernel.allocation.slots.len(), 3);
    assert_eq!(report.peak_arena, 4 * (3593 + 1549 + 527));
}

#[test]
fn doubling_chain_rebinds_the_domain() {
    let state = plan_demo("doubling_chain.kfs", PipelineOptions::default());
    let resolved = state.resolved.as_ref().unwrap();
    let bindings = resolved
        .default_bindings()
        .with(Symbol::Param("n".to_string()), 40);
    let report = simulate(&resolved.graph, state.plan.as_ref().unwrap(), &bindings).unwrap();
    assert_eq!(report.blocks, 3);
    assert_output_everywhere(&report, |c| 27 * c[0]);
}

// ── Pyramids ────────────────────────────────────────────────────────────────

#[test]
fn pyramid_fuses_every_level() {
    let (state, report) = run_demo("pyramid.kfs", PipelineOptions::default());
    assert_output_everywhere(&report, |_| 1);
    assert_eq!(report.blocks, 32);

    let plan = state.plan.as_ref().unwrap();
    assert_eq!(plan.kernels.len(), 1);
    let barriers = plan.kernels[0]
        .actions
        .iter()
        .filter(|a| matches!(a, kfuse::sync::Action::Barrier { .. }))
        .count();
    assert_eq!(barriers, 9);
}

#[test]
fn pyramid_with_uneven_boundary_tiles() {
    // 100 is a multiple of neither tile size, so the last row and column of
    // blocks are partial.
    let mut source = String::from("stage p0(x, y) = 1\n");
    for level in 1..10 {
        source.push_str(&format!("stage p{level}(x, y) = p{}(2*x, y)\n", level - 1));
    }
    source.push_str("output p9 [100, 100] tile(x: 3, y: 4)\n");
    for level in 0..9 {
        source.push_str(&format!("compute p{level} at p9 block\n"));
    }
    let state = plan_source("pyramid 100x100", &source, PipelineOptions::default());
    let resolved = state.resolved.as_ref().unwrap();
    let plan = state.plan.as_ref().unwrap();
    let report = simulate(&resolved.graph, plan, &resolved.default_bindings()).unwrap();

    assert_eq!(report.blocks, 34 * 25);
    assert_output_everywhere(&report, |_| 1);
    let kernel = &plan.kernels[0];
    assert_eq!(kernel.bounds.tile, vec![3, 4]);
    assert_eq!(kernel.allocation.slots.len(), 2);
}

#[test]
fn inverted_pyramid_values() {
    let (state, report) = run_demo("inverted_pyramid.kfs", PipelineOptions::default());
    assert_output_everywhere(&report, |_| 1);
    assert_eq!(report.blocks, 64);
    let kernel = &state.plan.as_ref().unwrap().kernels[0];
    assert_eq!(kernel.bounds.threads, vec![16, 16]);
    assert_eq!(kernel.bounds.tile, vec![64, 64]);
}

// ── Three-dimensional stencil ───────────────────────────────────────────────

#[test]
fn stencil_3d_sums_every_path() {
    let (state, report) = run_demo("stencil_3d.kfs", PipelineOptions::default());
    assert_eq!(report.output().unwrap().len(), 8 * 8 * 4);
    assert_output_everywhere(&report, |_| 32);
    assert_eq!(report.blocks, 8 * 8 * 4);
    let kernel = &state.plan.as_ref().unwrap().kernels[0];
    assert_eq!(kernel.bounds.tile, vec![1, 1, 1]);
}

// ── Mixed placements ────────────────────────────────────────────────────────

#[test]
fn blur_mixes_root_shared_and_private() {
    let (state, report) = run_demo("blur.kfs", PipelineOptions::default());
    assert_output_everywhere(&report, |c| c[0] + c[1]);

    let resolved = state.resolved.as_ref().unwrap();
    let plan = state.plan.as_ref().unwrap();
    let class = |name: &str| plan.class(resolved.graph.lookup(name).unwrap());
    assert_eq!(class("input"), StorageClass::Global);
    assert_eq!(class("blur_x"), StorageClass::Shared);
    assert_eq!(class("blur_y"), StorageClass::Private);
    assert_eq!(class("out"), StorageClass::Global);

    // The input kernel runs first and covers the halo.
    assert_eq!(plan.kernels.len(), 2);
    assert_eq!(plan.name(plan.kernels[0].root()), "input");
    let input = &report.globals["input"];
    assert_eq!(input.get(&[-1, -1]), Some(-2));
    assert_eq!(input.get(&[256, 256]), Some(512));
}

// ── Mixed element types ─────────────────────────────────────────────────────

fn multi_type_at(side: i64) -> (CompilationState, SimReport) {
    let state = plan_demo("multi_type.kfs", PipelineOptions::default());
    let resolved = state.resolved.as_ref().unwrap();
    let bindings = resolved
        .default_bindings()
        .with(Symbol::Param("w".to_string()), side)
        .with(Symbol::Param("h".to_string()), side);
    let report = simulate(&resolved.graph, state.plan.as_ref().unwrap(), &bindings)
        .unwrap_or_else(|e| panic!("multi_type.kfs: {e}"));
    (state, report)
}

#[test]
fn multi_type_levels_share_an_aligned_arena() {
    let (state, report) = multi_type_at(40);
    assert_eq!(report.output().unwrap().len(), 40 * 40 * 4);
    assert_output_everywhere(&report, |_| 32);
    assert_eq!(report.blocks, 40 * 40 * 4);

    let resolved = state.resolved.as_ref().unwrap();
    let graph = &resolved.graph;
    let id = |name: &str| graph.lookup(name).unwrap();
    assert_eq!(graph.stage(id("f1")).elem, ElemType::U8);
    assert_eq!(graph.stage(id("f2")).elem, ElemType::U32);
    assert_eq!(graph.stage(id("f3")).elem, ElemType::U16);

    let kernel = &state.plan.as_ref().unwrap().kernels[0];
    assert_eq!(kernel.bounds.threads, vec![6, 6, 1]);
    assert_eq!(kernel.bounds.threads_of(id("f5")), &[2, 2, 1]);
    assert_eq!(kernel.bounds.threads_of(id("f6")), &[1, 1, 1]);

    // f1, f3, f5 in slot 0; f2, f4 in slot 1 after 36 bytes of u8.
    let alloc = &kernel.allocation;
    assert_eq!(alloc.slots.len(), 2);
    let f1 = alloc.buffer(id("f1")).unwrap();
    assert_eq!(f1.bytes.as_const(), Some(36));
    let f2 = alloc.buffer(id("f2")).unwrap();
    assert_eq!(f2.bytes.as_const(), Some(100));
    assert_eq!(f2.offset.as_const(), Some(36));
    assert_eq!(alloc.slots[0].align, 4);
    assert_eq!(alloc.arena.as_const(), Some(136));
    assert_eq!(report.peak_arena, 136);
    assert_eq!(report.ranges["f3"], (4, 4));
}

#[test]
#[ignore = "runs 160000 blocks; use --ignored"]
fn multi_type_full_domain() {
    let (_, report) = multi_type_at(200);
    assert_eq!(report.blocks, 200 * 200 * 4);
    assert_output_everywhere(&report, |_| 32);
}
