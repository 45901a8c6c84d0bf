// pipeline.rs — Compilation state and pass orchestration
//
// Holds all pass artifacts and runs the minimal set of passes for a given
// terminal PassId. Core failures (`FuseError`) are turned into coded
// diagnostics anchored at the stage they name.
//
// Preconditions: the parsed Program must be set before calling run_pipeline.
// Postconditions: all artifacts for required passes are populated, or has_error is set.
// Failure modes: any pass emitting error-level diagnostics.
// Side effects: calls on_pass_complete callback after each pass for immediate display.

use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::alloc::{AllocOptions, Allocation};
use crate::ast::{Program, Span};
use crate::codegen::GeneratedCode;
use crate::diag::{codes, has_errors, Diagnostic};
use crate::error::FuseError;
use crate::lower::{KernelBounds, ProgramPlan};
use crate::manifest::{build_manifest, Manifest, MANIFEST_SCHEMA_VERSION};
use crate::pass::{descriptor, required_passes, PassId};
use crate::placement::Placements;
use crate::resolve::Resolved;
use crate::sync::{verify_barriers, Action, BarrierFault};
use crate::transform::TransformAlgebra;

// ── Options ────────────────────────────────────────────────────────────────

/// Command-line overrides applied on top of the source's `set` statements.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineOptions {
    pub reuse: Option<bool>,
    pub shared_limit: Option<u64>,
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducibility checks.
///
/// `source_hash`: SHA-256 of the raw `.kfs` source text.
/// `plan_fingerprint`: SHA-256 of the compact JSON manifest, when a plan exists.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub plan_fingerprint: Option<[u8; 32]>,
    pub compiler_version: &'static str,
}

#[derive(Serialize)]
struct BuildInfo<'a> {
    source_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan_fingerprint: Option<String>,
    manifest_schema_version: u32,
    compiler_version: &'a str,
}

impl Provenance {
    /// Hex string of the source hash (64 characters).
    pub fn source_hash_hex(&self) -> String {
        bytes_to_hex(&self.source_hash)
    }

    pub fn plan_fingerprint_hex(&self) -> Option<String> {
        self.plan_fingerprint.as_ref().map(bytes_to_hex)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let info = BuildInfo {
            source_hash: self.source_hash_hex(),
            plan_fingerprint: self.plan_fingerprint_hex(),
            manifest_schema_version: MANIFEST_SCHEMA_VERSION,
            compiler_version: self.compiler_version,
        };
        serde_json::to_string_pretty(&info)
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute provenance from source text and, if planning got that far, the
/// manifest. The fingerprint uses the compact JSON form so it does not
/// depend on display formatting.
pub fn compute_provenance(source: &str, manifest: Option<&Manifest>) -> Provenance {
    let plan_fingerprint = manifest
        .and_then(|m| m.canonical_json().ok())
        .map(|json| sha256(json.as_bytes()));
    Provenance {
        source_hash: sha256(source.as_bytes()),
        plan_fingerprint,
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Artifact storage ───────────────────────────────────────────────────────

/// Holds all compilation artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub program: Program,
    pub resolved: Option<Resolved>,
    pub placements: Option<Placements>,
    pub bounds: Option<Vec<KernelBounds>>,
    pub allocations: Option<Vec<Allocation>>,
    pub actions: Option<Vec<Vec<Action>>>,
    pub plan: Option<ProgramPlan>,
    pub generated: Option<GeneratedCode>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    pub provenance: Option<Provenance>,
}

impl CompilationState {
    pub fn new(program: Program) -> Self {
        Self {
            program,
            resolved: None,
            placements: None,
            bounds: None,
            allocations: None,
            actions: None,
            plan: None,
            generated: None,
            diagnostics: Vec::new(),
            has_error: false,
            provenance: None,
        }
    }

    /// Machine-readable plan, once bounds, buffers, and barriers exist.
    pub fn manifest(&self) -> Option<Manifest> {
        let resolved = self.resolved.as_ref()?;
        let plan = self.plan.as_ref()?;
        Some(build_manifest(&resolved.graph, plan, &resolved.settings))
    }

    /// Combine per-pass artifacts into a `ProgramPlan` if all are present.
    fn assemble_plan(&mut self) {
        if self.plan.is_some() {
            return;
        }
        let (Some(r), Some(p), Some(b), Some(a), Some(s)) = (
            &self.resolved,
            &self.placements,
            &self.bounds,
            &self.allocations,
            &self.actions,
        ) else {
            return;
        };
        self.plan = Some(crate::lower::assemble(
            &r.graph,
            &r.schedule,
            p,
            b.clone(),
            a.clone(),
            s.clone(),
        ));
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution failed due to error-level diagnostics in a pass.
/// The specific diagnostics are available in `CompilationState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
}

/// Per-pass post-processing: callback, accumulate, timing, error check.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: std::time::Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_errors(&diags);
    state.diagnostics.extend(diags);
    let name = descriptor(pass_id).name;
    let ms = elapsed.as_secs_f64() * 1000.0;
    debug!(pass = name, elapsed_ms = ms, "pass complete");
    if verbose {
        eprintln!("kfuse: {} complete, {:.1}ms", name, ms);
    }
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

/// Span of the stage a core error names, or the whole program.
fn error_span(resolved: &Resolved, program_span: Span, err: &FuseError) -> Span {
    let name = match err {
        FuseError::Placement { stage, .. } => Some(stage),
        FuseError::UnboundedRegion { consumer, .. } => Some(consumer),
        FuseError::Cycle { stages } => stages.first(),
        FuseError::UnboundSymbol { .. } => None,
    };
    name.and_then(|n| resolved.graph.lookup(n))
        .map(|id| resolved.span_of(id))
        .unwrap_or(program_span)
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute → on_pass_complete(callback) → timing → error check.
///
/// Preconditions: `state.program` is set.
/// Postconditions: artifacts for all passes in `required_passes(terminal)` are
///   populated and `state.plan` is assembled when they cover it, or
///   `state.has_error` is true.
/// Failure modes: any pass producing error-level diagnostics.
/// Side effects: calls `on_pass_complete` after each pass for immediate diagnostic display.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    options: &PipelineOptions,
    verbose: bool,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    let passes = required_passes(terminal);
    let program_span = state.program.span;

    for &pass_id in &passes {
        let t = Instant::now();
        let mut diags = Vec::new();
        match pass_id {
            PassId::Resolve => {
                let result = crate::resolve::resolve(&state.program);
                diags = result.diagnostics;
                if let Some(mut resolved) = result.resolved {
                    if let Some(reuse) = options.reuse {
                        resolved.settings.reuse = reuse;
                    }
                    if let Some(limit) = options.shared_limit {
                        resolved.settings.shared_limit = limit;
                    }
                    state.resolved = Some(resolved);
                }
            }
            PassId::Place => {
                let Some(r) = state.resolved.as_ref() else {
                    continue;
                };
                match crate::placement::assign_all(&r.graph, &r.schedule) {
                    Ok(p) => state.placements = Some(p),
                    Err(errors) => {
                        diags = errors
                            .iter()
                            .map(|e| Diagnostic::from_error(e, error_span(r, program_span, e)))
                            .collect();
                    }
                }
            }
            PassId::Bounds => {
                let (Some(r), Some(p)) = (state.resolved.as_ref(), state.placements.as_ref())
                else {
                    continue;
                };
                match crate::lower::infer_bounds(&r.graph, &r.schedule, p, &TransformAlgebra) {
                    Ok(b) => state.bounds = Some(b),
                    Err(e) => diags.push(Diagnostic::from_error(&e, error_span(r, program_span, &e))),
                }
            }
            PassId::Allocate => {
                let (Some(r), Some(p), Some(bounds)) = (
                    state.resolved.as_ref(),
                    state.placements.as_ref(),
                    state.bounds.as_ref(),
                ) else {
                    continue;
                };
                let opts = AllocOptions {
                    reuse: r.settings.reuse,
                };
                let mut allocations = Vec::with_capacity(bounds.len());
                for b in bounds {
                    let allocation =
                        crate::lower::allocate_kernel(&r.graph, &r.schedule, p, b, opts);
                    if let Some(bytes) = allocation.arena.as_const().map(|b| b.max(0) as u64) {
                        if bytes > r.settings.shared_limit {
                            diags.push(
                                Diagnostic::warning(
                                    codes::W0500,
                                    r.span_of(b.root),
                                    format!(
                                        "kernel '{}' needs {} bytes of shared memory per block, limit is {}",
                                        r.graph.name(b.root),
                                        bytes,
                                        r.settings.shared_limit
                                    ),
                                )
                                .with_hint("reduce the tile size or enable buffer reuse"),
                            );
                        }
                    }
                    debug!(
                        kernel = %r.graph.name(b.root),
                        arena = %allocation.arena,
                        slots = allocation.slots.len(),
                        "kernel allocated"
                    );
                    allocations.push(allocation);
                }
                state.allocations = Some(allocations);
            }
            PassId::Synchronize => {
                let (Some(r), Some(p), Some(bounds)) = (
                    state.resolved.as_ref(),
                    state.placements.as_ref(),
                    state.bounds.as_ref(),
                ) else {
                    continue;
                };
                let mut all = Vec::with_capacity(bounds.len());
                for b in bounds {
                    let actions = crate::sync::insert_barriers(&b.steps, p);
                    for fault in verify_barriers(&actions, p) {
                        let message = match fault {
                            BarrierFault::Missing(id) => {
                                format!("shared stage '{}' is not followed by a barrier", r.graph.name(id))
                            }
                            BarrierFault::Stray(i) => format!("stray barrier at action {i}"),
                        };
                        diags.push(Diagnostic::error(codes::E0500, r.span_of(b.root), message));
                    }
                    all.push(actions);
                }
                state.actions = Some(all);
            }
            PassId::Codegen => {
                state.assemble_plan();
                let (Some(r), Some(plan)) = (state.resolved.as_ref(), state.plan.as_ref()) else {
                    continue;
                };
                let params: Vec<String> = r.params.keys().cloned().collect();
                state.generated = Some(crate::codegen::codegen(&r.graph, plan, &params));
            }
        }
        let elapsed = t.elapsed();
        finish_pass(state, pass_id, diags, elapsed, verbose, &mut on_pass_complete)?;
    }

    state.assemble_plan();
    Ok(())
}
