// Reproducibility and CLI behavior tests.
//
// These tests verify that the compiler produces byte-identical outputs for
// identical inputs across every emit target, and that the command line
// reports failures with the documented exit codes.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn kfuse_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kfuse"))
}

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn demos_dir() -> PathBuf {
    project_root().join("demos")
}

fn demo_path(name: &str) -> String {
    demos_dir().join(name).to_str().unwrap().to_string()
}

fn run_raw(args: &[&str]) -> Output {
    Command::new(kfuse_binary())
        .args(args)
        .output()
        .expect("failed to run kfuse")
}

fn run_kfuse(args: &[&str]) -> String {
    let output = run_raw(args);
    assert!(
        output.status.success(),
        "kfuse failed with args {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("non-UTF-8 output")
}

/// Write `source` to a fresh file under the system temp directory.
fn temp_source(tag: &str, source: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("kfuse-test-{}-{}", std::process::id(), tag));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    let path = dir.join("input.kfs");
    std::fs::write(&path, source).expect("write temp source");
    path
}

const DEMOS: [&str; 6] = [
    "doubling_chain.kfs",
    "pyramid.kfs",
    "inverted_pyramid.kfs",
    "stencil_3d.kfs",
    "blur.kfs",
    "multi_type.kfs",
];

// ── Determinism ─────────────────────────────────────────────────────────────

#[test]
fn cuda_output_is_identical_across_runs() {
    for demo in DEMOS {
        let path = demo_path(demo);
        let first = run_kfuse(&["--emit", "cuda", &path]);
        let second = run_kfuse(&["--emit", "cuda", &path]);
        assert!(!first.is_empty(), "{demo}: empty CUDA output");
        assert_eq!(first, second, "{demo}: CUDA output differs between runs");
        assert!(first.contains("__syncthreads()"), "{demo}: no barriers emitted");
    }
}

#[test]
fn json_manifest_is_identical_across_runs() {
    for demo in DEMOS {
        let path = demo_path(demo);
        let first = run_kfuse(&["--emit", "json", &path]);
        let second = run_kfuse(&["--emit", "json", &path]);
        assert_eq!(first, second, "{demo}: manifest differs between runs");

        let v: serde_json::Value = serde_json::from_str(&first).expect("valid JSON");
        assert_eq!(v["schema_version"], 2);
        assert!(!v["kernels"].as_array().unwrap().is_empty());
    }
}

#[test]
fn build_info_is_stable() {
    let path = demo_path("doubling_chain.kfs");
    let first = run_kfuse(&["--emit", "build-info", &path]);
    let second = run_kfuse(&["--emit", "build-info", &path]);
    assert_eq!(first, second);

    let v: serde_json::Value = serde_json::from_str(&first).expect("valid JSON");
    let hash = v["source_hash"].as_str().unwrap();
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(v["plan_fingerprint"].as_str().unwrap().len(), 64);
    assert_eq!(v["manifest_schema_version"], 2);
    assert_eq!(v["compiler_version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn reuse_setting_changes_the_fingerprint() {
    let path = demo_path("doubling_chain.kfs");
    let packed = run_kfuse(&["--emit", "build-info", &path]);
    let flat = run_kfuse(&["--emit", "build-info", "--no-reuse", &path]);
    let packed: serde_json::Value = serde_json::from_str(&packed).unwrap();
    let flat: serde_json::Value = serde_json::from_str(&flat).unwrap();
    assert_eq!(packed["source_hash"], flat["source_hash"]);
    assert_ne!(packed["plan_fingerprint"], flat["plan_fingerprint"]);
}

// ── Emit targets ────────────────────────────────────────────────────────────

#[test]
fn emit_ast_is_parse_only() {
    // Planning would fail (no output), but the syntax tree still prints.
    let path = temp_source("ast", "stage f(x) = x\n");
    let stdout = run_kfuse(&["--emit", "ast", path.to_str().unwrap()]);
    assert!(stdout.contains("Stage"), "unexpected AST output:\n{stdout}");
}

#[test]
fn emit_plan_lists_every_kernel() {
    let stdout = run_kfuse(&["--emit", "plan", &demo_path("blur.kfs")]);
    assert!(stdout.contains("kernel 0 (input)"), "{stdout}");
    assert!(stdout.contains("kernel 1 (out)"), "{stdout}");
    assert!(stdout.contains("|barrier|"), "{stdout}");
}

#[test]
fn emit_dot_is_a_digraph() {
    let stdout = run_kfuse(&["--emit", "dot", &demo_path("pyramid.kfs")]);
    assert!(stdout.starts_with("digraph"), "{stdout}");
    assert!(stdout.contains("p0"));
    assert!(stdout.contains("p9"));
}

#[test]
fn emit_run_honors_bindings() {
    let stdout = run_kfuse(&[
        "--emit",
        "run",
        "--bind",
        "n=40",
        &demo_path("doubling_chain.kfs"),
    ]);
    assert!(stdout.contains("blocks      3"), "{stdout}");
    assert!(
        stdout.contains("output      f4 40 of 40 point(s) written"),
        "{stdout}"
    );
}

#[test]
fn output_flag_writes_a_file() {
    let dir = std::env::temp_dir().join(format!("kfuse-test-{}-out", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let out = dir.join("chain.cu");
    let stdout = run_kfuse(&[
        "--emit",
        "cuda",
        "-o",
        out.to_str().unwrap(),
        &demo_path("doubling_chain.kfs"),
    ]);
    assert!(stdout.is_empty());
    let written = std::fs::read_to_string(&out).expect("output file");
    assert_eq!(
        written,
        run_kfuse(&["--emit", "cuda", &demo_path("doubling_chain.kfs")])
    );
}

// ── Failures ────────────────────────────────────────────────────────────────

#[test]
fn missing_source_exits_with_2() {
    let output = run_raw(&["--emit", "plan", "/nonexistent/kfuse/input.kfs"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn resolve_error_exits_with_1_and_reports_location() {
    let path = temp_source("unknown", "stage f(x) = g(x)\noutput f [4]\n");
    let output = run_raw(&["--emit", "plan", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[E0100]"), "{stderr}");
    assert!(stderr.contains(":1:"), "{stderr}");
}

#[test]
fn parse_error_exits_with_1() {
    let path = temp_source("syntax", "stage f(x) = = x\n");
    let output = run_raw(&["--emit", "cuda", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("parse error"), "{stderr}");
}

#[test]
fn malformed_binding_is_rejected() {
    let output = run_raw(&[
        "--emit",
        "run",
        "--bind",
        "n",
        &demo_path("doubling_chain.kfs"),
    ]);
    assert!(!output.status.success());
}
