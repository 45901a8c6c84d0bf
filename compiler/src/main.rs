use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use kfuse::diag::Diagnostic;
use kfuse::pass::PassId;
use kfuse::pipeline::{compute_provenance, run_pipeline, CompilationState, PipelineOptions};
use kfuse::sym::Symbol;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EmitStage {
    /// Human-readable kernel plan
    Plan,
    /// CUDA kernel source
    Cuda,
    /// Graphviz rendering of the stage graph
    Dot,
    /// Machine-readable plan
    Json,
    /// Source hash and plan fingerprint
    BuildInfo,
    /// Execute the plan on the reference executor
    Run,
    /// Parsed syntax tree
    Ast,
}

impl EmitStage {
    fn terminal(self) -> Option<PassId> {
        match self {
            EmitStage::Ast => None,
            EmitStage::Cuda => Some(PassId::Codegen),
            EmitStage::Plan
            | EmitStage::Dot
            | EmitStage::Json
            | EmitStage::BuildInfo
            | EmitStage::Run => Some(PassId::Synchronize),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "kfuse",
    version,
    about = "Kernel fusion planner: sizes, places, and synchronizes fused GPU stages from .kfs schedules"
)]
struct Cli {
    /// Input .kfs schedule file
    source: PathBuf,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Cuda)]
    emit: EmitStage,

    /// Runtime parameter value, `name=value` (repeatable)
    #[arg(long = "bind", value_parser = parse_binding)]
    bind: Vec<(String, i64)>,

    /// Give every shared buffer its own arena slot
    #[arg(long)]
    no_reuse: bool,

    /// Per-block shared memory budget in bytes
    #[arg(long)]
    shared_limit: Option<u64>,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print compiler phases and timing
    #[arg(long)]
    verbose: bool,
}

fn parse_binding(s: &str) -> Result<(String, i64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    let value = value
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("invalid value for '{}': {e}", name.trim()))?;
    Ok((name.trim().to_string(), value))
}

/// 1-based line and column of a byte offset.
fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let col = before.rfind('\n').map_or(before.len(), |nl| before.len() - nl - 1) + 1;
    (line, col)
}

fn print_diag(path: &std::path::Path, source: &str, diag: &Diagnostic) {
    let (line, col) = line_col(source, diag.span.start);
    eprintln!("{}:{}:{}: {}", path.display(), line, col, diag);
    for related in &diag.related_spans {
        let (line, col) = line_col(source, related.span.start);
        eprintln!("  {}:{}:{}: note: {}", path.display(), line, col, related.label);
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "kfuse=debug" } else { "kfuse=warn" })
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn write_output(cli: &Cli, text: &str) -> ExitCode {
    match &cli.output {
        Some(path) => match std::fs::write(path, text) {
            Ok(()) => {
                if cli.verbose {
                    eprintln!("kfuse: wrote {}", path.display());
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("kfuse: error: {}: {}", path.display(), e);
                ExitCode::from(2)
            }
        },
        None => {
            print!("{text}");
            ExitCode::SUCCESS
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.verbose {
        eprintln!("kfuse: source = {}", cli.source.display());
        eprintln!("kfuse: emit   = {:?}", cli.emit);
    }

    // ── Read and parse source ──
    let source = match std::fs::read_to_string(&cli.source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("kfuse: error: {}: {}", cli.source.display(), e);
            return ExitCode::from(2);
        }
    };

    let parse_result = kfuse::parser::parse(&source);
    if !parse_result.errors.is_empty() {
        for err in &parse_result.errors {
            let (line, col) = line_col(&source, err.span().start);
            eprintln!("{}:{}:{}: parse error: {}", cli.source.display(), line, col, err);
        }
        return ExitCode::from(1);
    }
    let Some(program) = parse_result.program else {
        eprintln!("kfuse: parse failed with no output");
        return ExitCode::from(1);
    };

    if cli.verbose {
        eprintln!("kfuse: parsed {} statements", program.statements.len());
    }

    let Some(terminal) = cli.emit.terminal() else {
        return write_output(&cli, &format!("{program:#?}\n"));
    };

    // ── Passes ──
    let options = PipelineOptions {
        reuse: cli.no_reuse.then_some(false),
        shared_limit: cli.shared_limit,
    };
    let mut state = CompilationState::new(program);
    let result = run_pipeline(&mut state, terminal, &options, cli.verbose, |_, diags| {
        for d in diags {
            print_diag(&cli.source, &source, d);
        }
    });
    if let Err(e) = result {
        if cli.verbose {
            eprintln!("kfuse: stopped after {:?}", e.failing_pass);
        }
        return ExitCode::from(1);
    }
    state.provenance = Some(compute_provenance(&source, state.manifest().as_ref()));

    let (Some(resolved), Some(plan)) = (state.resolved.as_ref(), state.plan.as_ref()) else {
        eprintln!("kfuse: internal error: no plan after {:?}", terminal);
        return ExitCode::from(1);
    };

    let text = match cli.emit {
        EmitStage::Plan => plan.to_string(),
        EmitStage::Dot => kfuse::dot::emit_dot(&resolved.graph, plan),
        EmitStage::Cuda => match &state.generated {
            Some(g) => g.cuda_source.clone(),
            None => {
                eprintln!("kfuse: internal error: codegen produced nothing");
                return ExitCode::from(1);
            }
        },
        EmitStage::Json | EmitStage::BuildInfo => {
            let json = if cli.emit == EmitStage::Json {
                state.manifest().map(|m| m.to_json())
            } else {
                state.provenance.as_ref().map(|p| p.to_json())
            };
            match json {
                Some(Ok(s)) => s + "\n",
                Some(Err(e)) => {
                    eprintln!("kfuse: error: {e}");
                    return ExitCode::from(1);
                }
                None => return ExitCode::from(1),
            }
        }
        EmitStage::Run => {
            let mut bindings = resolved.default_bindings();
            for (name, value) in &cli.bind {
                bindings.set(Symbol::Param(name.clone()), *value);
            }
            match kfuse::sim::simulate(&resolved.graph, plan, &bindings) {
                Ok(report) => report.to_string(),
                Err(e) => {
                    eprintln!("kfuse: run failed: {e}");
                    return ExitCode::from(1);
                }
            }
        }
        EmitStage::Ast => unreachable!("handled before the pipeline"),
    };
    write_output(&cli, &text)
}
