// kfuse — kernel fusion planner
//
// Library root. The fusion core (graph, region, placement, alloc, sync) is
// driven by `lower`; the front end (lexer, parser, resolve) and the
// emitters (codegen, dot, manifest, sim) sit on either side of it.

pub mod alloc;
pub mod ast;
pub mod codegen;
pub mod diag;
pub mod dot;
pub mod error;
pub mod graph;
pub mod id;
pub mod lexer;
pub mod lower;
pub mod manifest;
pub mod parser;
pub mod pass;
pub mod pipeline;
pub mod placement;
pub mod region;
pub mod resolve;
pub mod sim;
pub mod sym;
pub mod sync;
pub mod transform;
