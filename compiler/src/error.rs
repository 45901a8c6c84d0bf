// error.rs — Typed failures of the fusion core
//
// All of these are detected while validating or planning a schedule, never
// while a kernel runs. They are deterministic functions of the
// (graph, schedule) pair and are not retried.

use thiserror::Error;

use crate::diag::{codes, DiagCode};

pub type Result<T, E = FuseError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FuseError {
    /// The declared reads do not form a DAG. `stages` lists one cycle,
    /// starting and ending at the same stage.
    #[error("dependency cycle: {}", .stages.join(" -> "))]
    Cycle { stages: Vec<String> },

    /// A stage is stored at a scope that some reader cannot see.
    #[error("stage '{stage}' is placed at {scope} scope but '{reader}' {reason}")]
    Placement {
        stage: String,
        scope: String,
        reader: String,
        reason: String,
    },

    /// A producer dimension is read through an access with no inverse and
    /// carries no declared bound.
    #[error("cannot bound dimension {dim} of '{stage}' as read by '{consumer}': {reason}")]
    UnboundedRegion {
        stage: String,
        consumer: String,
        dim: usize,
        reason: String,
    },

    /// A runtime parameter was needed to evaluate a symbolic size.
    #[error("runtime symbol '{name}' has no binding")]
    UnboundSymbol { name: String },
}

impl FuseError {
    pub fn code(&self) -> DiagCode {
        match self {
            FuseError::Cycle { .. } => codes::E0200,
            FuseError::Placement { .. } => codes::E0300,
            FuseError::UnboundedRegion { .. } => codes::E0400,
            FuseError::UnboundSymbol { .. } => codes::E0401,
        }
    }
}
