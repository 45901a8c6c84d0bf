// diag.rs — Diagnostics shared by every kfuse pass
//
// Passes never abort on the first problem they see: they collect
// `Diagnostic`s and the pipeline runner stops after the first pass that
// produced an error-level one. Core algorithms report typed `FuseError`s;
// `Diagnostic::from_error` attaches a source span and a stable code.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::ast::Span;
use crate::error::FuseError;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0300`, `W0500`).
///
/// Once assigned, a code keeps its meaning. Ranges:
/// `E01xx` resolve, `E02xx` graph structure, `E03xx` placement,
/// `E04xx` region bounds, `E05xx`/`W05xx` allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    pub const E0100: DiagCode = DiagCode("E0100"); // unknown stage
    pub const E0101: DiagCode = DiagCode("E0101"); // duplicate stage
    pub const E0102: DiagCode = DiagCode("E0102"); // call arity mismatch
    pub const E0103: DiagCode = DiagCode("E0103"); // unknown variable or param
    pub const E0104: DiagCode = DiagCode("E0104"); // invalid tile/thread/extent value
    pub const E0105: DiagCode = DiagCode("E0105"); // no output declared
    pub const E0106: DiagCode = DiagCode("E0106"); // duplicate directive
    pub const E0107: DiagCode = DiagCode("E0107"); // stage has no placement
    pub const E0108: DiagCode = DiagCode("E0108"); // unknown or malformed setting
    pub const E0109: DiagCode = DiagCode("E0109"); // unknown dimension name
    pub const E0110: DiagCode = DiagCode("E0110"); // unknown element type
    pub const E0200: DiagCode = DiagCode("E0200"); // dependency cycle
    pub const E0300: DiagCode = DiagCode("E0300"); // placement narrower than a reader
    pub const E0400: DiagCode = DiagCode("E0400"); // unbounded region
    pub const E0401: DiagCode = DiagCode("E0401"); // unbound runtime symbol
    pub const E0500: DiagCode = DiagCode("E0500"); // barrier sequence failed verification
    pub const W0101: DiagCode = DiagCode("W0101"); // stage never read
    pub const W0500: DiagCode = DiagCode("W0500"); // arena exceeds shared limit
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Related span ─────────────────────────────────────────────────────────

/// A secondary source location providing context for a diagnostic.
#[derive(Debug, Clone)]
pub struct RelatedSpan {
    pub span: Span,
    pub label: String,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub span: Span,
    pub message: String,
    pub hint: Option<String>,
    pub related_spans: Vec<RelatedSpan>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, span: Span, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            span,
            message: message.into(),
            hint: None,
            related_spans: Vec::new(),
        }
    }

    pub fn error(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, span, message).with_code(code)
    }

    pub fn warning(code: DiagCode, span: Span, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, span, message).with_code(code)
    }

    /// Wrap a core error, anchoring it at the span of the stage it names.
    pub fn from_error(err: &FuseError, span: Span) -> Self {
        let diag = Self::error(err.code(), span, err.to_string());
        match err {
            FuseError::Placement { .. } => {
                diag.with_hint("move the stage to a wider scope (block or root)")
            }
            FuseError::UnboundedRegion { .. } => {
                diag.with_hint("declare a `bound` for the producer dimension")
            }
            FuseError::UnboundSymbol { .. } => diag.with_hint("pass `--bind name=value`"),
            FuseError::Cycle { .. } => diag,
        }
    }

    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_related(mut self, span: Span, label: impl Into<String>) -> Self {
        self.related_spans.push(RelatedSpan {
            span,
            label: label.into(),
        });
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

/// True if any diagnostic in the slice is an error.
pub fn has_errors(diags: &[Diagnostic]) -> bool {
    diags.iter().any(Diagnostic::is_error)
}
