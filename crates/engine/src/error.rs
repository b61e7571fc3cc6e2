//! Error types for pipeline compilation and execution.

use thiserror::Error;
use weft_types::InvocationKey;

/// Failures detected while lowering a pipeline or building its variable table.
///
/// Always fatal and always raised before any tool is invoked.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("unresolved local variable '{name}' in {step}")]
    UnresolvedLocalVariable { step: String, name: String },

    #[error("unresolved global variable '{name}' in {step}")]
    UnresolvedGlobalVariable { step: String, name: String },

    #[error("malformed step '{step}': {reason}")]
    MalformedStep { step: String, reason: String },
}

impl CompileError {
    pub fn unresolved_local(step: impl ToString, name: impl Into<String>) -> Self {
        Self::UnresolvedLocalVariable {
            step: step.to_string(),
            name: name.into(),
        }
    }

    pub fn unresolved_global(step: impl ToString, name: impl Into<String>) -> Self {
        Self::UnresolvedGlobalVariable {
            step: step.to_string(),
            name: name.into(),
        }
    }

    pub fn malformed(step: impl ToString, reason: impl Into<String>) -> Self {
        Self::MalformedStep {
            step: step.to_string(),
            reason: reason.into(),
        }
    }
}

/// Main error type for pipeline runs.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("length mismatch writing '{variable}' from {step}: expected {expected} lanes, got {actual}")]
    LengthMismatch {
        step: InvocationKey,
        variable: String,
        expected: usize,
        actual: usize,
    },

    #[error("{step} returned malformed output for '{variable}': {reason}")]
    MalformedOutput {
        step: InvocationKey,
        variable: String,
        reason: String,
    },

    #[error("no skeleton available to pad '{variable}' written by {step}")]
    SkeletonUnavailable { step: InvocationKey, variable: String },

    /// A `$name` read whose only writer did not run on this path.
    #[error("local variable '{name}' was not written before {step}")]
    UnboundLocal { step: InvocationKey, name: String },

    #[error("tool {step} is not exposed by server '{server}'", server = .step.server)]
    UnknownTool { step: InvocationKey },

    #[error("tool {step} failed: {source}")]
    ToolInvocation {
        step: InvocationKey,
        #[source]
        source: anyhow::Error,
    },

    #[error("pipeline run canceled")]
    Cancelled,
}

impl EngineError {
    pub fn tool_invocation(step: &InvocationKey, source: anyhow::Error) -> Self {
        Self::ToolInvocation {
            step: step.clone(),
            source,
        }
    }

    pub fn malformed_output(step: &InvocationKey, variable: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedOutput {
            step: step.clone(),
            variable: variable.into(),
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}
