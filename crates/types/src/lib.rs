//! Shared type definitions for the Weft pipeline engine.
//!
//! These types are consumed by the engine and the CLI. They intentionally
//! preserve authoring order (via `IndexMap`) so variable tables, branch arms,
//! and snapshots render in the sequence they were written.

pub mod events;
pub mod pipeline;
pub mod spec;
pub mod value;

pub use events::{PipelineEvent, PipelineRunStatus, Snapshot, SourceRecord};
pub use pipeline::{
    BranchStep, CallStep, InvocationKey, InvocationKeyError, LoopStep, PipelineDefinition, PipelineDocument, RawBranch,
    RawCallOverrides, RawLoop, RawStep, Step,
};
pub use spec::{InvocationKind, OutputTarget, ServerSpec, SourceExpr, ToolRegistry, ToolSpec};
pub use value::{BranchPath, BranchSegment, LaneCountMismatch, LaneRecord, LaneTags, PoolValue, WrappedSequence};
