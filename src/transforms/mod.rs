//! The IL transform pipeline.
//!
//! Passes implement [`IlTransform`] and mutate the IL tree in place; every
//! pass leaves the structural invariants intact at exit (the pipeline
//! asserts them in debug builds). Pattern mismatch inside a pass is plain
//! `false`-returning control flow - only genuinely unexpected failures
//! surface as errors, which the driver wraps into a per-method failure
//! record instead of aborting the module.

mod cleanup;
mod context;
mod lock;
mod nullability;
mod pipeline;
mod structuring;
mod switch_on_string;
mod using_stmt;

pub use cleanup::{BlockSorting, InlineStackSlots, RemoveNops, SimplifyBranches};
pub use context::{StepMarker, TransformContext};
pub use lock::LockTransform;
pub use nullability::NullabilityTransforms;
pub use pipeline::{decompile_method, decompile_module, MethodOutcome, TransformPipeline};
pub use structuring::{ConditionDetection, LoopDetection, SwitchNormalization};
pub use switch_on_string::SwitchOnStringTransform;
pub use using_stmt::UsingTransform;

use crate::{il::ILFunction, Result};

/// A rewriting pass over one method's IL tree.
///
/// `run` returns whether it changed anything, so the driver can iterate
/// idempotent pass groups to fixpoint.
pub trait IlTransform: Send + Sync {
    /// Stable name, recorded as the step marker before the pass runs.
    fn name(&self) -> &'static str;

    /// Runs the pass.
    ///
    /// # Errors
    ///
    /// An error aborts the current method; the driver records it together
    /// with the pass name and current block.
    fn run(&self, function: &mut ILFunction, ctx: &TransformContext) -> Result<bool>;
}
