//! Pass wrappers over the control-flow structurer.

use crate::{
    il::ILFunction,
    structure,
    transforms::{context::TransformContext, IlTransform},
    Result,
};

/// Folds `if (cond) br X; br Y` endings and merges straight-line chains.
pub struct ConditionDetection;

impl IlTransform for ConditionDetection {
    fn name(&self) -> &'static str {
        "ConditionDetection"
    }

    fn run(&self, function: &mut ILFunction, ctx: &TransformContext) -> Result<bool> {
        ctx.check_cancelled()?;
        structure::fold_conditions(function)
    }
}

/// Nests natural loops into loop containers.
pub struct LoopDetection;

impl IlTransform for LoopDetection {
    fn name(&self) -> &'static str {
        "LoopDetection"
    }

    fn run(&self, function: &mut ILFunction, ctx: &TransformContext) -> Result<bool> {
        ctx.check_cancelled()?;
        structure::detect_loops(function)
    }
}

/// Merges, partitions and default-hoists switch sections.
pub struct SwitchNormalization;

impl IlTransform for SwitchNormalization {
    fn name(&self) -> &'static str {
        "SwitchNormalization"
    }

    fn run(&self, function: &mut ILFunction, ctx: &TransformContext) -> Result<bool> {
        ctx.check_cancelled()?;
        structure::simplify_switches(function)
    }
}
