//! The pipeline driver.
//!
//! Runs passes in a fixed order, repeating the idempotent normalization
//! group to fixpoint with an iteration cap. Before each pass the driver
//! records a step marker; if a pass fails, the error is wrapped with the
//! pass name and the block it was working on, and the method is reported as
//! failed rather than aborting the module. Whole-module decompilation maps
//! the driver over methods in parallel - the trees are disjoint and the
//! shared type system is safe for concurrent readers.

use std::sync::{atomic::AtomicBool, Arc};

use rayon::prelude::*;

use crate::{
    il::{ILBuilder, ILFunction},
    metadata::{MethodDefHandle, MethodToken},
    settings::DecompilerSettings,
    transforms::{
        cleanup::{BlockSorting, InlineStackSlots, RemoveNops, SimplifyBranches},
        context::TransformContext,
        lock::LockTransform,
        nullability::NullabilityTransforms,
        structuring::{ConditionDetection, LoopDetection, SwitchNormalization},
        switch_on_string::SwitchOnStringTransform,
        using_stmt::UsingTransform,
        IlTransform,
    },
    typesystem::{GenericContext, ResolveOptions, TypeSystem},
    Error, Result,
};

/// Iteration cap for fixpoint groups; a group that has not stabilized by
/// then indicates a non-idempotent pass.
const MAX_GROUP_ITERATIONS: usize = 20;

enum Stage {
    /// Passes run once, in order.
    Once(Vec<Box<dyn IlTransform>>),
    /// Passes repeated together until none of them changes anything.
    Fixpoint(Vec<Box<dyn IlTransform>>),
}

/// The ordered pass pipeline for one method.
pub struct TransformPipeline {
    stages: Vec<Stage>,
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::standard()
    }
}

impl TransformPipeline {
    /// The standard pass order.
    ///
    /// Normalization runs first so recognizers see inlined expression trees;
    /// string-switch recovery works on the raw block cascade and therefore
    /// precedes condition folding; lock/using/null recovery need the folded
    /// finally shapes and run after it; loops and switch normalization come
    /// last, followed by a final cleanup.
    #[must_use]
    pub fn standard() -> Self {
        Self {
            stages: vec![
                Stage::Fixpoint(vec![
                    Box::new(InlineStackSlots),
                    Box::new(RemoveNops),
                    Box::new(SimplifyBranches),
                    Box::new(BlockSorting),
                ]),
                Stage::Once(vec![Box::new(SwitchOnStringTransform)]),
                Stage::Once(vec![Box::new(ConditionDetection)]),
                Stage::Fixpoint(vec![
                    Box::new(InlineStackSlots),
                    Box::new(SimplifyBranches),
                    Box::new(BlockSorting),
                ]),
                Stage::Once(vec![
                    Box::new(LockTransform),
                    Box::new(UsingTransform),
                    Box::new(NullabilityTransforms),
                ]),
                Stage::Once(vec![Box::new(LoopDetection)]),
                Stage::Once(vec![Box::new(SwitchNormalization)]),
                Stage::Fixpoint(vec![
                    Box::new(InlineStackSlots),
                    Box::new(RemoveNops),
                    Box::new(SimplifyBranches),
                    Box::new(BlockSorting),
                ]),
            ],
        }
    }

    /// Applies the pipeline to one function.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransformFailure`] wrapping the failing pass, or
    /// [`Error::Cancelled`] when cancellation was observed at a pass
    /// boundary.
    pub fn run(&self, function: &mut ILFunction, ctx: &mut TransformContext) -> Result<()> {
        for stage in &self.stages {
            match stage {
                Stage::Once(passes) => {
                    for pass in passes {
                        Self::run_pass(pass.as_ref(), function, ctx)?;
                    }
                }
                Stage::Fixpoint(passes) => {
                    for _ in 0..MAX_GROUP_ITERATIONS {
                        let mut changed = false;
                        for pass in passes {
                            changed |= Self::run_pass(pass.as_ref(), function, ctx)?;
                        }
                        if !changed {
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn run_pass(
        pass: &dyn IlTransform,
        function: &mut ILFunction,
        ctx: &mut TransformContext,
    ) -> Result<bool> {
        ctx.check_cancelled()?;
        ctx.record_step(pass.name());
        ctx.set_current_block(0);
        let changed = pass.run(function, ctx).map_err(|source| match source {
            Error::Cancelled => Error::Cancelled,
            other => Error::TransformFailure {
                pass: pass.name(),
                block: ctx.current_block(),
                source: Box::new(other),
            },
        })?;
        debug_assert!(
            function.check_invariants().is_ok(),
            "pass {} broke the tree invariants",
            pass.name()
        );
        Ok(changed)
    }
}

/// The result of decompiling one method.
pub struct MethodOutcome {
    /// The method's metadata handle.
    pub handle: MethodDefHandle,
    /// The transformed function, or the failure the outer decompiler turns
    /// into a commented placeholder.
    pub result: Result<ILFunction>,
}

/// Decompiles a set of methods, in parallel across methods.
///
/// Per-method work is strictly sequential and deterministic; output order
/// matches the input handle order. A failing method yields its failure
/// record while the rest of the module still decompiles.
#[must_use]
pub fn decompile_module(
    types: &TypeSystem,
    methods: &[MethodDefHandle],
    settings: &DecompilerSettings,
    cancelled: Arc<AtomicBool>,
) -> Vec<MethodOutcome> {
    methods
        .par_iter()
        .map(|&handle| MethodOutcome {
            handle,
            result: decompile_method(types, handle, settings, &cancelled),
        })
        .collect()
}

/// Builds and transforms a single method body.
///
/// # Errors
///
/// Propagates metadata errors from resolution and body decoding, and
/// transform failures from the pipeline.
pub fn decompile_method(
    types: &TypeSystem,
    handle: MethodDefHandle,
    settings: &DecompilerSettings,
    cancelled: &Arc<AtomicBool>,
) -> Result<ILFunction> {
    let method = types.resolve_method(
        MethodToken::Definition(handle),
        &GenericContext::empty(),
        ResolveOptions::default(),
    )?;
    let body = types.reader().method_body(handle)?;
    let builder = ILBuilder::new(types);
    let mut function = builder.build(method, &body)?;

    let mut ctx = TransformContext::new(settings.clone())
        .with_cancellation(Arc::clone(cancelled));
    TransformPipeline::standard().run(&mut function, &mut ctx)?;
    Ok(function)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::InstrKind as K;

    #[test]
    fn test_pipeline_records_steps() {
        let mut function = ILFunction::new(None);
        let root = function.root();
        let block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(root, block).unwrap();
        let leave = function.create(K::Leave(root), vec![]).unwrap();
        function.push_child(block, leave).unwrap();

        let mut ctx = TransformContext::new(DecompilerSettings::default());
        TransformPipeline::standard()
            .run(&mut function, &mut ctx)
            .unwrap();

        let steps = ctx.steps();
        assert!(!steps.is_empty());
        assert_eq!(steps[0].ordinal, 0);
        assert!(steps.iter().any(|step| step.pass == "LockTransform"));
        assert!(steps
            .iter()
            .any(|step| step.pass == "SwitchOnStringTransform"));
        function.check_invariants().unwrap();
    }

    #[test]
    fn test_cancellation_stops_pipeline() {
        let mut function = ILFunction::new(None);
        let root = function.root();
        let block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(root, block).unwrap();
        let leave = function.create(K::Leave(root), vec![]).unwrap();
        function.push_child(block, leave).unwrap();

        let flag = Arc::new(AtomicBool::new(true));
        let mut ctx =
            TransformContext::new(DecompilerSettings::default()).with_cancellation(flag);
        let err = TransformPipeline::standard()
            .run(&mut function, &mut ctx)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
