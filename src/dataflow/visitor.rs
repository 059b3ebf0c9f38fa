//! The generic forward dataflow engine.
//!
//! Walks an IL tree carrying a mutable `current` state. Straight-line
//! children mutate the state in order; control-flow kinds clone, restore,
//! join, and meet according to their semantics; block containers run a
//! worklist fixpoint keyed by block child-index (reverse postorder after
//! `sort_blocks`, which makes convergence fast).
//!
//! Exceptional flow: every node whose kind can intrinsically throw joins the
//! current state into the innermost enclosing try's "on-exception" state.
//! That state is persistent per try-instruction across re-entries, so outer
//! fixpoints observe monotone growth and terminate on any finite-height
//! semilattice.
//!
//! In debug builds the engine asserts that block input states only grow
//! (monotonicity); a violation indicates a broken `join` implementation.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashMap;

use crate::{
    dataflow::state::DataFlowState,
    il::{ILFunction, InstrId, InstrKind},
    Error, Result,
};

/// Per-instruction effect hook of a concrete analysis.
///
/// The engine owns all control flow; the transfer function only describes
/// what individual instructions do to the state. It is invoked for every
/// node: before the children for the control-flow kinds (so handler
/// variables can be introduced at entry), after the children for everything
/// else (so a store sees its value's effects first).
pub trait TransferFunction<S: DataFlowState> {
    /// Applies one instruction's effect to the state.
    fn apply(&mut self, function: &ILFunction, instr: InstrId, state: &mut S);
}

struct ContainerCtx {
    id: InstrId,
    worklist: BTreeSet<(usize, InstrId)>,
}

/// The results of a completed analysis run.
pub struct AnalysisOutcome<S> {
    /// State at the function's end point.
    pub exit_state: S,
    /// Input state of every block the analysis reached.
    pub block_inputs: FxHashMap<InstrId, S>,
}

/// Forward fixed-point visitor over an IL tree.
pub struct DataFlowVisitor<'a, S: DataFlowState, T: TransferFunction<S>> {
    function: &'a ILFunction,
    transfer: T,
    state: S,
    /// Input state per block; missing entries are unreachable.
    block_inputs: FxHashMap<InstrId, S>,
    /// Persistent on-exception state per try instruction.
    exception_states: FxHashMap<InstrId, S>,
    /// Stack of try instructions currently being visited.
    active_tries: Vec<InstrId>,
    /// Stack of containers currently running their fixpoint.
    active_containers: Vec<ContainerCtx>,
    /// Accumulated on-leave state per container.
    container_exits: FxHashMap<InstrId, S>,
    /// Optional cooperative-cancellation flag, polled per processed block.
    cancelled: Option<&'a AtomicBool>,
}

impl<'a, S: DataFlowState, T: TransferFunction<S>> DataFlowVisitor<'a, S, T> {
    /// Creates a visitor with the analysis' entry state.
    pub fn new(function: &'a ILFunction, transfer: T, initial: S) -> Self {
        Self {
            function,
            transfer,
            state: initial,
            block_inputs: FxHashMap::default(),
            exception_states: FxHashMap::default(),
            active_tries: Vec::new(),
            active_containers: Vec::new(),
            container_exits: FxHashMap::default(),
            cancelled: None,
        }
    }

    /// Polls the flag at each processed block and aborts with
    /// [`Error::Cancelled`] when it is raised.
    #[must_use]
    pub fn with_cancellation(mut self, flag: &'a AtomicBool) -> Self {
        self.cancelled = Some(flag);
        self
    }

    /// Runs the analysis over the whole function and returns the state at
    /// the function's end point.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when the cancellation flag is observed.
    pub fn run(self) -> Result<S> {
        Ok(self.run_full()?.exit_state)
    }

    /// Runs the analysis and additionally returns every block's input
    /// state, for callers that inspect interior program points.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when the cancellation flag is observed.
    pub fn run_full(mut self) -> Result<AnalysisOutcome<S>> {
        self.visit(self.function.root())?;
        Ok(AnalysisOutcome {
            exit_state: self.state,
            block_inputs: self.block_inputs,
        })
    }

    fn unreachable_like(&self) -> S {
        let mut state = self.state.clone();
        state.mark_unreachable();
        state
    }

    fn visit(&mut self, instr: InstrId) -> Result<()> {
        use InstrKind as K;
        match self.function.kind(instr) {
            K::Block { .. } => {
                self.transfer
                    .apply(self.function, instr, &mut self.state);
                for &child in self.function.children(instr) {
                    self.visit(child)?;
                }
                Ok(())
            }

            K::BlockContainer(_) => self.visit_container(instr),

            K::Branch(target) => {
                let target = *target;
                self.join_into_block(target);
                self.state.mark_unreachable();
                Ok(())
            }

            K::Leave(target) => {
                let target = *target;
                for &child in self.function.children(instr) {
                    self.visit(child)?;
                }
                match self.container_exits.get_mut(&target) {
                    Some(exit) => exit.join(&self.state),
                    None => {
                        let snapshot = self.state.clone();
                        self.container_exits.insert(target, snapshot);
                    }
                }
                self.state.mark_unreachable();
                Ok(())
            }

            K::Return => {
                for &child in self.function.children(instr) {
                    self.visit(child)?;
                }
                self.transfer
                    .apply(self.function, instr, &mut self.state);
                self.state.mark_unreachable();
                Ok(())
            }

            K::Throw | K::Rethrow => {
                for &child in self.function.children(instr) {
                    self.visit(child)?;
                }
                self.propagate_exception();
                self.state.mark_unreachable();
                Ok(())
            }

            K::IfInstruction => {
                let condition = self.function.child(instr, 0);
                let then_branch = self.function.child(instr, 1);
                let else_branch = self.function.child(instr, 2);
                self.visit(condition)?;

                let before = self.state.clone();
                self.visit(then_branch)?;
                let then_exit = std::mem::replace(&mut self.state, before);
                self.visit(else_branch)?;
                self.state.join(&then_exit);
                Ok(())
            }

            K::SwitchInstruction => {
                let value = self.function.child(instr, 0);
                self.visit(value)?;

                let baseline = self.state.clone();
                let mut exit = self.unreachable_like();
                let sections: Vec<InstrId> = self.function.children(instr)[1..].to_vec();
                for section in sections {
                    self.state.replace_with(&baseline);
                    self.visit(section)?;
                    exit.join(&self.state);
                }
                self.state.replace_with(&exit);
                Ok(())
            }

            K::SwitchSection(_) => self.visit(self.function.child(instr, 0)),

            K::TryCatch => {
                let try_body = self.function.child(instr, 0);
                let handlers: Vec<InstrId> = self.function.children(instr)[1..].to_vec();

                self.enter_try(instr);
                self.visit(try_body)?;
                let mut result = self.state.clone();

                // Handlers run while the exception is still in flight: the
                // try stays on the active stack so a handler's own throwing
                // instructions join back into the same on-exception state,
                // and each handler re-reads the (possibly grown) snapshot.
                // Filter mutations are therefore observed by later handlers.
                for handler in handlers {
                    let snapshot = self
                        .exception_states
                        .get(&instr)
                        .cloned()
                        .unwrap_or_else(|| self.unreachable_like());
                    self.state.replace_with(&snapshot);
                    self.visit(handler)?;
                    result.join(&self.state);
                }
                self.exit_try();
                self.state.replace_with(&result);
                Ok(())
            }

            K::CatchHandler { .. } => {
                self.transfer
                    .apply(self.function, instr, &mut self.state);
                let filter = self.function.child(instr, 0);
                let body = self.function.child(instr, 1);
                self.visit(filter)?;
                self.visit(body)
            }

            K::TryFinally => {
                let try_body = self.function.child(instr, 0);
                let finally_body = self.function.child(instr, 1);

                self.enter_try(instr);
                self.visit(try_body)?;
                self.exit_try();
                let try_exit = self.state.clone();

                let on_exception = self
                    .exception_states
                    .get(&instr)
                    .cloned()
                    .unwrap_or_else(|| self.unreachable_like());
                self.state.join(&on_exception);
                self.visit(finally_body)?;

                // Both the protected region and the finally must complete
                // normally for the end point to be reachable.
                self.state.meet(&try_exit);
                Ok(())
            }

            K::TryFault => {
                let try_body = self.function.child(instr, 0);
                let fault_body = self.function.child(instr, 1);

                self.enter_try(instr);
                self.visit(try_body)?;
                self.exit_try();
                let try_exit = self.state.clone();

                let on_exception = self
                    .exception_states
                    .get(&instr)
                    .cloned()
                    .unwrap_or_else(|| self.unreachable_like());
                self.state.replace_with(&on_exception);
                self.visit(fault_body)?;

                // The fault handler always rethrows; only the normal exit
                // contributes to the post-state.
                self.state.replace_with(&try_exit);
                Ok(())
            }

            _ => {
                for &child in self.function.children(instr) {
                    self.visit(child)?;
                }
                if kind_may_throw(self.function.kind(instr)) {
                    self.propagate_exception();
                }
                self.transfer
                    .apply(self.function, instr, &mut self.state);
                Ok(())
            }
        }
    }

    fn visit_container(&mut self, container: InstrId) -> Result<()> {
        let blocks: Vec<InstrId> = self.function.children(container).to_vec();
        if blocks.is_empty() {
            return Ok(());
        }

        self.active_containers.push(ContainerCtx {
            id: container,
            worklist: BTreeSet::new(),
        });
        let entry = blocks[0];
        self.join_into_block(entry);

        loop {
            let Some(ctx) = self.active_containers.last_mut() else {
                break;
            };
            let Some(&(index, block)) = ctx.worklist.iter().next() else {
                break;
            };
            ctx.worklist.remove(&(index, block));

            if let Some(flag) = self.cancelled {
                if flag.load(Ordering::Relaxed) {
                    self.active_containers.pop();
                    return Err(Error::Cancelled);
                }
            }

            let input = self
                .block_inputs
                .get(&block)
                .cloned()
                .unwrap_or_else(|| self.unreachable_like());
            self.state.replace_with(&input);
            self.visit(block)?;
        }
        self.active_containers.pop();

        match self.container_exits.get(&container) {
            Some(exit) => {
                let exit = exit.clone();
                self.state.replace_with(&exit);
            }
            None => self.state.mark_unreachable(),
        }
        Ok(())
    }

    /// Joins the current state into a block's input and re-enqueues the
    /// block when its input grew.
    fn join_into_block(&mut self, block: InstrId) {
        if self.state.is_unreachable() {
            return;
        }
        let grew = match self.block_inputs.get_mut(&block) {
            Some(input) => {
                if self.state.less_or_equal(input) {
                    false
                } else {
                    #[cfg(debug_assertions)]
                    let before = input.clone();
                    input.join(&self.state);
                    #[cfg(debug_assertions)]
                    debug_assert!(
                        before.less_or_equal(input),
                        "block input state shrank on re-entry; join is not monotone"
                    );
                    true
                }
            }
            None => {
                self.block_inputs.insert(block, self.state.clone());
                true
            }
        };
        if grew {
            let Some(container) = self.function.parent(block) else {
                return;
            };
            if let Some(ctx) = self
                .active_containers
                .iter_mut()
                .rev()
                .find(|ctx| ctx.id == container)
            {
                ctx.worklist
                    .insert((self.function.child_index(block), block));
            }
        }
    }

    /// Joins the current state into the innermost enclosing try's persistent
    /// on-exception state.
    fn propagate_exception(&mut self) {
        if self.state.is_unreachable() {
            return;
        }
        let Some(&try_instr) = self.active_tries.last() else {
            return;
        };
        match self.exception_states.get_mut(&try_instr) {
            Some(existing) => existing.join(&self.state),
            None => {
                let snapshot = self.state.clone();
                self.exception_states.insert(try_instr, snapshot);
            }
        }
    }

    fn enter_try(&mut self, try_instr: InstrId) {
        self.active_tries.push(try_instr);
    }

    fn exit_try(&mut self) {
        self.active_tries.pop();
    }
}

/// Kinds that can intrinsically raise an exception.
fn kind_may_throw(kind: &InstrKind) -> bool {
    use InstrKind as K;
    match kind {
        K::Call(_)
        | K::CallVirt(_)
        | K::NewObj(_)
        | K::LdObj(_)
        | K::StObj(_)
        | K::LdFld(_)
        | K::LdFlda(_)
        | K::StFld(_)
        | K::Box(_)
        | K::UnboxAny(_)
        | K::CastClass(_)
        | K::Throw
        | K::Rethrow
        | K::LockInstruction
        | K::UsingInstruction(_) => true,
        K::BinaryOp(op) => op.may_throw(),
        _ => false,
    }
}
