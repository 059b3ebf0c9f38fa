//! Definite-assignment analysis.
//!
//! Tracks the set of variables that are *potentially unassigned* on some
//! path. The set grows at joins (union), so the semilattice has finite
//! height and the engine terminates; a variable is definitely assigned at a
//! point iff its bit is clear there.

use crate::{
    dataflow::{
        state::DataFlowState,
        visitor::{DataFlowVisitor, TransferFunction},
    },
    il::{ILFunction, InstrId, InstrKind, VarId, VariableKind},
    utils::BitSet,
    Result,
};

/// State: the variables that may still be unassigned.
#[derive(Clone, PartialEq)]
pub struct DefiniteAssignmentState {
    potentially_unassigned: BitSet,
    unreachable: bool,
}

impl DefiniteAssignmentState {
    /// State at function entry: parameters assigned, everything else not.
    #[must_use]
    pub fn at_entry(function: &ILFunction) -> Self {
        let count = function.variables().count();
        let mut potentially_unassigned = BitSet::full(count);
        for (id, variable) in function.variables() {
            if variable.kind() == VariableKind::Parameter {
                potentially_unassigned.remove(id.index());
            }
        }
        Self {
            potentially_unassigned,
            unreachable: false,
        }
    }

    /// Is the variable definitely assigned in this state?
    #[must_use]
    pub fn is_definitely_assigned(&self, var: VarId) -> bool {
        self.unreachable || !self.potentially_unassigned.contains(var.index())
    }

    fn assign(&mut self, var: VarId) {
        self.potentially_unassigned.remove(var.index());
    }
}

impl std::fmt::Debug for DefiniteAssignmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.unreachable {
            return write!(f, "unreachable");
        }
        write!(f, "maybe-unassigned: {:?}", self.potentially_unassigned)
    }
}

impl DataFlowState for DefiniteAssignmentState {
    fn less_or_equal(&self, other: &Self) -> bool {
        if self.unreachable {
            return true;
        }
        if other.unreachable {
            return false;
        }
        self.potentially_unassigned
            .is_subset(&other.potentially_unassigned)
    }

    fn replace_with(&mut self, other: &Self) {
        self.potentially_unassigned = other.potentially_unassigned.clone();
        self.unreachable = other.unreachable;
    }

    fn join(&mut self, incoming: &Self) {
        if incoming.unreachable {
            return;
        }
        if self.unreachable {
            self.replace_with(incoming);
            return;
        }
        self.potentially_unassigned
            .union_with(&incoming.potentially_unassigned);
    }

    fn meet(&mut self, incoming: &Self) {
        if self.unreachable {
            return;
        }
        if incoming.unreachable {
            self.mark_unreachable();
            return;
        }
        self.potentially_unassigned
            .intersect_with(&incoming.potentially_unassigned);
    }

    fn is_unreachable(&self) -> bool {
        self.unreachable
    }

    fn mark_unreachable(&mut self) {
        self.unreachable = true;
    }
}

/// The transfer function: stores and handler entries assign.
pub struct DefiniteAssignment;

impl TransferFunction<DefiniteAssignmentState> for DefiniteAssignment {
    fn apply(
        &mut self,
        function: &ILFunction,
        instr: InstrId,
        state: &mut DefiniteAssignmentState,
    ) {
        match *function.kind(instr) {
            InstrKind::StLoc(var) | InstrKind::UsingInstruction(var) => state.assign(var),
            InstrKind::CatchHandler { variable, .. } => state.assign(variable),
            _ => {}
        }
    }
}

impl DefiniteAssignment {
    /// Runs the analysis and returns the state at the function's end point.
    ///
    /// # Errors
    ///
    /// Propagates cancellation from the engine when a token is used through
    /// [`DataFlowVisitor`] directly; this convenience entry never cancels.
    pub fn run(function: &ILFunction) -> Result<DefiniteAssignmentState> {
        let initial = DefiniteAssignmentState::at_entry(function);
        DataFlowVisitor::new(function, DefiniteAssignment, initial).run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{ContainerKind, InstrKind as K};

    /// Builds: a loop that conditionally assigns `x`, then leaves.
    ///
    /// ```text
    /// entry: if (cond_param) { stloc x(1) } br header?  -- shaped as:
    /// header: if (p) br body; br exit_path
    /// body:   stloc x(ldc 1); br header
    /// exit:   leave
    /// ```
    #[test]
    fn test_loop_with_conditional_assignment_converges() {
        let mut function = ILFunction::new(None);
        let p = function.add_variable(VariableKind::Parameter, 0, None);
        let x = function.add_variable(VariableKind::Local, 0, None);

        let container = function.root();
        let header = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let body = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let exit = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        for block in [header, body, exit] {
            function.push_child(container, block).unwrap();
        }

        // header: if (ldloc p) br body; br exit
        let cond = function.create(K::LdLoc(p), vec![]).unwrap();
        let to_body = function.create(K::Branch(body), vec![]).unwrap();
        let nop = function.create(K::Nop, vec![]).unwrap();
        let if_instr = function
            .create(K::IfInstruction, vec![cond, to_body, nop])
            .unwrap();
        function.push_child(header, if_instr).unwrap();
        let to_exit = function.create(K::Branch(exit), vec![]).unwrap();
        function.push_child(header, to_exit).unwrap();

        // body: stloc x(ldc 1); br header
        let one = function.create(K::LdcI4(1), vec![]).unwrap();
        let assign = function.create(K::StLoc(x), vec![one]).unwrap();
        function.push_child(body, assign).unwrap();
        let back = function.create(K::Branch(header), vec![]).unwrap();
        function.push_child(body, back).unwrap();

        // exit: leave container
        let leave = function.create(K::Leave(container), vec![]).unwrap();
        function.push_child(exit, leave).unwrap();

        function.check_invariants().unwrap();

        let result = DefiniteAssignment::run(&function).unwrap();
        // The loop may execute zero times, so x is not definitely assigned
        // at the exit; the parameter is.
        assert!(!result.is_definitely_assigned(x));
        assert!(result.is_definitely_assigned(p));
    }

    #[test]
    fn test_assignment_on_both_arms_is_definite() {
        let mut function = ILFunction::new(None);
        let p = function.add_variable(VariableKind::Parameter, 0, None);
        let x = function.add_variable(VariableKind::Local, 0, None);

        let container = function.root();
        let block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(container, block).unwrap();

        // if (p) { x = 1 } else { x = 2 }; leave
        let cond = function.create(K::LdLoc(p), vec![]).unwrap();
        let one = function.create(K::LdcI4(1), vec![]).unwrap();
        let store_one = function.create(K::StLoc(x), vec![one]).unwrap();
        let two = function.create(K::LdcI4(2), vec![]).unwrap();
        let store_two = function.create(K::StLoc(x), vec![two]).unwrap();
        let if_instr = function
            .create(K::IfInstruction, vec![cond, store_one, store_two])
            .unwrap();
        function.push_child(block, if_instr).unwrap();
        let leave = function.create(K::Leave(container), vec![]).unwrap();
        function.push_child(block, leave).unwrap();

        let result = DefiniteAssignment::run(&function).unwrap();
        assert!(result.is_definitely_assigned(x));
    }

    #[test]
    fn test_try_finally_meet() {
        let mut function = ILFunction::new(None);
        let x = function.add_variable(VariableKind::Local, 0, None);

        let root = function.root();
        let outer_block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(root, outer_block).unwrap();

        // try { x = 1; leave } finally { }
        let try_container = function
            .create(K::BlockContainer(ContainerKind::Normal), vec![])
            .unwrap();
        let try_block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(try_container, try_block).unwrap();
        let one = function.create(K::LdcI4(1), vec![]).unwrap();
        let store = function.create(K::StLoc(x), vec![one]).unwrap();
        function.push_child(try_block, store).unwrap();
        let leave_try = function.create(K::Leave(try_container), vec![]).unwrap();
        function.push_child(try_block, leave_try).unwrap();

        let finally_container = function
            .create(K::BlockContainer(ContainerKind::Normal), vec![])
            .unwrap();
        let finally_block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(finally_container, finally_block).unwrap();
        let leave_finally = function
            .create(K::Leave(finally_container), vec![])
            .unwrap();
        function.push_child(finally_block, leave_finally).unwrap();

        let try_finally = function
            .create(K::TryFinally, vec![try_container, finally_container])
            .unwrap();
        function.push_child(outer_block, try_finally).unwrap();
        let leave_root = function.create(K::Leave(root), vec![]).unwrap();
        function.push_child(outer_block, leave_root).unwrap();

        function.check_invariants().unwrap();

        let result = DefiniteAssignment::run(&function).unwrap();
        assert!(!result.is_unreachable());
        assert!(result.is_definitely_assigned(x));
    }
}
