//! The dataflow state contract.
//!
//! Analyses plug a state type into the generic forward engine. The state
//! must form a join-semilattice of finite height: `join` computes a least
//! upper bound, `less_or_equal` is the semilattice order, and repeated joins
//! must reach a fixpoint. Analyses that participate in try-finally
//! recombination additionally provide `meet`.
//!
//! An "unreachable" state is the bottom element: it is `≤` everything, joins
//! as the identity, and meets to unreachable.

use std::fmt::Debug;

/// A join-semilattice state for the forward dataflow engine.
pub trait DataFlowState: Clone + Debug {
    /// The semilattice partial order.
    fn less_or_equal(&self, other: &Self) -> bool;

    /// Overwrites this state with a copy of `other`.
    fn replace_with(&mut self, other: &Self);

    /// Joins `incoming` into this state.
    ///
    /// Post-condition: `old_self ≤ self ∧ incoming ≤ self`.
    fn join(&mut self, incoming: &Self);

    /// Meets `incoming` into this state (greatest lower bound). Used at
    /// try-finally exits; meeting with an unreachable state must yield an
    /// unreachable state.
    fn meet(&mut self, incoming: &Self);

    /// `true` for the bottom element.
    fn is_unreachable(&self) -> bool;

    /// Turns this state into the bottom element.
    fn mark_unreachable(&mut self);
}
