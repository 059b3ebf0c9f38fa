//! Generic forward dataflow analysis over the IL tree.
//!
//! The engine ([`DataFlowVisitor`]) carries a user state through the tree,
//! running a worklist fixpoint per block container and tracking exceptional
//! flow per try instruction. States implement [`DataFlowState`] (a
//! join-semilattice with an unreachable bottom); concrete analyses supply a
//! [`TransferFunction`] for instruction effects.
//!
//! [`DefiniteAssignment`] is the built-in client, used by tests and
//! available to consumers for state-machine recovery work.

mod definite_assignment;
mod state;
mod visitor;

pub use definite_assignment::{DefiniteAssignment, DefiniteAssignmentState};
pub use state::DataFlowState;
pub use visitor::{AnalysisOutcome, DataFlowVisitor, TransferFunction};
