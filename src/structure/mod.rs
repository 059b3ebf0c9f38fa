//! Control-flow structuring.
//!
//! Recovers structured constructs from the branch graph: if/else folding
//! ([`fold_conditions`]), natural-loop nesting ([`detect_loops`]), and
//! switch normalization ([`simplify_switches`]). Block reordering lives
//! with the IL model as [`crate::il::sort_blocks`]; the transform pipeline
//! wraps all of these as passes.

mod conditions;
mod loops;
mod switches;

pub use conditions::fold_conditions;
pub use loops::detect_loops;
pub use switches::simplify_switches;
