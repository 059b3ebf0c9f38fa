//! Instruction flow flags.
//!
//! Every instruction carries a bitmask describing its control-flow and
//! side-effect behavior. Flags are the monotone union of the children's flags
//! plus the instruction's own intrinsic flags, with per-kind carve-outs for
//! the composite control-flow instructions (computed in the tree model, which
//! caches the result per node and invalidates ancestors on mutation).

use bitflags::bitflags;

bitflags! {
    /// Behavior bits of an instruction, derived bottom-up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InstructionFlags: u8 {
        /// The instruction participates in control flow (branches, leaves,
        /// blocks, structured statements).
        const CONTROL_FLOW = 1 << 0;
        /// Execution may transfer to another block.
        const MAY_BRANCH = 1 << 1;
        /// Execution may raise an exception.
        const MAY_THROW = 1 << 2;
        /// Execution never falls through past this instruction.
        const END_POINT_UNREACHABLE = 1 << 3;
        /// The instruction writes memory or otherwise has observable effects.
        const SIDE_EFFECTS = 1 << 4;
        /// Evaluation may short-circuit to null when a null-conditional
        /// target unwraps to null.
        const MAY_UNWRAP_NULL = 1 << 5;
    }
}

impl InstructionFlags {
    /// `true` when evaluation can neither throw nor write.
    #[must_use]
    pub fn is_pure(&self) -> bool {
        !self.intersects(Self::MAY_THROW | Self::SIDE_EFFECTS | Self::MAY_BRANCH)
    }
}
