//! Null-coalescing and null-propagation recovery.
//!
//! After condition folding, `x ?? y` sits in a single block as a pair of
//! stores feeding an if/else over the same temporary, and `x?.M()` is an
//! if/else whose arms store the access result or null into one variable.
//! Both recognizers collapse the diamond into an expression node and drop
//! the control flow.

use crate::{
    il::{ILFunction, InstrId, InstrKind, VarId, VariableKind},
    transforms::{context::TransformContext, IlTransform},
    Result,
};

/// Recovers `??` and `?.`. Gated by the `NullPropagation` setting.
pub struct NullabilityTransforms;

impl IlTransform for NullabilityTransforms {
    fn name(&self) -> &'static str {
        "NullabilityTransforms"
    }

    fn run(&self, function: &mut ILFunction, ctx: &TransformContext) -> Result<bool> {
        if !ctx.settings.null_propagation {
            return Ok(false);
        }
        let mut changed = false;
        let blocks: Vec<InstrId> = function
            .descendants_and_self(function.root())
            .into_iter()
            .filter(|&id| {
                !function.is_dead(id) && matches!(function.kind(id), InstrKind::Block { .. })
            })
            .collect();
        for block in blocks {
            if function.is_dead(block) {
                continue;
            }
            ctx.set_current_block(function.child_index(block));
            let mut index = function.children(block).len();
            while index > 0 {
                index -= 1;
                if index >= function.children(block).len() {
                    continue;
                }
                changed |= try_null_coalescing(function, block, index)?
                    || try_null_propagation(function, block, index)?;
            }
        }
        Ok(changed)
    }
}

/// ```text
/// stloc a(x); stloc r(ldloc a);
/// if (ldloc a) { br end } else { stloc r(y); br end }
/// ```
/// becomes `stloc r(x ?? y); br end`.
fn try_null_coalescing(function: &mut ILFunction, block: InstrId, index: usize) -> Result<bool> {
    let children = function.children(block);
    if index + 2 >= children.len() {
        return Ok(false);
    }
    let store_a = children[index];
    let store_r = children[index + 1];
    let if_instr = children[index + 2];

    let Some((a, _)) = function.match_stloc(store_a) else {
        return Ok(false);
    };
    if function.variable(a).kind() != VariableKind::StackSlot {
        return Ok(false);
    }
    let Some((r, r_value)) = function.match_stloc(store_r) else {
        return Ok(false);
    };
    if !function.match_ldloc_var(r_value, a) {
        return Ok(false);
    }

    let InstrKind::IfInstruction = function.kind(if_instr) else {
        return Ok(false);
    };
    let condition = function.child(if_instr, 0);
    if !function.match_ldloc_var(condition, a) {
        return Ok(false);
    }
    let then_arm = function.child(if_instr, 1);
    let else_arm = function.child(if_instr, 2);

    let Some(end_then) = arm_branch_target(function, then_arm) else {
        return Ok(false);
    };
    // else: Block[stloc r(y), br end]
    if !matches!(function.kind(else_arm), InstrKind::Block { .. }) {
        return Ok(false);
    }
    let else_instrs = function.children(else_arm);
    let [fallback_store, else_branch] = else_instrs else {
        return Ok(false);
    };
    let (fallback_store, else_branch) = (*fallback_store, *else_branch);
    let Some((r_again, _)) = function.match_stloc(fallback_store) else {
        return Ok(false);
    };
    if r_again != r || function.match_branch(else_branch) != Some(end_then) {
        return Ok(false);
    }

    // The temporary must be exactly the diamond's plumbing.
    let a_var = function.variable(a);
    if !(a_var.is_single_definition() && a_var.load_count() == 2 && a_var.address_count() == 0) {
        return Ok(false);
    }
    if function.variable(r).store_count() != 2 {
        return Ok(false);
    }

    // Rewrite.
    let value = function.detach_child(store_a, 0)?;
    let fallback = function.detach_child(fallback_store, 0)?;
    let coalesce = function.create(InstrKind::NullCoalescing, vec![value, fallback])?;
    let old_r_value = function.detach_child(store_r, 0)?;
    function.discard(old_r_value)?;
    function.insert_child(store_r, 0, coalesce)?;

    let end = end_then;
    let branch = function.create(InstrKind::Branch(end), vec![])?;
    function.replace(if_instr, branch)?;
    function.discard(if_instr)?;
    function.discard(store_a)?;
    Ok(true)
}

/// ```text
/// if (ldloc v) { stloc r(ACCESS(ldloc v)); br end }
/// else        { stloc r(ldnull); br end }
/// ```
/// becomes `stloc r(v?.ACCESS); br end`.
fn try_null_propagation(function: &mut ILFunction, block: InstrId, index: usize) -> Result<bool> {
    let children = function.children(block);
    if index >= children.len() {
        return Ok(false);
    }
    let if_instr = children[index];
    let InstrKind::IfInstruction = function.kind(if_instr) else {
        return Ok(false);
    };
    let condition = function.child(if_instr, 0);
    let Some(v) = function.match_ldloc(condition) else {
        return Ok(false);
    };
    let then_arm = function.child(if_instr, 1);
    let else_arm = function.child(if_instr, 2);

    let Some((access_store, then_end)) = arm_store_and_branch(function, then_arm) else {
        return Ok(false);
    };
    let Some((null_store, else_end)) = arm_store_and_branch(function, else_arm) else {
        return Ok(false);
    };
    if then_end != else_end {
        return Ok(false);
    }

    let Some((r_then, access)) = function.match_stloc(access_store) else {
        return Ok(false);
    };
    let Some((r_else, null_value)) = function.match_stloc(null_store) else {
        return Ok(false);
    };
    if r_then != r_else || !function.match_ldnull(null_value) {
        return Ok(false);
    }

    // The access must dereference exactly the tested variable as its
    // first-evaluated operand.
    if first_evaluated_load(function, access, v).is_none() {
        return Ok(false);
    }
    match function.kind(access) {
        InstrKind::Call(_)
        | InstrKind::CallVirt(_)
        | InstrKind::LdFld(_)
        | InstrKind::UnboxAny(_) => {}
        _ => return Ok(false),
    }

    // Rewrite: the access subtree (with its own load of the variable) moves
    // under a null-conditional whose first child is the tested target.
    let access = function.detach_child(access_store, 0)?;
    let target = function.create(InstrKind::LdLoc(v), vec![])?;
    let conditional = function.create(InstrKind::NullConditional, vec![target, access])?;

    let store_value = function.create(InstrKind::StLoc(r_then), vec![conditional])?;
    let branch = function.create(InstrKind::Branch(then_end), vec![])?;
    function.replace(if_instr, branch)?;
    function.insert_child(block, index, store_value)?;
    function.discard(if_instr)?;
    Ok(true)
}

/// `Block[br end]` or a bare `br end`.
fn arm_branch_target(function: &ILFunction, arm: InstrId) -> Option<InstrId> {
    if let Some(target) = function.match_branch(arm) {
        return Some(target);
    }
    if matches!(function.kind(arm), InstrKind::Block { .. }) {
        let instrs = function.children(arm);
        if let [only] = instrs {
            return function.match_branch(*only);
        }
    }
    None
}

/// `Block[stloc .., br end]` - binds the store and the branch target.
fn arm_store_and_branch(function: &ILFunction, arm: InstrId) -> Option<(InstrId, InstrId)> {
    if !matches!(function.kind(arm), InstrKind::Block { .. }) {
        return None;
    }
    let instrs = function.children(arm);
    let [store, branch] = instrs else {
        return None;
    };
    let target = function.match_branch(*branch)?;
    function.match_stloc(*store)?;
    Some((*store, target))
}

/// The `ldloc v` sitting on the access' leftmost evaluation path.
fn first_evaluated_load(function: &ILFunction, access: InstrId, v: VarId) -> Option<InstrId> {
    let mut current = access;
    loop {
        if function.match_ldloc_var(current, v) {
            return Some(current);
        }
        current = *function.children(current).first()?;
    }
}
