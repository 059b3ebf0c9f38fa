//! Normalization passes: nop removal, branch simplification, dead-block
//! dropping, and stack-slot inlining.
//!
//! These run between the structural and idiom-recognition passes and are
//! idempotent on their own output, so the driver repeats them to fixpoint.
//! Stack-slot inlining is the enabling pass for every peephole recognizer:
//! the builder materializes each evaluation-stack push as a store into a
//! fresh slot, and this pass folds single-use slots back into expression
//! trees wherever evaluation order permits.

use crate::{
    il::{sort_blocks, ILFunction, InstrId, InstrKind, VariableKind},
    transforms::{context::TransformContext, IlTransform},
    Result,
};

/// Drops `nop` fillers that sit directly in blocks.
pub struct RemoveNops;

impl IlTransform for RemoveNops {
    fn name(&self) -> &'static str {
        "RemoveNops"
    }

    fn run(&self, function: &mut ILFunction, _ctx: &TransformContext) -> Result<bool> {
        let mut changed = false;
        for id in function.descendants(function.root()) {
            if function.is_dead(id) || !function.match_nop(id) {
                continue;
            }
            let Some(parent) = function.parent(id) else {
                continue;
            };
            if matches!(function.kind(parent), InstrKind::Block { .. }) {
                function.discard(id)?;
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Threads branches through trivial blocks: a branch to a block containing
/// only `leave C` becomes `leave C` directly, and double negations in
/// conditions are unwrapped.
pub struct SimplifyBranches;

impl IlTransform for SimplifyBranches {
    fn name(&self) -> &'static str {
        "SimplifyBranches"
    }

    fn run(&self, function: &mut ILFunction, _ctx: &TransformContext) -> Result<bool> {
        let mut changed = false;
        for id in function.descendants(function.root()) {
            if function.is_dead(id) {
                continue;
            }
            match *function.kind(id) {
                InstrKind::Branch(target) => {
                    // br T where T: [leave C]  =>  leave C
                    let children = function.children(target);
                    if children.len() == 1 {
                        let only = children[0];
                        if let InstrKind::Leave(container) = *function.kind(only) {
                            if function.children(only).is_empty() {
                                function.replace_kind(id, InstrKind::Leave(container));
                                changed = true;
                            }
                        }
                    }
                }
                InstrKind::LogicNot => {
                    // logic.not(logic.not(x)) => x
                    let inner = function.child(id, 0);
                    if let Some(argument) = function.match_logic_not(inner) {
                        let kept = function.detach_child(inner, 0)?;
                        debug_assert_eq!(kept, argument);
                        function.replace(id, kept)?;
                        function.discard(id)?;
                        changed = true;
                    }
                }
                _ => {}
            }
        }
        Ok(changed)
    }
}

/// Reorders every container in reverse postorder and drops unreachable
/// blocks.
pub struct BlockSorting;

impl IlTransform for BlockSorting {
    fn name(&self) -> &'static str {
        "BlockSorting"
    }

    fn run(&self, function: &mut ILFunction, _ctx: &TransformContext) -> Result<bool> {
        let containers: Vec<InstrId> = function
            .descendants_and_self(function.root())
            .into_iter()
            .filter(|&id| {
                !function.is_dead(id)
                    && matches!(function.kind(id), InstrKind::BlockContainer(_))
            })
            .collect();
        let mut changed = false;
        for container in containers {
            if function.is_dead(container) {
                continue;
            }
            let before: Vec<InstrId> = function.children(container).to_vec();
            sort_blocks(function, container, true)?;
            changed |= function.children(container) != before.as_slice();
        }
        Ok(changed)
    }
}

/// Inlines single-definition, single-use stack slots into their use site,
/// and drops dead stores to stack slots whose value is pure.
pub struct InlineStackSlots;

impl IlTransform for InlineStackSlots {
    fn name(&self) -> &'static str {
        "InlineStackSlots"
    }

    fn run(&self, function: &mut ILFunction, ctx: &TransformContext) -> Result<bool> {
        let mut changed = false;
        loop {
            let mut round = false;
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
                ctx.check_cancelled()?;
                round |= inline_in_block(function, block)?;
            }
            if !round {
                break;
            }
            changed = true;
        }
        Ok(changed)
    }
}

fn inline_in_block(function: &mut ILFunction, block: InstrId) -> Result<bool> {
    let mut changed = false;
    // Last-to-first, so a chain of pushes collapses bottom-up and each
    // inlined slot exposes the next one as the first evaluated operand.
    let mut index = function.children(block).len();
    while index > 0 {
        index -= 1;
        if index >= function.children(block).len() {
            continue;
        }
        let store = function.child(block, index);
        let Some((var, value)) = function.match_stloc(store) else {
            continue;
        };
        let variable = function.variable(var);
        if variable.kind() != VariableKind::StackSlot || !variable.is_single_definition() {
            continue;
        }
        if variable.address_count() > 0 {
            continue;
        }

        if variable.load_count() == 0 {
            // Dead push: safe to drop when evaluating the value again has no
            // observable effect.
            if function.flags(value).is_pure() {
                function.discard(store)?;
                changed = true;
            }
            continue;
        }
        if variable.load_count() != 1 {
            continue;
        }

        let Some(next) = function.children(block).get(index + 1).copied() else {
            continue;
        };
        let Some(load) = find_single_load(function, next, var) else {
            continue;
        };
        if !may_inline_at(function, next, load, value) {
            continue;
        }

        let value = function.detach_child(store, 0)?;
        function.discard(store)?;
        function.replace(load, value)?;
        function.discard(load)?;
        changed = true;
    }
    Ok(changed)
}

/// Finds the unique `ldloc var` within the subtree of `site`, if present.
fn find_single_load(function: &ILFunction, site: InstrId, var: crate::il::VarId) -> Option<InstrId> {
    function
        .descendants_and_self(site)
        .into_iter()
        .find(|&id| function.match_ldloc_var(id, var))
}

/// Evaluation-order safety: the value may move to the load's position iff
/// everything evaluated before the load inside `site` is pure, and - when
/// the value itself has effects - the load is the first thing evaluated.
fn may_inline_at(
    function: &ILFunction,
    site: InstrId,
    load: InstrId,
    value: InstrId,
) -> bool {
    let value_flags = function.flags(value);
    if !value_flags.is_pure() {
        // The load must be on the leftmost evaluation path.
        let mut current = site;
        loop {
            if current == load {
                return true;
            }
            match function.children(current).first() {
                Some(&first) => current = first,
                None => return false,
            }
        }
    }

    // Pure value: no node evaluated before the load may have side effects
    // (a pure value commutes with pure reads).
    for id in function.descendants_and_self(site) {
        if id == load {
            return true;
        }
        // Ancestors of the load evaluate after their children; skip them.
        if function.descendants_and_self(id).contains(&load) {
            continue;
        }
        if !function.flags(id).is_pure() {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::InstrKind as K;
    use crate::settings::DecompilerSettings;

    fn ctx() -> TransformContext {
        TransformContext::new(DecompilerSettings::default())
    }

    #[test]
    fn test_inline_chain_collapses() {
        // S0 = ldc 1; S1 = ldc 2; pop-style use: stloc v(add(ld S0, ld S1))
        let mut function = ILFunction::new(None);
        let root = function.root();
        let block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(root, block).unwrap();

        let s0 = function.add_variable(VariableKind::StackSlot, 0, None);
        let s1 = function.add_variable(VariableKind::StackSlot, 1, None);
        let v = function.add_variable(VariableKind::Local, 0, None);

        let one = function.create(K::LdcI4(1), vec![]).unwrap();
        let store0 = function.create(K::StLoc(s0), vec![one]).unwrap();
        function.push_child(block, store0).unwrap();
        let two = function.create(K::LdcI4(2), vec![]).unwrap();
        let store1 = function.create(K::StLoc(s1), vec![two]).unwrap();
        function.push_child(block, store1).unwrap();

        let load0 = function.create(K::LdLoc(s0), vec![]).unwrap();
        let load1 = function.create(K::LdLoc(s1), vec![]).unwrap();
        let add = function
            .create(
                K::BinaryOp(crate::il::BinaryOperator::Add),
                vec![load0, load1],
            )
            .unwrap();
        let store_v = function.create(K::StLoc(v), vec![add]).unwrap();
        function.push_child(block, store_v).unwrap();
        let leave = function.create(K::Leave(root), vec![]).unwrap();
        function.push_child(block, leave).unwrap();

        assert!(InlineStackSlots.run(&mut function, &ctx()).unwrap());
        function.check_invariants().unwrap();

        // Both slots folded into the add.
        assert_eq!(function.children(block).len(), 2);
        let folded = function.child(block, 0);
        let (_, value) = function.match_stloc(folded).unwrap();
        assert!(matches!(function.kind(value), K::BinaryOp(_)));
        assert_eq!(function.match_ldc_i4(function.child(value, 0)), Some(1));
        assert_eq!(function.match_ldc_i4(function.child(value, 1)), Some(2));
        assert_eq!(function.variable(s0).load_count(), 0);
        assert_eq!(function.variable(s0).store_count(), 0);
    }

    #[test]
    fn test_impure_value_not_moved_past_reads() {
        // S0 = stsfld-like effect; the load is not first-evaluated: no inline.
        let mut function = ILFunction::new(None);
        let root = function.root();
        let block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(root, block).unwrap();

        let s0 = function.add_variable(VariableKind::StackSlot, 0, None);
        let x = function.add_variable(VariableKind::Local, 0, None);
        let v = function.add_variable(VariableKind::Local, 1, None);

        // S0 = (x = 7)  -- impure value (a store expression stand-in: we use
        // a division, which may throw)
        let lhs = function.create(K::LdLoc(x), vec![]).unwrap();
        let zero = function.create(K::LdcI4(0), vec![]).unwrap();
        let div = function
            .create(K::BinaryOp(crate::il::BinaryOperator::Div), vec![lhs, zero])
            .unwrap();
        let store0 = function.create(K::StLoc(s0), vec![div]).unwrap();
        function.push_child(block, store0).unwrap();

        // use: stloc v(add(ld x, ld S0)) -- ld S0 is evaluated second
        let first = function.create(K::LdLoc(x), vec![]).unwrap();
        let second = function.create(K::LdLoc(s0), vec![]).unwrap();
        let add = function
            .create(K::BinaryOp(crate::il::BinaryOperator::Add), vec![first, second])
            .unwrap();
        let store_v = function.create(K::StLoc(v), vec![add]).unwrap();
        function.push_child(block, store_v).unwrap();
        let leave = function.create(K::Leave(root), vec![]).unwrap();
        function.push_child(block, leave).unwrap();

        // The may-throw value must not move past the ld x read.
        assert!(!InlineStackSlots.run(&mut function, &ctx()).unwrap());
        function.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_nops() {
        let mut function = ILFunction::new(None);
        let root = function.root();
        let block = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(root, block).unwrap();
        let nop = function.create(K::Nop, vec![]).unwrap();
        function.push_child(block, nop).unwrap();
        let leave = function.create(K::Leave(root), vec![]).unwrap();
        function.push_child(block, leave).unwrap();

        assert!(RemoveNops.run(&mut function, &ctx()).unwrap());
        assert_eq!(function.children(block).len(), 1);
        function.check_invariants().unwrap();
    }

    #[test]
    fn test_branch_to_leave_threads() {
        let mut function = ILFunction::new(None);
        let root = function.root();
        let entry = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let trailer = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(root, entry).unwrap();
        function.push_child(root, trailer).unwrap();

        let branch = function.create(K::Branch(trailer), vec![]).unwrap();
        function.push_child(entry, branch).unwrap();
        let leave = function.create(K::Leave(root), vec![]).unwrap();
        function.push_child(trailer, leave).unwrap();

        assert!(SimplifyBranches.run(&mut function, &ctx()).unwrap());
        assert!(function.match_leave(branch, root).is_some());

        // The trailer is now unreachable and gets dropped by sorting.
        assert!(BlockSorting.run(&mut function, &ctx()).unwrap());
        assert_eq!(function.children(root), &[entry]);
        function.check_invariants().unwrap();
    }
}
