//! If/else recovery and block folding.
//!
//! The builder leaves every conditional as `if (cond) br X; br Y` at the end
//! of a block. This module folds single-entry branch targets into the `if`
//! arms (inverting the condition when only the fallthrough side is
//! foldable), and merges straight-line `br`-to-single-entry-block chains.
//! Repeated folding reduces the block count until only genuine join points
//! remain as blocks.

use crate::{
    il::{ILFunction, InstrId, InstrKind},
    Result,
};

/// Folds conditions and merges blocks across the whole function until no
/// more folding applies. Returns `true` when anything changed.
///
/// # Errors
///
/// Propagates `InvariantViolation` from the mutation API.
pub fn fold_conditions(function: &mut ILFunction) -> Result<bool> {
    let mut changed = false;
    loop {
        let mut round_changed = false;
        let containers: Vec<InstrId> = function
            .descendants_and_self(function.root())
            .into_iter()
            .filter(|&id| {
                !function.is_dead(id)
                    && matches!(function.kind(id), InstrKind::BlockContainer(_))
            })
            .collect();
        for container in containers {
            if function.is_dead(container) {
                continue;
            }
            round_changed |= fold_in_container(function, container)?;
        }
        if !round_changed {
            break;
        }
        changed = true;
    }
    Ok(changed)
}

fn fold_in_container(function: &mut ILFunction, container: InstrId) -> Result<bool> {
    let mut changed = false;
    for block in blocks_at_level(function, container) {
        if function.is_dead(block) {
            continue;
        }
        while try_fold_block(function, container, block)? {
            changed = true;
        }
    }
    Ok(changed)
}

/// All `Block` nodes whose branch targets resolve against `container`:
/// the container's direct children plus blocks folded into `if` arms, but
/// not blocks belonging to nested containers.
fn blocks_at_level(function: &ILFunction, container: InstrId) -> Vec<InstrId> {
    let mut result = Vec::new();
    let mut stack: Vec<InstrId> = function.children(container).to_vec();
    while let Some(id) = stack.pop() {
        match function.kind(id) {
            InstrKind::BlockContainer(_) => {} // inner level, not ours
            InstrKind::Block { .. } => {
                result.push(id);
                stack.extend(function.children(id));
            }
            _ => stack.extend(function.children(id)),
        }
    }
    result
}

/// `true` when `target` can be folded into the place of the single branch
/// pointing at it.
fn inlinable(
    function: &ILFunction,
    container: InstrId,
    block: InstrId,
    target: InstrId,
) -> bool {
    if target == block || function.parent(target) != Some(container) {
        return false;
    }
    if Some(target) == function.children(container).first().copied() {
        return false; // the entry point stays in place
    }
    matches!(
        function.kind(target),
        InstrKind::Block {
            incoming_edge_count: 1,
        }
    )
}

fn try_fold_block(
    function: &mut ILFunction,
    container: InstrId,
    block: InstrId,
) -> Result<bool> {
    if try_fold_if(function, container, block)? {
        return Ok(true);
    }
    try_merge_chain(function, container, block)
}

/// Folds `if (cond) br X; br Y` endings.
fn try_fold_if(
    function: &mut ILFunction,
    container: InstrId,
    block: InstrId,
) -> Result<bool> {
    let count = function.children(block).len();
    if count < 2 {
        return Ok(false);
    }
    let if_instr = function.child(block, count - 2);
    let trailing = function.child(block, count - 1);

    let Some((_, then_branch)) = function.match_if_instruction(if_instr) else {
        return Ok(false);
    };
    let Some(then_target) = function.match_branch(then_branch) else {
        return Ok(false);
    };
    let Some(fall_target) = function.match_branch(trailing) else {
        return Ok(false);
    };
    if then_target == fall_target {
        return Ok(false);
    }

    let then_foldable = inlinable(function, container, block, then_target);
    let fall_foldable = inlinable(function, container, block, fall_target);
    if !then_foldable && !fall_foldable {
        return Ok(false);
    }

    if !then_foldable {
        // Only the fallthrough side folds: invert the condition and swap
        // the targets so the foldable block sits on the then side.
        let condition = function.detach_child(if_instr, 0)?;
        let negated = function.create(InstrKind::LogicNot, vec![condition])?;
        function.insert_child(if_instr, 0, negated)?;
        function.set_branch_target(then_branch, fall_target)?;
        function.set_branch_target(trailing, then_target)?;
    }
    let (into_then, into_else) = if then_foldable {
        (then_target, fall_target)
    } else {
        (fall_target, then_target)
    };

    // Fold the then side.
    let moved = function.detach(into_then)?;
    let old_then = function.detach_child(if_instr, 1)?;
    function.discard(old_then)?;
    function.insert_child(if_instr, 1, moved)?;

    // If the other side is (now the only branch into) a single-entry block,
    // fold it into the else slot and drop the trailing branch.
    if inlinable(function, container, block, into_else) {
        let moved_else = function.detach(into_else)?;
        let old_else = function.detach_child(if_instr, 2)?;
        function.discard(old_else)?;
        function.insert_child(if_instr, 2, moved_else)?;

        let trailing_branch = function.detach_child(block, function.children(block).len() - 1)?;
        function.discard(trailing_branch)?;
    }
    Ok(true)
}

/// Merges `...; br Z` with a single-entry `Z` into one block.
fn try_merge_chain(
    function: &mut ILFunction,
    container: InstrId,
    block: InstrId,
) -> Result<bool> {
    let count = function.children(block).len();
    if count == 0 {
        return Ok(false);
    }
    let trailing = function.child(block, count - 1);
    let Some(target) = function.match_branch(trailing) else {
        return Ok(false);
    };
    if !inlinable(function, container, block, target) {
        return Ok(false);
    }

    let branch = function.detach_child(block, count - 1)?;
    function.discard(branch)?;
    let merged = function.detach(target)?;
    while !function.children(merged).is_empty() {
        let instr = function.detach_child(merged, 0)?;
        function.push_child(block, instr)?;
    }
    function.discard(merged)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{InstrKind as K, VariableKind};

    /// entry: if (p) br A; br B -- A: ret -- B: ret
    #[test]
    fn test_if_else_recovery() {
        let mut function = ILFunction::new(None);
        let p = function.add_variable(VariableKind::Parameter, 0, None);
        let root = function.root();

        let entry = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let block_a = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let block_b = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        for block in [entry, block_a, block_b] {
            function.push_child(root, block).unwrap();
        }

        let cond = function.create(K::LdLoc(p), vec![]).unwrap();
        let to_a = function.create(K::Branch(block_a), vec![]).unwrap();
        let nop = function.create(K::Nop, vec![]).unwrap();
        let if_instr = function
            .create(K::IfInstruction, vec![cond, to_a, nop])
            .unwrap();
        function.push_child(entry, if_instr).unwrap();
        let to_b = function.create(K::Branch(block_b), vec![]).unwrap();
        function.push_child(entry, to_b).unwrap();

        for block in [block_a, block_b] {
            let ret = function.create(K::Return, vec![]).unwrap();
            function.push_child(block, ret).unwrap();
        }

        assert!(fold_conditions(&mut function).unwrap());

        // Both arms folded into the if; entry now ends with the if.
        assert_eq!(function.children(entry).len(), 1);
        assert_eq!(function.child(if_instr, 1), block_a);
        assert_eq!(function.child(if_instr, 2), block_b);

        crate::il::sort_blocks(&mut function, root, true).unwrap();
        assert_eq!(function.children(root), &[entry]);
        function.check_invariants().unwrap();
    }

    /// entry: br A -- A: br B -- B: ret   collapses into one block.
    #[test]
    fn test_chain_merging() {
        let mut function = ILFunction::new(None);
        let root = function.root();
        let entry = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let block_a = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let block_b = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        for block in [entry, block_a, block_b] {
            function.push_child(root, block).unwrap();
        }
        let to_a = function.create(K::Branch(block_a), vec![]).unwrap();
        function.push_child(entry, to_a).unwrap();
        let to_b = function.create(K::Branch(block_b), vec![]).unwrap();
        function.push_child(block_a, to_b).unwrap();
        let ret = function.create(K::Return, vec![]).unwrap();
        function.push_child(block_b, ret).unwrap();

        assert!(fold_conditions(&mut function).unwrap());
        crate::il::sort_blocks(&mut function, root, true).unwrap();

        assert_eq!(function.children(root).len(), 1);
        let only = function.children(root)[0];
        assert_eq!(function.children(only).len(), 1);
        assert!(matches!(
            function.kind(function.child(only, 0)),
            K::Return
        ));
        function.check_invariants().unwrap();
    }

    /// A join point (two branches into the same block) must not be folded.
    #[test]
    fn test_join_point_stays() {
        let mut function = ILFunction::new(None);
        let p = function.add_variable(VariableKind::Parameter, 0, None);
        let root = function.root();
        let entry = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let block_a = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let join = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        for block in [entry, block_a, join] {
            function.push_child(root, block).unwrap();
        }

        let cond = function.create(K::LdLoc(p), vec![]).unwrap();
        let to_a = function.create(K::Branch(block_a), vec![]).unwrap();
        let nop = function.create(K::Nop, vec![]).unwrap();
        let if_instr = function
            .create(K::IfInstruction, vec![cond, to_a, nop])
            .unwrap();
        function.push_child(entry, if_instr).unwrap();
        let to_join = function.create(K::Branch(join), vec![]).unwrap();
        function.push_child(entry, to_join).unwrap();

        let a_to_join = function.create(K::Branch(join), vec![]).unwrap();
        function.push_child(block_a, a_to_join).unwrap();
        let ret = function.create(K::Return, vec![]).unwrap();
        function.push_child(join, ret).unwrap();

        fold_conditions(&mut function).unwrap();
        // block_a folds into the if arm, but join has two incoming edges and
        // must survive as a container child.
        assert!(function.children(root).contains(&join));
        function.check_invariants().unwrap();
    }
}
