//! Natural-loop detection and loop nesting.
//!
//! Back edges are found through the dominator tree of a container's branch
//! graph: an edge `latch -> header` where the header dominates the latch.
//! The loop body (the natural loop of all back edges to that header) moves
//! into a fresh `BlockContainer` of kind `Loop`; branches out of the body
//! become `leave`, and a wrapper block standing at the header's old position
//! continues to the loop's follow block. Multi-exit loops are first widened
//! to every block the header dominates; bodies that still have several
//! distinct exits stay unstructured.

use rustc_hash::FxHashSet;

use crate::{
    il::{container_graph, ILFunction, InstrId, InstrKind},
    il::ContainerKind,
    utils::Dominators,
    Result,
};

/// Detects and nests loops in every container of the function. Returns
/// `true` when at least one loop was built.
///
/// # Errors
///
/// Propagates `InvariantViolation` from the mutation API.
pub fn detect_loops(function: &mut ILFunction) -> Result<bool> {
    let mut changed = false;
    let mut queue: Vec<InstrId> = function
        .descendants_and_self(function.root())
        .into_iter()
        .filter(|&id| {
            !function.is_dead(id) && matches!(function.kind(id), InstrKind::BlockContainer(_))
        })
        .collect();

    while let Some(container) = queue.pop() {
        if function.is_dead(container) {
            continue;
        }
        let mut failed_headers: FxHashSet<InstrId> = FxHashSet::default();
        while let Some(new_loop) = detect_one_loop(function, container, &mut failed_headers)? {
            changed = true;
            queue.push(new_loop);
        }
    }
    Ok(changed)
}

/// Builds at most one loop in `container`, returning the new loop container.
fn detect_one_loop(
    function: &mut ILFunction,
    container: InstrId,
    failed_headers: &mut FxHashSet<InstrId>,
) -> Result<Option<InstrId>> {
    let blocks: Vec<InstrId> = function.children(container).to_vec();
    if blocks.len() < 2 {
        return Ok(None);
    }
    let graph = container_graph(function, container);
    let dominators = Dominators::compute(&graph, 0);
    let rpo = graph.reverse_postorder(0);
    let rpo_position = |index: usize| rpo.iter().position(|&node| node == index);

    // The entry of a loop container is that loop's own header; its back
    // edges are the loop repeating, not a nested loop.
    let own_header_index = match function.kind(container) {
        InstrKind::BlockContainer(ContainerKind::Loop) => Some(0),
        _ => None,
    };

    // Back edges, grouped by header; pick the innermost (deepest in RPO)
    // header that has not already failed.
    let mut header: Option<usize> = None;
    for latch in 0..blocks.len() {
        for &successor in graph.successors(latch) {
            if Some(successor) == own_header_index
                || failed_headers.contains(&blocks[successor])
                || !dominators.dominates(successor, latch)
            {
                continue;
            }
            match (header.and_then(&rpo_position), rpo_position(successor)) {
                (None, Some(_)) => header = Some(successor),
                (Some(current), Some(candidate)) if candidate > current => {
                    header = Some(successor);
                }
                _ => {}
            }
        }
    }
    let Some(header_index) = header else {
        return Ok(None);
    };

    // Natural loop body: header plus everything that reaches a latch
    // without passing through the header.
    let mut body: FxHashSet<usize> = FxHashSet::default();
    body.insert(header_index);
    let mut stack: Vec<usize> = (0..blocks.len())
        .filter(|&latch| {
            graph.successors(latch).contains(&header_index)
                && dominators.dominates(header_index, latch)
        })
        .collect();
    while let Some(node) = stack.pop() {
        if body.insert(node) {
            stack.extend(graph.predecessors(node).iter().copied());
        }
    }

    let exit_targets = |body: &FxHashSet<usize>| -> Vec<usize> {
        let mut exits = Vec::new();
        for &member in body {
            for &successor in graph.successors(member) {
                if !body.contains(&successor) && !exits.contains(&successor) {
                    exits.push(successor);
                }
            }
        }
        exits
    };

    let mut exits = exit_targets(&body);
    if exits.len() > 1 {
        // Widen to the full dominance region of the header; side branches
        // often belong inside the loop (break-heavy bodies).
        for index in 0..blocks.len() {
            if dominators.dominates(header_index, index) {
                body.insert(index);
            }
        }
        exits = exit_targets(&body);
    }
    if exits.len() > 1 {
        failed_headers.insert(blocks[header_index]);
        return Ok(None);
    }
    let follow = exits.first().map(|&index| blocks[index]);

    // Move the body into a fresh loop container, header first.
    let header_block = blocks[header_index];
    let header_position = function
        .children(container)
        .iter()
        .position(|&block| block == header_block)
        .ok_or_else(|| invariant_error!("loop header vanished from its container"))?;

    let loop_container = function.create(
        InstrKind::BlockContainer(ContainerKind::Loop),
        vec![],
    )?;
    let mut members_in_order: Vec<InstrId> = vec![header_block];
    for (index, &block) in blocks.iter().enumerate() {
        if index != header_index && body.contains(&index) {
            members_in_order.push(block);
        }
    }
    for &block in &members_in_order {
        let detached = function.detach(block)?;
        function.push_child(loop_container, detached)?;
    }

    // Branches out of the moved body become leaves of the loop container.
    let members: FxHashSet<InstrId> = members_in_order.iter().copied().collect();
    for descendant in function.descendants(loop_container) {
        if function.is_dead(descendant) {
            continue;
        }
        if let InstrKind::Branch(target) = *function.kind(descendant) {
            let owner = function.ancestor_matching(descendant, |kind| {
                matches!(kind, InstrKind::BlockContainer(_))
            });
            if owner == Some(loop_container) && !members.contains(&target) {
                function.replace_kind(descendant, InstrKind::Leave(loop_container));
            }
        }
    }

    // Wrapper block standing where the header used to be.
    let wrapper = function.create(
        InstrKind::Block {
            incoming_edge_count: 0,
        },
        vec![loop_container],
    )?;
    if let Some(follow_block) = follow {
        let branch = function.create(InstrKind::Branch(follow_block), vec![])?;
        function.push_child(wrapper, branch)?;
    }
    let insert_at = header_position.min(function.children(container).len());
    function.insert_child(container, insert_at, wrapper)?;

    // Entering branches now target the wrapper.
    let inside: FxHashSet<InstrId> = function
        .descendants_and_self(loop_container)
        .into_iter()
        .collect();
    for id in function.descendants(function.root()) {
        if function.is_dead(id) || inside.contains(&id) {
            continue;
        }
        if let InstrKind::Branch(target) = *function.kind(id) {
            if target == header_block {
                function.set_branch_target(id, wrapper)?;
            }
        }
    }

    Ok(Some(loop_container))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{InstrKind as K, VariableKind};

    /// entry -> header; header: if (p) br body; br exit
    /// body: br header (back edge); exit: leave
    #[test]
    fn test_simple_while_loop() {
        let mut function = ILFunction::new(None);
        let p = function.add_variable(VariableKind::Parameter, 0, None);
        let root = function.root();

        let entry = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let header = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let body = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let exit = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        for block in [entry, header, body, exit] {
            function.push_child(root, block).unwrap();
        }

        let to_header = function.create(K::Branch(header), vec![]).unwrap();
        function.push_child(entry, to_header).unwrap();

        let cond = function.create(K::LdLoc(p), vec![]).unwrap();
        let to_body = function.create(K::Branch(body), vec![]).unwrap();
        let nop = function.create(K::Nop, vec![]).unwrap();
        let if_instr = function
            .create(K::IfInstruction, vec![cond, to_body, nop])
            .unwrap();
        function.push_child(header, if_instr).unwrap();
        let to_exit = function.create(K::Branch(exit), vec![]).unwrap();
        function.push_child(header, to_exit).unwrap();

        let back = function.create(K::Branch(header), vec![]).unwrap();
        function.push_child(body, back).unwrap();

        let leave = function.create(K::Leave(root), vec![]).unwrap();
        function.push_child(exit, leave).unwrap();

        assert!(detect_loops(&mut function).unwrap());
        function.check_invariants().unwrap();

        // The header and body moved into a loop container; a wrapper block
        // continues to the exit block.
        let wrapper = function.children(root)[1];
        let loop_container = function.child(wrapper, 0);
        assert!(matches!(
            function.kind(loop_container),
            K::BlockContainer(ContainerKind::Loop)
        ));
        assert_eq!(function.children(loop_container), &[header, body]);
        // The header's exit branch became a leave of the loop container.
        let header_exit = *function.children(header).last().unwrap();
        assert!(function.match_leave(header_exit, loop_container).is_some());
        // The back edge survived as a branch to the header.
        let body_back = *function.children(body).last().unwrap();
        assert_eq!(function.match_branch(body_back), Some(header));
    }

    #[test]
    fn test_no_loop_no_change() {
        let mut function = ILFunction::new(None);
        let root = function.root();
        let entry = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        let next = function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        function.push_child(root, entry).unwrap();
        function.push_child(root, next).unwrap();
        let branch = function.create(K::Branch(next), vec![]).unwrap();
        function.push_child(entry, branch).unwrap();
        let ret = function.create(K::Return, vec![]).unwrap();
        function.push_child(next, ret).unwrap();

        assert!(!detect_loops(&mut function).unwrap());
        function.check_invariants().unwrap();
    }
}
