//! Block and block-container helpers.
//!
//! Blocks are ordinary instruction nodes, but the structurer and the
//! dataflow engine view the blocks of one container as a small flow graph.
//! This module builds that view and implements `sort_blocks`: reordering a
//! container's blocks in reverse postorder (which makes the dataflow
//! worklist converge quickly) and optionally dropping blocks no branch can
//! reach anymore.

use crate::{
    il::{
        function::ILFunction,
        instruction::{InstrId, InstrKind},
    },
    utils::FlowGraph,
    Result,
};

/// `true` when the node is a block.
#[must_use]
pub fn is_block(function: &ILFunction, id: InstrId) -> bool {
    matches!(function.kind(id), InstrKind::Block { .. })
}

/// The entry block of a container (its first child).
#[must_use]
pub fn entry_point(function: &ILFunction, container: InstrId) -> Option<InstrId> {
    debug_assert!(matches!(
        function.kind(container),
        InstrKind::BlockContainer(_)
    ));
    function.children(container).first().copied()
}

/// Builds the branch graph between the immediate blocks of `container`.
///
/// Nodes are block child-indices. Branches nested deeper (inside try bodies,
/// if arms, nested containers) can only target blocks of their own
/// container, so an edge exists exactly when a descendant branch of one
/// block names another block of this container.
#[must_use]
pub fn container_graph(function: &ILFunction, container: InstrId) -> FlowGraph {
    let blocks = function.children(container);
    let mut graph = FlowGraph::new(blocks.len());
    let index_of = |target: InstrId| blocks.iter().position(|&block| block == target);

    for (block_index, &block) in blocks.iter().enumerate() {
        for descendant in function.descendants(block) {
            if let InstrKind::Branch(target) = *function.kind(descendant) {
                if let Some(target_index) = index_of(target) {
                    graph.add_edge(block_index, target_index);
                }
            }
        }
    }
    graph
}

/// Reorders the blocks of a container in reverse postorder.
///
/// With `drop_unreachable`, blocks that no path from the entry reaches are
/// discarded (their branch edges and variable uses are unregistered).
/// Without it, unreachable blocks keep their relative order after the
/// reachable ones.
///
/// # Errors
///
/// Propagates `InvariantViolation` from the mutation API.
pub fn sort_blocks(
    function: &mut ILFunction,
    container: InstrId,
    drop_unreachable: bool,
) -> Result<()> {
    let blocks: Vec<InstrId> = function.children(container).to_vec();
    if blocks.len() <= 1 {
        return Ok(());
    }

    let graph = container_graph(function, container);
    let order = graph.reverse_postorder(0);

    let mut new_order: Vec<InstrId> = order.iter().map(|&index| blocks[index]).collect();
    if !drop_unreachable {
        let mut seen = vec![false; blocks.len()];
        for &index in &order {
            seen[index] = true;
        }
        for (index, &block) in blocks.iter().enumerate() {
            if !seen[index] {
                new_order.push(block);
            }
        }
    }

    function.reorder_children(container, new_order)
}
