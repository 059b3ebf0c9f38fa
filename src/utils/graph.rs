//! Minimal directed-graph utilities for control-flow analysis.
//!
//! The structurer and the block sorter both view a [`crate::il::ILFunction`]
//! block container as a small digraph whose nodes are block child-indices.
//! This module provides the shared pieces: successor/predecessor lists,
//! postorder and reverse-postorder traversal, and an iterative dominator
//! computation (Cooper-Harvey-Kennedy).

use rustc_hash::FxHashSet;

/// A small successor-list digraph over dense `usize` node ids.
///
/// Nodes are identified by index; edges are unlabelled. Parallel edges are
/// collapsed on insertion.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

impl FlowGraph {
    /// Creates a graph with `node_count` nodes and no edges.
    #[must_use]
    pub fn new(node_count: usize) -> Self {
        Self {
            successors: vec![Vec::new(); node_count],
            predecessors: vec![Vec::new(); node_count],
        }
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.successors.len()
    }

    /// Adds an edge `from -> to`, ignoring duplicates.
    ///
    /// # Panics
    ///
    /// Panics if either endpoint is out of bounds.
    pub fn add_edge(&mut self, from: usize, to: usize) {
        if !self.successors[from].contains(&to) {
            self.successors[from].push(to);
            self.predecessors[to].push(from);
        }
    }

    /// Successors of a node.
    #[must_use]
    pub fn successors(&self, node: usize) -> &[usize] {
        &self.successors[node]
    }

    /// Predecessors of a node.
    #[must_use]
    pub fn predecessors(&self, node: usize) -> &[usize] {
        &self.predecessors[node]
    }

    /// Depth-first postorder over the nodes reachable from `entry`.
    #[must_use]
    pub fn postorder(&self, entry: usize) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.node_count());
        let mut visited = FxHashSet::default();
        // Explicit stack with a child cursor so deep graphs cannot overflow
        // the call stack.
        let mut stack: Vec<(usize, usize)> = vec![(entry, 0)];
        visited.insert(entry);

        while let Some(&mut (node, ref mut cursor)) = stack.last_mut() {
            if let Some(&next) = self.successors[node].get(*cursor) {
                *cursor += 1;
                if visited.insert(next) {
                    stack.push((next, 0));
                }
            } else {
                order.push(node);
                stack.pop();
            }
        }
        order
    }

    /// Reverse postorder over the nodes reachable from `entry`.
    #[must_use]
    pub fn reverse_postorder(&self, entry: usize) -> Vec<usize> {
        let mut order = self.postorder(entry);
        order.reverse();
        order
    }
}

/// Immediate-dominator table for a [`FlowGraph`].
///
/// Computed with the iterative algorithm of Cooper, Harvey and Kennedy, which
/// converges quickly on reducible control flow and is simple enough to audit.
#[derive(Debug, Clone)]
pub struct Dominators {
    entry: usize,
    /// `idom[n]` is the immediate dominator of `n`; `usize::MAX` marks
    /// unreachable nodes, and `idom[entry] == entry`.
    idom: Vec<usize>,
}

impl Dominators {
    /// Computes the dominator table for the nodes reachable from `entry`.
    #[must_use]
    pub fn compute(graph: &FlowGraph, entry: usize) -> Self {
        let node_count = graph.node_count();
        let rpo = graph.reverse_postorder(entry);

        // Map node -> position in reverse postorder, for the intersect walk.
        let mut rpo_index = vec![usize::MAX; node_count];
        for (position, &node) in rpo.iter().enumerate() {
            rpo_index[node] = position;
        }

        let mut idom = vec![usize::MAX; node_count];
        idom[entry] = entry;

        let intersect = |idom: &[usize], mut a: usize, mut b: usize| -> usize {
            while a != b {
                while rpo_index[a] > rpo_index[b] {
                    a = idom[a];
                }
                while rpo_index[b] > rpo_index[a] {
                    b = idom[b];
                }
            }
            a
        };

        let mut changed = true;
        while changed {
            changed = false;
            for &node in rpo.iter().skip(1) {
                let mut new_idom = usize::MAX;
                for &pred in graph.predecessors(node) {
                    if idom[pred] == usize::MAX {
                        continue;
                    }
                    new_idom = if new_idom == usize::MAX {
                        pred
                    } else {
                        intersect(&idom, new_idom, pred)
                    };
                }
                if new_idom != usize::MAX && idom[node] != new_idom {
                    idom[node] = new_idom;
                    changed = true;
                }
            }
        }

        Self { entry, idom }
    }

    /// Returns the immediate dominator of `node`, or `None` for the entry and
    /// for unreachable nodes.
    #[must_use]
    pub fn immediate_dominator(&self, node: usize) -> Option<usize> {
        if node == self.entry || self.idom[node] == usize::MAX {
            None
        } else {
            Some(self.idom[node])
        }
    }

    /// Returns `true` if `node` is reachable from the entry.
    #[must_use]
    pub fn is_reachable(&self, node: usize) -> bool {
        node == self.entry || self.idom.get(node).is_some_and(|&d| d != usize::MAX)
    }

    /// Checks whether `a` dominates `b`. A node dominates itself.
    #[must_use]
    pub fn dominates(&self, a: usize, b: usize) -> bool {
        if !self.is_reachable(b) {
            return false;
        }
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            if current == self.entry {
                return false;
            }
            current = self.idom[current];
        }
    }
}
