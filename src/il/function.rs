//! The arena-allocated IL tree and its mutation discipline.
//!
//! An [`ILFunction`] owns every instruction node of one method body in a
//! flat arena addressed by [`InstrId`]. Parent links are indices, so heavy
//! in-place rewriting never fights the borrow checker, and a node's identity
//! is stable across restructuring.
//!
//! All structural changes go through the methods here. The API maintains
//! three bookkeeping invariants that transform passes rely on and the
//! invariant checker verifies after every pass:
//!
//! 1. parent/child edges agree (`parent.children[child_index] == child`);
//! 2. variable use counters equal the number of live loads / address-loads /
//!    stores referencing each variable;
//! 3. cached flow flags match a fresh derivation (caches are invalidated up
//!    to the root whenever a subtree changes).
//!
//! Misuse (attaching a node that already has a parent, touching a discarded
//! node, ...) fails with [`crate::Error::InvariantViolation`]; such failures
//! indicate a bug in a pass, not bad input.

use std::cell::Cell;

use crate::{
    il::{
        flags::InstructionFlags,
        instruction::{ContainerKind, InstrId, InstrKind},
        variable::{VarId, Variable, VariableKind},
    },
    typesystem::MethodRefRc,
    Result,
};

struct Node {
    kind: InstrKind,
    children: Vec<InstrId>,
    parent: Option<InstrId>,
    child_index: usize,
    flags_cache: Cell<Option<InstructionFlags>>,
    dead: bool,
}

/// A method body as a mutable IL tree.
pub struct ILFunction {
    nodes: Vec<Node>,
    variables: Vec<Variable>,
    root: InstrId,
    method: Option<MethodRefRc>,
}

impl ILFunction {
    /// Creates a function with an empty root block container.
    #[must_use]
    pub fn new(method: Option<MethodRefRc>) -> Self {
        let mut function = Self {
            nodes: Vec::new(),
            variables: Vec::new(),
            root: InstrId(0),
            method,
        };
        let root = function.alloc(InstrKind::BlockContainer(ContainerKind::Normal));
        function.root = root;
        function
    }

    /// The root block container.
    #[must_use]
    pub fn root(&self) -> InstrId {
        self.root
    }

    /// The type-system method this body belongs to, when known.
    #[must_use]
    pub fn method(&self) -> Option<&MethodRefRc> {
        self.method.as_ref()
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    /// Declares a new variable with a synthesized name.
    pub fn add_variable(
        &mut self,
        kind: VariableKind,
        index: usize,
        ty: Option<crate::typesystem::TsTypeRef>,
    ) -> VarId {
        let name = match kind {
            VariableKind::Parameter => format!("arg_{index}"),
            VariableKind::Local => format!("V_{index}"),
            VariableKind::StackSlot => format!("S_{index}"),
            VariableKind::ExceptionSlot => format!("E_{index}"),
        };
        self.add_named_variable(kind, index, name, ty)
    }

    /// Declares a new variable with an explicit name (from debug symbols).
    pub fn add_named_variable(
        &mut self,
        kind: VariableKind,
        index: usize,
        name: String,
        ty: Option<crate::typesystem::TsTypeRef>,
    ) -> VarId {
        let id = VarId(self.variables.len() as u32);
        self.variables.push(Variable::new(kind, index, name, ty));
        id
    }

    /// A variable by id.
    ///
    /// # Panics
    ///
    /// Panics on an id from another function.
    #[must_use]
    pub fn variable(&self, id: VarId) -> &Variable {
        &self.variables[id.index()]
    }

    /// All declared variables.
    pub fn variables(&self) -> impl Iterator<Item = (VarId, &Variable)> {
        self.variables
            .iter()
            .enumerate()
            .map(|(index, variable)| (VarId(index as u32), variable))
    }

    // ------------------------------------------------------------------
    // Node access
    // ------------------------------------------------------------------

    fn node(&self, id: InstrId) -> &Node {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: InstrId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// The kind tag of a node.
    #[must_use]
    pub fn kind(&self, id: InstrId) -> &InstrKind {
        &self.node(id).kind
    }

    /// The children of a node, in slot order.
    #[must_use]
    pub fn children(&self, id: InstrId) -> &[InstrId] {
        &self.node(id).children
    }

    /// A single child slot.
    #[must_use]
    pub fn child(&self, id: InstrId, index: usize) -> InstrId {
        self.node(id).children[index]
    }

    /// The parent of a node, `None` for the root and for detached nodes.
    #[must_use]
    pub fn parent(&self, id: InstrId) -> Option<InstrId> {
        self.node(id).parent
    }

    /// The node's slot within its parent.
    #[must_use]
    pub fn child_index(&self, id: InstrId) -> usize {
        self.node(id).child_index
    }

    /// `true` once a node has been discarded.
    #[must_use]
    pub fn is_dead(&self, id: InstrId) -> bool {
        self.node(id).dead
    }

    /// Pre-order traversal of a subtree, excluding `id` itself.
    #[must_use]
    pub fn descendants(&self, id: InstrId) -> Vec<InstrId> {
        let mut result = Vec::new();
        let mut stack: Vec<InstrId> = self.node(id).children.iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            result.push(current);
            stack.extend(self.node(current).children.iter().rev());
        }
        result
    }

    /// Pre-order traversal of a subtree, including `id` itself.
    #[must_use]
    pub fn descendants_and_self(&self, id: InstrId) -> Vec<InstrId> {
        let mut result = vec![id];
        result.extend(self.descendants(id));
        result
    }

    /// Walks up the parent chain to the nearest enclosing node satisfying
    /// `predicate`, excluding `id` itself.
    #[must_use]
    pub fn ancestor_matching(
        &self,
        id: InstrId,
        predicate: impl Fn(&InstrKind) -> bool,
    ) -> Option<InstrId> {
        let mut current = self.parent(id);
        while let Some(node) = current {
            if predicate(&self.node(node).kind) {
                return Some(node);
            }
            current = self.parent(node);
        }
        None
    }

    // ------------------------------------------------------------------
    // Construction and mutation
    // ------------------------------------------------------------------

    fn alloc(&mut self, kind: InstrKind) -> InstrId {
        let id = InstrId(self.nodes.len() as u32);
        self.register_kind(&kind, 1);
        self.nodes.push(Node {
            kind,
            children: Vec::new(),
            parent: None,
            child_index: 0,
            flags_cache: Cell::new(None),
            dead: false,
        });
        id
    }

    /// Creates a new detached instruction with the given children.
    ///
    /// Children must themselves be detached; they are claimed by the new
    /// node.
    ///
    /// # Errors
    ///
    /// Fails with `InvariantViolation` when a child is dead or already has a
    /// parent.
    pub fn create(&mut self, kind: InstrKind, children: Vec<InstrId>) -> Result<InstrId> {
        for &child in &children {
            self.ensure_attachable(child)?;
        }
        let id = self.alloc(kind);
        for (slot, &child) in children.iter().enumerate() {
            let node = self.node_mut(child);
            node.parent = Some(id);
            node.child_index = slot;
        }
        self.node_mut(id).children = children;
        Ok(id)
    }

    fn ensure_attachable(&self, id: InstrId) -> Result<()> {
        let node = self.node(id);
        if node.dead {
            return Err(invariant_error!("instruction {:?} was discarded", id));
        }
        if node.parent.is_some() {
            return Err(invariant_error!(
                "instruction {:?} already has a parent; detach it first",
                id
            ));
        }
        Ok(())
    }

    /// Inserts a detached node as child `index` of `parent`.
    ///
    /// # Errors
    ///
    /// Fails with `InvariantViolation` for a dead or attached child, or an
    /// out-of-range index.
    pub fn insert_child(&mut self, parent: InstrId, index: usize, child: InstrId) -> Result<()> {
        self.ensure_attachable(child)?;
        if index > self.node(parent).children.len() {
            return Err(invariant_error!(
                "insert index {} out of range for {:?}",
                index,
                parent
            ));
        }
        self.node_mut(parent).children.insert(index, child);
        {
            let node = self.node_mut(child);
            node.parent = Some(parent);
            node.child_index = index;
        }
        self.renumber_children(parent, index + 1);
        self.invalidate_flags_up(parent);
        Ok(())
    }

    /// Appends a detached node as the last child of `parent`.
    ///
    /// # Errors
    ///
    /// Fails with `InvariantViolation` for a dead or attached child.
    pub fn push_child(&mut self, parent: InstrId, child: InstrId) -> Result<()> {
        let index = self.node(parent).children.len();
        self.insert_child(parent, index, child)
    }

    /// Detaches child `index` of `parent` and returns it.
    ///
    /// Counters are not touched: the subtree stays live and can be
    /// reattached elsewhere, or passed to [`ILFunction::discard`].
    ///
    /// # Errors
    ///
    /// Fails with `InvariantViolation` for an out-of-range index.
    pub fn detach_child(&mut self, parent: InstrId, index: usize) -> Result<InstrId> {
        if index >= self.node(parent).children.len() {
            return Err(invariant_error!(
                "detach index {} out of range for {:?}",
                index,
                parent
            ));
        }
        let child = self.node_mut(parent).children.remove(index);
        self.node_mut(child).parent = None;
        self.renumber_children(parent, index);
        self.invalidate_flags_up(parent);
        Ok(child)
    }

    /// Detaches a node from wherever it is attached.
    ///
    /// # Errors
    ///
    /// Fails with `InvariantViolation` when the node is the root.
    pub fn detach(&mut self, id: InstrId) -> Result<InstrId> {
        match self.parent(id) {
            Some(parent) => self.detach_child(parent, self.child_index(id)),
            None if id == self.root => {
                Err(invariant_error!("the root container cannot be detached"))
            }
            None => Ok(id),
        }
    }

    /// Replaces `old` (attached or root) with the detached node `new`.
    /// `old` is left detached; callers usually [`ILFunction::discard`] it.
    ///
    /// # Errors
    ///
    /// Fails with `InvariantViolation` for a dead or attached `new`.
    pub fn replace(&mut self, old: InstrId, new: InstrId) -> Result<()> {
        self.ensure_attachable(new)?;
        match self.parent(old) {
            Some(parent) => {
                let slot = self.child_index(old);
                self.node_mut(old).parent = None;
                self.node_mut(parent).children[slot] = new;
                {
                    let node = self.node_mut(new);
                    node.parent = Some(parent);
                    node.child_index = slot;
                }
                self.invalidate_flags_up(parent);
                Ok(())
            }
            None if old == self.root => {
                self.root = new;
                Ok(())
            }
            None => Err(invariant_error!(
                "cannot replace detached instruction {:?}",
                old
            )),
        }
    }

    /// Discards a subtree: detaches it if necessary, unregisters every use
    /// count and branch edge it contributed, and tombstones the nodes.
    ///
    /// # Errors
    ///
    /// Fails with `InvariantViolation` when asked to discard the root.
    pub fn discard(&mut self, id: InstrId) -> Result<()> {
        if id == self.root {
            return Err(invariant_error!("the root container cannot be discarded"));
        }
        self.detach(id)?;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let children = std::mem::take(&mut self.node_mut(current).children);
            stack.extend(children);
            let kind = std::mem::replace(&mut self.node_mut(current).kind, InstrKind::Nop);
            self.register_kind(&kind, -1);
            let node = self.node_mut(current);
            node.parent = None;
            node.dead = true;
            node.flags_cache.set(None);
        }
        Ok(())
    }

    /// Rewrites a node's kind tag in place, keeping its children.
    ///
    /// Use-count and branch-edge bookkeeping moves from the old kind to the
    /// new one. The caller is responsible for the children still matching
    /// the new kind's slots.
    pub fn replace_kind(&mut self, id: InstrId, kind: InstrKind) {
        self.register_kind(&kind, 1);
        let old = std::mem::replace(&mut self.node_mut(id).kind, kind);
        self.register_kind(&old, -1);
        self.invalidate_flags_up(id);
    }

    /// Redirects a branch to a new target block.
    ///
    /// # Errors
    ///
    /// Fails with `InvariantViolation` when `branch` is not a branch.
    pub fn set_branch_target(&mut self, branch: InstrId, target: InstrId) -> Result<()> {
        match self.node(branch).kind {
            InstrKind::Branch(_) => {
                self.replace_kind(branch, InstrKind::Branch(target));
                Ok(())
            }
            _ => Err(invariant_error!("{:?} is not a branch", branch)),
        }
    }

    /// Reorders (and possibly drops) the children of a container.
    ///
    /// `order` must be a subset-permutation of the current children; children
    /// not listed are discarded.
    pub(crate) fn reorder_children(&mut self, parent: InstrId, order: Vec<InstrId>) -> Result<()> {
        let current = self.node(parent).children.clone();
        for &kept in &order {
            if !current.contains(&kept) {
                return Err(invariant_error!(
                    "{:?} is not a child of {:?}",
                    kept,
                    parent
                ));
            }
        }
        for &child in &current {
            if !order.contains(&child) {
                self.node_mut(child).parent = None;
                self.node_mut(parent)
                    .children
                    .retain(|&existing| existing != child);
                self.discard(child)?;
            }
        }
        for (slot, &child) in order.iter().enumerate() {
            let node = self.node_mut(child);
            node.parent = Some(parent);
            node.child_index = slot;
        }
        self.node_mut(parent).children = order;
        self.invalidate_flags_up(parent);
        Ok(())
    }

    fn renumber_children(&mut self, parent: InstrId, from: usize) {
        let children: Vec<InstrId> = self.node(parent).children[from..].to_vec();
        for (offset, child) in children.into_iter().enumerate() {
            self.node_mut(child).child_index = from + offset;
        }
    }

    /// Updates use counters and branch edges for a kind coming (+1) or going
    /// (-1).
    fn register_kind(&mut self, kind: &InstrKind, delta: i32) {
        let bump = |count: &mut u32| {
            *count = count.wrapping_add_signed(delta);
        };
        match kind {
            InstrKind::LdLoc(var) => bump(&mut self.variables[var.index()].load_count),
            InstrKind::LdLoca(var) => bump(&mut self.variables[var.index()].address_count),
            InstrKind::StLoc(var) | InstrKind::UsingInstruction(var) => {
                bump(&mut self.variables[var.index()].store_count);
            }
            InstrKind::CatchHandler { variable, .. } => {
                bump(&mut self.variables[variable.index()].store_count);
            }
            InstrKind::Branch(target) => {
                let target = *target;
                if let InstrKind::Block {
                    incoming_edge_count,
                } = &mut self.node_mut(target).kind
                {
                    *incoming_edge_count = incoming_edge_count.wrapping_add_signed(delta);
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Flow flags
    // ------------------------------------------------------------------

    /// The flow flags of a node, computed on demand and cached. Any mutation
    /// of the subtree invalidates the cache up to the root.
    #[must_use]
    pub fn flags(&self, id: InstrId) -> InstructionFlags {
        if let Some(cached) = self.node(id).flags_cache.get() {
            return cached;
        }
        let computed = self.compute_flags(id);
        self.node(id).flags_cache.set(Some(computed));
        computed
    }

    fn invalidate_flags_up(&self, id: InstrId) {
        let mut current = Some(id);
        while let Some(node) = current {
            self.node(node).flags_cache.set(None);
            current = self.node(node).parent;
        }
    }

    fn compute_flags(&self, id: InstrId) -> InstructionFlags {
        use InstructionFlags as F;
        let node = self.node(id);
        let children_union = |function: &Self| {
            node.children
                .iter()
                .fold(F::empty(), |acc, &child| acc | function.flags(child))
        };

        match &node.kind {
            InstrKind::Nop
            | InstrKind::LdcI4(_)
            | InstrKind::LdcI8(_)
            | InstrKind::LdcR8(_)
            | InstrKind::LdStr(_)
            | InstrKind::LdNull
            | InstrKind::DefaultValue(_)
            | InstrKind::LdLoc(_)
            | InstrKind::LdLoca(_)
            | InstrKind::LdsFld(_)
            | InstrKind::LdsFlda(_) => F::empty(),

            InstrKind::Pop
            | InstrKind::UnaryOp(_)
            | InstrKind::Comp(_)
            | InstrKind::LogicNot
            | InstrKind::Conv(_)
            | InstrKind::IsInst(_)
            | InstrKind::StringToInt(_) => children_union(self),

            InstrKind::BinaryOp(op) => {
                let mut flags = children_union(self);
                if op.may_throw() {
                    flags |= F::MAY_THROW;
                }
                flags
            }

            InstrKind::StLoc(_) => children_union(self) | F::SIDE_EFFECTS,
            InstrKind::StsFld(_) => children_union(self) | F::SIDE_EFFECTS,

            InstrKind::Call(_) | InstrKind::CallVirt(_) | InstrKind::NewObj(_) => {
                children_union(self) | F::MAY_THROW | F::SIDE_EFFECTS
            }

            InstrKind::LdObj(_)
            | InstrKind::LdFld(_)
            | InstrKind::LdFlda(_)
            | InstrKind::Box(_)
            | InstrKind::UnboxAny(_)
            | InstrKind::CastClass(_) => children_union(self) | F::MAY_THROW,

            InstrKind::StObj(_) | InstrKind::StFld(_) => {
                children_union(self) | F::MAY_THROW | F::SIDE_EFFECTS
            }

            InstrKind::Branch(_) | InstrKind::Leave(_) => {
                children_union(self) | F::CONTROL_FLOW | F::MAY_BRANCH | F::END_POINT_UNREACHABLE
            }
            InstrKind::Return => {
                children_union(self) | F::CONTROL_FLOW | F::END_POINT_UNREACHABLE
            }
            InstrKind::Throw | InstrKind::Rethrow => {
                children_union(self) | F::MAY_THROW | F::END_POINT_UNREACHABLE
            }

            InstrKind::IfInstruction => {
                let condition = self.flags(node.children[0]);
                let then_flags = self.flags(node.children[1]);
                let else_flags = self.flags(node.children[2]);
                let mut flags = condition
                    | F::CONTROL_FLOW
                    | ((then_flags | else_flags) - F::END_POINT_UNREACHABLE);
                if then_flags.contains(F::END_POINT_UNREACHABLE)
                    && else_flags.contains(F::END_POINT_UNREACHABLE)
                {
                    flags |= F::END_POINT_UNREACHABLE;
                }
                flags
            }

            InstrKind::SwitchInstruction => {
                let value_flags = self.flags(node.children[0]);
                let sections = &node.children[1..];
                let mut union = F::empty();
                let mut all_unreachable = !sections.is_empty();
                for &section in sections {
                    let section_flags = self.flags(section);
                    union |= section_flags - F::END_POINT_UNREACHABLE;
                    all_unreachable &= section_flags.contains(F::END_POINT_UNREACHABLE);
                }
                let mut flags = value_flags | union | F::CONTROL_FLOW;
                if all_unreachable {
                    flags |= F::END_POINT_UNREACHABLE;
                }
                flags
            }

            InstrKind::SwitchSection(_) => self.flags(node.children[0]),

            InstrKind::Block { .. } => children_union(self) | F::CONTROL_FLOW,

            InstrKind::BlockContainer(_) => {
                // Internal branches are absorbed by the container; whether the
                // end point is reachable depends on a leave targeting it.
                let mut flags = children_union(self)
                    - (F::MAY_BRANCH | F::END_POINT_UNREACHABLE)
                    | F::CONTROL_FLOW;
                let has_leave = self.descendants(id).iter().any(|&descendant| {
                    matches!(self.node(descendant).kind, InstrKind::Leave(target) if target == id)
                });
                if !has_leave {
                    flags |= F::END_POINT_UNREACHABLE;
                }
                flags
            }

            InstrKind::TryCatch => {
                let try_flags = self.flags(node.children[0]);
                let mut union = try_flags;
                let mut all_unreachable = try_flags.contains(F::END_POINT_UNREACHABLE);
                for &handler in &node.children[1..] {
                    let handler_flags = self.flags(handler);
                    union |= handler_flags - F::END_POINT_UNREACHABLE;
                    all_unreachable &= handler_flags.contains(F::END_POINT_UNREACHABLE);
                }
                let mut flags = (union - F::END_POINT_UNREACHABLE) | F::CONTROL_FLOW;
                if all_unreachable {
                    flags |= F::END_POINT_UNREACHABLE;
                }
                flags
            }

            InstrKind::CatchHandler { .. } => {
                let filter_flags = self.flags(node.children[0]);
                let body_flags = self.flags(node.children[1]);
                (filter_flags - F::END_POINT_UNREACHABLE) | body_flags
            }

            InstrKind::TryFinally => {
                let try_flags = self.flags(node.children[0]);
                let finally_flags = self.flags(node.children[1]);
                // The finally's own throws are absorbed unless the protected
                // region can raise in the first place.
                let mut flags = try_flags | (finally_flags - F::MAY_THROW) | F::CONTROL_FLOW;
                if try_flags.contains(F::MAY_THROW) {
                    flags |= finally_flags & F::MAY_THROW;
                }
                flags
            }

            InstrKind::TryFault => {
                let try_flags = self.flags(node.children[0]);
                let fault_flags = self.flags(node.children[1]);
                try_flags | (fault_flags - F::END_POINT_UNREACHABLE) | F::CONTROL_FLOW
            }

            InstrKind::LockInstruction | InstrKind::UsingInstruction(_) => {
                children_union(self) | F::CONTROL_FLOW | F::MAY_THROW | F::SIDE_EFFECTS
            }

            InstrKind::NullCoalescing => children_union(self),
            InstrKind::NullConditional => children_union(self) | F::MAY_UNWRAP_NULL,
        }
    }

    // ------------------------------------------------------------------
    // Invariant checking
    // ------------------------------------------------------------------

    /// Verifies every structural invariant of the tree. Intended for tests
    /// and debug assertions between passes.
    ///
    /// # Errors
    ///
    /// Returns `InvariantViolation` describing the first inconsistency
    /// found.
    pub fn check_invariants(&self) -> Result<()> {
        let reachable = self.descendants_and_self(self.root);

        // Parent/child edge consistency.
        for &id in &reachable {
            let node = self.node(id);
            if node.dead {
                return Err(invariant_error!("dead instruction {:?} is reachable", id));
            }
            for (slot, &child) in node.children.iter().enumerate() {
                let child_node = self.node(child);
                if child_node.parent != Some(id) || child_node.child_index != slot {
                    return Err(invariant_error!(
                        "parent link of {:?} does not match slot {} of {:?}",
                        child,
                        slot,
                        id
                    ));
                }
            }
        }

        // Every live node is reachable (no leaked detached subtrees).
        let mut is_reachable = vec![false; self.nodes.len()];
        for &id in &reachable {
            is_reachable[id.index()] = true;
        }
        for (index, node) in self.nodes.iter().enumerate() {
            if !node.dead && !is_reachable[index] {
                return Err(invariant_error!(
                    "live instruction {:?} is not reachable from the root",
                    InstrId(index as u32)
                ));
            }
        }

        // Variable counters match actual use counts.
        let mut loads = vec![0u32; self.variables.len()];
        let mut addresses = vec![0u32; self.variables.len()];
        let mut stores = vec![0u32; self.variables.len()];
        for &id in &reachable {
            match &self.node(id).kind {
                InstrKind::LdLoc(var) => loads[var.index()] += 1,
                InstrKind::LdLoca(var) => addresses[var.index()] += 1,
                InstrKind::StLoc(var) | InstrKind::UsingInstruction(var) => {
                    stores[var.index()] += 1;
                }
                InstrKind::CatchHandler { variable, .. } => stores[variable.index()] += 1,
                _ => {}
            }
        }
        for (index, variable) in self.variables.iter().enumerate() {
            if variable.load_count != loads[index]
                || variable.address_count != addresses[index]
                || variable.store_count != stores[index]
            {
                return Err(invariant_error!(
                    "use counts of {} drifted: recorded {}/{}/{}, actual {}/{}/{}",
                    variable.name(),
                    variable.load_count,
                    variable.address_count,
                    variable.store_count,
                    loads[index],
                    addresses[index],
                    stores[index]
                ));
            }
        }

        // Incoming edge counts match live branches.
        let mut incoming = vec![0u32; self.nodes.len()];
        for &id in &reachable {
            if let InstrKind::Branch(target) = self.node(id).kind {
                incoming[target.index()] += 1;
            }
        }
        for &id in &reachable {
            if let InstrKind::Block {
                incoming_edge_count,
            } = self.node(id).kind
            {
                if incoming_edge_count != incoming[id.index()] {
                    return Err(invariant_error!(
                        "incoming edge count of {:?} drifted: recorded {}, actual {}",
                        id,
                        incoming_edge_count,
                        incoming[id.index()]
                    ));
                }
            }
        }

        // Cached flags, where present, match a fresh derivation.
        for &id in &reachable {
            if let Some(cached) = self.node(id).flags_cache.get() {
                let fresh = self.compute_flags(id);
                if cached != fresh {
                    return Err(invariant_error!(
                        "cached flags of {:?} are stale: cached {:?}, derived {:?}",
                        id,
                        cached,
                        fresh
                    ));
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for ILFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ILFunction")
            .field("nodes", &self.nodes.len())
            .field("variables", &self.variables.len())
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::instruction::InstrKind as K;

    fn new_function() -> ILFunction {
        ILFunction::new(None)
    }

    #[test]
    fn test_create_attaches_children() {
        let mut function = new_function();
        let value = function.create(K::LdcI4(7), vec![]).unwrap();
        let var = function.add_variable(VariableKind::Local, 0, None);
        let store = function.create(K::StLoc(var), vec![value]).unwrap();

        assert_eq!(function.parent(value), Some(store));
        assert_eq!(function.child_index(value), 0);
        assert_eq!(function.variable(var).store_count(), 1);
    }

    #[test]
    fn test_double_attach_rejected() {
        let mut function = new_function();
        let value = function.create(K::LdcI4(1), vec![]).unwrap();
        let _store = function.create(K::Pop, vec![value]).unwrap();
        let err = function.create(K::Pop, vec![value]).unwrap_err();
        assert!(err.to_string().contains("already has a parent"));
    }

    #[test]
    fn test_discard_updates_counters() {
        let mut function = new_function();
        let var = function.add_variable(VariableKind::Local, 0, None);
        let load = function.create(K::LdLoc(var), vec![]).unwrap();
        let pop = function.create(K::Pop, vec![load]).unwrap();
        assert_eq!(function.variable(var).load_count(), 1);

        function.discard(pop).unwrap();
        assert_eq!(function.variable(var).load_count(), 0);
        assert!(function.is_dead(load));
        assert!(function.is_dead(pop));
    }

    #[test]
    fn test_branch_edge_accounting() {
        let mut function = new_function();
        let block = function
            .create(
                K::Block {
                    incoming_edge_count: 0,
                },
                vec![],
            )
            .unwrap();
        let branch = function.create(K::Branch(block), vec![]).unwrap();
        match function.kind(block) {
            K::Block {
                incoming_edge_count,
            } => assert_eq!(*incoming_edge_count, 1),
            _ => unreachable!(),
        }

        function.discard(branch).unwrap();
        match function.kind(block) {
            K::Block {
                incoming_edge_count,
            } => assert_eq!(*incoming_edge_count, 0),
            _ => unreachable!(),
        }
        function.discard(block).unwrap();
    }

    #[test]
    fn test_flags_derive_and_invalidate() {
        use InstructionFlags as F;
        let mut function = new_function();
        let throw_value = function.create(K::LdNull, vec![]).unwrap();
        let throw = function.create(K::Throw, vec![throw_value]).unwrap();
        let block = function
            .create(
                K::Block {
                    incoming_edge_count: 0,
                },
                vec![throw],
            )
            .unwrap();
        function.push_child(function.root(), block).unwrap();

        assert!(function.flags(block).contains(F::MAY_THROW));
        assert!(function.flags(block).contains(F::END_POINT_UNREACHABLE));

        // Mutate: remove the throw; the cached block flags must refresh.
        let detached = function.detach_child(block, 0).unwrap();
        function.discard(detached).unwrap();
        let ret = function.create(K::Return, vec![]).unwrap();
        function.push_child(block, ret).unwrap();
        assert!(!function.flags(block).contains(F::MAY_THROW));

        function.check_invariants().unwrap();
    }

    #[test]
    fn test_if_endpoint_requires_both_arms() {
        use InstructionFlags as F;
        let mut function = new_function();

        let cond = function.create(K::LdcI4(1), vec![]).unwrap();
        let then_ret = function.create(K::Return, vec![]).unwrap();
        let else_nop = function.create(K::Nop, vec![]).unwrap();
        let if_instr = function
            .create(K::IfInstruction, vec![cond, then_ret, else_nop])
            .unwrap();
        assert!(!function
            .flags(if_instr)
            .contains(F::END_POINT_UNREACHABLE));

        let else_slot = function.detach_child(if_instr, 2).unwrap();
        function.discard(else_slot).unwrap();
        let else_ret = function.create(K::Return, vec![]).unwrap();
        function.insert_child(if_instr, 2, else_ret).unwrap();
        assert!(function
            .flags(if_instr)
            .contains(F::END_POINT_UNREACHABLE));
        function.discard(if_instr).unwrap();
    }

    #[test]
    fn test_check_invariants_detects_leak() {
        let mut function = new_function();
        let orphan = function.create(K::Nop, vec![]).unwrap();
        let err = function.check_invariants().unwrap_err();
        assert!(err.to_string().contains("not reachable"));
        function.discard(orphan).unwrap();
        function.check_invariants().unwrap();
    }
}
