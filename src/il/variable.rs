//! Variables referenced by the IL tree.
//!
//! A variable is a named slot plus three use counters that the tree model
//! keeps exact: every attach or discard of a load, address-load, or store
//! updates them centrally. Passes rely on the counters to decide whether a
//! slot is safe to inline or eliminate; the invariant checker verifies them
//! against the actual tree after every pass.

use crate::typesystem::TsTypeRef;

/// Index of a variable within its owning function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub u32);

impl VarId {
    /// The index as a usize.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a variable slot represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// A method parameter (`this` is parameter 0 of instance methods).
    Parameter,
    /// A local variable slot from the method body.
    Local,
    /// A slot materialized from the CIL evaluation stack.
    StackSlot,
    /// The exception object of a catch handler.
    ExceptionSlot,
}

/// A variable slot with exact use counters.
#[derive(Debug, Clone)]
pub struct Variable {
    kind: VariableKind,
    /// Slot index within its kind (parameter index, local slot, ...).
    index: usize,
    /// Display name; synthesized (`V_0`, `S_3`, ...) when no debug info names
    /// the slot.
    name: String,
    /// Inferred or declared type, when known.
    ty: Option<TsTypeRef>,
    pub(crate) load_count: u32,
    pub(crate) address_count: u32,
    pub(crate) store_count: u32,
}

impl Variable {
    pub(crate) fn new(
        kind: VariableKind,
        index: usize,
        name: String,
        ty: Option<TsTypeRef>,
    ) -> Self {
        Self {
            kind,
            index,
            name,
            ty,
            load_count: 0,
            address_count: 0,
            store_count: 0,
        }
    }

    /// What this slot represents.
    #[must_use]
    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    /// Slot index within its kind.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared or inferred type.
    #[must_use]
    pub fn ty(&self) -> Option<&TsTypeRef> {
        self.ty.as_ref()
    }

    /// Number of loading instructions currently referencing this variable.
    #[must_use]
    pub fn load_count(&self) -> u32 {
        self.load_count
    }

    /// Number of address-taking instructions currently referencing this
    /// variable.
    #[must_use]
    pub fn address_count(&self) -> u32 {
        self.address_count
    }

    /// Number of storing instructions currently referencing this variable.
    #[must_use]
    pub fn store_count(&self) -> u32 {
        self.store_count
    }

    /// A variable is single-definition iff exactly one store references it.
    #[must_use]
    pub fn is_single_definition(&self) -> bool {
        self.store_count == 1
    }

    /// `true` when nothing references the variable anymore.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.load_count == 0 && self.address_count == 0 && self.store_count == 0
    }
}
