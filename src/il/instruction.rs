//! Instruction kinds and switch label sets.
//!
//! [`InstrKind`] is the tagged discriminator of every tree node. The child
//! slots of each kind are positional and documented per variant; the arena in
//! the function model stores children separately so a kind value itself is
//! cheap to inspect and clone. Branch and leave targets reference other nodes
//! by id without owning them.

use crate::{
    il::variable::VarId,
    typesystem::{FieldRefRc, MethodRefRc, PrimitiveKind, TsTypeRef},
};

/// Index of an instruction node within its owning function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

impl InstrId {
    /// The index as a usize.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    /// `add`
    Add,
    /// `sub`
    Sub,
    /// `mul`
    Mul,
    /// `div` (may throw on zero divisor or overflow)
    Div,
    /// `div.un`
    DivUn,
    /// `rem`
    Rem,
    /// `rem.un`
    RemUn,
    /// `and`
    BitAnd,
    /// `or`
    BitOr,
    /// `xor`
    BitXor,
    /// `shl`
    ShiftLeft,
    /// `shr`
    ShiftRight,
    /// `shr.un`
    ShiftRightUn,
}

impl BinaryOperator {
    /// Operators that can raise (division by zero, overflow on `div`).
    #[must_use]
    pub fn may_throw(self) -> bool {
        matches!(self, Self::Div | Self::DivUn | Self::Rem | Self::RemUn)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    /// `neg`
    Negate,
    /// `not`
    BitNot,
}

/// Comparison kinds produced by `ceq`/`cgt`/`clt` and the conditional
/// branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Equality.
    Equals,
    /// Inequality (synthesized; CIL spells it `ceq` + `not` or `bne.un`).
    NotEquals,
    /// Signed less-than.
    LessThan,
    /// Unsigned / unordered less-than.
    LessThanUn,
    /// Signed greater-than.
    GreaterThan,
    /// Unsigned / unordered greater-than.
    GreaterThanUn,
}

/// The role of a block container after structuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Plain region of blocks.
    Normal,
    /// A natural loop; the entry block is the loop header.
    Loop,
    /// The body region of a switch.
    Switch,
}

/// The tagged instruction discriminator.
///
/// Child slots are positional and listed as `[...]` per variant.
#[derive(Debug, Clone)]
pub enum InstrKind {
    /// No operation. `[]`
    Nop,
    /// Discard a computed value. `[value]`
    Pop,
    /// 32-bit integer constant. `[]`
    LdcI4(i32),
    /// 64-bit integer constant. `[]`
    LdcI8(i64),
    /// Floating constant. `[]`
    LdcR8(f64),
    /// String literal. `[]`
    LdStr(String),
    /// Null reference. `[]`
    LdNull,
    /// Zero-initialized value of a type. `[]`
    DefaultValue(TsTypeRef),
    /// Load a variable. `[]`
    LdLoc(VarId),
    /// Load a variable's address. `[]`
    LdLoca(VarId),
    /// Store into a variable. `[value]`
    StLoc(VarId),
    /// Binary arithmetic. `[left, right]`
    BinaryOp(BinaryOperator),
    /// Unary arithmetic. `[argument]`
    UnaryOp(UnaryOperator),
    /// Comparison producing 0/1. `[left, right]`
    Comp(Comparison),
    /// Logical negation of an i4 truth value. `[argument]`
    LogicNot,
    /// Numeric conversion. `[argument]`
    Conv(PrimitiveKind),
    /// Static or non-virtual call. `[arguments...]`
    Call(MethodRefRc),
    /// Virtual call. `[arguments...]`
    CallVirt(MethodRefRc),
    /// Object construction. `[arguments...]`
    NewObj(MethodRefRc),
    /// Indirect load through an address. `[target]`
    LdObj(TsTypeRef),
    /// Indirect store through an address. `[target, value]`
    StObj(TsTypeRef),
    /// Instance field load. `[target]`
    LdFld(FieldRefRc),
    /// Instance field address. `[target]`
    LdFlda(FieldRefRc),
    /// Instance field store. `[target, value]`
    StFld(FieldRefRc),
    /// Static field load. `[]`
    LdsFld(FieldRefRc),
    /// Static field address. `[]`
    LdsFlda(FieldRefRc),
    /// Static field store. `[value]`
    StsFld(FieldRefRc),
    /// Boxing conversion. `[argument]`
    Box(TsTypeRef),
    /// Unboxing conversion (`unbox.any`). `[argument]`
    UnboxAny(TsTypeRef),
    /// Checked reference cast. `[argument]`
    CastClass(TsTypeRef),
    /// Type test yielding null on mismatch. `[argument]`
    IsInst(TsTypeRef),
    /// Maps a string to the ordinal of a literal table entry, or -1.
    /// Synthesized by switch-on-string recovery. `[argument]`
    StringToInt(Vec<String>),
    /// Two-armed conditional. `[condition, then, else]`
    IfInstruction,
    /// Multi-way dispatch over an integer. `[value, sections...]`
    SwitchInstruction,
    /// One switch section with its label set. `[body]`
    SwitchSection(LabelSet),
    /// Unconditional jump to a block in an enclosing container. `[]`
    Branch(InstrId),
    /// Exit the referenced container, optionally carrying a return value.
    /// `[]` or `[value]`
    Leave(InstrId),
    /// Return from the function. `[]` or `[value]`
    Return,
    /// Raise an exception. `[exception]`
    Throw,
    /// Re-raise inside a handler. `[]`
    Rethrow,
    /// Straight-line instruction sequence ended by a control-flow transfer.
    /// `[instructions...]`
    Block {
        /// Number of live branches targeting this block.
        incoming_edge_count: u32,
    },
    /// Region of blocks; the first child is the entry point and control
    /// leaves only via `Leave` targeting this container. `[blocks...]`
    BlockContainer(ContainerKind),
    /// Protected region with catch handlers. `[try, handlers...]`
    TryCatch,
    /// One catch handler; the filter child is `ldc.i4 1` for unfiltered
    /// catches. `[filter, body]`
    CatchHandler {
        /// Receives the caught exception object.
        variable: VarId,
        /// The caught type; `System.Object` when catching everything.
        exception_type: TsTypeRef,
    },
    /// Protected region with a finally handler. `[try, finally]`
    TryFinally,
    /// Protected region with a fault handler (runs only on exceptional
    /// exit, then rethrows). `[try, fault]`
    TryFault,
    /// Recovered `lock (object) { body }`. `[object, body]`
    LockInstruction,
    /// Recovered `using (variable = resource) { body }`. `[resource, body]`
    UsingInstruction(VarId),
    /// Recovered `value ?? fallback`. `[value, fallback]`
    NullCoalescing,
    /// Recovered `target?.member` access: the access child evaluates only
    /// when the target is non-null, otherwise the result is null.
    /// `[target, access]`
    NullConditional,
}

impl InstrKind {
    /// `true` for the kinds that end a block.
    #[must_use]
    pub fn is_unconditional_transfer(&self) -> bool {
        matches!(
            self,
            Self::Branch(_) | Self::Leave(_) | Self::Return | Self::Throw | Self::Rethrow
        )
    }
}

/// A set of `i64` switch labels, stored as sorted disjoint inclusive
/// intervals with an inversion flag so the complement of any set (the
/// "default" labels) is representable exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    intervals: Vec<(i64, i64)>,
    inverted: bool,
}

impl LabelSet {
    /// The empty set.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            intervals: Vec::new(),
            inverted: false,
        }
    }

    /// The full integer range.
    #[must_use]
    pub fn full() -> Self {
        Self {
            intervals: Vec::new(),
            inverted: true,
        }
    }

    /// A single label.
    #[must_use]
    pub fn single(value: i64) -> Self {
        Self {
            intervals: vec![(value, value)],
            inverted: false,
        }
    }

    /// A set from arbitrary values.
    #[must_use]
    pub fn from_values(values: &[i64]) -> Self {
        let mut sorted: Vec<i64> = values.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut intervals: Vec<(i64, i64)> = Vec::new();
        for value in sorted {
            match intervals.last_mut() {
                Some((_, hi)) if *hi != i64::MAX && *hi + 1 == value => *hi = value,
                _ => intervals.push((value, value)),
            }
        }
        Self {
            intervals,
            inverted: false,
        }
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, value: i64) -> bool {
        let inside = self
            .intervals
            .iter()
            .any(|&(lo, hi)| lo <= value && value <= hi);
        inside != self.inverted
    }

    /// `true` when no value is a member.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        if self.inverted {
            covers_everything(&self.intervals)
        } else {
            self.intervals.is_empty()
        }
    }

    /// `true` when every value is a member.
    #[must_use]
    pub fn is_full(&self) -> bool {
        if self.inverted {
            self.intervals.is_empty()
        } else {
            covers_everything(&self.intervals)
        }
    }

    /// Set complement.
    #[must_use]
    pub fn complement(&self) -> Self {
        Self {
            intervals: self.intervals.clone(),
            inverted: !self.inverted,
        }
    }

    /// Set union.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        match (self.inverted, other.inverted) {
            (false, false) => Self {
                intervals: union_lists(&self.intervals, &other.intervals),
                inverted: false,
            },
            // ¬A ∪ B = ¬(A ∖ B)
            (true, false) => Self {
                intervals: subtract_lists(&self.intervals, &other.intervals),
                inverted: true,
            },
            (false, true) => Self {
                intervals: subtract_lists(&other.intervals, &self.intervals),
                inverted: true,
            },
            // ¬A ∪ ¬B = ¬(A ∩ B)
            (true, true) => Self {
                intervals: intersect_lists(&self.intervals, &other.intervals),
                inverted: true,
            },
        }
    }

    /// Set intersection.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        self.complement()
            .union(&other.complement())
            .complement()
    }

    /// `true` when the two sets share no value.
    #[must_use]
    pub fn is_disjoint(&self, other: &Self) -> bool {
        self.intersect(other).is_empty()
    }

    /// The members, when the set is finite and non-inverted. Used by tests
    /// and by the switch-on-string recognizers.
    #[must_use]
    pub fn values(&self) -> Option<Vec<i64>> {
        if self.inverted {
            return None;
        }
        let mut values = Vec::new();
        for &(lo, hi) in &self.intervals {
            if hi.wrapping_sub(lo) as u64 > 1_000_000 {
                return None;
            }
            values.extend(lo..=hi);
        }
        Some(values)
    }
}

fn covers_everything(intervals: &[(i64, i64)]) -> bool {
    intervals == [(i64::MIN, i64::MAX)]
}

/// Union of two sorted disjoint interval lists.
fn union_lists(a: &[(i64, i64)], b: &[(i64, i64)]) -> Vec<(i64, i64)> {
    let mut merged: Vec<(i64, i64)> = Vec::with_capacity(a.len() + b.len());
    let mut all: Vec<(i64, i64)> = a.iter().chain(b.iter()).copied().collect();
    all.sort_unstable();
    for (lo, hi) in all {
        match merged.last_mut() {
            Some((_, last_hi)) if *last_hi >= lo.saturating_sub(1) => {
                *last_hi = (*last_hi).max(hi);
            }
            _ => merged.push((lo, hi)),
        }
    }
    merged
}

/// Intersection of two sorted disjoint interval lists.
fn intersect_lists(a: &[(i64, i64)], b: &[(i64, i64)]) -> Vec<(i64, i64)> {
    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let lo = a[i].0.max(b[j].0);
        let hi = a[i].1.min(b[j].1);
        if lo <= hi {
            result.push((lo, hi));
        }
        if a[i].1 < b[j].1 {
            i += 1;
        } else {
            j += 1;
        }
    }
    result
}

/// `a ∖ b` over sorted disjoint interval lists.
fn subtract_lists(a: &[(i64, i64)], b: &[(i64, i64)]) -> Vec<(i64, i64)> {
    intersect_lists(a, &complement_list(b))
}

/// Complement of a sorted disjoint interval list, as a plain list.
fn complement_list(intervals: &[(i64, i64)]) -> Vec<(i64, i64)> {
    let mut result = Vec::with_capacity(intervals.len() + 1);
    let mut next = Some(i64::MIN);
    for &(lo, hi) in intervals {
        if let Some(start) = next {
            if start < lo {
                result.push((start, lo - 1));
            }
        }
        next = if hi == i64::MAX { None } else { Some(hi + 1) };
    }
    if let Some(start) = next {
        result.push((start, i64::MAX));
    }
    result
}
