//! Pattern primitives: the `match_*` predicate family.
//!
//! Every transform pass recognizes compiler idioms through these predicates.
//! They never mutate; on success they return the bound sub-instructions,
//! variables, or constants, and on mismatch they return `None`/`false` -
//! pattern failure is expected control flow, not an error.

use crate::{
    il::{
        function::ILFunction,
        instruction::{Comparison, InstrId, InstrKind},
        variable::VarId,
    },
    typesystem::{FieldRefRc, TsTypeRef},
};

impl ILFunction {
    /// `ldloc v` - binds the variable.
    #[must_use]
    pub fn match_ldloc(&self, id: InstrId) -> Option<VarId> {
        match *self.kind(id) {
            InstrKind::LdLoc(var) => Some(var),
            _ => None,
        }
    }

    /// `ldloc v` for a specific variable.
    #[must_use]
    pub fn match_ldloc_var(&self, id: InstrId, var: VarId) -> bool {
        self.match_ldloc(id) == Some(var)
    }

    /// `stloc v(value)` - binds the variable and the stored value.
    #[must_use]
    pub fn match_stloc(&self, id: InstrId) -> Option<(VarId, InstrId)> {
        match *self.kind(id) {
            InstrKind::StLoc(var) => Some((var, self.child(id, 0))),
            _ => None,
        }
    }

    /// `ldloca v` - binds the variable.
    #[must_use]
    pub fn match_ldloca(&self, id: InstrId) -> Option<VarId> {
        match *self.kind(id) {
            InstrKind::LdLoca(var) => Some(var),
            _ => None,
        }
    }

    /// `ldnull`.
    #[must_use]
    pub fn match_ldnull(&self, id: InstrId) -> bool {
        matches!(self.kind(id), InstrKind::LdNull)
    }

    /// `ldstr "..."` - binds the literal.
    #[must_use]
    pub fn match_ldstr(&self, id: InstrId) -> Option<&str> {
        match self.kind(id) {
            InstrKind::LdStr(value) => Some(value),
            _ => None,
        }
    }

    /// `ldc.i4 n` - binds the constant.
    #[must_use]
    pub fn match_ldc_i4(&self, id: InstrId) -> Option<i32> {
        match *self.kind(id) {
            InstrKind::LdcI4(value) => Some(value),
            _ => None,
        }
    }

    /// `ldc.i4` with a specific value.
    #[must_use]
    pub fn match_ldc_i4_const(&self, id: InstrId, expected: i32) -> bool {
        self.match_ldc_i4(id) == Some(expected)
    }

    /// `br target` - binds the target block.
    #[must_use]
    pub fn match_branch(&self, id: InstrId) -> Option<InstrId> {
        match *self.kind(id) {
            InstrKind::Branch(target) => Some(target),
            _ => None,
        }
    }

    /// `leave container` for a specific container - binds the optional
    /// return value.
    #[must_use]
    pub fn match_leave(&self, id: InstrId, container: InstrId) -> Option<Option<InstrId>> {
        match *self.kind(id) {
            InstrKind::Leave(target) if target == container => {
                Some(self.children(id).first().copied())
            }
            _ => None,
        }
    }

    /// `nop`.
    #[must_use]
    pub fn match_nop(&self, id: InstrId) -> bool {
        matches!(self.kind(id), InstrKind::Nop)
    }

    /// `if (cond) then` - requires the else branch to be a no-op
    /// fallthrough. Binds condition and then-branch.
    #[must_use]
    pub fn match_if_instruction(&self, id: InstrId) -> Option<(InstrId, InstrId)> {
        match self.kind(id) {
            InstrKind::IfInstruction if self.match_nop(self.child(id, 2)) => {
                Some((self.child(id, 0), self.child(id, 1)))
            }
            _ => None,
        }
    }

    /// `comp.eq(l, r)` - binds both operands.
    #[must_use]
    pub fn match_comp_equals(&self, id: InstrId) -> Option<(InstrId, InstrId)> {
        match self.kind(id) {
            InstrKind::Comp(Comparison::Equals) => Some((self.child(id, 0), self.child(id, 1))),
            _ => None,
        }
    }

    /// `comp.ne(l, r)` - binds both operands.
    #[must_use]
    pub fn match_comp_not_equals(&self, id: InstrId) -> Option<(InstrId, InstrId)> {
        match self.kind(id) {
            InstrKind::Comp(Comparison::NotEquals) => {
                Some((self.child(id, 0), self.child(id, 1)))
            }
            _ => None,
        }
    }

    /// `logic.not(arg)` - binds the argument.
    #[must_use]
    pub fn match_logic_not(&self, id: InstrId) -> Option<InstrId> {
        match self.kind(id) {
            InstrKind::LogicNot => Some(self.child(id, 0)),
            _ => None,
        }
    }

    /// `ldobj type(target)` - binds target and type.
    #[must_use]
    pub fn match_ldobj(&self, id: InstrId) -> Option<(InstrId, &TsTypeRef)> {
        match self.kind(id) {
            InstrKind::LdObj(ty) => Some((self.child(id, 0), ty)),
            _ => None,
        }
    }

    /// `stobj type(target, value)` - binds target, value and type.
    #[must_use]
    pub fn match_stobj(&self, id: InstrId) -> Option<(InstrId, InstrId, &TsTypeRef)> {
        match self.kind(id) {
            InstrKind::StObj(ty) => Some((self.child(id, 0), self.child(id, 1), ty)),
            _ => None,
        }
    }

    /// `ldsflda field` - binds the field.
    #[must_use]
    pub fn match_ldsflda(&self, id: InstrId) -> Option<&FieldRefRc> {
        match self.kind(id) {
            InstrKind::LdsFlda(field) => Some(field),
            _ => None,
        }
    }

    /// `ldsfld field` - binds the field.
    #[must_use]
    pub fn match_ldsfld(&self, id: InstrId) -> Option<&FieldRefRc> {
        match self.kind(id) {
            InstrKind::LdsFld(field) => Some(field),
            _ => None,
        }
    }

    /// `box type(value)` - binds value and type.
    #[must_use]
    pub fn match_box(&self, id: InstrId) -> Option<(InstrId, &TsTypeRef)> {
        match self.kind(id) {
            InstrKind::Box(ty) => Some((self.child(id, 0), ty)),
            _ => None,
        }
    }

    /// `unbox.any type(value)` - binds value and type.
    #[must_use]
    pub fn match_unbox_any(&self, id: InstrId) -> Option<(InstrId, &TsTypeRef)> {
        match self.kind(id) {
            InstrKind::UnboxAny(ty) => Some((self.child(id, 0), ty)),
            _ => None,
        }
    }

    /// Structural equality of two subtrees: same kinds, same bindings, same
    /// shapes. Branch targets must be identical blocks.
    #[must_use]
    pub fn matches_pattern(&self, a: InstrId, b: InstrId) -> bool {
        if !kinds_equal(self.kind(a), self.kind(b)) {
            return false;
        }
        let children_a = self.children(a);
        let children_b = self.children(b);
        children_a.len() == children_b.len()
            && children_a
                .iter()
                .zip(children_b)
                .all(|(&child_a, &child_b)| self.matches_pattern(child_a, child_b))
    }
}

/// Kind-tag equality including bindings, ignoring children.
fn kinds_equal(a: &InstrKind, b: &InstrKind) -> bool {
    use InstrKind as K;
    match (a, b) {
        (K::Nop, K::Nop)
        | (K::Pop, K::Pop)
        | (K::LdNull, K::LdNull)
        | (K::Return, K::Return)
        | (K::Throw, K::Throw)
        | (K::Rethrow, K::Rethrow)
        | (K::IfInstruction, K::IfInstruction)
        | (K::SwitchInstruction, K::SwitchInstruction)
        | (K::LogicNot, K::LogicNot)
        | (K::TryCatch, K::TryCatch)
        | (K::TryFinally, K::TryFinally)
        | (K::TryFault, K::TryFault)
        | (K::LockInstruction, K::LockInstruction)
        | (K::NullCoalescing, K::NullCoalescing)
        | (K::NullConditional, K::NullConditional) => true,
        (K::LdcI4(x), K::LdcI4(y)) => x == y,
        (K::LdcI8(x), K::LdcI8(y)) => x == y,
        (K::LdcR8(x), K::LdcR8(y)) => x.to_bits() == y.to_bits(),
        (K::LdStr(x), K::LdStr(y)) => x == y,
        (K::DefaultValue(x), K::DefaultValue(y)) => x == y,
        (K::LdLoc(x), K::LdLoc(y))
        | (K::LdLoca(x), K::LdLoca(y))
        | (K::StLoc(x), K::StLoc(y))
        | (K::UsingInstruction(x), K::UsingInstruction(y)) => x == y,
        (K::BinaryOp(x), K::BinaryOp(y)) => x == y,
        (K::UnaryOp(x), K::UnaryOp(y)) => x == y,
        (K::Comp(x), K::Comp(y)) => x == y,
        (K::Conv(x), K::Conv(y)) => x == y,
        (K::Call(x), K::Call(y)) | (K::CallVirt(x), K::CallVirt(y)) | (K::NewObj(x), K::NewObj(y)) => {
            method_refs_equal(x, y)
        }
        (K::LdObj(x), K::LdObj(y)) | (K::StObj(x), K::StObj(y)) => x == y,
        (K::Box(x), K::Box(y))
        | (K::UnboxAny(x), K::UnboxAny(y))
        | (K::CastClass(x), K::CastClass(y))
        | (K::IsInst(x), K::IsInst(y)) => x == y,
        (K::LdFld(x), K::LdFld(y))
        | (K::LdFlda(x), K::LdFlda(y))
        | (K::StFld(x), K::StFld(y))
        | (K::LdsFld(x), K::LdsFld(y))
        | (K::LdsFlda(x), K::LdsFlda(y))
        | (K::StsFld(x), K::StsFld(y)) => x == y,
        (K::StringToInt(x), K::StringToInt(y)) => x == y,
        (K::SwitchSection(x), K::SwitchSection(y)) => x == y,
        (K::Branch(x), K::Branch(y)) | (K::Leave(x), K::Leave(y)) => x == y,
        (K::Block { .. }, K::Block { .. }) => true,
        (K::BlockContainer(x), K::BlockContainer(y)) => x == y,
        (
            K::CatchHandler {
                variable: var_a,
                exception_type: ty_a,
            },
            K::CatchHandler {
                variable: var_b,
                exception_type: ty_b,
            },
        ) => var_a == var_b && ty_a == ty_b,
        _ => false,
    }
}

/// Call targets compare by declaring type, name and signature.
fn method_refs_equal(
    a: &crate::typesystem::MethodRefRc,
    b: &crate::typesystem::MethodRefRc,
) -> bool {
    a.declaring_type == b.declaring_type && a.name == b.name && a.signature == b.signature
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{instruction::InstrKind as K, variable::VariableKind};

    #[test]
    fn test_simple_matchers() {
        let mut function = ILFunction::new(None);
        let var = function.add_variable(VariableKind::Local, 0, None);
        let value = function.create(K::LdcI4(42), vec![]).unwrap();
        let store = function.create(K::StLoc(var), vec![value]).unwrap();

        assert_eq!(function.match_stloc(store), Some((var, value)));
        assert_eq!(function.match_ldc_i4(value), Some(42));
        assert!(function.match_ldc_i4_const(value, 42));
        assert!(!function.match_ldc_i4_const(value, 41));
        assert!(function.match_ldloc(store).is_none());
        function.discard(store).unwrap();
    }

    #[test]
    fn test_if_requires_nop_else() {
        let mut function = ILFunction::new(None);
        let cond = function.create(K::LdcI4(1), vec![]).unwrap();
        let then_branch = function.create(K::Return, vec![]).unwrap();
        let else_branch = function.create(K::Nop, vec![]).unwrap();
        let if_instr = function
            .create(K::IfInstruction, vec![cond, then_branch, else_branch])
            .unwrap();

        assert_eq!(
            function.match_if_instruction(if_instr),
            Some((cond, then_branch))
        );

        // Replace the else with a real instruction: no longer a match.
        let detached = function.detach_child(if_instr, 2).unwrap();
        function.discard(detached).unwrap();
        let else_ret = function.create(K::Return, vec![]).unwrap();
        function.insert_child(if_instr, 2, else_ret).unwrap();
        assert!(function.match_if_instruction(if_instr).is_none());
        function.discard(if_instr).unwrap();
    }

    #[test]
    fn test_structural_pattern_match() {
        let mut function = ILFunction::new(None);
        let var = function.add_variable(VariableKind::Local, 0, None);

        let left = {
            let load = function.create(K::LdLoc(var), vec![]).unwrap();
            let null = function.create(K::LdNull, vec![]).unwrap();
            function
                .create(K::Comp(Comparison::Equals), vec![load, null])
                .unwrap()
        };
        let right = {
            let load = function.create(K::LdLoc(var), vec![]).unwrap();
            let null = function.create(K::LdNull, vec![]).unwrap();
            function
                .create(K::Comp(Comparison::Equals), vec![load, null])
                .unwrap()
        };
        assert!(function.matches_pattern(left, right));

        let different = {
            let load = function.create(K::LdLoc(var), vec![]).unwrap();
            let zero = function.create(K::LdcI4(0), vec![]).unwrap();
            function
                .create(K::Comp(Comparison::Equals), vec![load, zero])
                .unwrap()
        };
        assert!(!function.matches_pattern(left, different));

        for id in [left, right, different] {
            function.discard(id).unwrap();
        }
    }
}
