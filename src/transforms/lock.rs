//! Lock-statement recovery.
//!
//! Recognizes the three shapes compilers lower `lock (x) { ... }` into and
//! rewrites them to a single `LockInstruction`:
//!
//! 1. *Legacy v2*: `stloc obj(x); call Monitor.Enter(obj);
//!    try { body } finally { Monitor.Exit(obj) }`.
//! 2. *v4*: a bool guard taken by `Monitor.Enter(obj, ref flag)` with the
//!    object stored inside the protected region, so `Exit` is skipped when
//!    an abort lands before the lock was taken.
//! 3. *Roslyn*: like v4 but the object is stored first, before the flag.
//!
//! Each recognizer demands the exact pattern - a single extra instruction
//! anywhere in the region makes it fail and leaves the input untouched. On
//! success the setup stores are removed and the guard variable is fully
//! eliminated.

use crate::{
    il::{ILFunction, InstrId, InstrKind, VarId},
    transforms::{context::TransformContext, IlTransform},
    typesystem::MethodRefRc,
    Result,
};

/// Recovers `lock` statements. Gated by the `LockStatement` setting.
pub struct LockTransform;

impl IlTransform for LockTransform {
    fn name(&self) -> &'static str {
        "LockTransform"
    }

    fn run(&self, function: &mut ILFunction, ctx: &TransformContext) -> Result<bool> {
        if !ctx.settings.lock_statement {
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
            // Last to first, so a firing recognizer may consume the
            // instructions before the position without invalidating `index`.
            let mut index = function.children(block).len();
            while index > 0 {
                index -= 1;
                if index >= function.children(block).len() {
                    continue;
                }
                let fired = try_legacy_v2(function, block, index)?
                    || try_v4(function, block, index)?
                    || try_roslyn(function, block, index)?;
                changed |= fired;
            }
        }
        Ok(changed)
    }
}

/// `call Monitor.Enter/Exit` with the given argument count.
fn match_monitor_call(
    function: &ILFunction,
    id: InstrId,
    name: &str,
    argc: usize,
) -> Option<MethodRefRc> {
    match function.kind(id) {
        InstrKind::Call(method)
            if method.matches_member("System.Threading", "Monitor", name)
                && function.children(id).len() == argc =>
        {
            Some(method.clone())
        }
        _ => None,
    }
}

fn match_try_finally(function: &ILFunction, id: InstrId) -> Option<(InstrId, InstrId)> {
    match function.kind(id) {
        InstrKind::TryFinally => Some((function.child(id, 0), function.child(id, 1))),
        _ => None,
    }
}

/// `finally { Monitor.Exit(obj) }` - exactly one call and the leave.
fn match_plain_exit(function: &ILFunction, finally: InstrId, obj: VarId) -> bool {
    let blocks = function.children(finally);
    let [block] = blocks else { return false };
    let instrs = function.children(*block);
    let [exit_call, leave] = instrs else {
        return false;
    };
    if match_monitor_call(function, *exit_call, "Exit", 1).is_none() {
        return false;
    }
    if !function.match_ldloc_var(function.child(*exit_call, 0), obj) {
        return false;
    }
    matches!(function.match_leave(*leave, finally), Some(None))
}

/// `finally { if (flag) Monitor.Exit(obj) }` in its folded form.
fn match_guarded_exit(
    function: &ILFunction,
    finally: InstrId,
    flag: VarId,
    obj: VarId,
) -> bool {
    let blocks = function.children(finally);
    let [block] = blocks else { return false };
    let instrs = function.children(*block);
    let [if_instr, leave] = instrs else {
        return false;
    };
    if !matches!(function.match_leave(*leave, finally), Some(None)) {
        return false;
    }
    let Some((condition, then_arm)) = function.match_if_instruction(*if_instr) else {
        return false;
    };
    if !function.match_ldloc_var(condition, flag) {
        return false;
    }
    // then: Block[call Exit(ldloc obj), leave finally]
    if !matches!(function.kind(then_arm), InstrKind::Block { .. }) {
        return false;
    }
    let arm = function.children(then_arm);
    let [exit_call, inner_leave] = arm else {
        return false;
    };
    if match_monitor_call(function, *exit_call, "Exit", 1).is_none() {
        return false;
    }
    if !function.match_ldloc_var(function.child(*exit_call, 0), obj) {
        return false;
    }
    matches!(function.match_leave(*inner_leave, finally), Some(None))
}

/// The lock object must be a throwaway single-definition temporary used
/// exactly by Enter and Exit.
fn lock_var_usable(function: &ILFunction, obj: VarId) -> bool {
    let variable = function.variable(obj);
    variable.is_single_definition() && variable.load_count() == 2 && variable.address_count() == 0
}

/// The v4/Roslyn guard: stored once, read by the finally, address taken by
/// Enter.
fn flag_var_usable(function: &ILFunction, flag: VarId) -> bool {
    let variable = function.variable(flag);
    variable.store_count() == 1 && variable.load_count() == 1 && variable.address_count() == 1
}

/// Shape 1: `stloc obj(x); call Enter(obj); try { body } finally { Exit(obj) }`.
fn try_legacy_v2(function: &mut ILFunction, block: InstrId, index: usize) -> Result<bool> {
    let children = function.children(block);
    if index + 2 >= children.len() {
        return Ok(false);
    }
    let store_obj = children[index];
    let enter = children[index + 1];
    let try_finally = children[index + 2];

    let Some((obj, _)) = function.match_stloc(store_obj) else {
        return Ok(false);
    };
    if match_monitor_call(function, enter, "Enter", 1).is_none() {
        return Ok(false);
    }
    if !function.match_ldloc_var(function.child(enter, 0), obj) {
        return Ok(false);
    }
    let Some((try_body, finally)) = match_try_finally(function, try_finally) else {
        return Ok(false);
    };
    if !lock_var_usable(function, obj) || !match_plain_exit(function, finally, obj) {
        return Ok(false);
    }

    let value = function.detach_child(store_obj, 0)?;
    let body = function.detach_child(try_finally, 0)?;
    debug_assert_eq!(body, try_body);
    let lock_instr = function.create(InstrKind::LockInstruction, vec![value, body])?;
    function.replace(try_finally, lock_instr)?;
    function.discard(try_finally)?;
    function.discard(enter)?;
    function.discard(store_obj)?;
    Ok(true)
}

/// Shape 2: `stloc flag(0); try { Enter(stloc obj(x), ref flag); body }
/// finally { if (flag) Exit(obj) }`.
fn try_v4(function: &mut ILFunction, block: InstrId, index: usize) -> Result<bool> {
    let children = function.children(block);
    if index + 1 >= children.len() {
        return Ok(false);
    }
    let store_flag = children[index];
    let try_finally = children[index + 1];

    let Some((flag, flag_value)) = function.match_stloc(store_flag) else {
        return Ok(false);
    };
    if !function.match_ldc_i4_const(flag_value, 0) {
        return Ok(false);
    }
    let Some((try_body, finally)) = match_try_finally(function, try_finally) else {
        return Ok(false);
    };

    // The protected region starts by storing the object and taking the lock.
    let Some(&entry) = function.children(try_body).first() else {
        return Ok(false);
    };
    let entry_instrs = function.children(entry);
    if entry_instrs.len() < 3 {
        return Ok(false);
    }
    let store_obj = entry_instrs[0];
    let enter = entry_instrs[1];
    let Some((obj, _)) = function.match_stloc(store_obj) else {
        return Ok(false);
    };
    if !match_enter_with_flag(function, enter, obj, flag) {
        return Ok(false);
    }
    if !lock_var_usable(function, obj)
        || !flag_var_usable(function, flag)
        || !match_guarded_exit(function, finally, flag, obj)
    {
        return Ok(false);
    }

    let value = function.detach_child(store_obj, 0)?;
    function.discard(enter)?;
    function.discard(store_obj)?;
    let body = function.detach_child(try_finally, 0)?;
    let lock_instr = function.create(InstrKind::LockInstruction, vec![value, body])?;
    function.replace(try_finally, lock_instr)?;
    function.discard(try_finally)?;
    function.discard(store_flag)?;
    Ok(true)
}

/// Shape 3: `stloc obj(x); stloc flag(0); try { Enter(obj, ref flag); body }
/// finally { if (flag) Exit(obj) }`.
fn try_roslyn(function: &mut ILFunction, block: InstrId, index: usize) -> Result<bool> {
    let children = function.children(block);
    if index + 2 >= children.len() {
        return Ok(false);
    }
    let store_obj = children[index];
    let store_flag = children[index + 1];
    let try_finally = children[index + 2];

    let Some((obj, _)) = function.match_stloc(store_obj) else {
        return Ok(false);
    };
    let Some((flag, flag_value)) = function.match_stloc(store_flag) else {
        return Ok(false);
    };
    if !function.match_ldc_i4_const(flag_value, 0) {
        return Ok(false);
    }
    let Some((try_body, finally)) = match_try_finally(function, try_finally) else {
        return Ok(false);
    };
    let Some(&entry) = function.children(try_body).first() else {
        return Ok(false);
    };
    let Some(&enter) = function.children(entry).first() else {
        return Ok(false);
    };
    if !match_enter_with_flag(function, enter, obj, flag) {
        return Ok(false);
    }
    if !lock_var_usable(function, obj)
        || !flag_var_usable(function, flag)
        || !match_guarded_exit(function, finally, flag, obj)
    {
        return Ok(false);
    }

    let value = function.detach_child(store_obj, 0)?;
    function.discard(enter)?;
    let body = function.detach_child(try_finally, 0)?;
    let lock_instr = function.create(InstrKind::LockInstruction, vec![value, body])?;
    function.replace(try_finally, lock_instr)?;
    function.discard(try_finally)?;
    function.discard(store_flag)?;
    function.discard(store_obj)?;
    Ok(true)
}

/// `call Monitor.Enter(ldloc obj, ldloca flag)`.
fn match_enter_with_flag(
    function: &ILFunction,
    id: InstrId,
    obj: VarId,
    flag: VarId,
) -> bool {
    if match_monitor_call(function, id, "Enter", 2).is_none() {
        return false;
    }
    function.match_ldloc_var(function.child(id, 0), obj)
        && function.match_ldloca(function.child(id, 1)) == Some(flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{ContainerKind, InstrKind as K, VariableKind};
    use crate::settings::DecompilerSettings;
    use crate::typesystem::{
        MethodRef, MethodSignature, MethodTarget, PrimitiveKind, TsType,
        TypeParameterSubstitution, UnknownType,
    };
    use std::sync::Arc;

    fn monitor_method(name: &str, params: usize) -> MethodRefRc {
        let object = TsType::primitive(PrimitiveKind::Object);
        let bool_ref = Arc::new(TsType::ByReference(TsType::primitive(
            PrimitiveKind::Boolean,
        )));
        let mut parameters = vec![object.clone()];
        if params == 2 {
            parameters.push(bool_ref);
        }
        Arc::new(MethodRef {
            target: MethodTarget::Fake,
            declaring_type: Arc::new(TsType::Unknown(UnknownType {
                namespace: "System.Threading".into(),
                name: "Monitor".into(),
                arity: 0,
            })),
            name: name.into(),
            signature: MethodSignature::simple(
                TsType::primitive(PrimitiveKind::Void),
                parameters,
            ),
            substitution: TypeParameterSubstitution::identity(),
            vararg_instance: false,
        })
    }

    fn foo_method() -> MethodRefRc {
        Arc::new(MethodRef {
            target: MethodTarget::Fake,
            declaring_type: Arc::new(TsType::Unknown(UnknownType {
                namespace: "My".into(),
                name: "App".into(),
                arity: 0,
            })),
            name: "Foo".into(),
            signature: MethodSignature::simple(TsType::primitive(PrimitiveKind::Void), vec![]),
            substitution: TypeParameterSubstitution::identity(),
            vararg_instance: false,
        })
    }

    struct RoslynLock {
        function: ILFunction,
        block: InstrId,
        obj: VarId,
        flag: VarId,
        try_finally: InstrId,
        try_container: InstrId,
        finally_block: InstrId,
    }

    /// Builds the canonical Roslyn shape:
    /// `stloc obj(ldloc x); stloc flag(0);
    ///  try { Enter(obj, ref flag); Foo(); leave } finally { if (flag) Exit(obj); leave }`
    fn build_roslyn() -> RoslynLock {
        let mut f = ILFunction::new(None);
        let root = f.root();
        let x = f.add_variable(VariableKind::Parameter, 0, None);
        let obj = f.add_variable(VariableKind::StackSlot, 0, None);
        let flag = f.add_variable(VariableKind::Local, 0, None);

        let block = f
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        f.push_child(root, block).unwrap();

        let load_x = f.create(K::LdLoc(x), vec![]).unwrap();
        let store_obj = f.create(K::StLoc(obj), vec![load_x]).unwrap();
        f.push_child(block, store_obj).unwrap();
        let zero = f.create(K::LdcI4(0), vec![]).unwrap();
        let store_flag = f.create(K::StLoc(flag), vec![zero]).unwrap();
        f.push_child(block, store_flag).unwrap();

        // try container
        let try_container = f
            .create(K::BlockContainer(ContainerKind::Normal), vec![])
            .unwrap();
        let try_block = f
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        f.push_child(try_container, try_block).unwrap();
        let enter_obj = f.create(K::LdLoc(obj), vec![]).unwrap();
        let enter_flag = f.create(K::LdLoca(flag), vec![]).unwrap();
        let enter = f
            .create(K::Call(monitor_method("Enter", 2)), vec![enter_obj, enter_flag])
            .unwrap();
        f.push_child(try_block, enter).unwrap();
        let body_call = f.create(K::Call(foo_method()), vec![]).unwrap();
        f.push_child(try_block, body_call).unwrap();
        let leave_try = f.create(K::Leave(try_container), vec![]).unwrap();
        f.push_child(try_block, leave_try).unwrap();

        // finally container
        let finally_container = f
            .create(K::BlockContainer(ContainerKind::Normal), vec![])
            .unwrap();
        let finally_block = f
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        f.push_child(finally_container, finally_block).unwrap();
        let guard = f.create(K::LdLoc(flag), vec![]).unwrap();
        let exit_obj = f.create(K::LdLoc(obj), vec![]).unwrap();
        let exit = f
            .create(K::Call(monitor_method("Exit", 1)), vec![exit_obj])
            .unwrap();
        let inner_leave = f.create(K::Leave(finally_container), vec![]).unwrap();
        let then_arm = f
            .create(K::Block { incoming_edge_count: 0 }, vec![exit, inner_leave])
            .unwrap();
        let else_arm = f.create(K::Nop, vec![]).unwrap();
        let if_instr = f
            .create(K::IfInstruction, vec![guard, then_arm, else_arm])
            .unwrap();
        f.push_child(finally_block, if_instr).unwrap();
        let leave_finally = f.create(K::Leave(finally_container), vec![]).unwrap();
        f.push_child(finally_block, leave_finally).unwrap();

        let try_finally = f
            .create(K::TryFinally, vec![try_container, finally_container])
            .unwrap();
        f.push_child(block, try_finally).unwrap();
        let leave_root = f.create(K::Leave(root), vec![]).unwrap();
        f.push_child(block, leave_root).unwrap();

        f.check_invariants().unwrap();
        RoslynLock {
            function: f,
            block,
            obj,
            flag,
            try_finally,
            try_container,
            finally_block,
        }
    }

    #[test]
    fn test_roslyn_lock_recovered() {
        let mut built = build_roslyn();
        let ctx = TransformContext::new(DecompilerSettings::default());
        assert!(LockTransform.run(&mut built.function, &ctx).unwrap());
        let f = &built.function;
        f.check_invariants().unwrap();

        // Block now holds [lock, leave].
        assert_eq!(f.children(built.block).len(), 2);
        let lock_instr = f.child(built.block, 0);
        assert!(matches!(f.kind(lock_instr), K::LockInstruction));
        // The lock value is the original `ldloc x` and the body is the try
        // container with Enter removed.
        assert!(f.match_ldloc(f.child(lock_instr, 0)).is_some());
        assert_eq!(f.child(lock_instr, 1), built.try_container);
        let body_entry = f.children(built.try_container)[0];
        assert!(matches!(
            f.kind(f.children(body_entry)[0]),
            K::Call(method) if method.name == "Foo"
        ));

        // The guard and object temporaries are fully eliminated.
        for var in [built.obj, built.flag] {
            let variable = f.variable(var);
            assert_eq!(variable.load_count(), 0);
            assert_eq!(variable.store_count(), 0);
            assert_eq!(variable.address_count(), 0);
        }
    }

    #[test]
    fn test_extra_instruction_blocks_recovery() {
        let mut built = build_roslyn();
        // Add one instruction inside the finally guard region.
        let f = &mut built.function;
        let stray = f.create(K::Call(foo_method()), vec![]).unwrap();
        f.insert_child(built.finally_block, 1, stray).unwrap();
        f.check_invariants().unwrap();

        let ctx = TransformContext::new(DecompilerSettings::default());
        assert!(!LockTransform.run(f, &ctx).unwrap());
        // Untouched: the try-finally survives.
        assert!(!f.is_dead(built.try_finally));
        assert!(matches!(f.kind(built.try_finally), K::TryFinally));
        f.check_invariants().unwrap();
    }

    #[test]
    fn test_setting_gate() {
        let mut built = build_roslyn();
        let ctx =
            TransformContext::new(DecompilerSettings::default().with_lock_statement(false));
        assert!(!LockTransform.run(&mut built.function, &ctx).unwrap());
        assert!(matches!(
            built.function.kind(built.try_finally),
            K::TryFinally
        ));
    }

    #[test]
    fn test_legacy_v2_shape() {
        let mut f = ILFunction::new(None);
        let root = f.root();
        let x = f.add_variable(VariableKind::Parameter, 0, None);
        let obj = f.add_variable(VariableKind::StackSlot, 0, None);

        let block = f
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        f.push_child(root, block).unwrap();

        let load_x = f.create(K::LdLoc(x), vec![]).unwrap();
        let store_obj = f.create(K::StLoc(obj), vec![load_x]).unwrap();
        f.push_child(block, store_obj).unwrap();
        let enter_arg = f.create(K::LdLoc(obj), vec![]).unwrap();
        let enter = f
            .create(K::Call(monitor_method("Enter", 1)), vec![enter_arg])
            .unwrap();
        f.push_child(block, enter).unwrap();

        let try_container = f
            .create(K::BlockContainer(ContainerKind::Normal), vec![])
            .unwrap();
        let try_block = f
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        f.push_child(try_container, try_block).unwrap();
        let body_call = f.create(K::Call(foo_method()), vec![]).unwrap();
        f.push_child(try_block, body_call).unwrap();
        let leave_try = f.create(K::Leave(try_container), vec![]).unwrap();
        f.push_child(try_block, leave_try).unwrap();

        let finally_container = f
            .create(K::BlockContainer(ContainerKind::Normal), vec![])
            .unwrap();
        let finally_block = f
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap();
        f.push_child(finally_container, finally_block).unwrap();
        let exit_arg = f.create(K::LdLoc(obj), vec![]).unwrap();
        let exit = f
            .create(K::Call(monitor_method("Exit", 1)), vec![exit_arg])
            .unwrap();
        f.push_child(finally_block, exit).unwrap();
        let leave_finally = f.create(K::Leave(finally_container), vec![]).unwrap();
        f.push_child(finally_block, leave_finally).unwrap();

        let try_finally = f
            .create(K::TryFinally, vec![try_container, finally_container])
            .unwrap();
        f.push_child(block, try_finally).unwrap();
        let leave_root = f.create(K::Leave(root), vec![]).unwrap();
        f.push_child(block, leave_root).unwrap();
        f.check_invariants().unwrap();

        let ctx = TransformContext::new(DecompilerSettings::default());
        assert!(LockTransform.run(&mut f, &ctx).unwrap());
        f.check_invariants().unwrap();

        let lock_instr = f.child(block, 0);
        assert!(matches!(f.kind(lock_instr), K::LockInstruction));
        assert_eq!(f.variable(obj).load_count(), 0);
        assert_eq!(f.variable(obj).store_count(), 0);
    }
}
