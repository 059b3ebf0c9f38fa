//! Using-statement recovery.
//!
//! `using (var res = init) { body }` lowers to a resource store followed by
//! a try/finally whose finally disposes the resource - null-checked for
//! reference types, unconditionally (through the address) for value types.
//! The recognizer rewrites the pair into a single `UsingInstruction` that
//! keeps the resource variable alive for the body.

use crate::{
    il::{ILFunction, InstrId, InstrKind, VarId},
    transforms::{context::TransformContext, IlTransform},
    Result,
};

/// Recovers `using` statements. Gated by the `UsingStatement` setting.
pub struct UsingTransform;

impl IlTransform for UsingTransform {
    fn name(&self) -> &'static str {
        "UsingTransform"
    }

    fn run(&self, function: &mut ILFunction, ctx: &TransformContext) -> Result<bool> {
        if !ctx.settings.using_statement {
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
            let mut index = function.children(block).len();
            while index > 0 {
                index -= 1;
                if index >= function.children(block).len() {
                    continue;
                }
                changed |= try_using(function, block, index)?;
            }
        }
        Ok(changed)
    }
}

/// `stloc res(init); try { body } finally { dispose }`.
fn try_using(function: &mut ILFunction, block: InstrId, index: usize) -> Result<bool> {
    let children = function.children(block);
    if index + 1 >= children.len() {
        return Ok(false);
    }
    let store_res = children[index];
    let try_finally = children[index + 1];

    let Some((res, _)) = function.match_stloc(store_res) else {
        return Ok(false);
    };
    let InstrKind::TryFinally = function.kind(try_finally) else {
        return Ok(false);
    };
    let finally = function.child(try_finally, 1);
    if !match_dispose_finally(function, finally, res) {
        return Ok(false);
    }

    let init = function.detach_child(store_res, 0)?;
    let body = function.detach_child(try_finally, 0)?;
    let using = function.create(InstrKind::UsingInstruction(res), vec![init, body])?;
    function.replace(try_finally, using)?;
    function.discard(try_finally)?;
    function.discard(store_res)?;
    Ok(true)
}

/// The finally must be exactly the dispose pattern:
/// - reference types: `if (res) { res.Dispose(); leave } leave`
/// - value types: `Dispose(ldloca res); leave`
fn match_dispose_finally(function: &ILFunction, finally: InstrId, res: VarId) -> bool {
    let blocks = function.children(finally);
    let [block] = blocks else { return false };
    let instrs = function.children(*block);

    match instrs {
        // Unconditional dispose (value types, sealed non-null resources).
        [dispose, leave] if is_dispose_call(function, *dispose, res) => {
            matches!(function.match_leave(*leave, finally), Some(None))
        }
        // Null-guarded dispose.
        [if_instr, leave] => {
            if !matches!(function.match_leave(*leave, finally), Some(None)) {
                return false;
            }
            let Some((condition, then_arm)) = function.match_if_instruction(*if_instr) else {
                return false;
            };
            if !is_nonnull_check(function, condition, res) {
                return false;
            }
            if !matches!(function.kind(then_arm), InstrKind::Block { .. }) {
                return false;
            }
            let arm = function.children(then_arm);
            let [dispose, inner_leave] = arm else {
                return false;
            };
            is_dispose_call(function, *dispose, res)
                && matches!(function.match_leave(*inner_leave, finally), Some(None))
        }
        _ => false,
    }
}

/// `call`/`callvirt` of a parameterless instance `Dispose` on the resource.
fn is_dispose_call(function: &ILFunction, id: InstrId, res: VarId) -> bool {
    let method = match function.kind(id) {
        InstrKind::Call(method) | InstrKind::CallVirt(method) => method,
        _ => return false,
    };
    if method.name != "Dispose"
        || !method.has_this()
        || !method.signature.parameters.is_empty()
        || function.children(id).len() != 1
    {
        return false;
    }
    let target = function.child(id, 0);
    function.match_ldloc_var(target, res) || function.match_ldloca(target) == Some(res)
}

/// Truthiness of the resource reference, in any of the shapes the builder
/// and condition folding produce.
fn is_nonnull_check(function: &ILFunction, condition: InstrId, res: VarId) -> bool {
    if function.match_ldloc_var(condition, res) {
        return true;
    }
    if let Some((left, right)) = function.match_comp_not_equals(condition) {
        return function.match_ldloc_var(left, res) && function.match_ldnull(right);
    }
    if let Some(inner) = function.match_logic_not(condition) {
        if let Some((left, right)) = function.match_comp_equals(inner) {
            return function.match_ldloc_var(left, res) && function.match_ldnull(right);
        }
    }
    if let InstrKind::Comp(crate::il::Comparison::GreaterThanUn) = function.kind(condition) {
        let left = function.child(condition, 0);
        let right = function.child(condition, 1);
        return function.match_ldloc_var(left, res) && function.match_ldnull(right);
    }
    false
}
