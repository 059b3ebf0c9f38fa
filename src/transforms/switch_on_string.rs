//! Switch-on-string recovery.
//!
//! Compilers lower `switch` over strings four ways; each recognizer here
//! rebuilds the same high-level form: a `SwitchInstruction` dispatching on
//! a synthesized `StringToInt(value, literals)` whose sections map each
//! literal's ordinal to the original case target, with the complement label
//! set as the default.
//!
//! 1. *Cascading ifs* - a run of `if (s == "lit") goto case` tests over one
//!    variable (three or more to fire).
//! 2. *Legacy hashtable* - a lazily initialized static `Hashtable` mapping
//!    literals to boxed ints, dispatched through `get_Item`.
//! 3. *Legacy dictionary* - a lazily initialized static
//!    `Dictionary<string, int>` dispatched through `TryGetValue`, with an
//!    explicit null pre-check on the switch value.
//! 4. *Roslyn* - `ComputeStringHash` feeding an integer switch whose
//!    sections re-check candidate literals for equality.
//!
//! Every recognizer verifies: involved blocks are single-entry, one
//! consistent switch variable, the literal-to-target mapping is a function
//! (a duplicate literal aborts the rewrite), and the derived default. Null
//! and lookup misses fold into the default section. The setup store of the
//! switch variable is inlined into the `StringToInt` when the switch was
//! its only remaining consumer, and kept otherwise.

use rustc_hash::FxHashSet;

use crate::{
    il::{ILFunction, InstrId, InstrKind, LabelSet, VarId},
    transforms::{context::TransformContext, IlTransform},
    typesystem::FieldRefRc,
    Result,
};

/// Recovers string switches. Gated by the `SwitchStatementOnString`
/// setting.
pub struct SwitchOnStringTransform;

impl IlTransform for SwitchOnStringTransform {
    fn name(&self) -> &'static str {
        "SwitchOnStringTransform"
    }

    fn run(&self, function: &mut ILFunction, ctx: &TransformContext) -> Result<bool> {
        if !ctx.settings.switch_statement_on_string {
            return Ok(false);
        }
        let mut changed = false;
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
            let blocks: Vec<InstrId> = function.children(container).to_vec();
            for block in blocks {
                if function.is_dead(block) {
                    continue;
                }
                ctx.set_current_block(function.child_index(block));
                let fired = try_cascade(function, container, block)?
                    || try_roslyn_hash(function, container, block)?
                    || try_dictionary(function, container, block)?
                    || try_hashtable(function, container, block)?;
                changed |= fired;
            }
        }
        Ok(changed)
    }
}

// ----------------------------------------------------------------------
// Shared pieces
// ----------------------------------------------------------------------

/// One `if (s == "lit") goto target; goto next` test.
struct StringTest {
    var: VarId,
    literal: String,
    target: InstrId,
    next: InstrId,
}

/// Matches the test at the end of a block; `require_empty_prefix` demands
/// the test be the whole block (chain continuation blocks carry nothing
/// else).
fn match_test_tail(
    function: &ILFunction,
    block: InstrId,
    require_empty_prefix: bool,
) -> Option<StringTest> {
    let instrs = function.children(block);
    if instrs.len() < 2 || (require_empty_prefix && instrs.len() != 2) {
        return None;
    }
    let if_instr = instrs[instrs.len() - 2];
    let trailing = instrs[instrs.len() - 1];

    let (condition, then_branch) = function.match_if_instruction(if_instr)?;
    let target = function.match_branch(then_branch)?;
    let next = function.match_branch(trailing)?;
    let (var, literal) = match_string_equality(function, condition)?;
    Some(StringTest {
        var,
        literal,
        target,
        next,
    })
}

/// `call string.op_Equality(ldloc v, ldstr "lit")` (either operand order).
fn match_string_equality(function: &ILFunction, id: InstrId) -> Option<(VarId, String)> {
    let InstrKind::Call(method) = function.kind(id) else {
        return None;
    };
    if !method.matches_member("System", "String", "op_Equality") {
        return None;
    }
    let children = function.children(id);
    let [left, right] = children else {
        return None;
    };
    let (load, literal) = match (
        function.match_ldloc(*left),
        function.match_ldstr(*right),
        function.match_ldloc(*right),
        function.match_ldstr(*left),
    ) {
        (Some(var), Some(lit), _, _) => (var, lit.to_string()),
        (_, _, Some(var), Some(lit)) => (var, lit.to_string()),
        _ => return None,
    };
    Some((load, literal))
}

/// A block that only the recognized construct enters.
fn single_entry(
    function: &ILFunction,
    container: InstrId,
    block: InstrId,
    expected_incoming: u32,
) -> bool {
    function.parent(block) == Some(container)
        && Some(block) != function.children(container).first().copied()
        && matches!(
            function.kind(block),
            InstrKind::Block { incoming_edge_count } if *incoming_edge_count == expected_incoming
        )
}

/// Builds the replacement `switch (StringToInt(ldloc v, lits))`.
fn build_string_switch(
    function: &mut ILFunction,
    var: VarId,
    cases: &[(String, InstrId)],
    default_target: InstrId,
) -> Result<InstrId> {
    let literals: Vec<String> = cases.iter().map(|(literal, _)| literal.clone()).collect();
    let load = function.create(InstrKind::LdLoc(var), vec![])?;
    let value = function.create(InstrKind::StringToInt(literals), vec![load])?;

    let mut children = vec![value];
    for (ordinal, (_, target)) in cases.iter().enumerate() {
        let branch = function.create(InstrKind::Branch(*target), vec![])?;
        let section = function.create(
            InstrKind::SwitchSection(LabelSet::single(ordinal as i64)),
            vec![branch],
        )?;
        children.push(section);
    }
    let covered: Vec<i64> = (0..cases.len() as i64).collect();
    let default_branch = function.create(InstrKind::Branch(default_target), vec![])?;
    let default_section = function.create(
        InstrKind::SwitchSection(LabelSet::from_values(&covered).complement()),
        vec![default_branch],
    )?;
    children.push(default_section);
    function.create(InstrKind::SwitchInstruction, children)
}

/// Replaces the last `count` instructions of `block` with the new switch.
fn splice_switch_into(
    function: &mut ILFunction,
    block: InstrId,
    consumed_tail: usize,
    switch: InstrId,
) -> Result<()> {
    for _ in 0..consumed_tail {
        let last = function.children(block).len() - 1;
        let old = function.detach_child(block, last)?;
        function.discard(old)?;
    }
    function.push_child(block, switch)
}

/// Discards consumed blocks (detaching them from their container first).
fn discard_blocks(function: &mut ILFunction, blocks: &[InstrId]) -> Result<()> {
    for &block in blocks {
        function.discard(block)?;
    }
    Ok(())
}

/// A rewrite may only discard blocks that no surviving case dispatches to.
fn targets_escape(consumed: &[InstrId], cases: &[(String, InstrId)], default_target: InstrId) -> bool {
    cases.iter().any(|(_, target)| consumed.contains(target))
        || consumed.contains(&default_target)
}

/// After the rewrite, inline `stloc v(value)` directly before the switch
/// when the switch is the variable's only remaining consumer; keep the
/// store when the variable has other uses.
fn maybe_inline_setup_store(
    function: &mut ILFunction,
    block: InstrId,
    var: VarId,
    switch: InstrId,
) -> Result<()> {
    let children = function.children(block);
    if children.len() < 2 {
        return Ok(());
    }
    let store = children[children.len() - 2];
    match function.match_stloc(store) {
        Some((stored, _)) if stored == var => {}
        _ => return Ok(()),
    }
    let variable = function.variable(var);
    if variable.store_count() != 1 || variable.load_count() != 1 || variable.address_count() != 0 {
        return Ok(());
    }

    let value_node = function.child(switch, 0);
    let load = function.child(value_node, 0);
    debug_assert!(function.match_ldloc_var(load, var));
    let value = function.detach_child(store, 0)?;
    function.replace(load, value)?;
    function.discard(load)?;
    function.discard(store)?;
    Ok(())
}

fn has_duplicate_literals(cases: &[(String, InstrId)]) -> bool {
    let mut seen = FxHashSet::default();
    cases.iter().any(|(literal, _)| !seen.insert(literal))
}

// ----------------------------------------------------------------------
// Shape 1: cascading ifs
// ----------------------------------------------------------------------

fn try_cascade(
    function: &mut ILFunction,
    container: InstrId,
    head: InstrId,
) -> Result<bool> {
    let Some(first) = match_test_tail(function, head, false) else {
        return Ok(false);
    };
    let var = first.var;
    let mut cases = vec![(first.literal, first.target)];
    let mut chain = Vec::new();
    let mut current = first.next;

    while single_entry(function, container, current, 1) {
        let Some(test) = match_test_tail(function, current, true) else {
            break;
        };
        if test.var != var {
            break;
        }
        cases.push((test.literal, test.target));
        chain.push(current);
        current = test.next;
    }
    let default_target = current;

    if cases.len() < 3
        || has_duplicate_literals(&cases)
        || targets_escape(&chain, &cases, default_target)
    {
        return Ok(false);
    }

    let switch = build_string_switch(function, var, &cases, default_target)?;
    splice_switch_into(function, head, 2, switch)?;
    discard_blocks(function, &chain)?;
    maybe_inline_setup_store(function, head, var, switch)?;
    Ok(true)
}

// ----------------------------------------------------------------------
// Shape 4: Roslyn ComputeStringHash
// ----------------------------------------------------------------------

fn try_roslyn_hash(
    function: &mut ILFunction,
    container: InstrId,
    head: InstrId,
) -> Result<bool> {
    let instrs = function.children(head);
    let Some(&old_switch) = instrs.last() else {
        return Ok(false);
    };
    if !matches!(function.kind(old_switch), InstrKind::SwitchInstruction) {
        return Ok(false);
    }

    // value: call ComputeStringHash(ldloc v)
    let hash_call = function.child(old_switch, 0);
    let InstrKind::Call(method) = function.kind(hash_call) else {
        return Ok(false);
    };
    if method.name != "ComputeStringHash" || function.children(hash_call).len() != 1 {
        return Ok(false);
    }
    let Some(var) = function.match_ldloc(function.child(hash_call, 0)) else {
        return Ok(false);
    };

    let Some((sections, default_target)) = collect_branch_sections(function, old_switch) else {
        return Ok(false);
    };

    // Each hash bucket re-checks candidate literals for equality against the
    // same variable; the chain falls through to the shared default.
    let mut cases: Vec<(String, InstrId)> = Vec::new();
    let mut buckets: Vec<InstrId> = Vec::new();
    for (_, bucket) in sections {
        if bucket == default_target {
            continue;
        }
        if !single_entry(function, container, bucket, 1) {
            return Ok(false);
        }
        let mut current = bucket;
        loop {
            let Some(test) = match_test_tail(function, current, true) else {
                return Ok(false);
            };
            if test.var != var {
                return Ok(false);
            }
            cases.push((test.literal, test.target));
            if !buckets.contains(&current) {
                buckets.push(current);
            }
            if test.next == default_target {
                break;
            }
            if !single_entry(function, container, test.next, 1) {
                return Ok(false);
            }
            current = test.next;
        }
    }

    if cases.is_empty()
        || has_duplicate_literals(&cases)
        || targets_escape(&buckets, &cases, default_target)
    {
        return Ok(false);
    }

    let switch = build_string_switch(function, var, &cases, default_target)?;
    splice_switch_into(function, head, 1, switch)?;
    discard_blocks(function, &buckets)?;
    maybe_inline_setup_store(function, head, var, switch)?;
    Ok(true)
}

/// The `(labels, branch target)` list of a switch whose sections all
/// dispatch directly, plus its default target.
fn collect_branch_sections(
    function: &ILFunction,
    switch: InstrId,
) -> Option<(Vec<(LabelSet, InstrId)>, InstrId)> {
    let mut sections = Vec::new();
    let mut default_target = None;
    for &section in &function.children(switch)[1..] {
        let InstrKind::SwitchSection(labels) = function.kind(section) else {
            return None;
        };
        let target = function.match_branch(function.child(section, 0))?;
        if labels.values().is_none() {
            default_target = Some(target);
        } else {
            sections.push((labels.clone(), target));
        }
    }
    Some((sections, default_target?))
}

// ----------------------------------------------------------------------
// Shapes 2 and 3: lazily initialized lookup structures
// ----------------------------------------------------------------------

/// `if (!s) goto default; goto next` at the end of a block.
fn match_null_check_tail(
    function: &ILFunction,
    block: InstrId,
) -> Option<(VarId, InstrId, InstrId)> {
    let instrs = function.children(block);
    if instrs.len() < 2 {
        return None;
    }
    let if_instr = instrs[instrs.len() - 2];
    let trailing = instrs[instrs.len() - 1];
    let (condition, then_branch) = function.match_if_instruction(if_instr)?;
    let default_target = function.match_branch(then_branch)?;
    let next = function.match_branch(trailing)?;
    let inner = function.match_logic_not(condition)?;
    let var = function.match_ldloc(inner)?;
    Some((var, default_target, next))
}

/// `if (ldsfld F) goto lookup; goto create` - the double-checked lazy
/// initialization head.
fn match_lazy_init(
    function: &ILFunction,
    block: InstrId,
) -> Option<(FieldRefRc, InstrId, InstrId)> {
    let instrs = function.children(block);
    let [if_instr, trailing] = instrs else {
        return None;
    };
    let (condition, then_branch) = function.match_if_instruction(*if_instr)?;
    let lookup = function.match_branch(then_branch)?;
    let create = function.match_branch(*trailing)?;
    let field = function.match_ldsfld(condition)?.clone();
    Some((field, lookup, create))
}

/// The populate block: construct, `Add` literal/ordinal pairs, publish to
/// the static field, branch to the lookup.
fn match_populate(
    function: &ILFunction,
    block: InstrId,
    container_type_name: &str,
) -> Option<(FieldRefRc, Vec<(String, i64)>, InstrId)> {
    let instrs = function.children(block);
    if instrs.len() < 3 {
        return None;
    }

    // stloc d(newobj <container>::.ctor(...))
    let (dict_var, ctor) = function.match_stloc(instrs[0])?;
    let InstrKind::NewObj(method) = function.kind(ctor) else {
        return None;
    };
    if method.declaring_type.named_pair().map(|(_, name)| name) != Some(container_type_name) {
        return None;
    }

    // Add calls.
    let mut entries = Vec::new();
    for &instr in &instrs[1..instrs.len() - 2] {
        let method = match function.kind(instr) {
            InstrKind::Call(method) | InstrKind::CallVirt(method) => method,
            _ => return None,
        };
        if method.name != "Add" || function.children(instr).len() != 3 {
            return None;
        }
        if function.match_ldloc(function.child(instr, 0)) != Some(dict_var) {
            return None;
        }
        let literal = function.match_ldstr(function.child(instr, 1))?.to_string();
        let value_node = function.child(instr, 2);
        let ordinal = match function.match_ldc_i4(value_node) {
            Some(value) => i64::from(value),
            None => {
                let (boxed, _) = function.match_box(value_node)?;
                i64::from(function.match_ldc_i4(boxed)?)
            }
        };
        entries.push((literal, ordinal));
    }

    // stsfld F(ldloc d); br lookup
    let publish = instrs[instrs.len() - 2];
    let InstrKind::StsFld(field) = function.kind(publish) else {
        return None;
    };
    let field = field.clone();
    if function.match_ldloc(function.child(publish, 0)) != Some(dict_var) {
        return None;
    }
    let lookup = function.match_branch(instrs[instrs.len() - 1])?;
    Some((field, entries, lookup))
}

/// Resolves an ordinal through the integer switch's sections.
fn case_target_for(
    sections: &[(LabelSet, InstrId)],
    default_target: InstrId,
    ordinal: i64,
) -> InstrId {
    sections
        .iter()
        .find(|(labels, _)| labels.contains(ordinal))
        .map_or(default_target, |(_, target)| *target)
}

fn try_dictionary(
    function: &mut ILFunction,
    container: InstrId,
    head: InstrId,
) -> Result<bool> {
    let Some((var, default_target, init_block)) = match_null_check_tail(function, head) else {
        return Ok(false);
    };
    if !single_entry(function, container, init_block, 1) {
        return Ok(false);
    }
    let Some((field, lookup_block, create_block)) = match_lazy_init(function, init_block) else {
        return Ok(false);
    };
    if !single_entry(function, container, create_block, 1)
        || !single_entry(function, container, lookup_block, 2)
    {
        return Ok(false);
    }
    let Some((stored_field, entries, lookup_again)) =
        match_populate(function, create_block, "Dictionary")
    else {
        return Ok(false);
    };
    // Field identity is structural, so a reloaded metadata view still
    // matches.
    if lookup_again != lookup_block || *stored_field != *field {
        return Ok(false);
    }

    // Lookup: if (dict.TryGetValue(s, out num)) goto switch; goto default
    let lookup_instrs = function.children(lookup_block);
    let [lookup_if, lookup_trailing] = lookup_instrs else {
        return Ok(false);
    };
    let (lookup_if, lookup_trailing) = (*lookup_if, *lookup_trailing);
    let Some((lookup_cond, to_switch)) = function.match_if_instruction(lookup_if) else {
        return Ok(false);
    };
    let Some(switch_block) = function.match_branch(to_switch) else {
        return Ok(false);
    };
    if function.match_branch(lookup_trailing) != Some(default_target) {
        return Ok(false);
    }
    let InstrKind::CallVirt(try_get) = function.kind(lookup_cond) else {
        return Ok(false);
    };
    if try_get.name != "TryGetValue" || function.children(lookup_cond).len() != 3 {
        return Ok(false);
    }
    let dict_load = function.child(lookup_cond, 0);
    match function.match_ldsfld(dict_load) {
        Some(loaded) if **loaded == *field => {}
        _ => return Ok(false),
    }
    if function.match_ldloc(function.child(lookup_cond, 1)) != Some(var) {
        return Ok(false);
    }
    let Some(num) = function.match_ldloca(function.child(lookup_cond, 2)) else {
        return Ok(false);
    };

    // The integer dispatch.
    if !single_entry(function, container, switch_block, 1) {
        return Ok(false);
    }
    let switch_instrs = function.children(switch_block);
    let [old_switch] = switch_instrs else {
        return Ok(false);
    };
    let old_switch = *old_switch;
    if !matches!(function.kind(old_switch), InstrKind::SwitchInstruction) {
        return Ok(false);
    }
    if function.match_ldloc(function.child(old_switch, 0)) != Some(num) {
        return Ok(false);
    }
    let Some((sections, int_default)) = collect_branch_sections(function, old_switch) else {
        return Ok(false);
    };
    if int_default != default_target {
        return Ok(false);
    }

    let cases: Vec<(String, InstrId)> = entries
        .iter()
        .map(|(literal, ordinal)| {
            (
                literal.clone(),
                case_target_for(&sections, default_target, *ordinal),
            )
        })
        .collect();
    let consumed = [init_block, create_block, lookup_block, switch_block];
    if cases.is_empty()
        || has_duplicate_literals(&cases)
        || targets_escape(&consumed, &cases, default_target)
    {
        return Ok(false);
    }

    let switch = build_string_switch(function, var, &cases, default_target)?;
    splice_switch_into(function, head, 2, switch)?;
    discard_blocks(function, &consumed)?;
    maybe_inline_setup_store(function, head, var, switch)?;
    Ok(true)
}

fn try_hashtable(
    function: &mut ILFunction,
    container: InstrId,
    head: InstrId,
) -> Result<bool> {
    let Some((var, default_target, init_block)) = match_null_check_tail(function, head) else {
        return Ok(false);
    };
    if !single_entry(function, container, init_block, 1) {
        return Ok(false);
    }
    let Some((field, lookup_block, create_block)) = match_lazy_init(function, init_block) else {
        return Ok(false);
    };
    if !single_entry(function, container, create_block, 1)
        || !single_entry(function, container, lookup_block, 2)
    {
        return Ok(false);
    }
    let Some((stored_field, entries, lookup_again)) =
        match_populate(function, create_block, "Hashtable")
    else {
        return Ok(false);
    };
    if lookup_again != lookup_block || *stored_field != *field {
        return Ok(false);
    }

    // Lookup: stloc o(tbl[s]); if (!o) goto default; goto switch
    let lookup_instrs = function.children(lookup_block);
    let [get_item_store, miss_if, lookup_trailing] = lookup_instrs else {
        return Ok(false);
    };
    let (get_item_store, miss_if, lookup_trailing) =
        (*get_item_store, *miss_if, *lookup_trailing);
    let Some((boxed_var, get_item)) = function.match_stloc(get_item_store) else {
        return Ok(false);
    };
    let InstrKind::CallVirt(getter) = function.kind(get_item) else {
        return Ok(false);
    };
    if getter.name != "get_Item" || function.children(get_item).len() != 2 {
        return Ok(false);
    }
    match function.match_ldsfld(function.child(get_item, 0)) {
        Some(loaded) if **loaded == *field => {}
        _ => return Ok(false),
    }
    if function.match_ldloc(function.child(get_item, 1)) != Some(var) {
        return Ok(false);
    }
    let Some((miss_cond, to_default)) = function.match_if_instruction(miss_if) else {
        return Ok(false);
    };
    if function.match_branch(to_default) != Some(default_target) {
        return Ok(false);
    }
    let Some(miss_load) = function.match_logic_not(miss_cond) else {
        return Ok(false);
    };
    if function.match_ldloc(miss_load) != Some(boxed_var) {
        return Ok(false);
    }
    let Some(switch_block) = function.match_branch(lookup_trailing) else {
        return Ok(false);
    };

    // switch ((int)o)
    if !single_entry(function, container, switch_block, 1) {
        return Ok(false);
    }
    let switch_instrs = function.children(switch_block);
    let [old_switch] = switch_instrs else {
        return Ok(false);
    };
    let old_switch = *old_switch;
    if !matches!(function.kind(old_switch), InstrKind::SwitchInstruction) {
        return Ok(false);
    }
    let unboxed = function.child(old_switch, 0);
    let Some((unbox_arg, _)) = function.match_unbox_any(unboxed) else {
        return Ok(false);
    };
    if function.match_ldloc(unbox_arg) != Some(boxed_var) {
        return Ok(false);
    }
    let Some((sections, int_default)) = collect_branch_sections(function, old_switch) else {
        return Ok(false);
    };
    if int_default != default_target {
        return Ok(false);
    }

    let cases: Vec<(String, InstrId)> = entries
        .iter()
        .map(|(literal, ordinal)| {
            (
                literal.clone(),
                case_target_for(&sections, default_target, *ordinal),
            )
        })
        .collect();
    let consumed = [init_block, create_block, lookup_block, switch_block];
    if cases.is_empty()
        || has_duplicate_literals(&cases)
        || targets_escape(&consumed, &cases, default_target)
    {
        return Ok(false);
    }

    let switch = build_string_switch(function, var, &cases, default_target)?;
    splice_switch_into(function, head, 2, switch)?;
    discard_blocks(function, &consumed)?;
    maybe_inline_setup_store(function, head, var, switch)?;
    Ok(true)
}
