//! Switch normalization.
//!
//! Collapses consecutive sections that dispatch to the same target,
//! canonicalizes the label sets into a disjoint union whose complement
//! belongs to the default section, and hoists the default section to the
//! last position. After normalization the union of all section label sets
//! is the full integer range and sections are pairwise disjoint, which the
//! test suite asserts for every switch.

use rustc_hash::FxHashMap;

use crate::{
    il::{ILFunction, InstrId, InstrKind, LabelSet},
    Result,
};

/// Normalizes every switch in the function. Returns `true` when anything
/// changed.
///
/// # Errors
///
/// Propagates `InvariantViolation` from the mutation API.
pub fn simplify_switches(function: &mut ILFunction) -> Result<bool> {
    let mut changed = false;
    let switches: Vec<InstrId> = function
        .descendants_and_self(function.root())
        .into_iter()
        .filter(|&id| {
            !function.is_dead(id) && matches!(function.kind(id), InstrKind::SwitchInstruction)
        })
        .collect();
    for switch in switches {
        if function.is_dead(switch) {
            continue;
        }
        changed |= simplify_one(function, switch)?;
    }
    Ok(changed)
}

fn section_labels(function: &ILFunction, section: InstrId) -> Option<&LabelSet> {
    match function.kind(section) {
        InstrKind::SwitchSection(labels) => Some(labels),
        _ => None,
    }
}

fn simplify_one(function: &mut ILFunction, switch: InstrId) -> Result<bool> {
    let mut changed = false;

    // Overlapping sections mean the switch was produced by a broken rewrite;
    // leave it untouched rather than guessing.
    let sections: Vec<InstrId> = function.children(switch)[1..].to_vec();
    for (position, &first) in sections.iter().enumerate() {
        for &second in &sections[position + 1..] {
            let (Some(labels_a), Some(labels_b)) = (
                section_labels(function, first),
                section_labels(function, second),
            ) else {
                return Ok(false);
            };
            if !labels_a.is_disjoint(labels_b) {
                return Ok(false);
            }
        }
    }

    // Merge sections dispatching to the same block.
    let mut first_for_target: FxHashMap<InstrId, InstrId> = FxHashMap::default();
    let mut merged: Vec<(InstrId, InstrId)> = Vec::new();
    for &section in &sections {
        let body = function.child(section, 0);
        let Some(target) = function.match_branch(body) else {
            continue;
        };
        match first_for_target.get(&target) {
            Some(&first) => merged.push((first, section)),
            None => {
                first_for_target.insert(target, section);
            }
        }
    }
    for (keep, drop) in merged {
        let (Some(kept), Some(dropped)) = (
            section_labels(function, keep).cloned(),
            section_labels(function, drop).cloned(),
        ) else {
            continue;
        };
        function.replace_kind(keep, InstrKind::SwitchSection(kept.union(&dropped)));
        function.discard(drop)?;
        changed = true;
    }

    // The default section owns the complement of everything else; it goes
    // last. Prefer the section that already holds an infinite label set.
    let sections: Vec<InstrId> = function.children(switch)[1..].to_vec();
    if sections.is_empty() {
        return Ok(changed);
    }
    let default_section = sections
        .iter()
        .copied()
        .find(|&section| {
            section_labels(function, section).is_some_and(|labels| labels.values().is_none())
        })
        .unwrap_or(*sections.last().expect("nonempty"));

    let mut others_union = LabelSet::empty();
    for &section in &sections {
        if section == default_section {
            continue;
        }
        if let Some(labels) = section_labels(function, section) {
            others_union = others_union.union(labels);
        }
    }
    let complement = others_union.complement();
    let current = section_labels(function, default_section).cloned();
    if current.as_ref() != Some(&complement) {
        function.replace_kind(default_section, InstrKind::SwitchSection(complement));
        changed = true;
    }

    let last_slot = function.children(switch).len() - 1;
    if function.child(switch, last_slot) != default_section {
        let slot = function.child_index(default_section);
        let detached = function.detach_child(switch, slot)?;
        function.push_child(switch, detached)?;
        changed = true;
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{ContainerKind, InstrKind as K};

    fn block(function: &mut ILFunction) -> InstrId {
        function
            .create(K::Block { incoming_edge_count: 0 }, vec![])
            .unwrap()
    }

    fn section(function: &mut ILFunction, labels: LabelSet, target: InstrId) -> InstrId {
        let branch = function.create(K::Branch(target), vec![]).unwrap();
        function
            .create(K::SwitchSection(labels), vec![branch])
            .unwrap()
    }

    /// Builds a switch with the given sections inside a well-formed block.
    fn build_switch(function: &mut ILFunction, sections: Vec<InstrId>) -> InstrId {
        let value = function.create(K::LdcI4(0), vec![]).unwrap();
        let mut children = vec![value];
        children.extend(sections);
        let switch = function.create(K::SwitchInstruction, children).unwrap();
        let root = function.root();
        let holder = block(function);
        function.push_child(root, holder).unwrap();
        function.push_child(holder, switch).unwrap();
        switch
    }

    #[test]
    fn test_sections_with_same_target_merge() {
        let mut function = ILFunction::new(None);
        let root = function.root();
        let target_a = block(&mut function);
        let target_b = block(&mut function);

        let sections = vec![
            section(&mut function, LabelSet::from_values(&[0]), target_a),
            section(&mut function, LabelSet::from_values(&[1]), target_b),
            section(&mut function, LabelSet::from_values(&[2]), target_a),
            section(
                &mut function,
                LabelSet::from_values(&[0, 1, 2]).complement(),
                target_b,
            ),
        ];
        let switch = build_switch(&mut function, sections);
        for target in [target_a, target_b] {
            function.push_child(root, target).unwrap();
            let ret = function.create(K::Return, vec![]).unwrap();
            function.push_child(target, ret).unwrap();
        }

        assert!(simplify_switches(&mut function).unwrap());

        // 0 and 2 merged; 1 merged into the default (same target); the
        // default went last and owns the complement.
        let sections: Vec<InstrId> = function.children(switch)[1..].to_vec();
        assert_eq!(sections.len(), 2);
        let first_labels = section_labels(&function, sections[0]).unwrap();
        assert!(first_labels.contains(0));
        assert!(first_labels.contains(2));
        assert!(!first_labels.contains(1));
        let default_labels = section_labels(&function, sections[1]).unwrap();
        assert!(default_labels.contains(1));
        assert!(default_labels.contains(100));

        // Partition property: union is full, pairwise disjoint.
        assert!(first_labels.union(default_labels).is_full());
        assert!(first_labels.is_disjoint(default_labels));
        function.check_invariants().unwrap();
    }

    #[test]
    fn test_overlapping_sections_left_alone() {
        let mut function = ILFunction::new(None);
        let root = function.root();
        let target = block(&mut function);
        let sections = vec![
            section(&mut function, LabelSet::from_values(&[0, 1]), target),
            section(
                &mut function,
                LabelSet::from_values(&[1, 2]),
                target,
            ),
        ];
        let switch = build_switch(&mut function, sections);
        function.push_child(root, target).unwrap();
        let ret = function.create(K::Return, vec![]).unwrap();
        function.push_child(target, ret).unwrap();

        assert!(!simplify_switches(&mut function).unwrap());
        assert_eq!(function.children(switch).len(), 3);
        function.check_invariants().unwrap();
    }

    #[test]
    fn test_container_kind_switch_exists() {
        // ContainerKind::Switch marks switch body regions built by the
        // switch-on-string recovery; keep the variant exercised.
        let mut function = ILFunction::new(None);
        let container = function
            .create(K::BlockContainer(ContainerKind::Switch), vec![])
            .unwrap();
        assert!(matches!(
            function.kind(container),
            K::BlockContainer(ContainerKind::Switch)
        ));
        function.discard(container).unwrap();
    }
}
