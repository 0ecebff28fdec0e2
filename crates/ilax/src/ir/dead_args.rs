use crate::HashMap;

use super::Function;
use super::lexer::{defined_local, is_numbered, rewrite_locals};

/// Drops every parameter the body never reads.
///
/// The function is assumed to be free-standing: nothing in the module calls
/// it, so no call sites need fixing. Unnamed values are renumbered when an
/// unnamed parameter goes away. Returns the names of the removed parameters.
pub fn remove_dead_args(func: &mut Function) -> Vec<String> {
    let dead: Vec<String> = func
        .params
        .iter()
        .filter(|p| func.use_count(&p.name) == 0)
        .map(|p| p.name.clone())
        .collect();
    if dead.is_empty() {
        return dead;
    }

    let renumber = dead.iter().any(|name| is_numbered(name));
    let old_entry = func.blocks.first().filter(|b| b.label.is_none()).map(|_| func.block_ref(0));
    func.params.retain(|p| !dead.contains(&p.name));

    if renumber {
        let mapping = numbering_after_removal(func, &dead, old_entry);
        apply_numbering(func, &mapping);
    }
    dead
}

/// Old number to new number for every unnamed value that survives.
fn numbering_after_removal(
    func: &Function,
    dead: &[String],
    old_entry: Option<String>,
) -> HashMap<String, String> {
    let mut mapping = HashMap::default();
    let mut next = 0usize;
    let mut assign = |old: &str, mapping: &mut HashMap<String, String>| {
        mapping.insert(old.to_string(), next.to_string());
        next += 1;
    };

    // Removed params no longer occupy a number; the kept ones are
    // renumbered in order. Their old numbers are recovered from position.
    let mut old_number = 0usize;
    let mut kept = func.params.iter().filter(|p| p.is_numbered()).peekable();
    while kept.peek().is_some() {
        let candidate = old_number.to_string();
        old_number += 1;
        if dead.contains(&candidate) {
            continue;
        }
        if let Some(param) = kept.next() {
            assign(&param.name, &mut mapping);
        }
    }

    if let Some(entry) = old_entry {
        assign(&entry, &mut mapping);
    }
    for block in &func.blocks {
        if let Some(label) = block.label.as_deref().filter(|l| is_numbered(l)) {
            assign(label, &mut mapping);
        }
        for inst in &block.insts {
            if let Some(def) = defined_local(inst).filter(|d| is_numbered(d)) {
                assign(&def, &mut mapping);
            }
        }
    }
    mapping
}

fn apply_numbering(func: &mut Function, mapping: &HashMap<String, String>) {
    for param in &mut func.params {
        if let Some(new_name) = mapping.get(&param.name) {
            param.name = new_name.clone();
        }
    }
    for block in &mut func.blocks {
        if let Some(label) = &mut block.label {
            if let Some(new_name) = mapping.get(label.as_str()) {
                *label = new_name.clone();
            }
        }
        for inst in &mut block.insts {
            *inst = rewrite_locals(inst, |r| {
                is_numbered(&r.name)
                    .then(|| mapping.get(&r.name).cloned())
                    .flatten()
            });
        }
    }
}
