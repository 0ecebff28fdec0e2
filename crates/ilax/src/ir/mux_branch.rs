use std::collections::BTreeSet;

use super::lexer::{fmt_local, local_refs, opcode, split_assignment, split_top_level, tokenize};
use super::{Block, Function, Module, Type};

struct Select {
    result: String,
    cond: String,
    ty: Type,
    on_true: String,
    on_false: String,
}

/// Splits an operand such as `i8 %a` into its type and value.
fn typed_operand(operand: &str) -> Option<(Type, String)> {
    let tokens = tokenize(operand);
    let mut pos = 0;
    let ty = Type::parse(&tokens, &mut pos)?;
    let value = operand[tokens.get(pos)?.span.start..].trim().to_string();
    Some((ty, value))
}

fn parse_select(inst: &str) -> Option<Select> {
    if opcode(inst) != "select" {
        return None;
    }
    let (result, rest) = split_assignment(inst)?;
    let operands = rest.trim_start().strip_prefix("select")?;
    let parts = split_top_level(operands);
    let [cond, on_true, on_false] = parts.as_slice() else {
        return None;
    };
    let (cond_ty, cond) = typed_operand(cond)?;
    if cond_ty != Type::Int(1) {
        return None;
    }
    let (ty, on_true) = typed_operand(on_true)?;
    let (_, on_false) = typed_operand(on_false)?;
    Some(Select {
        result,
        cond,
        ty,
        on_true,
        on_false,
    })
}

fn fresh_label(base: &str, taken: &mut BTreeSet<String>) -> String {
    let mut label = base.to_string();
    let mut n = 1;
    while taken.contains(&label) {
        label = format!("{}{}", base, n);
        n += 1;
    }
    taken.insert(label.clone());
    label
}

/// Replaces `select i1` instructions whose value is at least `threshold`
/// bits wide by a diamond of branches joined by a `phi`.
///
/// Returns the number of selects converted across all functions.
pub fn convert_selects_to_branches(module: &mut Module, threshold: u32) -> usize {
    module
        .functions_mut()
        .map(|func| convert_function(func, threshold))
        .sum()
}

fn convert_function(func: &mut Function, threshold: u32) -> usize {
    let mut taken: BTreeSet<String> = func.local_names().into_iter().collect();
    let mut converted = 0;
    let mut idx = 0;
    while idx < func.blocks.len() {
        let found = func.blocks[idx].insts.iter().enumerate().find_map(|(i, inst)| {
            parse_select(inst)
                .filter(|s| s.ty.bit_width().is_some_and(|w| w >= threshold))
                .map(|s| (i, s))
        });
        let Some((at, select)) = found else {
            idx += 1;
            continue;
        };

        let from = func.block_ref(idx);
        let base = format!("{}.mux", select.result);
        let on_true = fresh_label(&format!("{}.t", base), &mut taken);
        let on_false = fresh_label(&format!("{}.f", base), &mut taken);
        let join = fresh_label(&format!("{}.end", base), &mut taken);

        let block = &mut func.blocks[idx];
        let tail = block.insts.split_off(at + 1);
        block.insts.pop();
        block.insts.push(format!(
            "br i1 {}, label {}, label {}",
            select.cond,
            fmt_local(&on_true),
            fmt_local(&on_false)
        ));

        let mut join_insts = vec![format!(
            "{} = phi {} [ {}, {} ], [ {}, {} ]",
            fmt_local(&select.result),
            select.ty,
            select.on_true,
            fmt_local(&on_true),
            select.on_false,
            fmt_local(&on_false)
        )];
        join_insts.extend(tail);
        let successors: BTreeSet<String> = join_insts
            .last()
            .map(|term| local_refs(term).into_iter().map(|r| r.name).collect())
            .unwrap_or_default();

        let branch_to_join = format!("br label {}", fmt_local(&join));
        func.blocks.splice(
            idx + 1..idx + 1,
            [
                Block {
                    label: Some(on_true),
                    insts: vec![branch_to_join.clone()],
                },
                Block {
                    label: Some(on_false),
                    insts: vec![branch_to_join],
                },
                Block {
                    label: Some(join.clone()),
                    insts: join_insts,
                },
            ],
        );

        for block in &mut func.blocks {
            let is_successor = block.label.as_ref().is_some_and(|l| successors.contains(l));
            if is_successor {
                retarget_phis(block, &from, &join);
            }
        }

        converted += 1;
        idx += 3;
    }
    converted
}

/// Rewrites `phi` incoming blocks named `from` to `to`.
fn retarget_phis(block: &mut Block, from: &str, to: &str) {
    for inst in block.insts.iter_mut().take_while(|i| opcode(i) == "phi") {
        let refs = local_refs(inst);
        let mut out = String::with_capacity(inst.len());
        let mut last = 0;
        for r in refs {
            let closes_pair = inst[r.span.end..].trim_start().starts_with(']');
            if r.name == from && closes_pair {
                out.push_str(&inst[last..r.span.start]);
                out.push_str(&fmt_local(to));
                last = r.span.end;
            }
        }
        out.push_str(&inst[last..]);
        *inst = out;
    }
}
