use std::collections::BTreeSet;

use thiserror::Error;

use super::lexer::{defined_local, local_refs, opcode, split_assignment};
use super::{Function, Item, Module};

const TERMINATORS: &[&str] = &[
    "ret",
    "br",
    "switch",
    "indirectbr",
    "invoke",
    "callbr",
    "resume",
    "catchswitch",
    "catchret",
    "cleanupret",
    "unreachable",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}: {}", .function, .issues.join("; "))]
pub struct VerifyError {
    pub function: String,
    pub issues: Vec<String>,
}

/// Named types declared at module level (`%name = type ...`).
fn type_names(module: &Module) -> BTreeSet<String> {
    module
        .items
        .iter()
        .filter_map(|item| match item {
            Item::Text(text) => {
                let (name, rest) = split_assignment(text.trim())?;
                rest.trim_start().starts_with("type").then_some(name)
            }
            Item::Function(_) => None,
        })
        .collect()
}

/// Structural checks on one function of `module`: every block ends in
/// exactly one terminator, every local that is read is defined, and no
/// local is defined twice.
pub fn verify_function(module: &Module, func: &Function) -> Result<(), VerifyError> {
    let mut issues = Vec::new();
    let types = type_names(module);

    let mut defined = BTreeSet::new();
    let mut define = |name: String, issues: &mut Vec<String>| {
        if !defined.insert(name.clone()) {
            issues.push(format!("`%{}` is defined more than once", name));
        }
    };
    for param in &func.params {
        define(param.name.clone(), &mut issues);
    }
    for (idx, block) in func.blocks.iter().enumerate() {
        define(func.block_ref(idx), &mut issues);
        for inst in &block.insts {
            if let Some(name) = defined_local(inst) {
                define(name, &mut issues);
            }
        }
    }

    if func.blocks.is_empty() {
        issues.push("function has no body".to_string());
    }
    for (idx, block) in func.blocks.iter().enumerate() {
        let label = func.block_ref(idx);
        match block.insts.last() {
            Some(last) if TERMINATORS.contains(&opcode(last)) => {}
            _ => issues.push(format!("block `{}` does not end with a terminator", label)),
        }
        let early = block
            .insts
            .iter()
            .rev()
            .skip(1)
            .filter(|inst| TERMINATORS.contains(&opcode(inst)))
            .count();
        if early > 0 {
            issues.push(format!("block `{}` has a terminator before its end", label));
        }

        for inst in &block.insts {
            for r in local_refs(inst) {
                if !defined.contains(&r.name) && !types.contains(&r.name) {
                    issues.push(format!("use of undefined value `%{}`", r.name));
                }
            }
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(VerifyError {
            function: func.name.clone(),
            issues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(text: &str) -> Result<(), VerifyError> {
        let module = Module::parse(text).unwrap();
        let func = module.functions().next().unwrap();
        verify_function(&module, func)
    }

    #[test]
    fn accepts_well_formed() {
        let text = "\
%pair = type { i8, i8 }

define i8 @f(i8 %a, i1 %c) {
entry:
  %p = alloca %pair
  br i1 %c, label %t, label %done

t:
  br label %done

done:
  %r = phi i8 [ %a, %entry ], [ 0, %t ]
  ret i8 %r
}
";
        assert_eq!(check(text), Ok(()));
    }

    #[test]
    fn reports_each_problem() {
        let text = "\
define i8 @f(i8 %a) {
entry:
  %x = add i8 %a, %ghost
  %x = add i8 %a, 1
  ret i8 %x
  br label %entry

other:
  %y = add i8 %x, 1
}
";
        let err = check(text).unwrap_err();
        assert_eq!(err.function, "f");
        assert!(err.issues.iter().any(|i| i.contains("%ghost")));
        assert!(err.issues.iter().any(|i| i.contains("more than once")));
        assert!(err.issues.iter().any(|i| i.contains("before its end")));
        assert!(err.issues.iter().any(|i| i.contains("`other` does not end")));
    }

    #[test]
    fn message_lists_issues() {
        let err = check("define i8 @g() {\n  ret i8 %z\n}\n").unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("g: "));
        assert!(message.contains("%z"));
        let err: &dyn std::error::Error = &err;
        assert!(err.source().is_none());
    }
}
