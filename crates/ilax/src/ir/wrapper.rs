use std::collections::BTreeSet;

use super::lexer::fmt_local;
use super::{Block, Function, Module, Param, Type, verify_function};

/// Wrapper argument standing for the register array the function updates.
pub const RETURN_ARRAY_PTR_ID: &str = "__RETURN_ARRAY_PTR__";
/// Wrapper argument receiving a result wider than a machine word.
pub const RETURN_VAL_PTR_ID: &str = "__RETURN_VAL_PTR__";
pub const WRAPPER_SUFFIX: &str = "_wrapper";

const WRAPPER_BLOCK: &str = "wrapper_bb";

/// Attributes that only make sense on the by-value form of a parameter.
fn is_value_only_attr(attr: &str) -> bool {
    matches!(attr, "returned" | "zeroext" | "signext" | "inreg" | "noext")
        || attr.starts_with("range(")
        || attr.starts_with("nofpclass(")
}

fn is_linkage_or_visibility(word: &str) -> bool {
    matches!(
        word,
        "private"
            | "internal"
            | "available_externally"
            | "linkonce"
            | "linkonce_odr"
            | "weak"
            | "weak_odr"
            | "common"
            | "appending"
            | "extern_weak"
            | "external"
            | "hidden"
            | "protected"
            | "default"
            | "dso_local"
            | "dso_preemptable"
            | "local_unnamed_addr"
            | "unnamed_addr"
    )
}

fn unique_name(base: &str, taken: &mut BTreeSet<String>) -> String {
    let mut name = base.to_string();
    let mut n = 1;
    while taken.contains(&name) {
        name = format!("{}{}", base, n);
        n += 1;
    }
    taken.insert(name.clone());
    name
}

/// Adds `<main>_wrapper`, a C-callable front for `main`.
///
/// Parameters too wide for a register become `ptr nonnull` and are loaded
/// before the call. A wide result is stored through an extra trailing
/// `ptr nonnull` parameter named [`RETURN_VAL_PTR_ID`] and the wrapper
/// returns `void`. The calling convention of `main` is used for both the
/// wrapper and the call.
///
/// Both functions are verified afterwards; failures are logged only.
/// Returns the wrapper name, or `None` if `main` does not exist.
pub fn create_wrapper(module: &mut Module, main: &str) -> Option<String> {
    let func = module.function(main)?;
    let wrapper = build_wrapper(func);
    let name = wrapper.name.clone();

    module
        .items
        .retain(|item| !matches!(item, super::Item::Function(f) if f.name == name));
    module.insert_function_after(main, wrapper);

    for checked in [main, name.as_str()] {
        let Some(func) = module.function(checked) else {
            continue;
        };
        match verify_function(module, func) {
            Ok(()) => log::debug!("verification of {} passed", checked),
            Err(e) => log::error!("verification of {} failed: {}", checked, e),
        }
    }
    Some(name)
}

fn build_wrapper(main: &Function) -> Function {
    let cc = main.calling_conv();
    let big_ret = main.ret.is_big();

    let mut taken: BTreeSet<String> = main.params.iter().map(|p| p.name.clone()).collect();
    let mut params = Vec::with_capacity(main.params.len() + 1);
    let mut insts = Vec::new();
    let mut call_args = Vec::with_capacity(main.params.len());

    for param in &main.params {
        if param.ty.is_big() {
            let mut attrs = vec!["nonnull".to_string()];
            attrs.extend(
                param
                    .attrs
                    .iter()
                    .filter(|a| !is_value_only_attr(a) && a.as_str() != "nonnull")
                    .cloned(),
            );
            params.push(Param {
                ty: Type::Ptr,
                attrs,
                name: param.name.clone(),
            });
            let loaded = unique_name(&format!("{}.ld", param.name), &mut taken);
            insts.push(format!(
                "{} = load {}, ptr {}",
                fmt_local(&loaded),
                param.ty,
                fmt_local(&param.name)
            ));
            call_args.push(format!("{} {}", param.ty, fmt_local(&loaded)));
        } else {
            params.push(Param {
                ty: param.ty.clone(),
                attrs: param
                    .attrs
                    .iter()
                    .filter(|a| a.as_str() != "returned")
                    .cloned()
                    .collect(),
                name: param.name.clone(),
            });
            call_args.push(format!("{} {}", param.ty, fmt_local(&param.name)));
        }
    }

    if big_ret {
        params.push(Param {
            ty: Type::Ptr,
            attrs: vec!["nonnull".to_string()],
            name: RETURN_VAL_PTR_ID.to_string(),
        });
    }

    let cc_text = cc.as_ref().map_or(String::new(), |cc| format!("{} ", cc));
    let call = format!(
        "call {}{} {}({})",
        cc_text,
        main.ret,
        super::lexer::fmt_global(&main.name),
        call_args.join(", ")
    );
    if main.ret.is_void() {
        insts.push(call);
        insts.push("ret void".to_string());
    } else {
        let result = unique_name("wrapper.call", &mut taken);
        insts.push(format!("{} = {}", fmt_local(&result), call));
        if big_ret {
            insts.push(format!(
                "store {} {}, ptr {}",
                main.ret,
                fmt_local(&result),
                fmt_local(RETURN_VAL_PTR_ID)
            ));
            insts.push("ret void".to_string());
        } else {
            insts.push(format!("ret {} {}", main.ret, fmt_local(&result)));
        }
    }

    let cc_words: Vec<String> = cc
        .as_deref()
        .map(|cc| cc.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let mut prefix = cc_words.clone();
    if !big_ret {
        // Return attributes stay valid when the result is still returned.
        prefix.extend(
            main.prefix
                .iter()
                .filter(|w| !is_linkage_or_visibility(w) && !cc_words.contains(w))
                .cloned(),
        );
    }

    Function {
        name: format!("{}{}", main.name, WRAPPER_SUFFIX),
        prefix,
        ret: if big_ret { Type::Void } else { main.ret.clone() },
        params,
        varargs: false,
        suffix: "noinline".to_string(),
        blocks: vec![Block {
            label: Some(WRAPPER_BLOCK.to_string()),
            insts,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN: &str = "\
define fastcc i128 @ADD_acc(i32 %a, i128 zeroext %b) {
entry:
  %w = zext i32 %a to i128
  %r = add i128 %w, %b
  ret i128 %r
}
";

    #[test]
    fn big_params_and_result_go_through_pointers() {
        let mut module = Module::parse(MAIN).unwrap();
        let name = create_wrapper(&mut module, "ADD_acc").unwrap();
        assert_eq!(name, "ADD_acc_wrapper");

        let wrapper = module.function(&name).unwrap();
        assert_eq!(wrapper.params.len(), 3);
        assert_eq!(wrapper.params[0].ty, Type::Int(32));
        assert_eq!(wrapper.params[1].ty, Type::Ptr);
        assert_eq!(wrapper.params[1].attrs, vec!["nonnull"]);
        assert_eq!(wrapper.params[2].name, RETURN_VAL_PTR_ID);
        assert_eq!(wrapper.params[2].attrs, vec!["nonnull"]);
        assert!(wrapper.ret.is_void());
        assert_eq!(wrapper.calling_conv().as_deref(), Some("fastcc"));

        let expected = "\
define fastcc void @ADD_acc_wrapper(i32 %a, ptr nonnull %b, ptr nonnull %__RETURN_VAL_PTR__) noinline {
wrapper_bb:
  %b.ld = load i128, ptr %b
  %wrapper.call = call fastcc i128 @ADD_acc(i32 %a, i128 %b.ld)
  store i128 %wrapper.call, ptr %__RETURN_VAL_PTR__
  ret void
}";
        assert_eq!(wrapper.to_string(), expected);
    }

    #[test]
    fn small_result_is_returned_directly() {
        let text = "define noundef i8 @f(i8 %x) {\n  ret i8 %x\n}\n";
        let mut module = Module::parse(text).unwrap();
        let name = create_wrapper(&mut module, "f").unwrap();
        let wrapper = module.function(&name).unwrap();
        assert_eq!(wrapper.ret, Type::Int(8));
        assert_eq!(wrapper.prefix, vec!["noundef"]);
        let last = wrapper.blocks[0].insts.last().unwrap();
        assert_eq!(last, "ret i8 %wrapper.call");
    }

    #[test]
    fn void_result_and_missing_function() {
        let text = "define void @g(ptr %__RETURN_ARRAY_PTR__) {\n  ret void\n}\n";
        let mut module = Module::parse(text).unwrap();
        let name = create_wrapper(&mut module, "g").unwrap();
        let wrapper = module.function(&name).unwrap();
        assert_eq!(
            wrapper.blocks[0].insts,
            vec!["call void @g(ptr %__RETURN_ARRAY_PTR__)", "ret void"]
        );
        assert!(create_wrapper(&mut module, "missing").is_none());
    }
}
