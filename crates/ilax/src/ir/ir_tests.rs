use super::*;
use test_case::test_case;

const MODULE: &str = r#"; ModuleID = 'ADD_acc'
source_filename = "ADD_acc"
target triple = "x86_64-unknown-linux-gnu"

%struct.pair = type { i64, i64 }

@lut = internal constant [4 x i8] c"\01\02\03\04"

define internal fastcc noundef i8 @"ADD_acc"(i8 noundef %"acc#1", ptr nocapture readonly align 8 dereferenceable(16) %"mem[0]#2", i8 %0) #0 {
entry:
  %v = load i8, ptr %"mem[0]#2", align 8
  %sum = add i8 %"acc#1", %v
  switch i8 %sum, label %done [
    i8 0, label %zero
  ]

zero:                                             ; preds = %entry
  br label %done

done:
  %r = phi i8 [ %sum, %entry ], [ %0, %zero ]
  ret i8 %r
}

declare void @llvm.trap()

attributes #0 = { nounwind }
"#;

#[test]
fn parses_header_and_body() {
    let module = Module::parse(MODULE).unwrap();
    let func = module.function("ADD_acc").unwrap();
    assert_eq!(func.prefix, vec!["internal", "fastcc", "noundef"]);
    assert_eq!(func.ret, Type::Int(8));
    assert_eq!(func.calling_conv().as_deref(), Some("fastcc"));
    assert_eq!(func.suffix, "#0");

    let names: Vec<_> = func.params.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["acc#1", "mem[0]#2", "0"]);
    assert_eq!(func.params[0].attrs, vec!["noundef"]);
    assert_eq!(
        func.params[1].attrs,
        vec!["nocapture", "readonly", "align 8", "dereferenceable(16)"]
    );

    let labels: Vec<_> = func.blocks.iter().map(|b| b.label.clone()).collect();
    assert_eq!(
        labels,
        vec![
            Some("entry".to_string()),
            Some("zero".to_string()),
            Some("done".to_string())
        ]
    );
    // the multi-line switch is kept as a single instruction
    assert_eq!(func.blocks[0].insts.len(), 3);
    assert_eq!(func.use_count("0"), 1);
    assert_eq!(func.use_count("acc#1"), 1);
}

#[test]
fn printing_is_stable() {
    let module = Module::parse(MODULE).unwrap();
    let printed = module.to_string();
    assert_eq!(Module::parse(&printed).unwrap(), module);
    assert!(printed.contains(r#"@ADD_acc(i8 noundef %"acc#1""#));
}

#[test]
fn implicit_entry_label_follows_params() {
    let text = "define i8 @f(i8 %0, i8 %1) {\n  br label %3\n\n3:\n  ret i8 %0\n}\n";
    let module = Module::parse(text).unwrap();
    let func = module.function("f").unwrap();
    assert_eq!(func.block_ref(0), "2");
    assert_eq!(func.block_index("3"), Some(1));
}

#[test]
fn rejects_garbage() {
    let err = Module::parse("define i8 @f() {\n  ret i8 0\n}\nthis is not ir\n").unwrap_err();
    assert_eq!(err.line, 4);
    assert!(Module::parse("define i8 @f() {\n  ret i8 0\n").is_err());
    assert!(Module::parse("define @f() {\n}\n").is_err());
}

#[test]
fn data_layout_is_replaced_or_added() {
    let mut module = Module::parse(MODULE).unwrap();
    assert_eq!(module.data_layout(), None);
    module.set_data_layout(X86_64_DATA_LAYOUT);
    assert_eq!(module.data_layout(), Some(X86_64_DATA_LAYOUT));
    let printed = module.to_string();
    let layout_line = printed.lines().position(|l| l.starts_with("target datalayout"));
    let triple_line = printed.lines().position(|l| l.starts_with("target triple"));
    assert!(layout_line < triple_line);

    module.set_data_layout("e");
    assert_eq!(module.data_layout(), Some("e"));
    assert_eq!(module.to_string().matches("target datalayout").count(), 1);
}

#[test_case("i64", false; "machine word")]
#[test_case("i65", true; "wide integer")]
#[test_case("i128", true; "double word")]
#[test_case("ptr", false; "pointer")]
#[test_case("ptr addrspace(1)", false; "pointer in address space")]
#[test_case("[2 x i32]", false; "small array")]
#[test_case("[3 x i32]", true; "large array")]
#[test_case("{ i64, i1 }", true; "struct over a word")]
#[test_case("<4 x i16>", false; "small vector")]
#[test_case("<{ i8, i8 }>", false; "packed struct")]
fn big_types(text: &str, big: bool) {
    let ty = Type::from_text(text).unwrap();
    assert_eq!(ty.is_big(), big);
    assert_eq!(ty.to_string(), text);
}

#[test]
fn typed_pointers_and_named_types() {
    assert_eq!(
        Type::from_text("i8*"),
        Some(Type::TypedPtr(Box::new(Type::Int(8))))
    );
    assert_eq!(
        Type::from_text("%struct.pair"),
        Some(Type::Named("struct.pair".to_string()))
    );
    assert_eq!(Type::from_text("i8 i8"), None);
}

#[test]
fn address_space_pointers_are_pointers() {
    let ty = Type::from_text("ptr addrspace(3)").unwrap();
    assert_eq!(ty, Type::AddrSpacePtr(3));
    assert!(ty.is_pointer());
    assert_eq!(ty.bit_width(), Some(64));
}

#[test]
fn oversized_aggregates_have_no_width() {
    let ty = Type::from_text("[4294967295 x [4294967295 x i64]]").unwrap();
    assert_eq!(ty.bit_width(), None);
    let ty = Type::from_text("{ [4294967295 x i8], [4294967295 x i8] }").unwrap();
    assert_eq!(ty.bit_width(), None);
}
