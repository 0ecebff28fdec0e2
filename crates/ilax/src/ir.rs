//! A small model of textual LLVM IR.
//!
//! Only function definitions are parsed into structure (signature, blocks and
//! instruction lines); every other top-level line is carried through verbatim.
//! That is enough to clean up generated update functions, wrap them for a C
//! caller and read their dependencies back out of the argument list.

use std::fmt;
use std::path::Path;

use thiserror::Error;

mod dead_args;
pub(crate) mod lexer;
mod mux_branch;
mod verify;
mod wrapper;

pub use dead_args::remove_dead_args;
pub use mux_branch::convert_selects_to_branches;
pub use verify::{VerifyError, verify_function};
pub use wrapper::{RETURN_ARRAY_PTR_ID, RETURN_VAL_PTR_ID, WRAPPER_SUFFIX, create_wrapper};

use lexer::{Token, fmt_global, fmt_local, fmt_name, matching_close, name_of, split_top_level, tokenize};

/// x86-64 data layout matching what clang emits, so that linking the
/// generated modules against C/C++ objects does not warn.
pub const X86_64_DATA_LAYOUT: &str =
    "e-m:e-p270:32:32-p271:32:32-p272:64:64-i64:64-f80:128-n8:16:32:64-S128";

/// Widest value passed directly in a register.
pub const MACHINE_WORD_BITS: u32 = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct IrParseError {
    pub line: usize,
    pub message: String,
}

impl IrParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Void,
    Int(u32),
    Ptr,
    /// `ptr addrspace(N)`.
    AddrSpacePtr(u32),
    /// Pre-opaque-pointer `T*`.
    TypedPtr(Box<Type>),
    Vector { len: u32, elem: Box<Type> },
    Array { len: u32, elem: Box<Type> },
    Struct { fields: Vec<Type>, packed: bool },
    /// `%name` type reference.
    Named(String),
    /// Floating point, `label`, `metadata` and anything else kept as spelled.
    Other(String),
}

impl Type {
    pub fn bit_width(&self) -> Option<u32> {
        match self {
            Type::Void => Some(0),
            Type::Int(bits) => Some(*bits),
            Type::Ptr | Type::AddrSpacePtr(_) | Type::TypedPtr(_) => Some(MACHINE_WORD_BITS),
            Type::Vector { len, elem } | Type::Array { len, elem } => {
                elem.bit_width()?.checked_mul(*len)
            }
            Type::Struct { fields, .. } => fields
                .iter()
                .try_fold(0u32, |acc, field| acc.checked_add(field.bit_width()?)),
            Type::Named(_) => None,
            Type::Other(name) => match name.as_str() {
                "half" | "bfloat" => Some(16),
                "float" => Some(32),
                "double" => Some(64),
                "x86_fp80" => Some(80),
                "fp128" | "ppc_fp128" => Some(128),
                _ => None,
            },
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Ptr | Type::AddrSpacePtr(_) | Type::TypedPtr(_))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Type::Void)
    }

    /// Too wide to travel in a register: integers wider than a machine word
    /// and aggregates whose total width exceeds one.
    pub fn is_big(&self) -> bool {
        match self {
            Type::Int(bits) => *bits > MACHINE_WORD_BITS,
            Type::Vector { .. } | Type::Array { .. } | Type::Struct { .. } => self
                .bit_width()
                .is_some_and(|w| w > MACHINE_WORD_BITS),
            _ => false,
        }
    }

    pub(crate) fn parse(tokens: &[Token], pos: &mut usize) -> Option<Type> {
        let first = tokens.get(*pos)?.text.as_str();
        *pos += 1;
        let mut ty = match first {
            "void" => Type::Void,
            "ptr" => {
                if tokens.get(*pos).is_some_and(|t| t.text == "addrspace") {
                    *pos += 1;
                    Self::expect(tokens, pos, "(")?;
                    let space = tokens.get(*pos)?.text.parse().ok()?;
                    *pos += 1;
                    Self::expect(tokens, pos, ")")?;
                    Type::AddrSpacePtr(space)
                } else {
                    Type::Ptr
                }
            }
            "half" | "bfloat" | "float" | "double" | "fp128" | "x86_fp80" | "ppc_fp128"
            | "label" | "metadata" | "token" | "x86_amx" | "x86_mmx" => {
                Type::Other(first.to_string())
            }
            "<" if tokens.get(*pos).is_some_and(|t| t.text == "{") => {
                *pos += 1;
                let fields = Self::parse_fields(tokens, pos)?;
                Self::expect(tokens, pos, ">")?;
                Type::Struct {
                    fields,
                    packed: true,
                }
            }
            "<" | "[" => {
                let len = tokens.get(*pos)?.text.parse().ok()?;
                *pos += 1;
                Self::expect(tokens, pos, "x")?;
                let elem = Box::new(Self::parse(tokens, pos)?);
                if first == "<" {
                    Self::expect(tokens, pos, ">")?;
                    Type::Vector { len, elem }
                } else {
                    Self::expect(tokens, pos, "]")?;
                    Type::Array { len, elem }
                }
            }
            "{" => Type::Struct {
                fields: Self::parse_fields(tokens, pos)?,
                packed: false,
            },
            _ if first.starts_with('%') => Type::Named(name_of(first)),
            _ => {
                let bits = first.strip_prefix('i')?.parse().ok()?;
                Type::Int(bits)
            }
        };
        while tokens.get(*pos).is_some_and(|t| t.text == "*") {
            *pos += 1;
            ty = Type::TypedPtr(Box::new(ty));
        }
        Some(ty)
    }

    /// Parses struct fields after `{`, consuming the closing `}`.
    fn parse_fields(tokens: &[Token], pos: &mut usize) -> Option<Vec<Type>> {
        let mut fields = Vec::new();
        if tokens.get(*pos).is_some_and(|t| t.text == "}") {
            *pos += 1;
            return Some(fields);
        }
        loop {
            fields.push(Self::parse(tokens, pos)?);
            match tokens.get(*pos)?.text.as_str() {
                "," => *pos += 1,
                "}" => {
                    *pos += 1;
                    return Some(fields);
                }
                _ => return None,
            }
        }
    }

    fn expect(tokens: &[Token], pos: &mut usize, text: &str) -> Option<()> {
        (tokens.get(*pos)?.text == text).then(|| *pos += 1)
    }

    /// Parses a complete type spelling.
    pub fn from_text(text: &str) -> Option<Type> {
        let tokens = tokenize(text);
        let mut pos = 0;
        let ty = Self::parse(&tokens, &mut pos)?;
        (pos == tokens.len()).then_some(ty)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{}", bits),
            Type::Ptr => write!(f, "ptr"),
            Type::AddrSpacePtr(space) => write!(f, "ptr addrspace({})", space),
            Type::TypedPtr(inner) => write!(f, "{}*", inner),
            Type::Vector { len, elem } => write!(f, "<{} x {}>", len, elem),
            Type::Array { len, elem } => write!(f, "[{} x {}]", len, elem),
            Type::Struct { fields, packed } => {
                let body = fields
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                let body = if fields.is_empty() {
                    "{}".to_string()
                } else {
                    format!("{{ {} }}", body)
                };
                if *packed {
                    write!(f, "<{}>", body)
                } else {
                    write!(f, "{}", body)
                }
            }
            Type::Named(name) => write!(f, "{}", fmt_local(name)),
            Type::Other(text) => write!(f, "{}", text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub ty: Type,
    /// Parameter attributes, one entry per attribute (`noundef`, `align 8`, ...).
    pub attrs: Vec<String>,
    /// Parameter name; unnamed parameters carry their implicit number.
    pub name: String,
}

impl Param {
    pub fn is_numbered(&self) -> bool {
        lexer::is_numbered(&self.name)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty)?;
        for attr in &self.attrs {
            write!(f, " {}", attr)?;
        }
        write!(f, " {}", fmt_local(&self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// `None` only for an entry block without a label line.
    pub label: Option<String>,
    pub insts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    /// Everything between `define` and the return type: linkage, calling
    /// convention, return attributes.
    pub prefix: Vec<String>,
    pub ret: Type,
    pub params: Vec<Param>,
    pub varargs: bool,
    /// Everything between the parameter list and the body.
    pub suffix: String,
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Calling convention keyword, if one is spelled out.
    pub fn calling_conv(&self) -> Option<String> {
        let mut words = self.prefix.iter().peekable();
        while let Some(word) = words.next() {
            if word == "cc" {
                return words.next().map(|n| format!("cc {}", n));
            }
            let is_cc = word.len() > 2
                && word.ends_with("cc")
                && word.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if is_cc {
                return Some(word.clone());
            }
        }
        None
    }

    /// Name by which branch and phi instructions refer to block `idx`.
    pub fn block_ref(&self, idx: usize) -> String {
        match &self.blocks[idx].label {
            Some(label) => label.clone(),
            None => self
                .params
                .iter()
                .filter(|p| p.is_numbered())
                .count()
                .to_string(),
        }
    }

    pub fn block_index(&self, name: &str) -> Option<usize> {
        (0..self.blocks.len()).find(|&i| self.block_ref(i) == name)
    }

    /// Number of references to `name` in the body.
    pub fn use_count(&self, name: &str) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| &b.insts)
            .map(|inst| {
                lexer::local_refs(inst)
                    .into_iter()
                    .filter(|r| r.name == name)
                    .count()
                    .saturating_sub(usize::from(lexer::defined_local(inst).as_deref() == Some(name)))
            })
            .sum()
    }

    /// Every local name in scope: parameters, labels and instruction results.
    pub fn local_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.params.iter().map(|p| p.name.clone()).collect();
        for (idx, block) in self.blocks.iter().enumerate() {
            names.push(self.block_ref(idx));
            names.extend(block.insts.iter().filter_map(|i| lexer::defined_local(i)));
        }
        names
    }

    fn parse_header(line_no: usize, header: &str) -> Result<Self, IrParseError> {
        let err = |msg: &str| IrParseError::new(line_no, msg);
        let rest = header
            .trim_start()
            .strip_prefix("define")
            .ok_or_else(|| err("expected `define`"))?;

        let at = find_global_sigil(rest).ok_or_else(|| err("missing function name"))?;
        let open = find_params_open(rest, at).ok_or_else(|| err("missing parameter list"))?;
        let close = matching_close(rest, open).ok_or_else(|| err("unbalanced parameter list"))?;
        let name = name_of(rest[at..open].trim());

        let head_tokens = tokenize(&rest[..at]);
        let (ret_at, ret) = (0..head_tokens.len())
            .find_map(|i| {
                let mut pos = i;
                let ty = Type::parse(&head_tokens, &mut pos)?;
                (pos == head_tokens.len()).then_some((i, ty))
            })
            .ok_or_else(|| err("missing return type"))?;
        let prefix = head_tokens[..ret_at].iter().map(|t| t.text.clone()).collect();

        let mut params = Vec::new();
        let mut varargs = false;
        let mut next_number = 0;
        for part in split_top_level(&rest[open + 1..close]) {
            if part == "..." {
                varargs = true;
                continue;
            }
            let param = Self::parse_param(part, &mut next_number)
                .ok_or_else(|| err(&format!("malformed parameter `{}`", part)))?;
            params.push(param);
        }

        let suffix = rest[close + 1..].trim();
        let suffix = suffix.strip_suffix('{').unwrap_or(suffix).trim_end();
        Ok(Self {
            name,
            prefix,
            ret,
            params,
            varargs,
            suffix: suffix.to_string(),
            blocks: Vec::new(),
        })
    }

    fn parse_param(part: &str, next_number: &mut usize) -> Option<Param> {
        let tokens = tokenize(part);
        let mut pos = 0;
        let ty = Type::parse(&tokens, &mut pos)?;
        let named = tokens
            .last()
            .filter(|t| tokens.len() > pos && t.text.starts_with('%'));
        let attr_end = if named.is_some() {
            tokens.len() - 1
        } else {
            tokens.len()
        };
        let attrs = if pos < attr_end {
            split_attrs(&part[tokens[pos].span.start..tokens[attr_end - 1].span.end])
        } else {
            Vec::new()
        };
        let name = match named {
            Some(token) => name_of(&token.text),
            None => next_number.to_string(),
        };
        if lexer::is_numbered(&name) {
            *next_number += 1;
        }
        Some(Param { ty, attrs, name })
    }

    fn parse_body(&mut self, lines: &[(usize, &str)]) -> Result<(), IrParseError> {
        let mut pending = String::new();
        for &(line_no, raw) in lines {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            // `switch` tables and similar span several lines; keep them as one.
            if !pending.is_empty() {
                pending.push(' ');
                pending.push_str(line);
                if lexer::bracket_depth(&pending) > 0 {
                    continue;
                }
                let inst = std::mem::take(&mut pending);
                match self.blocks.last_mut() {
                    Some(block) => block.insts.push(inst),
                    None => return Err(IrParseError::new(line_no, "instruction outside a block")),
                }
                continue;
            }
            if lexer::bracket_depth(line) > 0 {
                pending = line.to_string();
                if self.blocks.is_empty() {
                    self.blocks.push(Block {
                        label: None,
                        insts: Vec::new(),
                    });
                }
                continue;
            }
            if let Some(label) = parse_label(line) {
                self.blocks.push(Block {
                    label: Some(label),
                    insts: Vec::new(),
                });
                continue;
            }
            match self.blocks.last_mut() {
                Some(block) => block.insts.push(line.to_string()),
                None if raw.starts_with(char::is_whitespace) => self.blocks.push(Block {
                    label: None,
                    insts: vec![line.to_string()],
                }),
                None => return Err(IrParseError::new(line_no, "instruction outside a function body")),
            }
        }
        if !pending.is_empty() {
            return Err(IrParseError::new(
                lines.last().map_or(0, |(n, _)| *n),
                "unterminated instruction",
            ));
        }
        Ok(())
    }
}

/// Splits an attribute list into individual attributes, keeping parenthesized
/// arguments and numeric operands (`align 8`) attached.
pub(crate) fn split_attrs(text: &str) -> Vec<String> {
    let tokens = tokenize(text);
    let mut attrs = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let start = tokens[i].span.start;
        let mut end = tokens[i].span.end;
        i += 1;
        if tokens.get(i).is_some_and(|t| t.text == "(") {
            if let Some(close) = matching_close(text, tokens[i].span.start) {
                end = close + 1;
                while i < tokens.len() && tokens[i].span.start <= close {
                    i += 1;
                }
            }
        } else if tokens
            .get(i)
            .is_some_and(|t| t.text.bytes().all(|b| b.is_ascii_digit()))
        {
            end = tokens[i].span.end;
            i += 1;
        }
        attrs.push(text[start..end].to_string());
    }
    attrs
}

fn find_global_sigil(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    i += 1;
                }
            }
            b'@' => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

fn find_params_open(text: &str, at: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = at + 1;
    if bytes.get(i) == Some(&b'"') {
        i += 1;
        while i < bytes.len() && bytes[i] != b'"' {
            i += 1;
        }
        i += 1;
    }
    text[i..].find('(').map(|off| i + off)
}

fn parse_label(line: &str) -> Option<String> {
    let line = line.split(';').next().unwrap_or(line).trim_end();
    let label = line.strip_suffix(':')?;
    if let Some(quoted) = label.strip_prefix('"').and_then(|l| l.strip_suffix('"')) {
        return Some(lexer::unescape(quoted));
    }
    label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '$' | '.' | '_'))
        .then(|| label.to_string())
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "define")?;
        for word in &self.prefix {
            write!(f, " {}", word)?;
        }
        let mut params: Vec<String> = self.params.iter().map(ToString::to_string).collect();
        if self.varargs {
            params.push("...".to_string());
        }
        write!(
            f,
            " {} {}({})",
            self.ret,
            fmt_global(&self.name),
            params.join(", ")
        )?;
        if !self.suffix.is_empty() {
            write!(f, " {}", self.suffix)?;
        }
        writeln!(f, " {{")?;
        for (idx, block) in self.blocks.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            if let Some(label) = &block.label {
                writeln!(f, "{}:", fmt_name(label))?;
            }
            for inst in &block.insts {
                writeln!(f, "  {}", inst)?;
            }
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// A top-level line kept verbatim.
    Text(String),
    Function(Function),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Module {
    pub items: Vec<Item>,
}

const TOP_LEVEL_KEYWORDS: &[&str] = &[
    "source_filename",
    "target",
    "declare",
    "attributes",
    "module",
    "uselistorder",
    "uselistorder_bb",
];

impl Module {
    pub fn parse(text: &str) -> Result<Self, IrParseError> {
        let mut items = Vec::new();
        let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));
        while let Some((line_no, line)) = lines.next() {
            let trimmed = line.trim();
            if trimmed.starts_with("define") {
                let mut func = Function::parse_header(line_no, line)?;
                let mut body = Vec::new();
                let mut closed = false;
                for (body_no, body_line) in lines.by_ref() {
                    if body_line.trim() == "}" {
                        closed = true;
                        break;
                    }
                    body.push((body_no, body_line));
                }
                if !closed {
                    return Err(IrParseError::new(line_no, "unterminated function body"));
                }
                func.parse_body(&body)?;
                items.push(Item::Function(func));
                continue;
            }
            let recognized = trimmed.is_empty()
                || line.starts_with(char::is_whitespace)
                || matches!(trimmed.as_bytes()[0], b';' | b'@' | b'%' | b'!' | b'$' | b'#')
                || TOP_LEVEL_KEYWORDS
                    .iter()
                    .any(|kw| trimmed.split_whitespace().next() == Some(*kw));
            if !recognized {
                return Err(IrParseError::new(
                    line_no,
                    format!("unexpected top-level line `{}`", trimmed),
                ));
            }
            items.push(Item::Text(line.to_string()));
        }
        Ok(Self { items })
    }

    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self, IrParseError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| IrParseError::new(0, format!("cannot read file: {}", e)))?;
        Self::parse(&text)
    }

    pub fn functions(&self) -> impl Iterator<Item = &Function> {
        self.items.iter().filter_map(|item| match item {
            Item::Function(f) => Some(f),
            Item::Text(_) => None,
        })
    }

    pub fn functions_mut(&mut self) -> impl Iterator<Item = &mut Function> {
        self.items.iter_mut().filter_map(|item| match item {
            Item::Function(f) => Some(f),
            Item::Text(_) => None,
        })
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions().find(|f| f.name == name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut Function> {
        self.functions_mut().find(|f| f.name == name)
    }

    /// Adds `func` right after the definition of `after`, or at the end.
    pub fn insert_function_after(&mut self, after: &str, func: Function) {
        let pos = self
            .items
            .iter()
            .position(|item| matches!(item, Item::Function(f) if f.name == after))
            .map_or(self.items.len(), |p| p + 1);
        self.items.insert(pos, Item::Text(String::new()));
        self.items.insert(pos + 1, Item::Function(func));
    }

    /// Replaces any existing `target datalayout` line, or adds one.
    pub fn set_data_layout(&mut self, layout: &str) {
        let line = format!("target datalayout = \"{}\"", layout);
        let existing = self.items.iter_mut().find(|item| {
            matches!(item, Item::Text(t) if t.trim_start().starts_with("target datalayout"))
        });
        match existing {
            Some(item) => *item = Item::Text(line),
            None => {
                let pos = self
                    .items
                    .iter()
                    .position(|item| match item {
                        Item::Text(t) => {
                            let t = t.trim_start();
                            !(t.starts_with(';') || t.starts_with("source_filename"))
                        }
                        Item::Function(_) => true,
                    })
                    .unwrap_or(self.items.len());
                self.items.insert(pos, Item::Text(line));
            }
        }
    }

    pub fn data_layout(&self) -> Option<&str> {
        self.items.iter().find_map(|item| match item {
            Item::Text(t) => t
                .trim_start()
                .strip_prefix("target datalayout = \"")
                .and_then(|s| s.strip_suffix('"')),
            Item::Function(_) => None,
        })
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for item in &self.items {
            match item {
                Item::Text(text) => writeln!(f, "{}", text)?,
                Item::Function(func) => writeln!(f, "{}", func)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod ir_tests;
