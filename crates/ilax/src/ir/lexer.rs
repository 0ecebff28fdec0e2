//! Token-level helpers for textual IR.

use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub text: String,
    pub span: Range<usize>,
}

const PUNCT: &[char] = &['(', ')', '[', ']', '{', '}', '<', '>', ',', '*', '='];

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '$' | '.' | '_')
}

/// Index just past the closing quote of a string starting at `open`.
fn skip_string(bytes: &[u8], open: usize) -> usize {
    let mut i = open + 1;
    while i < bytes.len() && bytes[i] != b'"' {
        i += 1;
    }
    (i + 1).min(bytes.len())
}

/// Splits a header fragment into tokens. Quoted names keep their sigil and
/// quotes; `;` starts a comment.
pub(crate) fn tokenize(text: &str) -> Vec<Token> {
    let bytes = text.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c == ';' {
            break;
        }
        let start = i;
        if PUNCT.contains(&c) {
            i += 1;
        } else if c == '"' {
            i = skip_string(bytes, i);
        } else {
            while i < bytes.len() {
                let c = bytes[i] as char;
                if c == '"' {
                    i = skip_string(bytes, i);
                    break;
                }
                if c.is_ascii_whitespace() || PUNCT.contains(&c) || c == ';' {
                    break;
                }
                i += 1;
            }
        }
        tokens.push(Token {
            text: text[start..i].to_string(),
            span: start..i,
        });
    }
    tokens
}

/// Splits at commas that are not nested in brackets or strings.
pub(crate) fn split_top_level(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'(' | b'[' | b'{' | b'<' => depth += 1,
            b')' | b']' | b'}' | b'>' => depth -= 1,
            b',' if depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    let last = text[start..].trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last);
    }
    parts
}

/// Net count of unclosed `[`, `(` and `{` outside strings and comments.
pub(crate) fn bracket_depth(text: &str) -> i32 {
    let bytes = text.as_bytes();
    let mut depth = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i = skip_string(bytes, i);
                continue;
            }
            b';' => break,
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    depth
}

/// Index of the bracket closing the one at `open`.
pub(crate) fn matching_close(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut i = open;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i = skip_string(bytes, i);
                continue;
            }
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// A `%name` occurrence inside an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LocalRef {
    pub name: String,
    pub span: Range<usize>,
}

/// Finds every local identifier in `line`, skipping string constants,
/// global names and the trailing comment.
pub(crate) fn local_refs(line: &str) -> Vec<LocalRef> {
    let bytes = line.as_bytes();
    let mut refs = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b';' => break,
            b'"' => i = skip_string(bytes, i),
            b'@' | b'%' if i + 1 < bytes.len() && bytes[i + 1] == b'"' => {
                let end = skip_string(bytes, i + 1);
                if bytes[i] == b'%' {
                    let quoted = &line[i + 2..end.saturating_sub(1).max(i + 2)];
                    refs.push(LocalRef {
                        name: unescape(quoted),
                        span: i..end,
                    });
                }
                i = end;
            }
            sigil @ (b'@' | b'%') => {
                let start = i;
                i += 1;
                while i < bytes.len() && is_ident_char(bytes[i] as char) {
                    i += 1;
                }
                if sigil == b'%' && i > start + 1 {
                    refs.push(LocalRef {
                        name: line[start + 1..i].to_string(),
                        span: start..i,
                    });
                }
            }
            _ => i += 1,
        }
    }
    refs
}

/// Applies `rename` to every local identifier in `line`.
pub(crate) fn rewrite_locals(line: &str, rename: impl Fn(&LocalRef) -> Option<String>) -> String {
    let mut out = String::with_capacity(line.len());
    let mut last = 0;
    for r in local_refs(line) {
        if let Some(new_name) = rename(&r) {
            out.push_str(&line[last..r.span.start]);
            out.push_str(&fmt_local(&new_name));
            last = r.span.end;
        }
    }
    out.push_str(&line[last..]);
    out
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Decodes the `\XX` escapes of a quoted IR name.
pub(crate) fn unescape(quoted: &str) -> String {
    let bytes = quoted.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if i + 1 < bytes.len() && bytes[i + 1] == b'\\' {
                out.push(b'\\');
                i += 2;
                continue;
            }
            if let Some(&[hi, lo]) = bytes.get(i + 1..i + 3) {
                if let (Some(hi), Some(lo)) = (hex_digit(hi), hex_digit(lo)) {
                    out.push((hi << 4) | lo);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Strips an optional sigil and quotes from a name token.
pub(crate) fn name_of(token: &str) -> String {
    let bare = token.trim_start_matches(['%', '@']);
    match bare.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(quoted) => unescape(quoted),
        None => bare.to_string(),
    }
}

fn needs_quotes(name: &str) -> bool {
    if name.is_empty() {
        return true;
    }
    if name.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let first = name.as_bytes()[0] as char;
    first.is_ascii_digit() || !name.chars().all(is_ident_char)
}

fn quote(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for b in name.bytes() {
        if b == b'"' || b == b'\\' || !(0x20..0x7f).contains(&b) {
            out.push_str(&format!("\\{:02X}", b));
        } else {
            out.push(b as char);
        }
    }
    out.push('"');
    out
}

/// Prints a name without its sigil, quoting it when required.
pub(crate) fn fmt_name(name: &str) -> String {
    if needs_quotes(name) {
        quote(name)
    } else {
        name.to_string()
    }
}

pub(crate) fn fmt_local(name: &str) -> String {
    format!("%{}", fmt_name(name))
}

pub(crate) fn fmt_global(name: &str) -> String {
    format!("@{}", fmt_name(name))
}

pub(crate) fn is_numbered(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

/// Splits `%x = rest` into the defined local and `rest`.
pub(crate) fn split_assignment(inst: &str) -> Option<(String, &str)> {
    let first = local_refs(inst).into_iter().next()?;
    if first.span.start != 0 {
        return None;
    }
    let rest = inst[first.span.end..].trim_start().strip_prefix('=')?;
    Some((first.name, rest.trim_start()))
}

/// Local defined by an instruction of the form `%x = ...`.
pub(crate) fn defined_local(inst: &str) -> Option<String> {
    split_assignment(inst).map(|(name, _)| name)
}

/// Opcode of an instruction, ignoring any result assignment.
pub(crate) fn opcode(inst: &str) -> &str {
    let body = split_assignment(inst).map_or(inst, |(_, rest)| rest);
    let mut words = body.split_whitespace();
    let mut word = words.next().unwrap_or("");
    while matches!(word, "tail" | "musttail" | "notail") {
        word = words.next().unwrap_or("");
    }
    word
}
