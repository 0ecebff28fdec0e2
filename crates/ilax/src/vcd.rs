//! Reset values read from a VCD trace.
//!
//! The trace is expected to start in reset: the last value recorded for a
//! register (in `$dumpvars` or any later time step) is taken as its reset
//! value.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use ::vcd::{Command, IdCode, Parser, ScopeItem, ScopeType};
use thiserror::Error;

use crate::HashMap;

pub const RESET_VALUES_FILE: &str = "rst_vals.txt";

#[derive(Error, Debug)]
pub enum VcdError {
    #[error("malformed trace: {0}")]
    Trace(#[from] std::io::Error),

    #[error("cannot read `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed register table: {0}")]
    Registers(#[from] toml::de::Error),
}

/// Register table `name = width`, in TOML.
pub fn read_register_table(path: impl AsRef<Path>) -> Result<BTreeMap<String, u32>, VcdError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| VcdError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

/// Relevant variables by identifier code, with their declared width.
type VarTable = HashMap<IdCode, (String, u32)>;

/// Collects the reset value of every relevant variable in the trace.
///
/// With an empty `registers` table every variable is relevant; otherwise
/// only those naming a register, with or without a leading backslash.
/// Vector values are formatted `<width>'b<bits>`, the width taken from the
/// table when known, then from the `$var` declaration, then from the number
/// of bits recorded. Scalar values are the bare bit character.
pub fn parse_reset_values(
    reader: impl BufRead,
    registers: &BTreeMap<String, u32>,
) -> Result<BTreeMap<String, String>, VcdError> {
    let mut parser = Parser::new(reader);
    let header = parser.parse_header()?;

    let mut vars = VarTable::default();
    collect_vars(&header.items, None, registers, &mut vars);

    let mut values = BTreeMap::new();
    for command in parser {
        match command? {
            Command::ChangeScalar(code, value) => {
                if let Some((name, _)) = vars.get(&code) {
                    values.insert(name.clone(), value.to_string());
                }
            }
            Command::ChangeVector(code, vector) => {
                if let Some((name, declared)) = vars.get(&code) {
                    let bits = vector.to_string();
                    let width = match registers.get(name) {
                        Some(width) => *width as usize,
                        None if *declared > 0 => *declared as usize,
                        None => bits.len(),
                    };
                    values.insert(name.clone(), format!("{}'b{}", width, bits));
                }
            }
            _ => {}
        }
    }

    log::info!(
        "{} relevant variable definitions, {} reset values",
        vars.len(),
        values.len()
    );
    Ok(values)
}

/// Walks the scope tree. The outermost scope is the top module and adds no
/// prefix to the names below it.
fn collect_vars(
    items: &[ScopeItem],
    prefix: Option<&str>,
    registers: &BTreeMap<String, u32>,
    vars: &mut VarTable,
) {
    for item in items {
        match item {
            ScopeItem::Scope(scope) => {
                if scope.scope_type != ScopeType::Module {
                    log::warn!("non-module scope `{}`", scope.identifier);
                }
                let inner = match prefix {
                    None => String::new(),
                    Some(outer) => {
                        format!("{}{}.", outer, scope.identifier.trim_start_matches('\\'))
                    }
                };
                collect_vars(&scope.items, Some(&inner), registers, vars);
            }
            ScopeItem::Var(var) => {
                let hier = format!(
                    "{}{}",
                    prefix.unwrap_or_default(),
                    var.reference.trim_start_matches('\\')
                );
                if let Some(name) = register_name(hier, registers) {
                    vars.entry(var.code).or_insert((name, var.size));
                }
            }
            _ => {}
        }
    }
}

fn register_name(hier: String, registers: &BTreeMap<String, u32>) -> Option<String> {
    if registers.is_empty() || registers.contains_key(&hier) {
        return Some(hier);
    }
    let escaped = format!("\\{}", hier);
    if registers.contains_key(&escaped) {
        Some(escaped)
    } else {
        log::trace!("{} is not a register", hier);
        None
    }
}

/// One `name<tabs>value` line per variable.
pub fn write_reset_values(
    out: &mut impl Write,
    values: &BTreeMap<String, String>,
) -> std::io::Result<()> {
    for (name, value) in values {
        writeln!(out, "{}\t\t\t\t\t\t\t\t\t\t\t\t\t\t{}", name, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: &str = r"$date
    Mon Jan  1 00:00:00 2024
$end
$version Icarus $end
$timescale 1 ns $end
$scope module top $end
$var reg 8 ! acc $end
$var wire 1 # clk $end
$scope module u_alu $end
$var reg 4 % \flag [3:0] $end
$upscope $end
$upscope $end
$enddefinitions $end
#0
$dumpvars
b00000001 !
0#
bx %
$end
#10
b00000010 !
1#
";

    #[test]
    fn keeps_last_value_of_every_variable() {
        let values = parse_reset_values(TRACE.as_bytes(), &BTreeMap::new()).unwrap();
        assert_eq!(
            values,
            BTreeMap::from([
                ("acc".to_string(), "8'b00000010".to_string()),
                ("clk".to_string(), "1".to_string()),
                ("u_alu.flag".to_string(), "4'bx".to_string()),
            ])
        );
    }

    #[test]
    fn register_table_filters_and_sizes() {
        let registers = BTreeMap::from([
            ("acc".to_string(), 16),
            ("\\u_alu.flag".to_string(), 4),
        ]);
        let values = parse_reset_values(TRACE.as_bytes(), &registers).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["acc"], "16'b00000010");
        assert_eq!(values["\\u_alu.flag"], "4'bx");
    }

    #[test]
    fn zero_width_declaration_falls_back_to_recorded_bits() {
        let text = "$scope module top $end\n$var wire 0 ! w $end\n$upscope $end\n\
                    $enddefinitions $end\n#0\nb101 !\n";
        let values = parse_reset_values(text.as_bytes(), &BTreeMap::new()).unwrap();
        assert_eq!(values["w"], "3'b101");
    }

    #[test]
    fn unbalanced_scopes_are_errors() {
        let text = "$scope module top $end\n$enddefinitions $end\n";
        assert!(parse_reset_values(text.as_bytes(), &BTreeMap::new()).is_err());
        let text = "$upscope $end\n$enddefinitions $end\n";
        assert!(parse_reset_values(text.as_bytes(), &BTreeMap::new()).is_err());
    }

    #[test]
    fn output_format() {
        let values = BTreeMap::from([("acc".to_string(), "8'b1".to_string())]);
        let mut out = Vec::new();
        write_reset_values(&mut out, &values).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "acc\t\t\t\t\t\t\t\t\t\t\t\t\t\t8'b1\n"
        );
    }
}
