//! Reading dependencies back out of a wrapper's parameter list.

use crate::config::{Config, CycleOrder};
use crate::design::DesignInfo;
use crate::error::ExtractError;
use crate::ir::{Function, RETURN_ARRAY_PTR_ID, RETURN_VAL_PTR_ID};

/// Separates a variable name from its cycle number in argument names.
pub const CYCLE_DELIMITER: &str = "#";

/// One input of an update function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyArg {
    pub name: String,
    /// Width in bits; negative when the value is passed by pointer.
    pub width: i32,
    /// Cycles before the end of the instruction's time window.
    pub cycle: i32,
}

pub fn is_reserved_arg(name: &str) -> bool {
    name == RETURN_ARRAY_PTR_ID || name == RETURN_VAL_PTR_ID
}

/// Splits `var#n` into `var` and `n`. A missing or non-numeric suffix
/// yields no cycle.
pub fn split_cycle(arg: &str) -> (&str, Option<i32>) {
    match arg.split_once(CYCLE_DELIMITER) {
        Some((var, suffix)) => match suffix.parse() {
            Ok(n) => (var, Some(n)),
            Err(_) => (var, None),
        },
        None => (arg, None),
    }
}

fn width_i32(width: u32) -> i32 {
    i32::try_from(width).unwrap_or(i32::MAX)
}

/// Context needed to size pointer arguments.
pub struct ArgContext<'a> {
    pub config: &'a Config,
    pub design: &'a dyn DesignInfo,
    /// Catalogued width of an ASV, if known.
    pub catalog_width: &'a dyn Fn(&str) -> Option<u32>,
}

/// Turns the parameters of `wrapper` into dependency records.
///
/// `target` is the unit's target and `delay_bound` its delay; together with
/// the configured cycle order they map argument suffixes to cycles.
pub fn gather_wrapper_args(
    wrapper: &Function,
    target: &str,
    delay_bound: u32,
    cycle_order: CycleOrder,
    cx: &ArgContext<'_>,
) -> Result<Vec<DependencyArg>, ExtractError> {
    let mut args = Vec::with_capacity(wrapper.params.len());
    for param in &wrapper.params {
        let name = param.name.as_str();
        if name == RETURN_ARRAY_PTR_ID {
            let vector = cx.config.target_vectors.get(target).ok_or_else(|| {
                ExtractError::ReservedArgument {
                    function: wrapper.name.clone(),
                    argument: name.to_string(),
                    target: target.to_string(),
                    reason: "is not a vector",
                }
            })?;
            let width = vector_member_width(target, &vector.members, cx)?;
            args.push(DependencyArg {
                name: name.to_string(),
                width: -width_i32(width),
                cycle: 0,
            });
            continue;
        }
        if name == RETURN_VAL_PTR_ID {
            let width = match (cx.catalog_width)(target) {
                Some(width) => width,
                None => {
                    log::warn!(
                        "function {} has arg {}, but {} is not a known ASV",
                        wrapper.name,
                        name,
                        target
                    );
                    cx.design
                        .var_width_complex(target)
                        .ok_or_else(|| ExtractError::ReservedArgument {
                            function: wrapper.name.clone(),
                            argument: name.to_string(),
                            target: target.to_string(),
                            reason: "has no known width",
                        })?
                }
            };
            args.push(DependencyArg {
                name: name.to_string(),
                width: -width_i32(width),
                cycle: 0,
            });
            continue;
        }

        let (var, suffix) = split_cycle(name);
        let cycle = match suffix {
            Some(n) => cycle_order.to_cycle(n, delay_bound).ok_or_else(|| {
                ExtractError::CycleOutOfRange {
                    argument: name.to_string(),
                    delay_bound,
                }
            })?,
            None => 0,
        };

        let width = if !param.ty.is_pointer() {
            param
                .ty
                .bit_width()
                .map(width_i32)
                .ok_or_else(|| ExtractError::UnknownWidth {
                    name: var.to_string(),
                })?
        } else if let Some(vector) = cx.config.target_vectors.get(var) {
            -width_i32(vector_member_width(var, &vector.members, cx)?)
        } else if let Some(width) = (cx.catalog_width)(var) {
            -width_i32(width)
        } else {
            let width = cx
                .design
                .var_width_complex(var)
                .ok_or_else(|| ExtractError::UnknownWidth {
                    name: var.to_string(),
                })?;
            if cx.config.vector_of_member(var).is_some() {
                log::info!(
                    "function {} has arg {} of size {} which belongs to a register array",
                    wrapper.name,
                    var,
                    width
                );
            } else {
                log::warn!(
                    "function {} has arg {} of size {} which is not a known ASV or register array",
                    wrapper.name,
                    var,
                    width
                );
            }
            -width_i32(width)
        };

        args.push(DependencyArg {
            name: var.to_string(),
            width,
            cycle,
        });
    }
    Ok(args)
}

fn vector_member_width(
    vector: &str,
    members: &[String],
    cx: &ArgContext<'_>,
) -> Result<u32, ExtractError> {
    let first = members
        .first()
        .ok_or_else(|| ExtractError::EmptyTargetVector {
            name: vector.to_string(),
        })?;
    cx.design
        .var_width_complex(first)
        .ok_or_else(|| ExtractError::UnknownWidth {
            name: first.clone(),
        })
}
