use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::config::Config;
use crate::deps::{DependencyArg, is_reserved_arg};
use crate::error::ExtractError;
use crate::sync::{SyncList, SyncMap, SyncSet, ThreadCount};

/// Catalog entry of one architectural state variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WidthCycles {
    pub width: u32,
    /// Specific cycles a delayed value is needed at; empty when unspecialized.
    pub cycles: BTreeSet<i32>,
}

impl WidthCycles {
    pub fn new(width: u32) -> Self {
        Self {
            width,
            cycles: BTreeSet::new(),
        }
    }
}

/// Dependencies of every affected target, per instruction.
pub type DependencyReport = BTreeMap<String, BTreeMap<String, Vec<DependencyArg>>>;

/// Everything one extraction run shares between its units.
#[derive(Debug, Default)]
pub struct RunState {
    /// Scalar targets waiting to be generated.
    pub work_set: SyncSet,
    /// Targets generated against every instruction.
    pub visited: SyncSet,
    pub catalog: SyncMap<WidthCycles>,
    /// Instruction name to target name to dependencies.
    pub report: SyncMap<BTreeMap<String, Vec<DependencyArg>>>,
    /// Final `.ll` files of useful units.
    pub artifacts: SyncList<PathBuf>,
    pub running: ThreadCount,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `name` to the catalog, or checks it against the existing entry.
    /// Returns `true` if the entry was created.
    pub fn catalog_asv(&self, name: &str, width: u32) -> Result<bool, ExtractError> {
        self.catalog.upsert(
            name,
            || WidthCycles::new(width),
            |entry, created| {
                if entry.width != width {
                    return Err(ExtractError::WidthMismatch {
                        name: name.to_string(),
                        recorded: entry.width,
                        observed: width,
                    });
                }
                Ok(created)
            },
        )
    }

    pub fn catalog_width(&self, name: &str) -> Option<u32> {
        self.catalog.get(name).map(|entry| entry.width)
    }

    /// Makes sure `instr` shows up in the report even if nothing is affected.
    pub fn open_instruction(&self, instr: &str) {
        self.report.emplace(instr, BTreeMap::new());
    }

    /// Records the dependencies of `target` under `instr`. A second record
    /// for the same pair is ignored with a warning; the first one is kept.
    pub fn record(&self, instr: &str, target: &str, args: Vec<DependencyArg>) -> bool {
        let inserted = self.report.upsert(instr, BTreeMap::new, |targets, _| {
            if targets.contains_key(target) {
                false
            } else {
                targets.insert(target.to_string(), args);
                true
            }
        });
        if !inserted {
            log::warn!(
                "for instruction {}, target {} is seen before",
                instr,
                target
            );
        }
        inserted
    }

    /// Feeds the dependencies of a finished unit back into the catalog and
    /// the work set.
    ///
    /// Reserved arguments, configured targets, vectors and vector members
    /// are left alone. Everything else is catalogued with the magnitude of
    /// its width; a width that disagrees with the catalog is fatal. New
    /// names are queued unless already visited.
    pub fn absorb(&self, config: &Config, args: &[DependencyArg]) -> Result<(), ExtractError> {
        for arg in args {
            let name = arg.name.as_str();
            if is_reserved_arg(name)
                || config.targets.contains_key(name)
                || config.is_vector(name)
                || config.vector_of_member(name).is_some()
            {
                continue;
            }

            let created = self.catalog_asv(name, arg.width.unsigned_abs())?;
            if arg.cycle != 0 {
                self.catalog.update(name, |entry| entry.cycles.insert(arg.cycle));
            }
            if created && config.options.push_new_targets && !self.visited.contains(name) {
                log::debug!("new target {}", name);
                self.work_set.insert(name);
            }
        }
        Ok(())
    }

    pub fn report_snapshot(&self) -> DependencyReport {
        self.report.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(name: &str, width: i32, cycle: i32) -> DependencyArg {
        DependencyArg {
            name: name.to_string(),
            width,
            cycle,
        }
    }

    const CONFIG: &str = r#"
[targets]
pc = [1]
[target_vectors.regfile]
members = ["rf[0]", "rf[1]"]
"#;

    #[test]
    fn absorb_catalogs_and_queues_new_names() {
        let config: Config = CONFIG.parse().unwrap();
        let state = RunState::new();
        state.visited.insert("done");
        state
            .absorb(
                &config,
                &[
                    arg("acc", 8, 0),
                    arg("mem", -128, 2),
                    arg("done", 1, 0),
                    arg("pc", 32, 0),
                    arg("regfile", -32, 0),
                    arg("rf[1]", -32, 0),
                    arg("__RETURN_VAL_PTR__", -128, 0),
                ],
            )
            .unwrap();

        assert_eq!(
            state.work_set.snapshot().into_iter().collect::<Vec<_>>(),
            vec!["acc", "mem"]
        );
        assert_eq!(state.catalog_width("mem"), Some(128));
        assert_eq!(
            state.catalog.get("mem").unwrap().cycles,
            BTreeSet::from([2])
        );
        assert!(state.catalog.contains("done"));
        assert!(!state.catalog.contains("pc"));
        assert!(!state.catalog.contains("rf[1]"));
    }

    #[test]
    fn catalogued_names_are_not_requeued() {
        let config: Config = "".parse().unwrap();
        let state = RunState::new();
        state.catalog_asv("acc", 8).unwrap();
        state.absorb(&config, &[arg("acc", 8, 1)]).unwrap();
        assert!(state.work_set.is_empty());
        assert_eq!(state.catalog.get("acc").unwrap().cycles, BTreeSet::from([1]));
    }

    #[test]
    fn width_mismatch_is_fatal() {
        let config: Config = "".parse().unwrap();
        let state = RunState::new();
        state.absorb(&config, &[arg("acc", 8, 0)]).unwrap();
        let err = state.absorb(&config, &[arg("acc", -16, 0)]).unwrap_err();
        assert!(matches!(
            err,
            ExtractError::WidthMismatch { recorded: 8, observed: 16, .. }
        ));
    }

    #[test]
    fn first_record_wins() {
        let state = RunState::new();
        assert!(state.record("ADD", "acc", vec![arg("a", 8, 0)]));
        assert!(!state.record("ADD", "acc", vec![arg("b", 8, 0)]));
        let report = state.report_snapshot();
        assert_eq!(report["ADD"]["acc"][0].name, "a");
    }
}
