use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::HashMap;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read configuration `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("target vector `{name}` has an empty member list")]
    EmptyTargetVector { name: String },

    #[error("member `{member}` belongs to both `{first}` and `{second}`")]
    SharedVectorMember {
        member: String,
        first: String,
        second: String,
    },

    #[error("instruction #{index} has an empty name")]
    UnnamedInstruction { index: usize },

    #[error("invalid memory pattern `{pattern}`: {source}")]
    MemoryPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Which loop of the fixpoint computation is the outer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Schedule {
    /// Pop one target, generate it for every instruction, repeat.
    #[default]
    TargetOuter,
    /// Snapshot the work set, then run every instruction over the snapshot.
    InstructionOuter,
}

/// How the numeric suffix of a generated argument name maps to a cycle offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleOrder {
    /// Suffixes count up from 1; cycle = suffix - 1.
    #[default]
    Forward,
    /// Suffixes count down from the delay bound; cycle = delay - suffix.
    Reverse,
}

impl CycleOrder {
    /// `None` when the offset does not fit an `i32`.
    pub fn to_cycle(self, suffix: i32, delay_bound: u32) -> Option<i32> {
        match self {
            CycleOrder::Forward => suffix.checked_sub(1),
            CycleOrder::Reverse => i32::try_from(delay_bound).ok()?.checked_sub(suffix),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstrInfo {
    pub name: String,
    /// Default delay bound for every target of this instruction.
    #[serde(rename = "delay")]
    pub delay_bound: u32,
    /// Per-target delay bounds overriding `delay_bound`.
    #[serde(default)]
    pub delay_exceptions: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetVector {
    pub members: Vec<String>,
    #[serde(default)]
    pub delay: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractOptions {
    /// Regenerate and rewrite artifacts even when they already exist.
    pub overwrite_existing: bool,
    /// Run the design-specific rewrite pass followed by a second `-O3`.
    pub bitwise_rewrite: bool,
    pub rewrite_pass: String,
    pub rewrite_plugin: Option<PathBuf>,
    pub mux_to_branch: bool,
    /// Minimum width in bits of a `select` that gets turned into branches.
    pub mux_to_branch_threshold: u32,
    pub multi_thread: bool,
    /// Upper bound on concurrently running units; 0 means one thread per unit.
    pub max_threads: usize,
    pub schedule: Schedule,
    pub cycle_order: CycleOrder,
    /// Feed discovered dependencies back into the work set.
    pub push_new_targets: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            overwrite_existing: false,
            bitwise_rewrite: false,
            rewrite_pass: "rtl2ila".to_string(),
            rewrite_plugin: None,
            mux_to_branch: false,
            mux_to_branch_threshold: 1,
            multi_thread: false,
            max_threads: 0,
            schedule: Schedule::TargetOuter,
            cycle_order: CycleOrder::Forward,
            push_new_targets: true,
        }
    }
}

pub const DEFAULT_MEMORY_PATTERN: &str = r"(^|\.)mem[A-Za-z0-9_]*(\[\d+\])*$";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default = "default_out_dir")]
    out_dir: PathBuf,
    #[serde(default)]
    llvm_path: Option<PathBuf>,
    #[serde(default)]
    options: ExtractOptions,
    #[serde(default)]
    instructions: Vec<InstrInfo>,
    #[serde(default)]
    targets: BTreeMap<String, Vec<u32>>,
    #[serde(default)]
    target_vectors: BTreeMap<String, TargetVector>,
    #[serde(default)]
    skipped_outputs: BTreeSet<String>,
    #[serde(default)]
    added_targets: Vec<String>,
    #[serde(default)]
    fifo_depths: BTreeMap<String, u32>,
    #[serde(default)]
    memory_pattern: Option<String>,
}

fn default_out_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Immutable run configuration, built once and handed to the engine.
#[derive(Debug, Clone)]
pub struct Config {
    pub out_dir: PathBuf,
    /// Directory holding `opt`; `None` resolves it through `$PATH`.
    pub llvm_path: Option<PathBuf>,
    pub options: ExtractOptions,
    pub instructions: Vec<InstrInfo>,
    /// Delay overrides. A non-empty table also restricts the initial work set to its keys.
    pub targets: BTreeMap<String, Vec<u32>>,
    pub target_vectors: BTreeMap<String, TargetVector>,
    pub skipped_outputs: BTreeSet<String>,
    pub added_targets: Vec<String>,
    /// Register count of each fifo module.
    pub fifo_depths: BTreeMap<String, u32>,
    memory_pattern: Regex,
    vector_of_member: HashMap<String, String>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        text.parse()
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        for (index, instr) in raw.instructions.iter().enumerate() {
            if instr.name.is_empty() {
                return Err(ConfigError::UnnamedInstruction { index });
            }
        }

        let mut vector_of_member: HashMap<String, String> = HashMap::default();
        for (name, vector) in &raw.target_vectors {
            if vector.members.is_empty() {
                return Err(ConfigError::EmptyTargetVector { name: name.clone() });
            }
            for member in &vector.members {
                if let Some(first) = vector_of_member.insert(member.clone(), name.clone()) {
                    if first != *name {
                        return Err(ConfigError::SharedVectorMember {
                            member: member.clone(),
                            first,
                            second: name.clone(),
                        });
                    }
                }
            }
        }

        let pattern = raw
            .memory_pattern
            .unwrap_or_else(|| DEFAULT_MEMORY_PATTERN.to_string());
        let memory_pattern = Regex::new(&pattern)
            .map_err(|source| ConfigError::MemoryPattern { pattern, source })?;

        Ok(Self {
            out_dir: raw.out_dir,
            llvm_path: raw.llvm_path,
            options: raw.options,
            instructions: raw.instructions,
            targets: raw.targets,
            target_vectors: raw.target_vectors,
            skipped_outputs: raw.skipped_outputs,
            added_targets: raw.added_targets,
            fifo_depths: raw.fifo_depths,
            memory_pattern,
            vector_of_member,
        })
    }

    /// Whether `name` denotes a memory element.
    pub fn is_memory(&self, name: &str) -> bool {
        self.memory_pattern.is_match(name)
    }

    /// The vector `name` is a member of, if any.
    pub fn vector_of_member(&self, name: &str) -> Option<&str> {
        self.vector_of_member.get(name).map(String::as_str)
    }

    pub fn is_vector(&self, name: &str) -> bool {
        self.target_vectors.contains_key(name)
    }

    pub fn is_skipped(&self, name: &str) -> bool {
        self.skipped_outputs.contains(name)
    }

    pub fn with_out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = out_dir.into();
        self
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let raw: RawConfig = toml::from_str(text)?;
        Self::from_raw(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
out_dir = "build"

[options]
multi_thread = true
schedule = "instruction-outer"
cycle_order = "reverse"

[[instructions]]
name = "ADD"
delay = 2

[instructions.delay_exceptions]
acc = 3

[[instructions]]
name = "NOP"
delay = 0

[targets]
r1 = [1, 3]

[target_vectors.regfile]
members = ["rf[0]", "rf[1]"]
delay = 0
"#;

    #[test]
    fn parses_sample() {
        let config: Config = SAMPLE.parse().unwrap();
        assert_eq!(config.out_dir, PathBuf::from("build"));
        assert!(config.options.multi_thread);
        assert_eq!(config.options.schedule, Schedule::InstructionOuter);
        assert_eq!(config.options.cycle_order, CycleOrder::Reverse);
        assert_eq!(config.options.rewrite_pass, "rtl2ila");
        assert!(config.options.push_new_targets);
        assert_eq!(config.instructions.len(), 2);
        assert_eq!(config.instructions[0].delay_exceptions["acc"], 3);
        assert_eq!(config.targets["r1"], vec![1, 3]);
        assert_eq!(config.target_vectors["regfile"].delay, Some(0));
        assert_eq!(config.vector_of_member("rf[1]"), Some("regfile"));
        assert!(config.vector_of_member("acc").is_none());
    }

    #[test]
    fn rejects_empty_vector() {
        let text = r#"
[target_vectors.v]
members = []
"#;
        let err = text.parse::<Config>().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTargetVector { name } if name == "v"));
    }

    #[test]
    fn default_memory_pattern() {
        let config: Config = "".parse().unwrap();
        assert!(config.is_memory("mem[3]"));
        assert!(config.is_memory("core.mem_data[1][2]"));
        assert!(!config.is_memory("acc"));
        assert!(!config.is_memory("memo.acc"));
    }

    #[test]
    fn cycle_order_mapping() {
        assert_eq!(CycleOrder::Reverse.to_cycle(2, 3), Some(1));
        assert_eq!(CycleOrder::Forward.to_cycle(2, 3), Some(1));
        assert_eq!(CycleOrder::Forward.to_cycle(1, 3), Some(0));
        assert_eq!(CycleOrder::Reverse.to_cycle(3, 3), Some(0));
    }

    #[test]
    fn cycle_order_out_of_range() {
        assert_eq!(CycleOrder::Forward.to_cycle(i32::MIN, 3), None);
        assert_eq!(CycleOrder::Reverse.to_cycle(i32::MIN, 3), None);
        assert_eq!(CycleOrder::Reverse.to_cycle(-1, u32::MAX), None);
    }
}
