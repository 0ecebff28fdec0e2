//! Extraction of per-instruction update functions from an RTL design.
//!
//! Starting from the design outputs, every architectural state variable is
//! generated as an LLVM IR function against every instruction. The inputs of
//! each cleaned function name further state variables, which are generated in
//! turn until no new ones appear. The result is a dependency report, a state
//! variable catalog and a script linking all generated modules.

pub mod config;
pub mod delay;
pub mod deps;
pub mod design;
pub mod error;
pub mod generator;
pub mod ir;
pub mod optimizer;
pub mod pipeline;
pub mod report;
pub mod scheduler;
pub mod state;
pub mod sync;
pub mod target;
pub mod vcd;

pub(crate) use fxhash::FxHashMap as HashMap;

pub use config::{Config, CycleOrder, ExtractOptions, InstrInfo, Schedule, TargetVector};
pub use deps::DependencyArg;
pub use design::{DesignInfo, DesignMetadata};
pub use error::{ExtractError, UnitError};
pub use generator::{CommandGenerator, UpdateFunctionGenerator};
pub use optimizer::{IrOptimizer, OptPipeline, OptStage, OptTool};
pub use pipeline::UnitOutcome;
pub use scheduler::{ExtractSummary, Extractor};
pub use state::{DependencyReport, RunState, WidthCycles};
pub use target::{TargetClassifier, TargetDescriptor};
