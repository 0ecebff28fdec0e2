use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;
use crate::design::DesignError;
use crate::generator::GeneratorError;
use crate::ir::IrParseError;
use crate::optimizer::OptimizerError;

/// Errors that abort an extraction run.
///
/// These indicate a broken data contract between the configuration, the
/// design metadata and the generated IR, not a condition a single
/// generation unit can recover from.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Design(#[from] DesignError),

    #[error("inconsistent width for `{name}`: catalogued as {recorded} bits, observed {observed} bits")]
    WidthMismatch {
        name: String,
        recorded: u32,
        observed: u32,
    },

    #[error("cannot resolve the module of instance `{instance}`")]
    UnresolvedInstance { instance: String },

    #[error("no width known for `{name}`")]
    UnknownWidth { name: String },

    #[error("target vector `{name}` has no members")]
    EmptyTargetVector { name: String },

    #[error("`{name}` is not a configured target vector")]
    UnknownTargetVector { name: String },

    #[error("no fifo depth configured for module `{module}` (instance `{instance}`)")]
    MissingFifoDepth { module: String, instance: String },

    #[error("function `{function}` has reserved argument `{argument}` but target `{target}` {reason}")]
    ReservedArgument {
        function: String,
        argument: String,
        target: String,
        reason: &'static str,
    },

    #[error("argument `{argument}` names a cycle outside the range of delay bound {delay_bound}")]
    CycleOutOfRange { argument: String, delay_bound: u32 },

    #[error("running unit count is already 0, cannot decrease")]
    ThreadCountUnderflow,

    #[error("a generation worker panicked")]
    WorkerPanicked,

    #[error("cannot start the generation workers: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExtractError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Per-unit failures. A unit that fails this way contributes nothing to the
/// work set or the report; the run continues.
#[derive(Error, Debug)]
pub enum UnitError {
    #[error("generator failed: {0}")]
    Generator(#[from] GeneratorError),

    #[error("optimizer failed: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("cannot parse `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: IrParseError,
    },

    #[error("function `{function}` not found in `{path}`")]
    MissingFunction { function: String, path: PathBuf },

    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
