//! Producers of raw, unsimplified update-function IR.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

use crate::config::InstrInfo;
use crate::target::TargetDescriptor;

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("cannot run generator `{program}`: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("generator `{program}` failed for `{target}` ({status}): {stderr}")]
    Failed {
        program: PathBuf,
        target: String,
        status: String,
        stderr: String,
    },

    #[error("generator did not write `{path}`")]
    MissingOutput { path: PathBuf },

    #[error("{0}")]
    Other(String),
}

/// Emits the raw IR of one update function.
///
/// Implementations are shared by concurrently running units, so both
/// operations take `&self`.
pub trait UpdateFunctionGenerator: Send + Sync {
    /// File name stem shared by every stage file of this target and delay.
    fn basename(&self, desc: &TargetDescriptor, delay_bound: u32) -> String {
        format!("{}_{}", desc.func_name(), delay_bound)
    }

    /// Writes IR defining a function named [`TargetDescriptor::func_name`] to `out`.
    fn emit_ir(
        &self,
        desc: &TargetDescriptor,
        delay_bound: u32,
        instr: &InstrInfo,
        instr_index: usize,
        out: &Path,
    ) -> Result<(), GeneratorError>;
}

/// Runs an external program once per unit.
///
/// The target is described on the command line:
/// `<program> <args..> --target T --function F --instr I --instr-index N
/// --delay D --width W [--module M] [--instance I] [--memory] [--member M..]
/// --out FILE`.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(
        &self,
        desc: &TargetDescriptor,
        delay_bound: u32,
        instr: &InstrInfo,
        instr_index: usize,
        out: &Path,
    ) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--target")
            .arg(&desc.target)
            .arg("--function")
            .arg(desc.func_name())
            .arg("--instr")
            .arg(&instr.name)
            .arg("--instr-index")
            .arg(instr_index.to_string())
            .arg("--delay")
            .arg(delay_bound.to_string())
            .arg("--width")
            .arg(desc.width.to_string());
        if let Some(module) = &desc.module {
            cmd.arg("--module").arg(module);
        }
        if let Some(instance) = &desc.instance {
            cmd.arg("--instance").arg(instance);
        }
        if desc.is_memory || desc.is_memory_vector {
            cmd.arg("--memory");
        }
        for member in &desc.members {
            cmd.arg("--member").arg(member);
        }
        cmd.arg("--out").arg(out);
        cmd
    }
}

impl UpdateFunctionGenerator for CommandGenerator {
    fn emit_ir(
        &self,
        desc: &TargetDescriptor,
        delay_bound: u32,
        instr: &InstrInfo,
        instr_index: usize,
        out: &Path,
    ) -> Result<(), GeneratorError> {
        let mut cmd = self.command(desc, delay_bound, instr, instr_index, out);
        log::debug!("{:?}", cmd);
        let output = cmd.output().map_err(|source| GeneratorError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(GeneratorError::Failed {
                program: self.program.clone(),
                target: desc.target.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !out.exists() {
            return Err(GeneratorError::MissingOutput {
                path: out.to_path_buf(),
            });
        }
        Ok(())
    }
}
