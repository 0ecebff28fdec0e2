//! One generation unit: a target, a delay bound and an instruction.

use std::path::{Path, PathBuf};
use std::time::Instant;

use itertools::Itertools;

use crate::config::{Config, InstrInfo};
use crate::deps::{ArgContext, DependencyArg, gather_wrapper_args};
use crate::design::DesignInfo;
use crate::error::{ExtractError, UnitError};
use crate::generator::UpdateFunctionGenerator;
use crate::ir::{
    Module, X86_64_DATA_LAYOUT, convert_selects_to_branches, create_wrapper, remove_dead_args,
};
use crate::optimizer::{CLEAN_SIMP_EXT, FINAL_EXT, IrOptimizer, OptPipeline, RAW_EXT, stage_path};
use crate::report::Timings;
use crate::state::RunState;
use crate::target::{TargetClassifier, TargetDescriptor};

/// What a finished unit contributes to the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOutcome {
    /// The update function was found; its (possibly empty) dependency list
    /// has been recorded.
    pub useful: bool,
    pub args: Vec<DependencyArg>,
}

impl UnitOutcome {
    fn not_useful() -> Self {
        Self::default()
    }
}

/// A cleaned module together with the name of its wrapper.
struct Cleaned {
    module: Module,
    wrapper: String,
}

/// Everything a unit needs, borrowed from the run.
#[derive(Clone, Copy)]
pub struct Pipeline<'a> {
    pub config: &'a Config,
    pub design: &'a dyn DesignInfo,
    pub generator: &'a dyn UpdateFunctionGenerator,
    pub optimizer: &'a dyn IrOptimizer,
    pub stages: &'a OptPipeline,
    pub state: &'a RunState,
    pub timings: &'a Timings,
}

impl Pipeline<'_> {
    /// Produces the update function of `target` for `instr` and records its
    /// dependencies.
    ///
    /// Generator, optimizer and parse failures only make the unit not
    /// useful. Errors returned here abort the run.
    pub fn generate(
        &self,
        target: &str,
        delay_bound: u32,
        is_vector: bool,
        instr: &InstrInfo,
        instr_index: usize,
    ) -> Result<UnitOutcome, ExtractError> {
        let desc = TargetClassifier::new(self.config, self.design).classify(
            target,
            is_vector,
            &instr.name,
        )?;
        let base = self
            .config
            .out_dir
            .join(self.generator.basename(&desc, delay_bound));
        log::info!(
            "---- BEGIN {}target {} for {} (delay {})",
            if is_vector { "vector " } else { "" },
            target,
            instr.name,
            delay_bound
        );

        let cleaned = match self.clean(&desc, &base, delay_bound, instr, instr_index) {
            Ok(cleaned) => cleaned,
            Err(e) => {
                log::error!("{}: {}", desc.func_name(), e);
                log::info!("{} is NOT affected by {}", target, instr.name);
                return Ok(UnitOutcome::not_useful());
            }
        };

        let args = match cleaned.module.function(&cleaned.wrapper) {
            Some(wrapper) => {
                let catalog_width = |name: &str| self.state.catalog_width(name);
                let cx = ArgContext {
                    config: self.config,
                    design: self.design,
                    catalog_width: &catalog_width,
                };
                gather_wrapper_args(
                    wrapper,
                    target,
                    delay_bound,
                    self.config.options.cycle_order,
                    &cx,
                )?
            }
            None => Vec::new(),
        };

        let artifact = match self.persist(&cleaned.module, &base) {
            Ok(path) => path,
            Err(e) => {
                log::error!("{}: {}", desc.func_name(), e);
                log::info!("{} is NOT affected by {}", target, instr.name);
                return Ok(UnitOutcome::not_useful());
            }
        };

        log::info!("{} is affected by {}", target, instr.name);
        self.state.artifacts.push(artifact);
        self.state.record(&instr.name, target, args.clone());
        self.state.absorb(self.config, &args)?;
        Ok(UnitOutcome { useful: true, args })
    }

    /// Generates and optimizes (unless cached), then cleans up and wraps the
    /// update function.
    fn clean(
        &self,
        desc: &TargetDescriptor,
        base: &Path,
        delay_bound: u32,
        instr: &InstrInfo,
        instr_index: usize,
    ) -> Result<Cleaned, UnitError> {
        let func_name = desc.func_name();
        let optimized = stage_path(base, self.stages.output_ext());

        if optimized.exists() && !self.config.options.overwrite_existing {
            log::debug!("reusing {}", optimized.display());
        } else {
            let raw = stage_path(base, RAW_EXT);
            let start = Instant::now();
            self.generator
                .emit_ir(desc, delay_bound, instr, instr_index, &raw)?;
            self.timings.generation.record(&func_name, start.elapsed());

            let start = Instant::now();
            self.stages.run(self.optimizer, base)?;
            self.timings
                .optimization
                .record(&func_name, start.elapsed());
        }

        let mut module = Module::parse_file(&optimized).map_err(|source| UnitError::Parse {
            path: optimized.clone(),
            source,
        })?;
        let missing = || UnitError::MissingFunction {
            function: func_name.clone(),
            path: optimized.clone(),
        };

        let func = module.function_mut(&func_name).ok_or_else(missing)?;
        let removed = remove_dead_args(func);
        if !removed.is_empty() {
            log::debug!("{}: removed unused {}", func_name, removed.iter().join(", "));
        }

        if self.config.options.mux_to_branch {
            let converted =
                convert_selects_to_branches(&mut module, self.config.options.mux_to_branch_threshold);
            log::debug!("{}: {} select(s) turned into branches", func_name, converted);
        }

        let wrapper = create_wrapper(&mut module, &func_name).ok_or_else(missing)?;
        module.set_data_layout(X86_64_DATA_LAYOUT);
        Ok(Cleaned { module, wrapper })
    }

    /// Writes the final `.ll` unless one is already there.
    fn persist(&self, module: &Module, base: &Path) -> Result<PathBuf, UnitError> {
        let final_path = stage_path(base, FINAL_EXT);
        if final_path.exists() && !self.config.options.overwrite_existing {
            log::debug!("keeping {}", final_path.display());
            return Ok(final_path);
        }
        let tmp = stage_path(base, CLEAN_SIMP_EXT);
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| UnitError::Io { path, source }
        };
        std::fs::write(&tmp, module.to_string()).map_err(io(&tmp))?;
        std::fs::rename(&tmp, &final_path).map_err(io(&final_path))?;
        Ok(final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::DesignMetadata;
    use crate::generator::GeneratorError;
    use crate::optimizer::{OptStage, OptimizerError};

    /// Writes a fixed function for every target.
    struct Canned(&'static str);

    impl UpdateFunctionGenerator for Canned {
        fn emit_ir(
            &self,
            desc: &TargetDescriptor,
            _delay_bound: u32,
            _instr: &InstrInfo,
            _instr_index: usize,
            out: &Path,
        ) -> Result<(), GeneratorError> {
            let text = self.0.replace("@NAME", &format!("@{}", desc.func_name()));
            std::fs::write(out, text).map_err(|e| GeneratorError::Other(e.to_string()))
        }
    }

    struct PassThrough;

    impl IrOptimizer for PassThrough {
        fn run(&self, _stage: &OptStage, input: &Path, output: &Path) -> Result<(), OptimizerError> {
            std::fs::copy(input, output).map(drop).map_err(|e| OptimizerError::Failed {
                stage: "copy",
                input: input.to_path_buf(),
                status: "io".to_string(),
                stderr: e.to_string(),
            })
        }
    }

    const DESIGN: &str = r#"
top = "cpu"
outputs = ["acc"]
[modules.cpu.vars]
acc = 8
b = 8
wide = 128
"#;

    fn run_unit(ir: &'static str, out: &Path) -> (UnitOutcome, RunState) {
        let config: Config = "".parse::<Config>().unwrap().with_out_dir(out);
        let design = DesignMetadata::from_toml(DESIGN).unwrap();
        let stages = OptPipeline::from_config(&config);
        let state = RunState::new();
        let timings = Timings::open(out).unwrap();
        let instr = InstrInfo {
            name: "ADD".to_string(),
            delay_bound: 0,
            delay_exceptions: Default::default(),
        };
        let pipeline = Pipeline {
            config: &config,
            design: &design,
            generator: &Canned(ir),
            optimizer: &PassThrough,
            stages: &stages,
            state: &state,
            timings: &timings,
        };
        let outcome = pipeline.generate("acc", 0, false, &instr, 1).unwrap();
        (outcome, state)
    }

    #[test]
    fn useful_unit_records_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let (outcome, state) = run_unit(
            "define i8 @NAME(i8 %acc, i8 %b, i8 %unused) {\n  %s = add i8 %acc, %b\n  ret i8 %s\n}\n",
            dir.path(),
        );
        assert!(outcome.useful);
        let names: Vec<_> = outcome.args.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["acc", "b"]);
        assert_eq!(state.report_snapshot()["ADD"]["acc"].len(), 2);
        assert_eq!(state.work_set.snapshot().into_iter().collect::<Vec<_>>(), vec!["acc", "b"]);

        let final_path = dir.path().join("ADD_acc_0.ll");
        let text = std::fs::read_to_string(&final_path).unwrap();
        assert!(text.contains("define i8 @ADD_acc_wrapper(i8 %acc, i8 %b)"));
        assert!(text.contains(X86_64_DATA_LAYOUT));
        assert!(!dir.path().join("ADD_acc_0.clean-simp-ll").exists());
        assert_eq!(state.artifacts.snapshot(), vec![final_path]);
    }

    #[test]
    fn unparsable_output_is_not_useful() {
        let dir = tempfile::tempdir().unwrap();
        let (outcome, state) = run_unit("this is not IR\n", dir.path());
        assert_eq!(outcome, UnitOutcome::not_useful());
        assert!(state.report_snapshot().is_empty());
        assert!(state.artifacts.is_empty());
    }

    #[test]
    fn missing_function_is_not_useful() {
        let dir = tempfile::tempdir().unwrap();
        let (outcome, _) = run_unit(
            "define i8 @other(i8 %a) {\n  ret i8 %a\n}\n",
            dir.path(),
        );
        assert!(!outcome.useful);
    }

    #[test]
    fn function_without_arguments_is_still_useful() {
        let dir = tempfile::tempdir().unwrap();
        let (outcome, state) = run_unit("define i8 @NAME() {\n  ret i8 1\n}\n", dir.path());
        assert!(outcome.useful);
        assert!(outcome.args.is_empty());
        assert!(state.report_snapshot()["ADD"]["acc"].is_empty());
    }
}
