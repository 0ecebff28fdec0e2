//! Fixpoint discovery of every state variable an instruction can update.
//!
//! Targets are generated against every instruction. The dependencies of each
//! useful unit are fed back into the work set until nothing new turns up.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use itertools::Itertools;
use rayon::prelude::*;

use crate::config::{Config, Schedule};
use crate::delay::resolve_delay_bounds;
use crate::design::DesignInfo;
use crate::error::ExtractError;
use crate::generator::UpdateFunctionGenerator;
use crate::optimizer::{IrOptimizer, OptPipeline};
use crate::pipeline::Pipeline;
use crate::report::{self, Timings};
use crate::state::{DependencyReport, RunState, WidthCycles};

/// Result of a finished run.
#[derive(Debug, Clone, Default)]
pub struct ExtractSummary {
    pub catalog: BTreeMap<String, WidthCycles>,
    pub report: DependencyReport,
    /// Final `.ll` files, sorted.
    pub artifacts: Vec<PathBuf>,
}

/// One `(target, delay)` pair of an instruction's batch.
#[derive(Debug, Clone)]
struct Unit {
    target: String,
    delay_bound: u32,
    is_vector: bool,
}

/// Drives the generation units of one run.
pub struct Extractor<'a> {
    config: &'a Config,
    design: &'a dyn DesignInfo,
    generator: &'a dyn UpdateFunctionGenerator,
    optimizer: &'a dyn IrOptimizer,
    stages: OptPipeline,
    state: RunState,
}

impl<'a> Extractor<'a> {
    pub fn new(
        config: &'a Config,
        design: &'a dyn DesignInfo,
        generator: &'a dyn UpdateFunctionGenerator,
        optimizer: &'a dyn IrOptimizer,
    ) -> Self {
        Self {
            config,
            design,
            generator,
            optimizer,
            stages: OptPipeline::from_config(config),
            state: RunState::new(),
        }
    }

    /// Replaces the optimizer stages derived from the configuration.
    pub fn with_stages(mut self, stages: OptPipeline) -> Self {
        self.stages = stages;
        self
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Seeds the work set, runs the configured strategy to its fixpoint and
    /// writes the run artifacts into the output directory.
    pub fn run(&self) -> Result<ExtractSummary, ExtractError> {
        let out_dir = &self.config.out_dir;
        std::fs::create_dir_all(out_dir).map_err(|e| ExtractError::io(out_dir, e))?;
        let timings = Timings::open(out_dir)?;

        self.seed()?;
        for instr in &self.config.instructions {
            self.state.open_instruction(&instr.name);
        }

        let pipeline = Pipeline {
            config: self.config,
            design: self.design,
            generator: self.generator,
            optimizer: self.optimizer,
            stages: &self.stages,
            state: &self.state,
            timings: &timings,
        };
        let schedule = if self.config.options.multi_thread {
            Schedule::InstructionOuter
        } else {
            self.config.options.schedule
        };
        log::info!(
            "### extracting {} instruction(s), {} initial target(s), {:?}",
            self.config.instructions.len(),
            self.state.work_set.len(),
            schedule
        );
        match schedule {
            Schedule::TargetOuter => self.run_target_outer(&pipeline)?,
            Schedule::InstructionOuter => self.run_instruction_outer(&pipeline)?,
        }

        let summary = ExtractSummary {
            catalog: self.state.catalog.snapshot(),
            report: self.state.report_snapshot(),
            artifacts: self.state.artifacts.snapshot().into_iter().sorted().collect(),
        };
        report::write_all(
            out_dir,
            &summary.report,
            &summary.catalog,
            &summary.artifacts,
            self.config,
            self.design,
        )?;
        Ok(summary)
    }

    /// Fills the work set and the catalog before the first unit runs.
    fn seed(&self) -> Result<(), ExtractError> {
        let state = &self.state;
        let unknown = |name: &str| ExtractError::UnknownWidth {
            name: name.to_string(),
        };

        for output in self.design.module_outputs() {
            if self.design.is_fifo_output(&output) {
                continue;
            }
            let width = self
                .design
                .var_width_simple(&output, None)
                .ok_or_else(|| unknown(&output))?;
            state.catalog.emplace(output.as_str(), WidthCycles::new(width));
            state.work_set.insert(output);
        }

        state.work_set.extend(self.config.added_targets.iter().cloned());

        for instance in self.design.fifo_instances() {
            let module = self.design.module_of_instance(&instance).ok_or_else(|| {
                ExtractError::UnresolvedInstance {
                    instance: instance.clone(),
                }
            })?;
            let depth = *self.config.fifo_depths.get(&module).ok_or_else(|| {
                ExtractError::MissingFifoDepth {
                    module: module.clone(),
                    instance: instance.clone(),
                }
            })?;
            for i in 0..depth {
                let reg = format!("r{}", i);
                let name = format!("{}.{}", instance, reg);
                let width = self
                    .design
                    .var_width_simple(&reg, Some(&module))
                    .ok_or_else(|| unknown(&name))?;
                state.catalog.emplace(name.as_str(), WidthCycles::new(width));
                state.work_set.insert(name);
            }
        }

        if !self.config.targets.is_empty() {
            state.work_set.clear();
            for name in self.config.targets.keys() {
                let width = self
                    .design
                    .var_width_complex(name)
                    .ok_or_else(|| unknown(name))?;
                state.catalog.emplace(name.as_str(), WidthCycles::new(width));
                state.work_set.insert(name.as_str());
            }
        } else if !self.config.target_vectors.is_empty() {
            state.work_set.clear();
        }
        Ok(())
    }

    /// One target at a time, each against every instruction, single threaded.
    fn run_target_outer(&self, pipeline: &Pipeline<'_>) -> Result<(), ExtractError> {
        let state = &self.state;
        let mut vectors: Vec<(&String, &Vec<String>)> = self
            .config
            .target_vectors
            .iter()
            .map(|(name, vector)| (name, &vector.members))
            .rev()
            .collect();

        loop {
            let (target, members) = if let Some(target) = state.work_set.pop_first() {
                if state.visited.contains(&target) || self.config.is_skipped(&target) {
                    continue;
                }
                (target, None)
            } else if let Some((name, members)) = vectors.pop() {
                (name.clone(), Some(members))
            } else {
                break;
            };

            for (idx, instr) in self.config.instructions.iter().enumerate() {
                for delay_bound in resolve_delay_bounds(&target, instr, self.config) {
                    pipeline.generate(&target, delay_bound, members.is_some(), instr, idx + 1)?;
                }
            }

            match members {
                Some(members) => state.visited.extend(members.iter().cloned()),
                None => {
                    state.visited.insert(target);
                }
            }
        }
        Ok(())
    }

    /// Rounds over a snapshot of the work set, each instruction's units
    /// finishing before the next instruction starts.
    fn run_instruction_outer(&self, pipeline: &Pipeline<'_>) -> Result<(), ExtractError> {
        let state = &self.state;
        let mut first_round = true;

        while !state.work_set.is_empty() || (first_round && !self.config.target_vectors.is_empty())
        {
            let round = state.work_set.take();
            log::info!("### new round over {} target(s)", round.len());

            for (idx, instr) in self.config.instructions.iter().enumerate() {
                let scalars = round
                    .iter()
                    .filter(|t| !state.visited.contains(t) && !self.config.is_skipped(t))
                    .map(|t| (t.as_str(), false));
                let vectors = self
                    .config
                    .target_vectors
                    .keys()
                    .filter(|_| first_round)
                    .map(|t| (t.as_str(), true));
                let units: Vec<Unit> = scalars
                    .chain(vectors)
                    .flat_map(|(target, is_vector)| {
                        resolve_delay_bounds(target, instr, self.config)
                            .into_iter()
                            .map(move |delay_bound| Unit {
                                target: target.to_string(),
                                delay_bound,
                                is_vector,
                            })
                    })
                    .collect();

                if self.config.options.multi_thread {
                    self.run_batch(units, |unit| {
                        pipeline.generate(&unit.target, unit.delay_bound, unit.is_vector, instr, idx + 1)
                    })?;
                } else {
                    for unit in units {
                        pipeline.generate(&unit.target, unit.delay_bound, unit.is_vector, instr, idx + 1)?;
                    }
                }
            }

            if first_round {
                for vector in self.config.target_vectors.values() {
                    state.visited.extend(vector.members.iter().cloned());
                }
            }
            state.visited.extend(round);
            first_round = false;
        }
        Ok(())
    }

    /// Runs `units` on a pool of at most `max_threads` workers (one per unit
    /// when 0) and returns once all of them are done. The first fatal error
    /// stops the batch from picking up further units.
    fn run_batch<T, F>(&self, units: Vec<Unit>, run_unit: F) -> Result<(), ExtractError>
    where
        F: Fn(&Unit) -> Result<T, ExtractError> + Sync,
    {
        if units.is_empty() {
            return Ok(());
        }
        let workers = match self.config.options.max_threads {
            0 => units.len(),
            n => n.min(units.len()),
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("ilax-unit-{}", i))
            .build()?;
        let running = &self.state.running;

        let batch = || {
            units.par_iter().try_for_each(|unit| {
                let in_flight = running.increase();
                log::trace!("{} unit(s) in flight", in_flight);
                let result = run_unit(unit);
                running.decrease()?;
                result.map(drop)
            })
        };
        panic::catch_unwind(AssertUnwindSafe(|| pool.install(batch)))
            .map_err(|_| ExtractError::WorkerPanicked)?
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::InstrInfo;
    use crate::design::DesignMetadata;
    use crate::generator::GeneratorError;
    use crate::optimizer::{OptStage, OptimizerError};
    use crate::target::TargetDescriptor;

    struct Idle;

    impl UpdateFunctionGenerator for Idle {
        fn emit_ir(
            &self,
            _desc: &TargetDescriptor,
            _delay_bound: u32,
            _instr: &InstrInfo,
            _instr_index: usize,
            _out: &Path,
        ) -> Result<(), GeneratorError> {
            Err(GeneratorError::Other("idle".to_string()))
        }
    }

    impl IrOptimizer for Idle {
        fn run(&self, stage: &OptStage, input: &Path, _output: &Path) -> Result<(), OptimizerError> {
            Err(OptimizerError::Failed {
                stage: stage.name,
                input: input.to_path_buf(),
                status: "idle".to_string(),
                stderr: String::new(),
            })
        }
    }

    fn units(n: usize) -> Vec<Unit> {
        (0..n)
            .map(|i| Unit {
                target: format!("t{}", i),
                delay_bound: 1,
                is_vector: false,
            })
            .collect()
    }

    fn with_extractor(options: &str, f: impl FnOnce(&Extractor<'_>)) {
        let config: Config = options.parse().unwrap();
        let design = DesignMetadata::from_toml("top = \"top\"\n[modules.top]\n").unwrap();
        f(&Extractor::new(&config, &design, &Idle, &Idle));
    }

    #[test]
    fn batch_stays_within_max_threads() {
        with_extractor("[options]\nmulti_thread = true\nmax_threads = 2\n", |extractor| {
            let done = AtomicUsize::new(0);
            let peak = AtomicU32::new(0);
            extractor
                .run_batch(units(8), |_| {
                    peak.fetch_max(extractor.state.running.get(), Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            assert_eq!(done.load(Ordering::SeqCst), 8);
            assert!(peak.load(Ordering::SeqCst) <= 2);
            assert_eq!(extractor.state.running.get(), 0);
        });
    }

    #[test]
    fn batch_reports_fatal_error_after_join() {
        with_extractor("[options]\nmulti_thread = true\n", |extractor| {
            let err = extractor
                .run_batch(units(4), |unit| {
                    if unit.target == "t2" {
                        return Err(ExtractError::UnknownWidth {
                            name: unit.target.clone(),
                        });
                    }
                    Ok(())
                })
                .unwrap_err();
            assert!(matches!(err, ExtractError::UnknownWidth { ref name } if name == "t2"));
            assert_eq!(extractor.state.running.get(), 0);
        });
    }

    #[test]
    fn panicking_unit_is_a_fatal_error() {
        with_extractor("[options]\nmulti_thread = true\nmax_threads = 1\n", |extractor| {
            let err = extractor
                .run_batch(units(1), |_| -> Result<(), ExtractError> { panic!("unit") })
                .unwrap_err();
            assert!(matches!(err, ExtractError::WorkerPanicked));
        });
    }
}
