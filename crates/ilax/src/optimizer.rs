//! Staged invocation of the external IR optimizer.
//!
//! A generated file goes through a fixed list of [`OptStage`]s. Each stage is
//! one discrete `opt` process whose exit status is checked before the next
//! one starts, and each writes its own file next to the generated one so a
//! later run can resume from it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("cannot run `{program}`: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stage `{stage}` failed on `{input}` ({status}): {stderr}")]
    Failed {
        stage: &'static str,
        input: PathBuf,
        status: String,
        stderr: String,
    },

    #[error("stage `{stage}` produced no output `{output}`")]
    MissingOutput {
        stage: &'static str,
        output: PathBuf,
    },
}

/// Extension of the raw generator output.
pub const RAW_EXT: &str = ".tmp-ll";
pub const CLEAN_EXT: &str = ".clean-ll";
pub const TMP_O3_EXT: &str = ".tmp-o3-ll";
pub const CLEAN_O3_EXT: &str = ".clean-o3-ll";
pub const REWRITE_EXT: &str = ".rewrite-ll";
pub const REOPT_EXT: &str = ".reopt-ll";
/// Module written by the pipeline before it is renamed to the final `.ll`.
pub const CLEAN_SIMP_EXT: &str = ".clean-simp-ll";
pub const FINAL_EXT: &str = ".ll";

/// `base` with `ext` appended to its file name.
pub fn stage_path(base: &Path, ext: &str) -> PathBuf {
    let mut name: OsString = base.as_os_str().to_owned();
    name.push(ext);
    PathBuf::from(name)
}

/// One `opt` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptStage {
    pub name: &'static str,
    /// Value of `-passes=`.
    pub passes: String,
    /// Pass plugin to load for this stage.
    pub plugin: Option<PathBuf>,
    pub input_ext: &'static str,
    pub output_ext: &'static str,
    /// Delete the output once the following stage has consumed it.
    pub transient: bool,
}

/// Something that can run one optimizer stage over a file.
pub trait IrOptimizer: Send + Sync {
    fn run(&self, stage: &OptStage, input: &Path, output: &Path) -> Result<(), OptimizerError>;
}

/// The LLVM `opt` binary.
#[derive(Debug, Clone)]
pub struct OptTool {
    program: PathBuf,
}

impl OptTool {
    /// `opt` from `llvm_path`, or from `$PATH` when none is given.
    pub fn new(llvm_path: Option<&Path>) -> Self {
        let program = match llvm_path {
            Some(dir) => dir.join("opt"),
            None => PathBuf::from("opt"),
        };
        Self { program }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl IrOptimizer for OptTool {
    fn run(&self, stage: &OptStage, input: &Path, output: &Path) -> Result<(), OptimizerError> {
        let mut cmd = Command::new(&self.program);
        if let Some(plugin) = &stage.plugin {
            cmd.arg(format!("-load-pass-plugin={}", plugin.display()));
        }
        cmd.arg(format!("-passes={}", stage.passes))
            .arg(input)
            .arg("-S")
            .arg("-o")
            .arg(output);
        log::debug!("{:?}", cmd);

        let out = cmd.output().map_err(|source| OptimizerError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if !out.status.success() {
            return Err(OptimizerError::Failed {
                stage: stage.name,
                input: input.to_path_buf(),
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// The ordered stages run over every generated file.
#[derive(Debug, Clone, Default)]
pub struct OptPipeline {
    stages: Vec<OptStage>,
}

impl OptPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_stage(&mut self, stage: OptStage) {
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[OptStage] {
        &self.stages
    }

    /// Simplify, optimize and, with `bitwise_rewrite`, rewrite and re-optimize.
    pub fn from_config(config: &Config) -> Self {
        let mut pipeline = Self::new();
        pipeline.add_stage(OptStage {
            name: "simplify",
            passes: "instsimplify,deadargelim,instsimplify".to_string(),
            plugin: None,
            input_ext: RAW_EXT,
            output_ext: CLEAN_EXT,
            transient: false,
        });
        pipeline.add_stage(OptStage {
            name: "optimize",
            passes: "default<O3>".to_string(),
            plugin: None,
            input_ext: CLEAN_EXT,
            output_ext: TMP_O3_EXT,
            transient: true,
        });
        pipeline.add_stage(OptStage {
            name: "deadargelim",
            passes: "deadargelim".to_string(),
            plugin: None,
            input_ext: TMP_O3_EXT,
            output_ext: CLEAN_O3_EXT,
            transient: false,
        });
        if config.options.bitwise_rewrite {
            pipeline.add_stage(OptStage {
                name: "rewrite",
                passes: config.options.rewrite_pass.clone(),
                plugin: config.options.rewrite_plugin.clone(),
                input_ext: CLEAN_O3_EXT,
                output_ext: REWRITE_EXT,
                transient: false,
            });
            pipeline.add_stage(OptStage {
                name: "reoptimize",
                passes: "default<O3>".to_string(),
                plugin: None,
                input_ext: REWRITE_EXT,
                output_ext: REOPT_EXT,
                transient: false,
            });
        }
        pipeline
    }

    /// Extension of the file the last stage writes.
    pub fn output_ext(&self) -> &'static str {
        self.stages.last().map_or(RAW_EXT, |s| s.output_ext)
    }

    /// Runs every stage over the files derived from `base`, stopping at the
    /// first failure. Returns the path of the last stage's output.
    pub fn run(&self, optimizer: &dyn IrOptimizer, base: &Path) -> Result<PathBuf, OptimizerError> {
        let mut pending_removal: Option<PathBuf> = None;
        for stage in &self.stages {
            let input = stage_path(base, stage.input_ext);
            let output = stage_path(base, stage.output_ext);
            log::debug!("** stage {}: {}", stage.name, output.display());
            optimizer.run(stage, &input, &output)?;
            if !output.exists() {
                return Err(OptimizerError::MissingOutput {
                    stage: stage.name,
                    output,
                });
            }
            if let Some(done) = pending_removal.take() {
                if let Err(e) = std::fs::remove_file(&done) {
                    log::warn!("cannot remove {}: {}", done.display(), e);
                }
            }
            if stage.transient {
                pending_removal = Some(output);
            }
        }
        Ok(stage_path(base, self.output_ext()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Copies input to output and records every stage.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
        fail_at: Option<&'static str>,
    }

    impl IrOptimizer for Recorder {
        fn run(&self, stage: &OptStage, input: &Path, output: &Path) -> Result<(), OptimizerError> {
            self.seen.lock().unwrap().push(stage.name);
            if self.fail_at == Some(stage.name) {
                return Err(OptimizerError::Failed {
                    stage: stage.name,
                    input: input.to_path_buf(),
                    status: "exit status: 1".to_string(),
                    stderr: String::new(),
                });
            }
            std::fs::copy(input, output).unwrap();
            Ok(())
        }
    }

    #[test]
    fn stages_follow_configuration() {
        let plain: Config = "".parse().unwrap();
        let names: Vec<_> = OptPipeline::from_config(&plain)
            .stages()
            .iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["simplify", "optimize", "deadargelim"]);

        let rewrite: Config = "[options]\nbitwise_rewrite = true\nrewrite_plugin = \"librtl.so\"\n"
            .parse()
            .unwrap();
        let pipeline = OptPipeline::from_config(&rewrite);
        assert_eq!(pipeline.stages().len(), 5);
        assert_eq!(pipeline.stages()[3].passes, "rtl2ila");
        assert_eq!(pipeline.stages()[3].plugin, Some(PathBuf::from("librtl.so")));
        assert_eq!(pipeline.output_ext(), REOPT_EXT);
    }

    #[test]
    fn runs_stages_and_drops_transient_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("ADD_acc_2");
        std::fs::write(stage_path(&base, RAW_EXT), "; raw\n").unwrap();

        let config: Config = "".parse().unwrap();
        let recorder = Recorder::default();
        let out = OptPipeline::from_config(&config).run(&recorder, &base).unwrap();

        assert_eq!(out, stage_path(&base, CLEAN_O3_EXT));
        assert!(out.exists());
        assert!(stage_path(&base, CLEAN_EXT).exists());
        assert!(!stage_path(&base, TMP_O3_EXT).exists());
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["simplify", "optimize", "deadargelim"]
        );
    }

    #[test]
    fn stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("f");
        std::fs::write(stage_path(&base, RAW_EXT), "").unwrap();

        let config: Config = "".parse().unwrap();
        let recorder = Recorder {
            fail_at: Some("optimize"),
            ..Default::default()
        };
        let err = OptPipeline::from_config(&config)
            .run(&recorder, &base)
            .unwrap_err();
        assert!(matches!(err, OptimizerError::Failed { stage: "optimize", .. }));
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["simplify", "optimize"]);
    }

    #[test]
    fn opt_location() {
        assert_eq!(OptTool::new(None).program(), Path::new("opt"));
        assert_eq!(
            OptTool::new(Some(Path::new("/usr/lib/llvm/bin"))).program(),
            Path::new("/usr/lib/llvm/bin/opt")
        );
    }
}
