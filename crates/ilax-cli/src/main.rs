use clap::{Parser as ClapParser, Subcommand};
use miette::{IntoDiagnostic, Result, bail};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

use ilax::vcd::{self, RESET_VALUES_FILE};
use ilax::{CommandGenerator, Config, DesignMetadata, Extractor, OptTool};

#[derive(ClapParser)]
#[command(name = "ilax", about = "Extract per-instruction update functions from an RTL design")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate update functions until no new state variable turns up
    Extract {
        /// Run configuration (TOML)
        #[arg(long)]
        config: PathBuf,

        /// Design metadata (TOML or JSON)
        #[arg(long)]
        design: PathBuf,

        /// Program emitting the raw IR of one update function
        #[arg(long)]
        generator: PathBuf,

        /// Extra argument passed to the generator before the target description
        #[arg(long = "generator-arg", allow_hyphen_values = true)]
        generator_args: Vec<String>,

        /// Output directory, overriding the configuration
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Read register reset values from a VCD trace
    ResetValues {
        /// Trace recorded while the design is held in reset
        #[arg(long)]
        vcd: PathBuf,

        /// Register table (`name = width`, TOML); every variable when omitted
        #[arg(long)]
        registers: Option<PathBuf>,

        /// Directory receiving rst_vals.txt
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Command::Extract {
            config,
            design,
            generator,
            generator_args,
            out,
        } => {
            let mut config = Config::load(&config).into_diagnostic()?;
            if let Some(out) = out {
                config = config.with_out_dir(out);
            }
            if config.instructions.is_empty() {
                bail!("No instructions configured");
            }
            let design = DesignMetadata::load(&design).into_diagnostic()?;
            let generator = CommandGenerator::new(generator).with_args(generator_args);
            let optimizer = OptTool::new(config.llvm_path.as_deref());

            let summary = Extractor::new(&config, &design, &generator, &optimizer)
                .run()
                .into_diagnostic()?;
            log::info!(
                "{} state variable(s), {} generated module(s) in {}",
                summary.catalog.len(),
                summary.artifacts.len(),
                config.out_dir.display()
            );
        }
        Command::ResetValues {
            vcd: trace_path,
            registers,
            out,
        } => {
            let registers = match registers {
                Some(path) => vcd::read_register_table(path).into_diagnostic()?,
                None => BTreeMap::new(),
            };
            let trace = File::open(&trace_path).into_diagnostic()?;
            let values =
                vcd::parse_reset_values(BufReader::new(trace), &registers).into_diagnostic()?;

            std::fs::create_dir_all(&out).into_diagnostic()?;
            let path = out.join(RESET_VALUES_FILE);
            let mut writer = BufWriter::new(File::create(&path).into_diagnostic()?);
            vcd::write_reset_values(&mut writer, &values).into_diagnostic()?;
            writer.flush().into_diagnostic()?;
            log::info!("{} reset value(s) written to {}", values.len(), path.display());
        }
    }
    Ok(())
}
