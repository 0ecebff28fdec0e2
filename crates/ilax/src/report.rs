//! Run artifacts: the dependency report, the ASV catalog, the link script
//! and the timing logs.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::Config;
use crate::design::DesignInfo;
use crate::error::ExtractError;
use crate::state::{DependencyReport, WidthCycles};

pub const FUNC_INFO_FILE: &str = "func_info.txt";
pub const ASV_INFO_FILE: &str = "asv_info.txt";
pub const LINK_SCRIPT_FILE: &str = "link.sh";
pub const GEN_TIME_FILE: &str = "up_gen_time.txt";
pub const SIMPLIFY_TIME_FILE: &str = "simplify_time.txt";

/// `Instr:` blocks of `Target:` blocks of `name:width[:cycle]` lines.
pub fn write_func_info(out: &mut impl Write, report: &DependencyReport) -> io::Result<()> {
    for (instr, targets) in report {
        writeln!(out, "Instr:{}", instr)?;
        for (target, args) in targets {
            writeln!(out, "Target:{}", target)?;
            for arg in args {
                write!(out, "{}:{}", arg.name, arg.width)?;
                if arg.cycle != 0 {
                    write!(out, ":{}", arg.cycle)?;
                }
                writeln!(out)?;
            }
            writeln!(out)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Scalar ASVs as `name:width[:cycle]..`, then each vector as a bracketed
/// list of `member:width` followed by `]:name`.
pub fn write_asv_info(
    out: &mut impl Write,
    catalog: &BTreeMap<String, WidthCycles>,
    config: &Config,
    design: &dyn DesignInfo,
) -> Result<(), ExtractError> {
    let io_err = |e| ExtractError::io(ASV_INFO_FILE, e);
    for (name, entry) in catalog {
        if config.vector_of_member(name).is_some() {
            continue;
        }
        write!(out, "{}:{}", name, entry.width).map_err(io_err)?;
        for cycle in &entry.cycles {
            write!(out, ":{}", cycle).map_err(io_err)?;
        }
        writeln!(out).map_err(io_err)?;
    }

    for (name, vector) in &config.target_vectors {
        writeln!(out, "[").map_err(io_err)?;
        for member in &vector.members {
            let width = design
                .var_width_complex(member)
                .ok_or_else(|| ExtractError::UnknownWidth {
                    name: member.clone(),
                })?;
            writeln!(out, "{}:{}", member, width).map_err(io_err)?;
        }
        writeln!(out, "]:{}", name).map_err(io_err)?;
    }
    Ok(())
}

/// Shell script linking every generated module with the top-level C++
/// model. Arguments given to the script are passed on to `clang`.
pub fn write_link_script(out: &mut impl Write, artifacts: &[PathBuf]) -> io::Result<()> {
    writeln!(out, "clang $* ila.cpp -emit-llvm -S -o main.ll")?;
    writeln!(out, "llvm-link -v main.ll \\")?;
    for artifact in artifacts {
        writeln!(out, "{} \\", artifact.display())?;
    }
    writeln!(out, "-S -o linked.ll")?;
    writeln!(out, "clang $* linked.ll")?;
    Ok(())
}

/// Adds execute permission wherever read permission is granted.
#[cfg(unix)]
pub fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(path)?.permissions();
    let mode = perms.mode();
    let mut exec = 0o100;
    if mode & 0o040 != 0 {
        exec |= 0o010;
    }
    if mode & 0o004 != 0 {
        exec |= 0o001;
    }
    perms.set_mode(mode | exec);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Writes `func_info.txt`, `asv_info.txt` and `link.sh` into `out_dir`.
pub fn write_all(
    out_dir: &Path,
    report: &DependencyReport,
    catalog: &BTreeMap<String, WidthCycles>,
    artifacts: &[PathBuf],
    config: &Config,
    design: &dyn DesignInfo,
) -> Result<(), ExtractError> {
    let create = |name: &str| {
        let path = out_dir.join(name);
        File::create(&path)
            .map(BufWriter::new)
            .map_err(|e| ExtractError::io(path, e))
    };

    let mut func_info = create(FUNC_INFO_FILE)?;
    write_func_info(&mut func_info, report)
        .and_then(|()| func_info.flush())
        .map_err(|e| ExtractError::io(out_dir.join(FUNC_INFO_FILE), e))?;

    let mut asv_info = create(ASV_INFO_FILE)?;
    write_asv_info(&mut asv_info, catalog, config, design)?;
    asv_info
        .flush()
        .map_err(|e| ExtractError::io(out_dir.join(ASV_INFO_FILE), e))?;

    let script = out_dir.join(LINK_SCRIPT_FILE);
    let mut link = create(LINK_SCRIPT_FILE)?;
    write_link_script(&mut link, artifacts)
        .and_then(|()| link.flush())
        .map_err(|e| ExtractError::io(&script, e))?;
    drop(link);
    make_executable(&script).map_err(|e| ExtractError::io(&script, e))?;

    log::info!(
        "wrote {} targets over {} instructions to {}",
        catalog.len(),
        report.len(),
        out_dir.display()
    );
    Ok(())
}

/// Append-only `<function>:\t<seconds>` log shared by concurrent units.
#[derive(Debug)]
pub struct TimingLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TimingLog {
    /// Opens `path` for appending and stamps the start of a new run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ExtractError> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ExtractError::io(&path, e))?;
        writeln!(file, "===== Begin a new run!").map_err(|e| ExtractError::io(&path, e))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Appends one entry. Failures are logged; timings are informational.
    pub fn record(&self, function: &str, elapsed: Duration) {
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{}:\t{}", function, elapsed.as_secs()) {
            log::warn!("cannot write {}: {}", self.path.display(), e);
        }
    }
}

/// The generation and optimization timing logs of one run.
#[derive(Debug)]
pub struct Timings {
    pub generation: TimingLog,
    pub optimization: TimingLog,
}

impl Timings {
    pub fn open(out_dir: &Path) -> Result<Self, ExtractError> {
        Ok(Self {
            generation: TimingLog::open(out_dir.join(GEN_TIME_FILE))?,
            optimization: TimingLog::open(out_dir.join(SIMPLIFY_TIME_FILE))?,
        })
    }
}
