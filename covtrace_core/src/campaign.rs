use crate::corpus::Corpus;
use crate::executor::{self, ExecError, Executor};
use crate::trace::{self, TraceError, TraceOptions};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default name of the working input inside the output directory.
pub const WORKING_INPUT_NAME: &str = ".cur_input";

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Driver-level failures. Every variant is fatal: a campaign that cannot
/// materialize inputs or record traces has nothing trustworthy to report.
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("unable to create output directory {path:?} (it must not already exist): {source}")]
    CreateOutputDir {
        path: PathBuf,
        source: io::Error,
    },

    #[error("unable to lock output directory {path:?}: {source}")]
    LockOutputDir {
        path: PathBuf,
        source: io::Error,
    },

    #[error("unable to create traces directory {path:?}: {source}")]
    CreateTracesDir {
        path: PathBuf,
        source: io::Error,
    },

    #[error("unable to materialize input {src:?} at {dst:?}: {source}")]
    Materialize {
        src: PathBuf,
        dst: PathBuf,
        source: io::Error,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Trace(#[from] TraceError),
}

/// The campaign's output directory: created fresh, exclusively locked for
/// the life of this process, holding one trace artifact per test case under
/// `traces/`.
#[derive(Debug)]
pub struct OutputDir {
    pub root: PathBuf,
    pub traces: PathBuf,
    // Keeps the flock alive until the process exits.
    _lock: File,
}

impl OutputDir {
    pub fn prepare(root: &Path) -> Result<Self, CampaignError> {
        fs::create_dir(root).map_err(|source| CampaignError::CreateOutputDir {
            path: root.to_path_buf(),
            source,
        })?;

        let lock = File::open(root).map_err(|source| CampaignError::LockOutputDir {
            path: root.to_path_buf(),
            source,
        })?;
        let rc = unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc < 0 {
            return Err(CampaignError::LockOutputDir {
                path: root.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }

        let traces = root.join("traces");
        fs::create_dir(&traces).map_err(|source| CampaignError::CreateTracesDir {
            path: traces.clone(),
            source,
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            traces,
            _lock: lock,
        })
    }
}

/// Replaces the first `@@` in each argument with the working input path.
pub fn substitute_input_marker(argv: &[String], input_path: &Path) -> Vec<String> {
    let replacement = input_path.display().to_string();
    argv.iter()
        .map(|arg| arg.replacen("@@", &replacement, 1))
        .collect()
}

/// Hard-links `src` to `dst`, falling back to a byte-for-byte copy through
/// a fixed buffer when linking is not permitted (cross-device inputs).
fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }

    let mut reader = File::open(src)?;
    let mut writer = OpenOptions::new().write(true).create_new(true).open(dst)?;
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
    }
    Ok(())
}

/// Aggregate result of a whole campaign.
#[derive(Debug, Clone, Copy, Default)]
pub struct CampaignOutcome {
    pub executed: u32,
    pub any_crashed: bool,
    pub any_timed_out: bool,
    pub interrupted: bool,
}

impl CampaignOutcome {
    /// The process exit status summarizing the whole corpus: 2 if any run
    /// crashed, else 1 if any run timed out, else 0. Launch failures abort
    /// the campaign before this is consulted.
    pub fn exit_code(&self) -> i32 {
        if self.any_crashed {
            2
        } else if self.any_timed_out {
            1
        } else {
            0
        }
    }
}

/// Runs every corpus record through the executor in mtime order, recording
/// one trace artifact per record.
///
/// Per iteration: materialize the input at `working_input`, execute, remove
/// the materialized input, serialize the classified map to
/// `traces/<basename>.txt`. An operator interrupt ends the loop after the
/// current record's bookkeeping; later records stay unprocessed.
pub fn run(
    corpus: &mut Corpus,
    exec: &mut Executor,
    out: &OutputDir,
    working_input: &Path,
    opts: &TraceOptions,
    quiet: bool,
) -> Result<CampaignOutcome, CampaignError> {
    corpus.sort_by_mtime();
    corpus.compute_time_buckets();

    let mut outcome = CampaignOutcome::default();
    for record in corpus.iter() {
        if !quiet {
            println!(
                "[*] {} (mtime {}, +{}s / +{}m / +{}h)",
                record.path.display(),
                record.mtime,
                record.seconds_since_min,
                record.minutes_since_min,
                record.hours_since_min,
            );
        }

        link_or_copy(&record.path, working_input).map_err(|source| {
            CampaignError::Materialize {
                src: record.path.clone(),
                dst: working_input.to_path_buf(),
                source,
            }
        })?;

        let run_result = exec.execute();
        if let Err(e) = fs::remove_file(working_input) {
            log::warn!("failed to remove working input {working_input:?}: {e}");
        }
        let run = run_result?;

        outcome.executed += 1;
        outcome.any_crashed |= run.crashed;
        outcome.any_timed_out |= run.timed_out;

        // An operator interrupt kills the in-flight child; that truncated
        // run must not be recorded as a fresh trace.
        let killed_by_interrupt = executor::stop_requested()
            && run.signal.is_some()
            && !run.crashed
            && !run.timed_out;

        if !killed_by_interrupt {
            let base = record
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("case_{}", outcome.executed));
            let trace_path = out.traces.join(format!("{base}.txt"));
            let tuples = trace::write_trace(exec.coverage(), &trace_path, opts, &run)?;

            if !quiet {
                if tuples == 0 {
                    println!("[-] no instrumentation output for {base}");
                } else {
                    println!("[+] captured {tuples} tuples in {}", trace_path.display());
                }
            }
        }

        if executor::stop_requested() {
            outcome.interrupted = true;
            break;
        }
    }

    Ok(outcome)
}
