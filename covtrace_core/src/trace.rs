use crate::executor::ExecOutcome;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Reserved destination name that routes the trace to standard output.
pub const STDOUT_SINK: &str = "-";

/// Suppression rules for minimization-mode traces, taken from the
/// environment of the consuming tool.
///
/// By default only clean runs produce artifacts. `crashes_only` inverts
/// that to keep crashing runs instead; `allow_any` keeps both. Timed-out
/// runs never qualify.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinimizePolicy {
    pub crashes_only: bool,
    pub allow_any: bool,
}

impl MinimizePolicy {
    pub fn from_env() -> Self {
        Self {
            crashes_only: std::env::var_os("COVTRACE_CMIN_CRASHES_ONLY").is_some(),
            allow_any: std::env::var_os("COVTRACE_CMIN_ALLOW_ANY").is_some(),
        }
    }

    fn disqualifies(&self, outcome: &ExecOutcome) -> bool {
        if outcome.timed_out {
            return true;
        }
        !self.allow_any && outcome.crashed != self.crashes_only
    }
}

/// Encoding selection for one trace artifact.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceOptions {
    /// Write the classified map verbatim instead of text lines.
    pub binary: bool,
    /// Minimization-tool line format plus policy-based suppression.
    pub minimize: bool,
    pub policy: MinimizePolicy,
}

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("unable to open trace destination {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("unable to write trace to {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

fn open_sink(dest: &Path) -> Result<Box<dyn Write>, TraceError> {
    if dest.as_os_str() == STDOUT_SINK {
        return Ok(Box::new(io::stdout()));
    }
    let mut options = OpenOptions::new();
    options.write(true);
    // Device nodes exist already; exclusive creation only applies elsewhere.
    if !dest.starts_with("/dev") {
        options.create_new(true);
    }
    let file = options.open(dest).map_err(|source| TraceError::Open {
        path: dest.to_path_buf(),
        source,
    })?;
    Ok(Box::new(file))
}

/// Serializes a classified map to `dest` and returns the number of nonzero
/// slots.
///
/// The count is computed before any suppression decision, so callers can
/// always distinguish "no coverage observed" from "artifact withheld".
/// Text lines are `offset:count` with a zero-padded offset; minimization
/// mode concatenates `count` and `offset` with no delimiter and withholds
/// the whole artifact when the outcome is disqualified by the policy.
pub fn write_trace(
    map: &[u8],
    dest: &Path,
    opts: &TraceOptions,
    outcome: &ExecOutcome,
) -> Result<u32, TraceError> {
    let nonzero = map.iter().filter(|&&slot| slot != 0).count() as u32;

    if opts.minimize && opts.policy.disqualifies(outcome) {
        return Ok(nonzero);
    }

    let sink = open_sink(dest)?;
    let mut out = BufWriter::new(sink);
    let write_failed = |source| TraceError::Write {
        path: dest.to_path_buf(),
        source,
    };

    if opts.binary {
        out.write_all(map).map_err(write_failed)?;
    } else {
        for (offset, &count) in map.iter().enumerate() {
            if count == 0 {
                continue;
            }
            if opts.minimize {
                writeln!(out, "{count}{offset}").map_err(write_failed)?;
            } else {
                writeln!(out, "{offset:06}:{count}").map_err(write_failed)?;
            }
        }
    }

    out.flush().map_err(write_failed)?;
    Ok(nonzero)
}
