use anyhow::{Context, bail};
use clap::Parser;
use covtrace_core::campaign::{self, OutputDir, WORKING_INPUT_NAME, substitute_input_marker};
use covtrace_core::config::EngineConfig;
use covtrace_core::corpus::Corpus;
use covtrace_core::executor::{self, Executor};
use covtrace_core::trace::{MinimizePolicy, TraceOptions};
use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Runs an instrumented target over a corpus of test cases and records one
/// classified coverage trace per input.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Input directory with test cases
    #[clap(short = 'i', long = "input")]
    input_dir: PathBuf,

    /// Output directory for trace artifacts (created fresh)
    #[clap(short = 'o', long = "output")]
    output_dir: PathBuf,

    /// Working path the target reads each test case from
    /// (default: <output>/.cur_input)
    #[clap(short = 'f', long = "input-file")]
    input_file: Option<PathBuf>,

    /// Per-run timeout in milliseconds, or "none"
    #[clap(short = 't', long = "timeout")]
    timeout: Option<String>,

    /// Child address-space limit in megabytes, or "none"
    #[clap(short = 'm', long = "mem-limit")]
    mem_limit: Option<String>,

    /// Record edge coverage only, ignore hit counts
    #[clap(short = 'e', long)]
    edges_only: bool,

    /// Sink target output and suppress narration
    #[clap(short = 'q', long)]
    quiet: bool,

    /// Bit-flag classification and raw binary trace output
    #[clap(short = 'b', long)]
    binary: bool,

    /// Corpus-minimization output convention (implies --quiet)
    #[clap(short = 'Z', long)]
    minimize: bool,

    /// Keep core dumps from crashing children
    #[clap(short = 'c', long)]
    keep_cores: bool,

    /// Optional TOML file with engine settings; CLI flags win
    #[clap(long)]
    config_file: Option<PathBuf>,

    /// Target command line after `--`; `@@` in any argument expands to the
    /// working input path
    #[clap(required = true, last = true)]
    target: Vec<String>,
}

/// Parses a numeric limit where the literal "none" selects the zero
/// sentinel (no timeout, no memory limit).
fn parse_limit(value: &str, what: &str) -> Result<u64, anyhow::Error> {
    if value == "none" {
        return Ok(0);
    }
    value
        .parse::<u64>()
        .with_context(|| format!("bad syntax for {what}: {value:?}"))
}

fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0 && meta.len() >= 4)
        .unwrap_or(false)
}

/// Resolves the target binary: an explicit path is checked directly, a bare
/// name is searched along PATH. Either way the result must be a regular
/// executable file.
fn find_binary(name: &str) -> Result<PathBuf, anyhow::Error> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        if is_executable_file(&path) {
            return Ok(path);
        }
        bail!("program {name:?} not found or not executable");
    }

    let path_var = env::var_os("PATH")
        .with_context(|| format!("program {name:?} is not a path and PATH is unset"))?;
    for dir in env::split_paths(&path_var) {
        let candidate = if dir.as_os_str().is_empty() {
            PathBuf::from(name)
        } else {
            dir.join(name)
        };
        if is_executable_file(&candidate) {
            return Ok(candidate);
        }
    }
    bail!("program {name:?} not found in PATH or not executable");
}

fn assemble_config(cli: &Cli) -> Result<EngineConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(path) => EngineConfig::load_from_file(path)?,
        None => EngineConfig::default(),
    };

    if let Some(timeout) = &cli.timeout {
        config.exec_timeout_ms = parse_limit(timeout, "-t")?;
    }
    if let Some(mem_limit) = &cli.mem_limit {
        config.mem_limit_mb = parse_limit(mem_limit, "-m")?;
    }
    config.edges_only |= cli.edges_only;
    config.quiet |= cli.quiet;
    config.binary |= cli.binary;
    config.minimize |= cli.minimize;
    config.keep_cores |= cli.keep_cores;

    config.normalize();
    config.validate()?;
    Ok(config)
}

fn run() -> Result<i32, anyhow::Error> {
    let cli = Cli::parse();
    let config = assemble_config(&cli)?;
    log::debug!("effective configuration: {config:?}");

    let target_path = find_binary(&cli.target[0])?;

    let out = OutputDir::prepare(&cli.output_dir)?;
    let working_input = cli
        .input_file
        .clone()
        .unwrap_or_else(|| out.root.join(WORKING_INPUT_NAME));
    let working_input = std::path::absolute(&working_input)
        .with_context(|| format!("cannot resolve working input path {working_input:?}"))?;

    let mut argv = cli.target.clone();
    argv[0] = target_path.display().to_string();
    let argv = substitute_input_marker(&argv, &working_input);

    // The executor allocates the coverage channel and freezes the child
    // environment, so it must come before any corpus work that could fail
    // with a half-built setup.
    let mut exec = Executor::new(&target_path, &argv, &config)?;
    executor::install_stop_handlers()?;

    let mut corpus = Corpus::discover(&cli.input_dir)?;
    if !config.quiet {
        println!(
            "[*] covtrace {}: executing {:?} over {} test cases",
            env!("CARGO_PKG_VERSION"),
            target_path.display().to_string(),
            corpus.len(),
        );
    }

    let opts = TraceOptions {
        binary: config.binary,
        minimize: config.minimize,
        policy: MinimizePolicy::from_env(),
    };
    let outcome = campaign::run(
        &mut corpus,
        &mut exec,
        &out,
        &working_input,
        &opts,
        config.quiet,
    )?;

    if !config.quiet {
        let mut notes = Vec::new();
        if outcome.any_crashed {
            notes.push("crashes observed");
        }
        if outcome.any_timed_out {
            notes.push("timeouts observed");
        }
        if outcome.interrupted {
            notes.push("interrupted by operator");
        }
        let suffix = if notes.is_empty() {
            String::new()
        } else {
            format!(" ({})", notes.join(", "))
        };
        println!(
            "[*] finished: {} of {} test cases executed{}",
            outcome.executed,
            corpus.len(),
            suffix,
        );
    }

    Ok(outcome.exit_code())
}

fn main() {
    env_logger::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("[-] {e:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_accept_numbers_and_the_none_sentinel() {
        assert_eq!(parse_limit("none", "-t").unwrap(), 0);
        assert_eq!(parse_limit("1500", "-t").unwrap(), 1500);
        assert!(parse_limit("-3", "-t").is_err());
        assert!(parse_limit("1.5s", "-t").is_err());
    }

    #[test]
    fn find_binary_resolves_shells_but_rejects_garbage() {
        let sh = find_binary("/bin/sh").expect("/bin/sh must resolve");
        assert_eq!(sh, PathBuf::from("/bin/sh"));

        let from_path = find_binary("sh").expect("sh must resolve from PATH");
        assert!(is_executable_file(&from_path));

        assert!(find_binary("/nonexistent/covtrace/binary").is_err());
        assert!(find_binary("covtrace-no-such-binary-xyz").is_err());
    }

    #[test]
    fn cli_requires_target_after_double_dash() {
        let parsed = Cli::try_parse_from([
            "covtrace", "-i", "in", "-o", "out", "--", "./target", "@@",
        ])
        .expect("parse failed");
        assert_eq!(parsed.target, ["./target", "@@"]);

        assert!(Cli::try_parse_from(["covtrace", "-i", "in", "-o", "out"]).is_err());
    }
}
