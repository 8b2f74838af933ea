use crate::classify::Classifier;
use crate::config::EngineConfig;
use crate::coverage::{CoverageChannelError, SharedCoverageMap};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering, fence};
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

// The only process-wide mutable state: an operator interrupt must be able to
// kill the in-flight child from the handler, and the driver polls the stop
// flag between iterations. Everything else lives in the Executor.
static STOP_SOON: AtomicBool = AtomicBool::new(false);
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_stop_signal(_sig: libc::c_int) {
    STOP_SOON.store(true, Ordering::SeqCst);
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

/// Routes SIGHUP/SIGINT/SIGTERM to the minimal stop handler. Call once
/// before the first execution.
pub fn install_stop_handlers() -> Result<(), ExecError> {
    let action = SigAction::new(
        SigHandler::Handler(handle_stop_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM] {
        unsafe { signal::sigaction(sig, &action) }.map_err(ExecError::SignalSetup)?;
    }
    Ok(())
}

/// True once the operator asked the campaign to stop. Polled explicitly by
/// the driver loop after every iteration.
pub fn stop_requested() -> bool {
    STOP_SOON.load(Ordering::SeqCst)
}

/// Errors raised while spawning or supervising the target.
///
/// All variants are fatal for the campaign. Timeouts and crashes are not
/// errors; they come back as `ExecOutcome` flags.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error(transparent)]
    Channel(#[from] CoverageChannelError),

    #[error("unable to open /dev/null: {0}")]
    NullSink(std::io::Error),

    #[error("target argument or environment entry contains an interior NUL byte")]
    InvalidArg(#[from] std::ffi::NulError),

    #[error("unable to install signal handlers: {0}")]
    SignalSetup(nix::Error),

    #[error("fork() failed: {0}")]
    Fork(nix::Error),

    #[error("waitpid() failed: {0}")]
    Wait(nix::Error),

    /// The child could not replace its image with the target binary. This
    /// signals a broken target, not a bad input, and aborts the campaign.
    #[error("unable to execute target {0:?}")]
    TargetLaunch(PathBuf),
}

/// The result of one supervised run. Consumed immediately by the serializer
/// and the driver's aggregate bookkeeping; never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub timed_out: bool,
    pub crashed: bool,
    pub signal: Option<i32>,
}

/// A target command line frozen into exec-ready form.
///
/// Everything the child needs (path, argv, environment) is converted to C
/// strings up front, so the post-fork path performs no allocation and stays
/// async-signal-safe.
pub struct TargetCommand {
    display_path: PathBuf,
    path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl TargetCommand {
    /// Snapshots the current environment, forcing `LD_BIND_NOW=1` unless
    /// the operator exported `LD_BIND_LAZY`. Eager symbol binding keeps
    /// crash locations deterministic between runs.
    ///
    /// `argv[0]` is the target name; the coverage channel must already be
    /// set up so its id is part of the snapshot.
    pub fn new(path: &Path, argv: &[String]) -> Result<Self, ExecError> {
        let path_c = CString::new(path.as_os_str().as_bytes().to_vec())?;
        let argv_c = argv
            .iter()
            .map(|arg| CString::new(arg.as_bytes().to_vec()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut bind_lazy = false;
        let mut bind_now_set = false;
        let mut envp = Vec::new();
        for (key, value) in std::env::vars_os() {
            if key == "LD_BIND_LAZY" {
                bind_lazy = true;
            }
            if key == "LD_BIND_NOW" {
                bind_now_set = true;
            }
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            envp.push(CString::new(entry)?);
        }
        if !bind_lazy && !bind_now_set {
            envp.push(CString::new("LD_BIND_NOW=1")?);
        }

        Ok(Self {
            display_path: path.to_path_buf(),
            path: path_c,
            argv: argv_c,
            envp,
        })
    }
}

/// Spawns and supervises one child per call, owning the coverage channel
/// for the duration of the campaign.
///
/// Per execution: reset the map, fork, sandbox the child, wait under an
/// explicit deadline, check the launch sentinel, classify in place. At most
/// one child is ever live.
pub struct Executor {
    shm: SharedCoverageMap,
    classifier: Classifier,
    command: TargetCommand,
    exec_timeout: Option<Duration>,
    mem_limit_mb: u64,
    keep_cores: bool,
    quiet: bool,
    dev_null: File,
}

impl Executor {
    /// Allocates the coverage channel, then freezes the target command so
    /// the channel id is visible in the child's environment.
    pub fn new(target: &Path, argv: &[String], config: &EngineConfig) -> Result<Self, ExecError> {
        let shm = SharedCoverageMap::new()?;
        let command = TargetCommand::new(target, argv)?;
        let classifier = Classifier::new(config.classify_mode(), config.edges_only);
        let dev_null = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/null")
            .map_err(ExecError::NullSink)?;

        Ok(Self {
            shm,
            classifier,
            command,
            exec_timeout: config.exec_timeout(),
            mem_limit_mb: config.mem_limit_mb,
            keep_cores: config.keep_cores,
            quiet: config.quiet,
            dev_null,
        })
    }

    /// The classified coverage of the most recent execution.
    pub fn coverage(&self) -> &[u8] {
        self.shm.as_slice()
    }

    /// Runs the target once against whatever input the frozen argv points
    /// at, returning the classified outcome.
    pub fn execute(&mut self) -> Result<ExecOutcome, ExecError> {
        if !self.quiet {
            println!("-- target output begins --");
        }

        self.shm.reset_for_exec();

        // Exec-ready pointer arrays, built while allocation is still safe.
        let argv_ptrs: Vec<*const libc::c_char> = self
            .command
            .argv
            .iter()
            .map(|arg| arg.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();
        let envp_ptrs: Vec<*const libc::c_char> = self
            .command
            .envp
            .iter()
            .map(|entry| entry.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let child = match unsafe { fork() }.map_err(ExecError::Fork)? {
            ForkResult::Child => self.run_child(&argv_ptrs, &envp_ptrs),
            ForkResult::Parent { child } => child,
        };

        CHILD_PID.store(child.as_raw(), Ordering::SeqCst);
        let (status, timed_out) = self.supervise(child)?;
        CHILD_PID.store(0, Ordering::SeqCst);

        // Pair of the reset fence: the child's map writes must be visible
        // before the sentinel check and classification below.
        fence(Ordering::SeqCst);

        if self.shm.launch_failed() {
            return Err(ExecError::TargetLaunch(self.command.display_path.clone()));
        }

        self.classifier.classify_in_place(self.shm.as_mut_slice());

        if !self.quiet {
            println!("-- target output ends --");
        }

        let signal = match status {
            WaitStatus::Signaled(_, sig, _) => Some(sig as i32),
            _ => None,
        };
        let crashed = signal.is_some() && !timed_out && !stop_requested();
        let outcome = ExecOutcome {
            timed_out,
            crashed,
            signal,
        };

        if !self.quiet {
            if outcome.timed_out {
                println!("+++ target timed out +++");
            } else if stop_requested() {
                println!("+++ run aborted by operator +++");
            } else if let Some(sig) = outcome.signal {
                println!("+++ target killed by signal {sig} +++");
            }
        }

        Ok(outcome)
    }

    /// Child-side setup between fork and exec. Only async-signal-safe calls
    /// from here on: raw dup2/setrlimit/setsid/execve, a volatile sentinel
    /// store on failure, then _exit.
    fn run_child(&self, argv: &[*const libc::c_char], envp: &[*const libc::c_char]) -> ! {
        unsafe {
            if self.quiet {
                let null_fd = self.dev_null.as_raw_fd();
                if libc::dup2(null_fd, 1) < 0 || libc::dup2(null_fd, 2) < 0 {
                    self.shm.write_launch_sentinel();
                    libc::_exit(1);
                }
            }

            if self.mem_limit_mb > 0 {
                let bytes = (self.mem_limit_mb as libc::rlim_t) << 20;
                let limit = libc::rlimit {
                    rlim_cur: bytes,
                    rlim_max: bytes,
                };
                // Target may still run without the limit; errors ignored.
                libc::setrlimit(libc::RLIMIT_AS, &limit);
            }

            let core_limit = if self.keep_cores {
                libc::RLIM_INFINITY
            } else {
                0
            };
            let limit = libc::rlimit {
                rlim_cur: core_limit,
                rlim_max: core_limit,
            };
            libc::setrlimit(libc::RLIMIT_CORE, &limit);

            libc::setsid();

            libc::execve(self.command.path.as_ptr(), argv.as_ptr(), envp.as_ptr());

            // Exec failed: the map is the only channel back to the parent.
            self.shm.write_launch_sentinel();
            libc::_exit(0);
        }
    }

    /// Waits for the child, enforcing the configured deadline. A run past
    /// the deadline is killed outright and then reaped, so the child is
    /// guaranteed gone when this returns.
    fn supervise(&self, child: Pid) -> Result<(WaitStatus, bool), ExecError> {
        let deadline = match self.exec_timeout {
            None => {
                let status = waitpid(child, None).map_err(ExecError::Wait)?;
                return Ok((status, false));
            }
            Some(timeout) => Instant::now() + timeout,
        };

        loop {
            match waitpid(child, Some(WaitPidFlag::WNOHANG)).map_err(ExecError::Wait)? {
                WaitStatus::StillAlive => {
                    if Instant::now() >= deadline {
                        if let Err(e) = signal::kill(child, Signal::SIGKILL) {
                            log::warn!("failed to kill timed-out child {child}: {e}");
                        }
                        let status = waitpid(child, None).map_err(ExecError::Wait)?;
                        return Ok((status, true));
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                status => return Ok((status, false)),
            }
        }
    }
}
