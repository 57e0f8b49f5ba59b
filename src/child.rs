//! Hosting a child program on the PTY
//!
//! [`ChildProcessHost`] ties the pieces together: it allocates the
//! [`PtyDevice`], forks the program with the slave wired to its standard
//! streams and bound as its controlling terminal, records the login, then
//! drives I/O through the [`IoMultiplexer`] until the child exits. Exit (or
//! [`terminate`](ChildProcessHost::terminate)) records the logout and
//! releases the device, in that order.
//!
//! Start-up is confirmed over a close-on-exec status pipe. A successful
//! exec closes the child's end, so the parent reads end of file; any
//! failure before exec is written to the pipe as a five byte frame (step
//! code, then the errno as little endian `i32`) before the child exits
//! with status 127.

use std::collections::VecDeque;
use std::env;
use std::ffi::{c_char, CString, OsString};
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::ptr;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, error, info, warn};

use crate::config::HostConfig;
use crate::event::LifecycleEvent;
use crate::mux::{ByteSink, IoMultiplexer, MuxError, Side};
use crate::pty::{DefaultBackend, PtyBackend, PtyDevice, PtyError, WindowSize};
use crate::session::{BindingError, SessionBinder};

/// Exit status of a child that failed before exec
pub const START_FAILURE_EXIT: i32 = 127;

/// Search path used when the child environment has no `PATH`
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Poll interval while waiting out the termination grace period
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Where the hosted child is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChildState {
    #[default]
    NotStarted,
    Running,
    /// Exit code; death by signal `n` is reported as `128 + n`
    Exited(i32),
    Failed(String),
}

/// The child process owned by a [`ChildProcessHost`]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChildProcess {
    pub pid: Option<Pid>,
    pub state: ChildState,
}

impl ChildProcess {
    pub fn is_running(&self) -> bool {
        self.state == ChildState::Running
    }
}

/// Errors returned by [`ChildProcessHost`]
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("A child is already running on this terminal")]
    AlreadyRunning,

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed to create status pipe: {0}")]
    Pipe(#[source] nix::Error),

    #[error("Failed to fork: {0}")]
    Fork(#[source] nix::Error),

    #[error("Child failed to start: {0}")]
    StartFailed(String),

    #[error("Failed to wait for child: {0}")]
    Wait(#[source] nix::Error),

    #[error("Failed to signal child: {0}")]
    Signal(#[source] nix::Error),

    #[error("Slave side is not available for direct I/O")]
    SlaveBusy,

    #[error(transparent)]
    Mux(#[from] MuxError),
}

/// Child-side setup step that failed before exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum StartStep {
    Duplicate = 1,
    NewSession = 2,
    ControllingTerminal = 3,
    ForegroundGroup = 4,
    Chdir = 5,
    Exec = 6,
}

impl StartStep {
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Duplicate,
            2 => Self::NewSession,
            3 => Self::ControllingTerminal,
            4 => Self::ForegroundGroup,
            5 => Self::Chdir,
            6 => Self::Exec,
            _ => return None,
        })
    }
}

impl From<&BindingError> for StartStep {
    fn from(err: &BindingError) -> Self {
        match err {
            BindingError::NewSession(_) => Self::NewSession,
            BindingError::ControllingTerminal(_) => Self::ControllingTerminal,
            BindingError::ForegroundGroup(_) => Self::ForegroundGroup,
        }
    }
}

impl fmt::Display for StartStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Duplicate => "dup2",
            Self::NewSession => "setsid",
            Self::ControllingTerminal => "TIOCSCTTY",
            Self::ForegroundGroup => "tcsetpgrp",
            Self::Chdir => "chdir",
            Self::Exec => "exec",
        })
    }
}

const STATUS_FRAME_LEN: usize = 5;

fn encode_status(step: StartStep, errno: Errno) -> [u8; STATUS_FRAME_LEN] {
    let mut frame = [0; STATUS_FRAME_LEN];
    frame[0] = step as u8;
    frame[1..].copy_from_slice(&(errno as i32).to_le_bytes());
    frame
}

/// Reason string for a status frame received from the child
fn decode_status(frame: &[u8; STATUS_FRAME_LEN]) -> String {
    let errno = Errno::from_raw(i32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]));
    match StartStep::from_code(frame[0]) {
        Some(step) => format!("{}: {}", step, errno),
        None => format!("unknown setup step {}: {}", frame[0], errno),
    }
}

/// Everything the child needs after fork, converted up front so the child
/// never allocates
struct ExecPlan {
    path: CString,
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const c_char>,
    working_dir: Option<CString>,
}

impl ExecPlan {
    fn new(program: &str, args: &[&str], config: &HostConfig) -> Result<Self, SpawnError> {
        if program.is_empty() {
            return Err(SpawnError::InvalidArgument("empty program name".to_string()));
        }

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(c_string(program.as_bytes())?);
        for arg in args {
            argv.push(c_string(arg.as_bytes())?);
        }

        let vars = child_environment(config);
        let search_path = vars
            .iter()
            .find(|(key, _)| key == "PATH")
            .map(|(_, value)| value.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_PATH.to_string());
        let path = c_string(resolve_program(program, &search_path).as_os_str().as_bytes())?;

        let envp = vars
            .into_iter()
            .map(|(key, value)| {
                let mut entry = key.into_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                c_string(&entry)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let working_dir = config
            .working_dir
            .as_ref()
            .map(|dir| c_string(dir.as_os_str().as_bytes()))
            .transpose()?;

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);
        Ok(Self {
            path,
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
            working_dir,
        })
    }
}

fn c_string(bytes: &[u8]) -> Result<CString, SpawnError> {
    CString::new(bytes).map_err(|_| {
        SpawnError::InvalidArgument(format!(
            "interior NUL byte in {:?}",
            String::from_utf8_lossy(bytes)
        ))
    })
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// The parent environment with `TERM` and the configured overrides applied
fn child_environment(config: &HostConfig) -> Vec<(OsString, OsString)> {
    let overridden = |key: &OsString| key == "TERM" || config.env.iter().any(|(k, _)| key == k.as_str());

    let mut vars: Vec<(OsString, OsString)> =
        env::vars_os().filter(|(key, _)| !overridden(key)).collect();
    vars.push(("TERM".into(), config.term.clone().into()));
    for (key, value) in &config.env {
        vars.push((key.into(), value.into()));
    }
    vars
}

/// Look a bare program name up in `search_path`
///
/// Names containing a slash, and names not found anywhere, are returned
/// unchanged; exec then reports the error from the child.
fn resolve_program(program: &str, search_path: &str) -> std::path::PathBuf {
    if program.contains('/') {
        return program.into();
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| {
            candidate
                .metadata()
                .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        })
        .unwrap_or_else(|| program.into())
}

/// Report a failed setup step to the parent and exit without running any
/// destructors or atexit handlers
fn start_failed(status: RawFd, step: StartStep, errno: Errno) -> ! {
    let frame = encode_status(step, errno);
    // SAFETY: write and _exit are async-signal-safe; frame outlives the call
    unsafe {
        libc::write(status, frame.as_ptr().cast(), frame.len());
        libc::_exit(START_FAILURE_EXIT)
    }
}

/// Child side of the fork: wire up the terminal and exec
///
/// Runs between fork and exec, so only async-signal-safe calls are made.
fn exec_child(plan: &ExecPlan, slave: RawFd, status: RawFd) -> ! {
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: plain syscalls on descriptors this process owns
        let result = unsafe {
            if slave == target {
                // dup2 onto itself would keep the close-on-exec flag
                libc::fcntl(target, libc::F_SETFD, 0)
            } else {
                libc::dup2(slave, target)
            }
        };
        if result < 0 {
            start_failed(status, StartStep::Duplicate, Errno::last());
        }
    }

    if let Err(e) = SessionBinder::bind_controlling_terminal(slave) {
        start_failed(status, StartStep::from(&e), e.errno());
    }

    // SAFETY: resetting dispositions and the mask only affects this process
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, ptr::null_mut());
    }

    if let Some(dir) = &plan.working_dir {
        // SAFETY: dir is a valid C string built before fork
        if unsafe { libc::chdir(dir.as_ptr()) } < 0 {
            start_failed(status, StartStep::Chdir, Errno::last());
        }
    }

    // SAFETY: all pointer arrays are NUL terminated and point into CStrings
    // owned by plan
    unsafe {
        libc::execve(
            plan.path.as_ptr(),
            plan.argv_ptrs.as_ptr(),
            plan.envp_ptrs.as_ptr(),
        );
    }
    start_failed(status, StartStep::Exec, Errno::last())
}

/// Translate a wait status into an exit code, if the child is gone
fn exit_code(status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as i32),
        _ => None,
    }
}

/// Block until `pid` is reaped, retrying on EINTR
fn reap_blocking(pid: Pid) -> Result<i32, SpawnError> {
    loop {
        match waitpid(pid, None) {
            Ok(status) => {
                if let Some(code) = exit_code(status) {
                    return Ok(code);
                }
            }
            Err(Errno::EINTR) => {}
            Err(e) => return Err(abandon_start(pid, e)),
        }
    }
}

/// Close-on-exec pipe carrying the child's start-up status
#[cfg(not(target_os = "macos"))]
fn status_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
}

/// Close-on-exec pipe carrying the child's start-up status
///
/// macOS has no `pipe2`, so the flag is set after the fact.
#[cfg(target_os = "macos")]
fn status_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let (read, write) = nix::unistd::pipe()?;
    for fd in [&read, &write] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }
    Ok((read, write))
}

/// Kill and reap a child whose start-up can no longer be observed
fn abandon_start(pid: Pid, err: Errno) -> SpawnError {
    warn!(pid = pid.as_raw(), "Lost the start-up status pipe, killing child: {}", err);
    let _ = kill(pid, Signal::SIGKILL);
    if let Err(e) = reap_blocking(pid) {
        warn!(pid = pid.as_raw(), "Failed to reap abandoned child: {}", e);
    }
    SpawnError::Wait(err)
}

/// Wait for the child's verdict on the status pipe
///
/// `Ok(None)` means exec succeeded. `Ok(Some(reason))` means the child
/// reported a failed step or missed the deadline. On that and on `Err` the
/// child has been reaped.
fn wait_for_start(pid: Pid, status: &OwnedFd, timeout: Duration) -> Result<Option<String>, SpawnError> {
    let deadline = Instant::now() + timeout;
    let mut frame = [0u8; STATUS_FRAME_LEN];
    let mut filled = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(pid = pid.as_raw(), "Child did not start in time, killing it");
            let _ = kill(pid, Signal::SIGKILL);
            reap_blocking(pid)?;
            return Ok(Some(format!("did not start within {:?}", timeout)));
        }

        let millis = u16::try_from(remaining.as_millis().max(1)).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(status.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) | Err(Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => return Err(abandon_start(pid, e)),
        }

        // SAFETY: the buffer slice is valid for writes of its length
        let n = unsafe {
            libc::read(
                status.as_raw_fd(),
                frame[filled..].as_mut_ptr().cast(),
                STATUS_FRAME_LEN - filled,
            )
        };
        match Errno::result(n) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                reap_blocking(pid)?;
                return Ok(Some("truncated start-up status".to_string()));
            }
            Ok(n) => {
                filled += n as usize;
                if filled == STATUS_FRAME_LEN {
                    reap_blocking(pid)?;
                    return Ok(Some(decode_status(&frame)));
                }
            }
            Err(Errno::EINTR) => {}
            Err(e) => return Err(abandon_start(pid, e)),
        }
    }
}

/// Runs one child program on one PTY device
pub struct ChildProcessHost<B: PtyBackend = DefaultBackend> {
    device: PtyDevice<B>,
    binder: SessionBinder,
    mux: IoMultiplexer,
    config: HostConfig,
    user: String,
    child: ChildProcess,
    /// Line of the login record to remove on teardown
    login_line: Option<String>,
    events: VecDeque<LifecycleEvent>,
}

impl ChildProcessHost<DefaultBackend> {
    /// Create a host with the platform PTY backend and the accounting
    /// store named in `config`
    pub fn new(config: HostConfig) -> Self {
        let binder = match config.accounting.open() {
            Some(accounting) => SessionBinder::new(accounting),
            None => SessionBinder::without_accounting(),
        };
        Self::with_parts(PtyDevice::new(), binder, config)
    }
}

impl<B: PtyBackend> ChildProcessHost<B> {
    /// Create a host from explicit collaborators
    pub fn with_parts(device: PtyDevice<B>, binder: SessionBinder, config: HostConfig) -> Self {
        Self {
            device,
            binder,
            mux: IoMultiplexer::new(config.read_buffer_size),
            user: config.accounting.resolved_user(),
            config,
            child: ChildProcess::default(),
            login_line: None,
            events: VecDeque::new(),
        }
    }

    pub fn child(&self) -> &ChildProcess {
        &self.child
    }

    pub fn device(&self) -> &PtyDevice<B> {
        &self.device
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn binder(&self) -> &SessionBinder {
        &self.binder
    }

    /// Allocate the device (if closed), apply the configured window size
    /// and start watching the master
    pub fn open(&mut self) -> Result<(), SpawnError> {
        if !self.device.is_open() {
            self.device.allocate()?;
            if let Err(e) = self.device.set_window_size(self.config.window) {
                warn!("Failed to apply initial window size: {}", e);
            }
        }
        if self.mux.registered(Side::Master).is_none() {
            self.register(Side::Master, self.device.master_handle())?;
        }
        Ok(())
    }

    /// Open the device with the slave side watched as well
    ///
    /// Without a child on the slave, bytes queued with
    /// [`write_slave`](Self::write_slave) reach the master and the other
    /// way round. A later [`spawn`](Self::spawn) hands the slave to the
    /// child and stops watching it.
    pub fn open_standalone(&mut self) -> Result<(), SpawnError> {
        if self.child.is_running() {
            return Err(SpawnError::SlaveBusy);
        }
        self.open()?;
        if self.mux.registered(Side::Slave).is_none() {
            self.register(Side::Slave, self.device.slave_handle())?;
        }
        Ok(())
    }

    fn register(&mut self, side: Side, fd: RawFd) -> Result<(), SpawnError> {
        // SAFETY: the device owns fd and keeps it open until release, which
        // always unregisters first
        let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
        self.mux.register(side, fd)?;
        Ok(())
    }

    /// Start `program` on the terminal
    ///
    /// Allocates the device if needed. Returns once the child has exec'd;
    /// if it never gets that far the device stays allocated and
    /// [`SpawnError::StartFailed`] is returned.
    pub fn spawn(&mut self, program: &str, args: &[&str]) -> Result<ChildProcess, SpawnError> {
        if self.child.is_running() {
            return Err(SpawnError::AlreadyRunning);
        }
        let plan = ExecPlan::new(program, args, &self.config)?;

        self.open()?;
        // The child's standard streams share the slave's file description
        self.mux.unregister(Side::Slave);

        let slave = self.device.slave_handle();
        let (status_read, status_write) = status_pipe().map_err(SpawnError::Pipe)?;

        // SAFETY: the child branch only makes async-signal-safe calls
        // before exec or _exit
        let pid = match unsafe { fork() }.map_err(SpawnError::Fork)? {
            ForkResult::Child => exec_child(&plan, slave, status_write.as_raw_fd()),
            ForkResult::Parent { child } => child,
        };
        drop(status_write);
        debug!(pid = pid.as_raw(), program, "Forked child");

        let verdict = match wait_for_start(pid, &status_read, self.config.start_timeout()) {
            Ok(verdict) => verdict,
            Err(e) => {
                self.record_start_failure(pid, format!("start-up status lost: {}", e));
                return Err(e);
            }
        };
        match verdict {
            None => {
                info!(pid = pid.as_raw(), program, "Child started");
                self.child = ChildProcess {
                    pid: Some(pid),
                    state: ChildState::Running,
                };
                self.events
                    .push_back(LifecycleEvent::Started { pid: pid.as_raw() });

                if let Some(path) = self.device.slave_path() {
                    self.login_line = self
                        .binder
                        .record_login(path, &self.user, pid)
                        .map(|record| record.line_name);
                }
                Ok(self.child.clone())
            }
            Some(reason) => {
                warn!(pid = pid.as_raw(), program, "Child failed to start: {}", reason);
                self.record_start_failure(pid, reason.clone());
                Err(SpawnError::StartFailed(reason))
            }
        }
    }

    /// Record a child that never got to exec; it has already been reaped
    fn record_start_failure(&mut self, pid: Pid, reason: String) {
        self.child = ChildProcess {
            pid: Some(pid),
            state: ChildState::Failed(reason.clone()),
        };
        self.events.push_back(LifecycleEvent::Failed { reason });
    }

    /// Start the program named in the config
    pub fn spawn_default(&mut self) -> Result<ChildProcess, SpawnError> {
        let program = self.config.program.clone();
        let args = self.config.args.clone();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.spawn(&program, &args)
    }

    /// Queue bytes for the master (input to the child)
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), SpawnError> {
        if !self.device.is_open() {
            return Err(PtyError::NotOpen.into());
        }
        self.mux.queue(Side::Master, bytes);
        Ok(())
    }

    /// Queue bytes for the slave side in standalone mode
    pub fn write_slave(&mut self, bytes: &[u8]) -> Result<(), SpawnError> {
        if !self.mux.is_enabled(Side::Slave) {
            return Err(SpawnError::SlaveBusy);
        }
        self.mux.queue(Side::Slave, bytes);
        Ok(())
    }

    /// Run one turn of the I/O loop, then check on the child
    ///
    /// Output left on the master when the child exits is delivered before
    /// the device is released.
    pub fn pump<S>(&mut self, timeout: Duration, sink: &mut S) -> Result<usize, SpawnError>
    where
        S: ByteSink + ?Sized,
    {
        let mut moved = self.mux.poll_once(timeout, sink)?;
        if let Some(code) = self.reap()? {
            moved += self.mux.drain(Side::Master, sink)?;
            self.finish(code);
        }
        Ok(moved)
    }

    /// Check whether the child has exited, without doing any I/O
    ///
    /// Returns the new state if the child left `Running` during this call.
    pub fn poll_child(&mut self) -> Result<Option<ChildState>, SpawnError> {
        Ok(self.reap()?.map(|code| self.finish(code)))
    }

    /// Stop the running child and tear the session down
    ///
    /// Sends SIGHUP, waits out the configured grace period, then SIGKILL.
    /// Returns once the child has been reaped and the device released.
    pub fn terminate(&mut self) -> Result<ChildState, SpawnError> {
        let Some(pid) = self.child.pid.filter(|_| self.child.is_running()) else {
            return Ok(self.child.state.clone());
        };

        info!(pid = pid.as_raw(), "Terminating child");
        match kill(pid, Signal::SIGHUP) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(SpawnError::Signal(e)),
        }

        let deadline = Instant::now() + self.config.terminate_grace();
        loop {
            if let Some(code) = self.reap()? {
                return Ok(self.finish(code));
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(REAP_INTERVAL);
        }

        debug!(pid = pid.as_raw(), "Grace period over, sending SIGKILL");
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(SpawnError::Signal(e)),
        }
        let code = reap_blocking(pid)?;
        Ok(self.finish(code))
    }

    /// Resize the terminal and notify the child
    pub fn resize(&mut self, size: WindowSize) -> Result<(), SpawnError> {
        self.device.set_window_size(size)?;
        if let Some(pid) = self.child.pid.filter(|_| self.child.is_running()) {
            kill(pid, Signal::SIGWINCH).map_err(SpawnError::Signal)?;
        }
        Ok(())
    }

    /// Close the device, stopping the child first if one is running
    ///
    /// Returns whether the device was open.
    pub fn release_device(&mut self) -> Result<bool, SpawnError> {
        if self.child.is_running() {
            self.terminate()?;
        }
        Ok(self.teardown())
    }

    /// Oldest undelivered lifecycle event
    pub fn next_event(&mut self) -> Option<LifecycleEvent> {
        self.events.pop_front()
    }

    /// All undelivered lifecycle events, oldest first
    pub fn drain_events(&mut self) -> Vec<LifecycleEvent> {
        self.events.drain(..).collect()
    }

    /// Non-blocking wait; the exit code if the running child is gone
    fn reap(&mut self) -> Result<Option<i32>, SpawnError> {
        let Some(pid) = self.child.pid.filter(|_| self.child.is_running()) else {
            return Ok(None);
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(status) => Ok(exit_code(status)),
            Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(SpawnError::Wait(e)),
        }
    }

    /// Record the exit and tear the session down
    fn finish(&mut self, code: i32) -> ChildState {
        info!(pid = ?self.child.pid.map(Pid::as_raw), code, "Child exited");
        self.child.state = ChildState::Exited(code);
        self.events.push_back(LifecycleEvent::Exited { code });
        self.teardown();
        self.child.state.clone()
    }

    /// SIGKILL and a blocking wait, for when [`terminate`](Self::terminate)
    /// failed
    ///
    /// A child that is no longer ours to wait for counts as gone. Returns
    /// whether the child has left `Running`.
    fn force_stop(&mut self) -> bool {
        let Some(pid) = self.child.pid.filter(|_| self.child.is_running()) else {
            return true;
        };
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                error!(pid = pid.as_raw(), "Cannot kill child: {}", e);
                return false;
            }
        }
        match reap_blocking(pid) {
            Ok(code) => {
                self.finish(code);
            }
            Err(SpawnError::Wait(Errno::ECHILD)) => {
                warn!(pid = pid.as_raw(), "Child was reaped elsewhere");
                self.child.state = ChildState::Failed("child reaped elsewhere".to_string());
                self.events.push_back(LifecycleEvent::Failed {
                    reason: "child reaped elsewhere".to_string(),
                });
            }
            Err(e) => {
                error!(pid = pid.as_raw(), "Cannot reap child: {}", e);
                return false;
            }
        }
        !self.child.is_running()
    }

    /// Stop the child if needed, then tear down
    ///
    /// The device is left alone while the child may still be running.
    /// Returns whether teardown happened.
    fn shutdown(&mut self) -> bool {
        if self.child.is_running() {
            if let Err(e) = self.terminate() {
                warn!("Failed to terminate child: {}", e);
                if !self.force_stop() {
                    error!("Child still running, keeping its session and device");
                    return false;
                }
            }
        }
        self.teardown();
        true
    }

    /// Logout first, then stop watching and close the descriptors
    fn teardown(&mut self) -> bool {
        if let Some(line) = self.login_line.take() {
            self.binder.record_logout(&line);
        }
        self.mux.unregister(Side::Slave);
        self.mux.unregister(Side::Master);
        self.device.release()
    }
}

impl<B: PtyBackend> Drop for ChildProcessHost<B> {
    fn drop(&mut self) {
        if !self.shutdown() {
            // Closing the descriptors would pull the terminal out from under
            // a live session
            self.device.leak();
        }
    }
}

impl<B: PtyBackend> fmt::Debug for ChildProcessHost<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcessHost")
            .field("device", &self.device)
            .field("child", &self.child)
            .field("login_line", &self.login_line)
            .finish_non_exhaustive()
    }
}
