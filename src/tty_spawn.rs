use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::os::unix::prelude::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::errno::Errno;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
use nix::libc::login_tty;
use nix::libc::{O_NONBLOCK, TIOCGWINSZ, TIOCSWINSZ, VEOF};
use nix::pty::{openpty, Winsize};
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};
use nix::sys::time::TimeVal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvpe, fork, read, tcgetpgrp, write, ForkResult, Pid};
use signal_hook::consts::SIGWINCH;
use tracing::{debug, warn};

use crate::bell::{BellChannel, BellDetector};
use crate::errors::{HubError, Result};
use crate::input::{ControlPipeReader, PtyInput};
use crate::protocol::{ControlCommand, SessionStatus};
use crate::recorder::Recorder;
use crate::store::{SessionPaths, SessionStore};

pub const DEFAULT_TERM: &str = "xterm-256color";

// Define TIOCSCTTY for platforms where it's not exposed by libc
#[cfg(target_os = "linux")]
const TIOCSCTTY: u64 = 0x540E;

/// Where a resize came from, for the last-resize-wins rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeSource {
    Browser,
    Terminal,
}

/// Tiny state machine implementing "last resize wins with a grace window":
/// a terminal resize is suppressed while a browser resize is fresher than
/// the grace period.
#[derive(Debug)]
pub struct ResizeArbiter {
    grace: Duration,
    last: Mutex<Option<(ResizeSource, Instant)>>,
}

impl ResizeArbiter {
    pub fn new() -> Self {
        Self::with_grace(Duration::from_millis(1000))
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            grace,
            last: Mutex::new(None),
        }
    }

    pub fn record(&self, source: ResizeSource) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some((source, Instant::now()));
    }

    pub fn terminal_resize_allowed(&self) -> bool {
        let last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            None | Some((ResizeSource::Terminal, _)) => true,
            Some((ResizeSource::Browser, at)) => at.elapsed() >= self.grace,
        }
    }
}

impl Default for ResizeArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cross-platform implementation of `login_tty`
/// On systems with `login_tty`, use it directly. Otherwise, implement manually.
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
unsafe fn login_tty_compat(fd: i32) -> io::Result<()> {
    if login_tty(fd) == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
unsafe fn login_tty_compat(fd: i32) -> io::Result<()> {
    if libc::setsid() == -1 {
        return Err(io::Error::last_os_error());
    }

    #[cfg(target_os = "linux")]
    {
        if libc::ioctl(fd, TIOCSCTTY as libc::c_ulong, 0) == -1
            && libc::ioctl(fd, TIOCSCTTY as libc::c_ulong, 1) == -1
        {
            return Err(io::Error::last_os_error());
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        if libc::ioctl(fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1
            && libc::ioctl(fd, libc::TIOCSCTTY as libc::c_ulong, 1) == -1
        {
            return Err(io::Error::last_os_error());
        }
    }

    if libc::dup2(fd, 0) == -1 || libc::dup2(fd, 1) == -1 || libc::dup2(fd, 2) == -1 {
        return Err(io::Error::last_os_error());
    }
    if fd > 2 {
        libc::close(fd);
    }
    Ok(())
}

/// The environment handed to the child: `TERM` plus passthrough of the
/// variables a shell needs to behave like the user's own.
pub fn create_env_vars(term: &str) -> HashMap<String, String> {
    let mut env_vars = HashMap::new();
    env_vars.insert("TERM".to_string(), term.to_string());
    for var in ["SHELL", "LANG", "LC_ALL", "PATH", "USER", "HOME"] {
        if let Ok(value) = std::env::var(var) {
            env_vars.insert(var.to_string(), value);
        }
    }
    env_vars
}

/// Everything needed to spawn one session under a PTY.
pub struct SpawnConfig {
    pub session_id: String,
    /// Resolved argv, as recorded in `session.json`.
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    pub paths: SessionPaths,
    /// Forward mode: bind the session to the current TTY and mirror output
    /// to stdout.
    pub attach_tty: bool,
}

/// Handle to a live PTY session owned by this process.
pub struct SessionProcess {
    pub pid: u32,
    pub master: Arc<OwnedFd>,
    pub recorder: Arc<Mutex<Recorder>>,
    pub input: Arc<PtyInput>,
    pub arbiter: Arc<ResizeArbiter>,
    pub exited: Arc<AtomicBool>,
    pub exited_at: Arc<Mutex<Option<Instant>>>,
    join: Option<JoinHandle<i32>>,
}

impl SessionProcess {
    /// Blocks until the communication loop finishes; returns the exit code.
    pub fn wait(mut self) -> i32 {
        self.join
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or(1)
    }
}

fn dup_fd(fd: BorrowedFd) -> io::Result<OwnedFd> {
    let duped = unsafe { libc::dup(fd.as_raw_fd()) };
    if duped < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(duped) })
}

/// Spawns `config.argv` under a fresh PTY and starts the communication loop
/// on its own thread. The recorder is opened before the fork so the header
/// always precedes any output.
pub fn spawn_session(
    config: SpawnConfig,
    store: SessionStore,
    bells: Option<Arc<BellChannel>>,
    on_exit: Option<Box<dyn FnOnce(i32) + Send>>,
) -> Result<SessionProcess> {
    if !config.cwd.is_dir() {
        return Err(HubError::InvalidWorkingDir {
            path: config.cwd.clone(),
        });
    }
    if let Some(err) = crate::resolver::executable_error(&config.argv) {
        return Err(HubError::spawn_failed_from_io(&config.argv[0], &err));
    }

    // Attached mode sizes from the controlling terminal; otherwise from the
    // requested dimensions.
    let term_attrs = if config.attach_tty {
        tcgetattr(io::stdin()).ok()
    } else {
        None
    };
    let winsize = if config.attach_tty {
        get_winsize(io::stdin().as_fd()).unwrap_or(Winsize {
            ws_row: config.rows,
            ws_col: config.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        })
    } else {
        Winsize {
            ws_row: config.rows,
            ws_col: config.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    };

    let pty = openpty(Some(&winsize), term_attrs.as_ref()).map_err(|err| HubError::SpawnFailed {
        reason: format!("pty allocation failed: {err}"),
    })?;

    let recorder = Recorder::create(
        &config.paths.stdout,
        winsize.ws_col,
        winsize.ws_row,
        Some(config.argv.join(" ")),
        None,
        Some(create_env_vars(&config.term)),
    )
    .map_err(|err| HubError::SpawnFailed {
        reason: format!("failed to open recording: {err}"),
    })?;
    let recorder = Arc::new(Mutex::new(recorder));

    let stdin_file = open_stdin_fifo(&config.paths);

    // everything the child needs is prepared before the fork; nothing may
    // allocate between fork and exec
    let args: Vec<CString> = config
        .argv
        .iter()
        .filter_map(|arg| CString::new(arg.as_bytes()).ok())
        .collect();
    if args.is_empty() {
        return Err(HubError::SpawnFailed {
            reason: "command line contains interior NUL bytes".to_string(),
        });
    }
    let env: Vec<CString> = create_env_vars(&config.term)
        .iter()
        .filter_map(|(key, value)| CString::new(format!("{key}={value}")).ok())
        .collect();
    let cwd = CString::new(config.cwd.to_string_lossy().as_bytes().to_vec()).map_err(|_| {
        HubError::InvalidWorkingDir {
            path: config.cwd.clone(),
        }
    })?;

    let child = match unsafe { fork() }.map_err(|err| HubError::SpawnFailed {
        reason: format!("fork failed: {err}"),
    })? {
        ForkResult::Parent { child } => child,
        ForkResult::Child => {
            // In the child: become the session leader on the PTY slave,
            // then exec. Any failure here must not unwind into the parent's
            // state, so errors end in process::exit.
            drop(pty.master);
            if unsafe { login_tty_compat(pty.slave.into_raw_fd()) }.is_err() {
                std::process::exit(1);
            }
            if unsafe { libc::chdir(cwd.as_ptr()) } != 0 {
                std::process::exit(1);
            }
            match execvpe(&args[0], &args, &env) {
                Ok(_) | Err(_) => std::process::exit(127),
            }
        }
    };
    drop(pty.slave);

    let pid = child.as_raw() as u32;
    if let Err(err) = store.update_status(&config.session_id, SessionStatus::Running, Some(pid), None)
    {
        warn!(session_id = %config.session_id, %err, "failed to record running status");
    }

    let master_dup = Arc::new(
        dup_fd(pty.master.as_fd()).map_err(|err| HubError::SpawnFailed {
            reason: format!("dup failed: {err}"),
        })?,
    );
    let input = Arc::new(PtyInput::new(Arc::clone(&master_dup), Arc::clone(&recorder)));
    let arbiter = Arc::new(ResizeArbiter::new());
    let exited = Arc::new(AtomicBool::new(false));
    let exited_at = Arc::new(Mutex::new(None));

    let ctx = LoopContext {
        master: pty.master,
        child,
        session_id: config.session_id.clone(),
        store,
        paths: config.paths,
        recorder: Arc::clone(&recorder),
        input: Arc::clone(&input),
        stdin_file,
        attach_tty: config.attach_tty,
        term_attrs,
        arbiter: Arc::clone(&arbiter),
        bells,
        original_size: (winsize.ws_col, winsize.ws_row),
        exited: Arc::clone(&exited),
        exited_at: Arc::clone(&exited_at),
        on_exit,
    };

    let join = std::thread::Builder::new()
        .name(format!("session-{}", config.session_id))
        .spawn(move || communication_loop(ctx))
        .map_err(|err| HubError::SpawnFailed {
            reason: format!("failed to start session thread: {err}"),
        })?;

    Ok(SessionProcess {
        pid,
        master: master_dup,
        recorder,
        input,
        arbiter,
        exited,
        exited_at,
        join: Some(join),
    })
}

/// Opens the stdin FIFO read+write so polling primitives never report ready
/// while no writer exists.
fn open_stdin_fifo(paths: &SessionPaths) -> Option<File> {
    File::options()
        .read(true)
        .write(true)
        .custom_flags(O_NONBLOCK)
        .open(&paths.stdin)
        .ok()
}

struct LoopContext {
    master: OwnedFd,
    child: Pid,
    session_id: String,
    store: SessionStore,
    paths: SessionPaths,
    recorder: Arc<Mutex<Recorder>>,
    input: Arc<PtyInput>,
    stdin_file: Option<File>,
    attach_tty: bool,
    term_attrs: Option<Termios>,
    arbiter: Arc<ResizeArbiter>,
    bells: Option<Arc<BellChannel>>,
    original_size: (u16, u16),
    exited: Arc<AtomicBool>,
    exited_at: Arc<Mutex<Option<Instant>>>,
    on_exit: Option<Box<dyn FnOnce(i32) + Send>>,
}

fn communication_loop(mut ctx: LoopContext) -> i32 {
    // Raw mode while attached; restored on drop. There is no hard guarantee
    // Drop runs on every exit path, so a stray raw terminal remains possible.
    let _restore_term = ctx.attach_tty.then(|| {
        ctx.term_attrs.as_ref().map(|attrs| {
            let mut raw = attrs.clone();
            cfmakeraw(&mut raw);
            raw.local_flags.remove(LocalFlags::ECHO);
            tcsetattr(io::stdin(), SetArg::TCSAFLUSH, &raw).ok();
            RestoreTerm(attrs.clone())
        })
    });

    let got_winch = Arc::new(AtomicBool::new(false));
    if ctx.attach_tty {
        signal_hook::flag::register(SIGWINCH, Arc::clone(&got_winch)).ok();
    }

    let mut buf = [0; 4096];
    let mut control = ControlPipeReader::new();
    let mut bell_detector = BellDetector::new();
    let mut read_stdin = ctx.attach_tty;
    let mut done = false;
    let stdin = io::stdin();

    while !done {
        if got_winch.swap(false, Ordering::Relaxed) && ctx.arbiter.terminal_resize_allowed() {
            if let Some(size) = get_winsize(stdin.as_fd()) {
                apply_resize(ctx.master.as_fd(), size.ws_col, size.ws_row, &ctx.recorder);
                ctx.arbiter.record(ResizeSource::Terminal);
            }
        }

        for command in control.poll(&ctx.paths.control) {
            handle_control_command(&ctx, command);
        }

        let mut read_fds = FdSet::new();
        let mut timeout = TimeVal::new(0, 100_000); // 100ms timeout
        read_fds.insert(ctx.master.as_fd());
        if read_stdin {
            read_fds.insert(stdin.as_fd());
        }
        if let Some(ref f) = ctx.stdin_file {
            read_fds.insert(f.as_fd());
        }
        match select(None, Some(&mut read_fds), None, None, Some(&mut timeout)) {
            Ok(0) => continue,
            Err(Errno::EINTR | Errno::EAGAIN) => continue,
            Ok(_) => {}
            Err(err) => {
                warn!(session_id = %ctx.session_id, %err, "select failed");
                break;
            }
        }

        if read_stdin && read_fds.contains(stdin.as_fd()) {
            match read(&stdin, &mut buf) {
                Ok(0) => {
                    send_eof_sequence(ctx.master.as_fd());
                    read_stdin = false;
                }
                Ok(n) => {
                    if write_all(ctx.master.as_fd(), &buf[..n]).is_err() {
                        done = true;
                    }
                }
                Err(Errno::EINTR | Errno::EAGAIN) => {}
                // on linux a closed tty raises EIO
                Err(Errno::EIO) => {
                    done = true;
                }
                Err(err) => {
                    warn!(session_id = %ctx.session_id, %err, "stdin read failed");
                    done = true;
                }
            }
        }

        if let Some(ref f) = ctx.stdin_file {
            if read_fds.contains(f.as_fd()) {
                // read() so EAGAIN/EINTR can be handled explicitly
                match read(f, &mut buf) {
                    Ok(0) | Err(Errno::EAGAIN | Errno::EINTR) => {}
                    Ok(n) => {
                        let _ = ctx.input.send(&buf[..n]);
                    }
                    Err(err) => {
                        warn!(session_id = %ctx.session_id, %err, "stdin fifo read failed");
                    }
                }
            }
        }

        if read_fds.contains(ctx.master.as_fd()) {
            match read(&ctx.master, &mut buf) {
                // on linux a closed tty raises EIO
                Ok(0) | Err(Errno::EIO) => {
                    done = true;
                }
                Ok(n) => {
                    let chunk = &buf[..n];
                    let bell_count = bell_detector.scan(chunk);
                    if let Ok(mut recorder) = ctx.recorder.lock() {
                        let _ = recorder.write_output(chunk);
                    }
                    if ctx.attach_tty {
                        let _ = write_all(io::stdout().as_fd(), chunk);
                    }
                    if bell_count > 0 {
                        emit_bell(&ctx, bell_count);
                    }
                }
                Err(Errno::EAGAIN | Errno::EINTR) => {}
                Err(err) => {
                    warn!(session_id = %ctx.session_id, %err, "pty read failed");
                    done = true;
                }
            }
        }
    }

    let exit_code = match waitpid(ctx.child, None) {
        Ok(WaitStatus::Exited(_, status)) => status,
        Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
        _ => 1,
    };

    finalize_session(&mut ctx, exit_code);
    exit_code
}

fn handle_control_command(ctx: &LoopContext, command: ControlCommand) {
    match command {
        ControlCommand::Resize { cols, rows } => {
            apply_resize(ctx.master.as_fd(), cols, rows, &ctx.recorder);
            ctx.arbiter.record(ResizeSource::Browser);
        }
        ControlCommand::Kill { signal } => {
            let number = signal.map_or(libc::SIGTERM, |s| s.as_signal_number());
            let signal = Signal::try_from(number).unwrap_or(Signal::SIGTERM);
            let _ = kill(ctx.child, signal);
        }
        ControlCommand::ResetSize => {
            let (cols, rows) = if ctx.attach_tty {
                get_winsize(io::stdin().as_fd())
                    .map_or(ctx.original_size, |s| (s.ws_col, s.ws_row))
            } else {
                ctx.original_size
            };
            apply_resize(ctx.master.as_fd(), cols, rows, &ctx.recorder);
            ctx.arbiter.record(ResizeSource::Terminal);
        }
    }
}

fn emit_bell(ctx: &LoopContext, bell_count: usize) {
    let Some(bells) = ctx.bells.as_ref() else {
        return;
    };
    if let Some(info) = ctx.store.load_info(&ctx.session_id) {
        let exited_at = *ctx.exited_at.lock().unwrap_or_else(|e| e.into_inner());
        bells.emit(&ctx.session_id, &info, bell_count, exited_at);
    }
}

fn finalize_session(ctx: &mut LoopContext, exit_code: i32) {
    if let Ok(mut recorder) = ctx.recorder.lock() {
        let trailer = serde_json::json!(["exit", exit_code, ctx.session_id]);
        let _ = recorder.write_raw_json(&trailer);
        recorder.close();
    }
    if let Err(err) =
        ctx.store
            .update_status(&ctx.session_id, SessionStatus::Exited, None, Some(exit_code))
    {
        warn!(session_id = %ctx.session_id, %err, "failed to record exit status");
    }
    ctx.exited.store(true, Ordering::SeqCst);
    *ctx.exited_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    debug!(session_id = %ctx.session_id, exit_code, "session exited");
    if let Some(on_exit) = ctx.on_exit.take() {
        on_exit(exit_code);
    }
}

/// Applies a resize to the PTY, wakes the foreground process group, and
/// records the resize event.
pub fn apply_resize(master: BorrowedFd, cols: u16, rows: u16, recorder: &Arc<Mutex<Recorder>>) {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    if set_winsize(master, winsize).is_err() {
        return;
    }
    if let Ok(pgrp) = tcgetpgrp(master) {
        killpg(pgrp, Signal::SIGWINCH).ok();
    }
    if let Ok(mut recorder) = recorder.lock() {
        let _ = recorder.write_resize(cols, rows);
    }
}

/// If possible, returns the terminal size of the given fd.
pub fn get_winsize(fd: BorrowedFd) -> Option<Winsize> {
    nix::ioctl_read_bad!(_get_window_size, TIOCGWINSZ, Winsize);
    let mut size: Winsize = unsafe { std::mem::zeroed() };
    unsafe { _get_window_size(fd.as_raw_fd(), &mut size).ok()? };
    Some(size)
}

/// Sets the winsize
pub fn set_winsize(fd: BorrowedFd, winsize: Winsize) -> std::result::Result<(), Errno> {
    nix::ioctl_write_ptr_bad!(_set_window_size, TIOCSWINSZ, Winsize);
    unsafe { _set_window_size(fd.as_raw_fd(), &winsize) }?;
    Ok(())
}

/// Sends an EOF signal to the terminal if it's in canonical mode.
fn send_eof_sequence(fd: BorrowedFd) {
    if let Ok(attrs) = tcgetattr(fd) {
        if attrs.local_flags.contains(LocalFlags::ICANON) {
            write(fd, &[attrs.control_chars[VEOF]]).ok();
        }
    }
}

/// Calls write in a loop until it's done.
fn write_all(fd: BorrowedFd, mut buf: &[u8]) -> std::result::Result<(), Errno> {
    while !buf.is_empty() {
        match write(fd, buf) {
            Ok(n) => buf = &buf[n..],
            Err(Errno::EINTR | Errno::EAGAIN) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

struct RestoreTerm(Termios);

impl Drop for RestoreTerm {
    fn drop(&mut self) {
        tcsetattr(io::stdin(), SetArg::TCSAFLUSH, &self.0).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resize_arbiter_last_wins_with_grace() {
        let arbiter = ResizeArbiter::with_grace(Duration::from_millis(100));
        // no resizes yet: terminal may apply
        assert!(arbiter.terminal_resize_allowed());

        arbiter.record(ResizeSource::Browser);
        // browser resize is fresh: terminal suppressed
        assert!(!arbiter.terminal_resize_allowed());

        std::thread::sleep(Duration::from_millis(150));
        // grace window passed
        assert!(arbiter.terminal_resize_allowed());

        arbiter.record(ResizeSource::Terminal);
        // terminal-sourced resizes never block the terminal
        assert!(arbiter.terminal_resize_allowed());
    }

    #[test]
    fn test_create_env_vars_carries_term() {
        let env = create_env_vars("xterm-256color");
        assert_eq!(env.get("TERM").map(String::as_str), Some("xterm-256color"));
        // PATH passthrough (always set in test environments)
        assert!(env.contains_key("PATH"));
        // nothing beyond the allow list plus TERM
        for key in env.keys() {
            assert!(
                ["TERM", "SHELL", "LANG", "LC_ALL", "PATH", "USER", "HOME"]
                    .contains(&key.as_str()),
                "unexpected env var {key}"
            );
        }
    }
}
