use std::collections::HashMap;
use std::os::fd::{AsFd, OwnedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bell::BellChannel;
use crate::errors::{HubError, Result};
use crate::input::{append_control, InputClientCache, InputServer, PtyInput};
use crate::protocol::{
    special_key_sequence, ControlCommand, SessionStatus, SignalSpec, DEFAULT_COLS, DEFAULT_ROWS,
};
use crate::recorder::Recorder;
use crate::resolver::resolve_command;
use crate::store::{SessionEntry, SessionStore};
use crate::tty_spawn::{
    apply_resize, spawn_session, ResizeArbiter, ResizeSource, SessionProcess, SpawnConfig,
    DEFAULT_TERM,
};

/// How long a graceful kill polls before escalating to SIGKILL.
const KILL_GRACE: Duration = Duration::from_millis(3000);
const KILL_POLL: Duration = Duration::from_millis(500);
const SIGKILL_WAIT: Duration = Duration::from_millis(100);
/// Grace after posting a kill on the control pipe before signalling directly.
const EXTERNAL_KILL_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub session_id: Option<String>,
    pub name: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub term: Option<String>,
}

#[derive(Debug, Clone)]
pub enum InputPayload {
    Text(String),
    Key(String),
}

impl InputPayload {
    pub fn from_parts(text: Option<String>, key: Option<String>) -> Result<Self> {
        match (text, key) {
            (_, Some(key)) => Ok(Self::Key(key)),
            (Some(text), None) if !text.is_empty() => Ok(Self::Text(text)),
            _ => Err(HubError::InvalidInput {
                reason: "request carries neither text nor key".to_string(),
            }),
        }
    }

    fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Self::Text(text) => Ok(text.into_bytes()),
            Self::Key(key) => special_key_sequence(&key)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| HubError::InvalidInput {
                    reason: format!("unknown key: {key}"),
                }),
        }
    }
}

/// In-memory view of a session this process spawned. Sessions not in this
/// map are external: owned by another process, coordinated purely through
/// their session directory.
struct LiveSession {
    pid: u32,
    master: Arc<OwnedFd>,
    input: Arc<PtyInput>,
    recorder: Arc<Mutex<Recorder>>,
    arbiter: Arc<ResizeArbiter>,
    exited: Arc<AtomicBool>,
    input_server: Option<InputServer>,
}

/// The PTY supervisor: spawns sessions, routes input, arbitrates resizes
/// and walks the SIGTERM→SIGKILL escalation. Holds only weak ties to
/// sessions (id + handles); the session store owns the durable record.
pub struct PtySupervisor {
    store: SessionStore,
    sessions: Arc<Mutex<HashMap<String, LiveSession>>>,
    clients: InputClientCache,
    bells: Option<Arc<BellChannel>>,
}

impl PtySupervisor {
    pub fn new(store: SessionStore, bells: Option<Arc<BellChannel>>) -> Self {
        Self {
            store,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            clients: InputClientCache::new(),
            bells,
        }
    }

    pub const fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn is_live(&self, session_id: &str) -> bool {
        self.lock_sessions().contains_key(session_id)
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, LiveSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns a new session and returns its id and recorded info.
    pub fn create(
        &self,
        argv: &[String],
        options: CreateOptions,
    ) -> Result<(String, crate::protocol::SessionInfo)> {
        let (session_id, info, _process) = self.create_session(argv, options, false)?;
        Ok((session_id, info))
    }

    /// Forward mode: spawn attached to the current TTY and block until the
    /// child exits, returning its exit code.
    pub fn spawn_forward(&self, argv: &[String], options: CreateOptions) -> Result<i32> {
        let (session_id, _, process) = self.create_session(argv, options, true)?;
        let exit_code = process.wait();
        debug!(session_id, exit_code, "forwarded session finished");
        Ok(exit_code)
    }

    fn create_session(
        &self,
        argv: &[String],
        options: CreateOptions,
        attach_tty: bool,
    ) -> Result<(String, crate::protocol::SessionInfo, SessionProcess)> {
        if argv.is_empty() {
            return Err(HubError::InvalidInput {
                reason: "command cannot be empty".to_string(),
            });
        }

        let working_dir = options
            .working_dir
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("/"));
        if !working_dir.is_dir() {
            return Err(HubError::InvalidWorkingDir { path: working_dir });
        }

        let session_id = options
            .session_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let resolved = resolve_command(argv);
        debug!(
            session_id,
            kind = ?resolved.kind,
            original = ?argv,
            resolved = ?resolved.argv,
            "resolved command"
        );

        let name = options.name.unwrap_or_else(|| {
            argv[0]
                .rsplit('/')
                .next()
                .unwrap_or("unknown")
                .to_string()
        });
        let cols = options.cols.unwrap_or(DEFAULT_COLS);
        let rows = options.rows.unwrap_or(DEFAULT_ROWS);
        let term = options.term.unwrap_or_else(|| DEFAULT_TERM.to_string());

        let paths = self.store.create_directory(&session_id)?;
        let info = crate::protocol::SessionInfo {
            command: resolved.argv.clone(),
            name,
            working_dir: working_dir.to_string_lossy().to_string(),
            status: SessionStatus::Starting,
            pid: None,
            exit_code: None,
            started_at: Some(jiff::Timestamp::now()),
            term: term.clone(),
            cols: Some(cols),
            rows: Some(rows),
        };
        if let Err(err) = self.store.save_info(&session_id, &info) {
            let _ = self.store.cleanup(&session_id);
            return Err(err);
        }

        let sessions = Arc::clone(&self.sessions);
        let exit_session_id = session_id.clone();
        let on_exit: Box<dyn FnOnce(i32) + Send> = Box::new(move |exit_code| {
            let mut map = sessions.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(live) = map.remove(&exit_session_id) {
                if let Some(server) = live.input_server {
                    server.shutdown();
                }
            }
            debug!(session_id = exit_session_id, exit_code, "session reaped");
        });

        let config = SpawnConfig {
            session_id: session_id.clone(),
            argv: resolved.argv,
            cwd: working_dir,
            term,
            cols,
            rows,
            paths: paths.clone(),
            attach_tty,
        };
        let process = match spawn_session(
            config,
            self.store.clone(),
            self.bells.clone(),
            Some(on_exit),
        ) {
            Ok(process) => process,
            Err(err) => {
                let _ = self.store.cleanup(&session_id);
                return Err(err);
            }
        };

        let input_server = InputServer::start(&paths.input_sock, Arc::clone(&process.input));
        let live = LiveSession {
            pid: process.pid,
            master: Arc::clone(&process.master),
            input: Arc::clone(&process.input),
            recorder: Arc::clone(&process.recorder),
            arbiter: Arc::clone(&process.arbiter),
            exited: Arc::clone(&process.exited),
            input_server,
        };
        self.lock_sessions().insert(session_id.clone(), live);
        // a very short-lived command can exit before registration; its
        // on_exit ran against an empty map, so drop the entry ourselves
        if process.exited.load(Ordering::SeqCst) {
            if let Some(live) = self.lock_sessions().remove(&session_id) {
                if let Some(server) = live.input_server {
                    server.shutdown();
                }
            }
        }

        let mut info = info;
        info.status = SessionStatus::Running;
        info.pid = Some(process.pid);
        info!(session_id, pid = process.pid, "session started");
        Ok((session_id, info, process))
    }

    /// Delivers input to the session. In-memory sessions get a direct PTY
    /// write; external sessions go through their input socket (FIFO
    /// fallback), with the connection cached per session.
    pub fn send_input(&self, session_id: &str, payload: InputPayload) -> Result<()> {
        let bytes = payload.into_bytes()?;
        if let Some(live) = self.lock_sessions().get(session_id) {
            return live
                .input
                .send(&bytes)
                .map_err(|_| HubError::NoSocketConnection {
                    session_id: session_id.to_string(),
                });
        }

        if self.store.load_info(session_id).is_none() {
            return Err(HubError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        let paths = self.store.paths(session_id);
        self.clients.send(session_id, &paths, &bytes)
    }

    /// A browser-initiated resize. Wins over terminal resizes for the grace
    /// window.
    pub fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(HubError::InvalidInput {
                reason: "cols and rows must be greater than zero".to_string(),
            });
        }
        {
            let sessions = self.lock_sessions();
            if let Some(live) = sessions.get(session_id) {
                apply_resize(live.master.as_fd(), cols, rows, &live.recorder);
                live.arbiter.record(ResizeSource::Browser);
                drop(sessions);
                self.persist_dimensions(session_id, cols, rows);
                return Ok(());
            }
        }

        if self.store.load_info(session_id).is_none() {
            return Err(HubError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        let paths = self.store.paths(session_id);
        append_control(&paths, &ControlCommand::Resize { cols, rows })?;
        self.persist_dimensions(session_id, cols, rows);
        Ok(())
    }

    fn persist_dimensions(&self, session_id: &str, cols: u16, rows: u16) {
        if let Some(mut info) = self.store.load_info(session_id) {
            info.cols = Some(cols);
            info.rows = Some(rows);
            if let Err(err) = self.store.save_info(session_id, &info) {
                warn!(session_id, %err, "failed to persist dimensions");
            }
        }
    }

    /// Asks an externally-owned session to resize back to its own TTY size.
    pub fn reset_size(&self, session_id: &str) -> Result<()> {
        if self.is_live(session_id) {
            return Err(HubError::InvalidInput {
                reason: "reset-size only applies to external sessions".to_string(),
            });
        }
        if self.store.load_info(session_id).is_none() {
            return Err(HubError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        let paths = self.store.paths(session_id);
        append_control(&paths, &ControlCommand::ResetSize)
    }

    /// The host terminal resized. Forwarded to each live session unless a
    /// browser resize is fresher than the grace window.
    pub fn terminal_resize(&self, cols: u16, rows: u16) {
        for (session_id, live) in self.lock_sessions().iter() {
            if live.arbiter.terminal_resize_allowed() {
                apply_resize(live.master.as_fd(), cols, rows, &live.recorder);
                live.arbiter.record(ResizeSource::Terminal);
                debug!(session_id, cols, rows, "applied terminal resize");
            } else {
                debug!(session_id, "terminal resize suppressed by recent browser resize");
            }
        }
    }

    /// Terminates a session; resolves only once the process is gone.
    pub fn kill(&self, session_id: &str, signal: Signal) -> Result<()> {
        let live_pid = self.lock_sessions().get(session_id).map(|live| live.pid);
        if let Some(pid) = live_pid {
            escalate_kill(session_id, pid, signal)?;
            self.clients.drop_connection(session_id);
            return Ok(());
        }

        // External session: ask the owner first, then signal directly.
        let Some(info) = self.store.load_info(session_id) else {
            return Err(HubError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        };
        let Some(pid) = info.pid else {
            // nothing to signal; make the record consistent
            let _ = self
                .store
                .update_status(session_id, SessionStatus::Exited, None, Some(1));
            return Ok(());
        };

        let paths = self.store.paths(session_id);
        let spec = SignalSpec::Number(signal as i32);
        if append_control(&paths, &ControlCommand::Kill { signal: Some(spec) }).is_ok() {
            std::thread::sleep(EXTERNAL_KILL_GRACE);
        }
        if crate::utils::is_pid_alive(pid) {
            escalate_kill(session_id, pid, signal)?;
            // the owner normally records the exit; cover for a dead owner
            let still_running = self
                .store
                .load_info(session_id)
                .is_some_and(|info| info.status == SessionStatus::Running);
            if still_running {
                let exit_code = 128 + signal as i32;
                let _ = self
                    .store
                    .update_status(session_id, SessionStatus::Exited, None, Some(exit_code));
            }
        }
        self.clients.drop_connection(session_id);
        Ok(())
    }

    /// Zombie-sweeping list; drops cached input connections of sessions
    /// discovered exited and prunes any stale in-memory entries.
    pub fn list(&self) -> Result<Vec<SessionEntry>> {
        let entries = self.store.list()?;
        for entry in &entries {
            if entry.info.status == SessionStatus::Exited {
                self.clients.drop_connection(&entry.id);
            }
        }
        self.lock_sessions()
            .retain(|_, live| !live.exited.load(Ordering::SeqCst));
        Ok(entries)
    }

    pub fn get(&self, session_id: &str) -> Result<SessionEntry> {
        self.store
            .get(session_id)
            .ok_or_else(|| HubError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Fire-and-forget kill if live, then remove the directory.
    pub fn cleanup(&self, session_id: &str) -> Result<()> {
        let removed = self.lock_sessions().remove(session_id);
        if let Some(live) = removed {
            if !live.exited.load(Ordering::SeqCst) {
                let _ = send_signal_pair(live.pid, Signal::SIGKILL);
            }
            if let Some(server) = live.input_server {
                server.shutdown();
            }
        }
        self.store.cleanup(session_id)?;
        self.clients.drop_connection(session_id);
        Ok(())
    }

    pub fn cleanup_exited(&self) -> Result<Vec<String>> {
        let removed = self.store.cleanup_exited()?;
        for session_id in &removed {
            self.clients.drop_connection(session_id);
        }
        Ok(removed)
    }

    /// Shutdown hook: kill every live session and release its resources.
    pub fn kill_all(&self) {
        let ids: Vec<String> = self.lock_sessions().keys().cloned().collect();
        let handles: Vec<_> = ids
            .into_iter()
            .map(|session_id| {
                let pid = self.lock_sessions().get(&session_id).map(|l| l.pid);
                std::thread::spawn(move || {
                    if let Some(pid) = pid {
                        let _ = escalate_kill(&session_id, pid, Signal::SIGTERM);
                    }
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Signals the process and, on POSIX, its process group so descendants die
/// together. "Already gone" is success.
fn send_signal_pair(pid: u32, signal: Signal) -> Result<(), Errno> {
    let target = Pid::from_raw(pid as i32);
    match kill(target, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => return Err(err),
    }
    match killpg(target, signal) {
        Ok(()) | Err(Errno::ESRCH | Errno::EPERM) => Ok(()),
        Err(err) => Err(err),
    }
}

/// SIGTERM, poll every 500 ms for up to 3 s, then SIGKILL and a final
/// 100 ms wait. SIGKILL requests skip straight to the short path.
fn escalate_kill(session_id: &str, pid: u32, signal: Signal) -> Result<()> {
    let to_kill_failed = |err: Errno| HubError::KillFailed {
        session_id: session_id.to_string(),
        reason: err.to_string(),
    };

    if signal == Signal::SIGKILL {
        send_signal_pair(pid, Signal::SIGKILL).map_err(to_kill_failed)?;
        std::thread::sleep(SIGKILL_WAIT);
        return Ok(());
    }

    send_signal_pair(pid, signal).map_err(to_kill_failed)?;
    let polls = (KILL_GRACE.as_millis() / KILL_POLL.as_millis()) as u32;
    for _ in 0..polls {
        std::thread::sleep(KILL_POLL);
        if !crate::utils::is_pid_alive(pid) {
            return Ok(());
        }
    }

    debug!(session_id, pid, "escalating to SIGKILL");
    send_signal_pair(pid, Signal::SIGKILL).map_err(to_kill_failed)?;
    std::thread::sleep(SIGKILL_WAIT);
    if crate::utils::is_pid_alive(pid) {
        return Err(HubError::KillFailed {
            session_id: session_id.to_string(),
            reason: format!("pid {pid} survived SIGKILL"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionInfo;
    use std::time::Instant;
    use tempfile::TempDir;

    fn supervisor() -> (TempDir, PtySupervisor) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        (dir, PtySupervisor::new(store, None))
    }

    fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn test_create_rejects_missing_working_dir() {
        let (_dir, supervisor) = supervisor();
        let err = supervisor
            .create(
                &["sh".to_string()],
                CreateOptions {
                    working_dir: Some(PathBuf::from("/definitely/not/here")),
                    ..CreateOptions::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.code(), "invalidWorkingDir");
        // no session directory left behind
        assert!(supervisor.store().list().unwrap().is_empty());
    }

    #[test]
    fn test_create_rejects_empty_command() {
        let (_dir, supervisor) = supervisor();
        let err = supervisor.create(&[], CreateOptions::default()).unwrap_err();
        assert_eq!(err.code(), "invalidInput");
    }

    #[test]
    fn test_input_payload_validation() {
        assert!(InputPayload::from_parts(None, None).is_err());
        assert!(InputPayload::from_parts(Some(String::new()), None).is_err());
        let key = InputPayload::from_parts(None, Some("enter".to_string())).unwrap();
        assert_eq!(key.into_bytes().unwrap(), b"\r");
        let bad = InputPayload::from_parts(None, Some("warp".to_string())).unwrap();
        assert_eq!(bad.into_bytes().unwrap_err().code(), "invalidInput");
    }

    #[test]
    fn test_session_lifecycle_echo() {
        let (_dir, supervisor) = supervisor();
        let (session_id, info) = supervisor
            .create(
                &["sh".to_string(), "-c".to_string(), "echo hi".to_string()],
                CreateOptions {
                    cols: Some(80),
                    rows: Some(24),
                    working_dir: Some(std::env::temp_dir()),
                    ..CreateOptions::default()
                },
            )
            .unwrap();
        assert_eq!(info.status, SessionStatus::Running);
        assert!(info.pid.is_some());

        wait_for("session exit", Duration::from_secs(10), || {
            supervisor
                .get(&session_id)
                .map(|entry| entry.info.status == SessionStatus::Exited)
                .unwrap_or(false)
        });

        let entry = supervisor.get(&session_id).unwrap();
        assert_eq!(entry.info.exit_code, Some(0));

        let recording =
            std::fs::read_to_string(supervisor.store().paths(&session_id).stdout).unwrap();
        assert!(recording.contains("hi"));
        let last = recording.lines().last().unwrap();
        assert!(last.contains("exit"), "missing exit trailer: {last}");
        assert!(last.contains(&session_id));
    }

    #[test]
    fn test_recording_header_has_requested_size() {
        let (_dir, supervisor) = supervisor();
        let (session_id, _) = supervisor
            .create(
                &["sh".to_string(), "-c".to_string(), "true".to_string()],
                CreateOptions {
                    cols: Some(100),
                    rows: Some(42),
                    working_dir: Some(std::env::temp_dir()),
                    ..CreateOptions::default()
                },
            )
            .unwrap();
        wait_for("exit", Duration::from_secs(10), || {
            supervisor
                .get(&session_id)
                .map(|e| e.info.status == SessionStatus::Exited)
                .unwrap_or(false)
        });
        let recording =
            std::fs::read_to_string(supervisor.store().paths(&session_id).stdout).unwrap();
        let header = recording.lines().next().unwrap();
        assert!(header.contains("\"width\":100"));
        assert!(header.contains("\"height\":42"));
    }

    #[test]
    fn test_send_input_reaches_session() {
        let (_dir, supervisor) = supervisor();
        let (session_id, _) = supervisor
            .create(
                &["sh".to_string(), "-c".to_string(), "read line; echo got-$line".to_string()],
                CreateOptions {
                    working_dir: Some(std::env::temp_dir()),
                    ..CreateOptions::default()
                },
            )
            .unwrap();

        supervisor
            .send_input(&session_id, InputPayload::Text("ping\n".to_string()))
            .unwrap();

        wait_for("echoed input", Duration::from_secs(10), || {
            std::fs::read_to_string(supervisor.store().paths(&session_id).stdout)
                .map(|content| content.contains("got-ping"))
                .unwrap_or(false)
        });

        // input was mirrored to the recording as an "i" event
        let recording =
            std::fs::read_to_string(supervisor.store().paths(&session_id).stdout).unwrap();
        assert!(recording.contains(r#""i""#));
    }

    #[test]
    fn test_kill_escalation_on_term_ignoring_process() {
        let (_dir, supervisor) = supervisor();
        let (session_id, info) = supervisor
            .create(
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    "trap '' TERM; while true; do sleep 1; done".to_string(),
                ],
                CreateOptions {
                    working_dir: Some(std::env::temp_dir()),
                    ..CreateOptions::default()
                },
            )
            .unwrap();
        let pid = info.pid.unwrap();
        // give the shell a moment to install the trap
        std::thread::sleep(Duration::from_millis(300));

        let started = Instant::now();
        supervisor.kill(&session_id, Signal::SIGTERM).unwrap();
        let elapsed = started.elapsed();
        assert!(!crate::utils::is_pid_alive(pid));
        assert!(
            elapsed <= Duration::from_millis(3700),
            "kill took {elapsed:?}"
        );

        wait_for("exited status", Duration::from_secs(5), || {
            supervisor
                .get(&session_id)
                .map(|e| e.info.status == SessionStatus::Exited)
                .unwrap_or(false)
        });
        let entry = supervisor.get(&session_id).unwrap();
        assert_eq!(entry.info.exit_code, Some(128 + 9));
    }

    #[test]
    fn test_kill_unknown_session() {
        let (_dir, supervisor) = supervisor();
        let err = supervisor.kill("ghost", Signal::SIGTERM).unwrap_err();
        assert_eq!(err.code(), "sessionNotFound");
    }

    #[test]
    fn test_external_kill_by_pid() {
        let (_dir, supervisor) = supervisor();
        let child = std::process::Command::new("sleep")
            .arg("100")
            .spawn()
            .unwrap();
        let pid = child.id();

        let store = supervisor.store();
        store.create_directory("ext1").unwrap();
        let info = SessionInfo {
            command: vec!["sleep".to_string(), "100".to_string()],
            name: "sleep".to_string(),
            working_dir: "/tmp".to_string(),
            status: SessionStatus::Running,
            pid: Some(pid),
            started_at: Some(jiff::Timestamp::now()),
            ..SessionInfo::default()
        };
        store.save_info("ext1", &info).unwrap();

        supervisor.kill("ext1", Signal::SIGTERM).unwrap();
        assert!(!crate::utils::is_pid_alive(pid));
        // reap so the test process does not accumulate zombies
        let mut child = child;
        let _ = child.wait();
    }

    #[test]
    fn test_reset_size_rejected_for_live_sessions() {
        let (_dir, supervisor) = supervisor();
        let (session_id, _) = supervisor
            .create(
                &["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
                CreateOptions {
                    working_dir: Some(std::env::temp_dir()),
                    ..CreateOptions::default()
                },
            )
            .unwrap();
        let err = supervisor.reset_size(&session_id).unwrap_err();
        assert_eq!(err.code(), "invalidInput");
        supervisor.kill(&session_id, Signal::SIGKILL).unwrap();
    }

    #[test]
    fn test_reset_size_appends_control_message() {
        let (_dir, supervisor) = supervisor();
        let store = supervisor.store();
        store.create_directory("ext2").unwrap();
        store
            .save_info("ext2", &SessionInfo::default())
            .unwrap();

        supervisor.reset_size("ext2").unwrap();
        let control = std::fs::read_to_string(store.paths("ext2").control).unwrap();
        assert!(control.contains("reset-size"));
    }

    #[test]
    fn test_resize_external_appends_and_persists() {
        let (_dir, supervisor) = supervisor();
        let store = supervisor.store();
        store.create_directory("ext3").unwrap();
        store.save_info("ext3", &SessionInfo::default()).unwrap();

        supervisor.resize("ext3", 132, 50).unwrap();
        let control = std::fs::read_to_string(store.paths("ext3").control).unwrap();
        assert!(control.contains(r#""cols":132"#));
        let info = store.load_info("ext3").unwrap();
        assert_eq!(info.cols, Some(132));
        assert_eq!(info.rows, Some(50));

        assert_eq!(
            supervisor.resize("ext3", 0, 10).unwrap_err().code(),
            "invalidInput"
        );
    }

    #[test]
    fn test_resize_precedence_browser_wins_within_grace() {
        let (_dir, supervisor) = supervisor();
        let (session_id, _) = supervisor
            .create(
                &["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
                CreateOptions {
                    working_dir: Some(std::env::temp_dir()),
                    ..CreateOptions::default()
                },
            )
            .unwrap();

        supervisor.resize(&session_id, 120, 30).unwrap();
        // a terminal resize right after the browser's is suppressed
        supervisor.terminal_resize(100, 40);
        std::thread::sleep(Duration::from_millis(1100));
        // after the grace window the terminal wins again
        supervisor.terminal_resize(110, 35);

        let recording =
            std::fs::read_to_string(supervisor.store().paths(&session_id).stdout).unwrap();
        assert!(recording.contains("120x30"));
        assert!(!recording.contains("100x40"));
        assert!(recording.contains("110x35"));

        let info = supervisor.store().load_info(&session_id).unwrap();
        assert_eq!(info.cols, Some(120));
        assert_eq!(info.rows, Some(30));

        supervisor.kill(&session_id, Signal::SIGKILL).unwrap();
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let (_dir, supervisor) = supervisor();
        assert!(supervisor.cleanup("never-was").is_ok());
    }
}
