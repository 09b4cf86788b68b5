use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tracing::{debug, warn};

use crate::errors::{HubError, Result};
use crate::protocol::ControlCommand;
use crate::recorder::Recorder;
use crate::store::SessionPaths;

/// `sun_path` is ~104 bytes on the BSDs; anything longer cannot be bound.
const SOCKET_PATH_LIMIT: usize = 100;

/// Writes to a live session's PTY, mirroring input into the recorder.
///
/// One write lock per session makes every `send` atomic with respect to
/// concurrent senders: each call's bytes reach the PTY in one contiguous run.
pub struct PtyInput {
    master: Arc<OwnedFd>,
    recorder: Arc<Mutex<Recorder>>,
    write_lock: Mutex<()>,
}

impl PtyInput {
    pub fn new(master: Arc<OwnedFd>, recorder: Arc<Mutex<Recorder>>) -> Self {
        Self {
            master,
            recorder,
            write_lock: Mutex::new(()),
        }
    }

    pub fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let written = unsafe {
                libc::write(
                    self.master.as_raw_fd(),
                    remaining.as_ptr().cast::<libc::c_void>(),
                    remaining.len(),
                )
            };
            if written < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            remaining = &remaining[written as usize..];
        }
        if let Ok(mut recorder) = self.recorder.lock() {
            let _ = recorder.write_input(bytes);
        }
        Ok(())
    }
}

/// Per-session stream server on `input.sock`: every byte received from any
/// client is PTY input. At most one server exists per session.
pub struct InputServer {
    socket_path: PathBuf,
    stop: Arc<AtomicBool>,
}

impl InputServer {
    /// Binds the socket and starts the accept loop. Returns `None` when the
    /// socket path exceeds the `sun_path` limit (deep temp dirs in tests);
    /// the stdin FIFO remains as the fallback input path.
    pub fn start(socket_path: &Path, input: Arc<PtyInput>) -> Option<Self> {
        if socket_path.as_os_str().len() > SOCKET_PATH_LIMIT {
            debug!(?socket_path, "socket path too long, using FIFO only");
            return None;
        }
        let _ = std::fs::remove_file(socket_path);
        let listener = match UnixListener::bind(socket_path) {
            Ok(listener) => listener,
            Err(err) => {
                warn!(?socket_path, %err, "failed to bind input socket");
                return None;
            }
        };
        // any local client may type into the session
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o666));
        }
        let _ = listener.set_nonblocking(true);

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let path = socket_path.to_path_buf();
        std::thread::Builder::new()
            .name("input-server".to_string())
            .spawn(move || accept_loop(&listener, &input, &stop_flag))
            .ok()?;

        Some(Self {
            socket_path: path,
            stop,
        })
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for InputServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: &UnixListener, input: &Arc<PtyInput>, stop: &Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let input = Arc::clone(input);
                let stop = Arc::clone(stop);
                std::thread::spawn(move || client_loop(stream, &input, &stop));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(err) => {
                debug!(%err, "input socket accept failed");
                break;
            }
        }
    }
}

fn client_loop(mut stream: UnixStream, input: &Arc<PtyInput>, stop: &Arc<AtomicBool>) {
    let _ = stream.set_read_timeout(Some(Duration::from_millis(200)));
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if input.send(&buf[..n]).is_err() {
                    break;
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => break,
        }
    }
}

/// Client side: one cached outgoing connection per session, reconnected
/// lazily after failures. Falls back to the stdin FIFO when the socket is
/// not there.
#[derive(Default)]
pub struct InputClientCache {
    connections: Mutex<HashMap<String, UnixStream>>,
}

impl InputClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, session_id: &str, paths: &SessionPaths, bytes: &[u8]) -> Result<()> {
        if paths.input_sock.exists() {
            if self.send_via_socket(session_id, &paths.input_sock, bytes).is_ok() {
                return Ok(());
            }
            // one reconnect attempt before giving up on the socket
            self.drop_connection(session_id);
            if self.send_via_socket(session_id, &paths.input_sock, bytes).is_ok() {
                return Ok(());
            }
        }
        if paths.stdin.exists() {
            return write_to_pipe_with_timeout(&paths.stdin, bytes, Duration::from_secs(1))
                .map_err(|_| HubError::NoSocketConnection {
                    session_id: session_id.to_string(),
                });
        }
        Err(HubError::SessionPathsNotFound {
            session_id: session_id.to_string(),
        })
    }

    fn send_via_socket(&self, session_id: &str, socket: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if !connections.contains_key(session_id) {
            let stream = UnixStream::connect(socket)?;
            connections.insert(session_id.to_string(), stream);
        }
        let stream = connections
            .get_mut(session_id)
            .expect("connection just inserted");
        stream.write_all(bytes)?;
        stream.flush()
    }

    pub fn drop_connection(&self, session_id: &str) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }
}

/// Appends one control message to the session's control pipe.
pub fn append_control(paths: &SessionPaths, command: &ControlCommand) -> Result<()> {
    let line = serde_json::to_string(command).map_err(|err| HubError::InvalidInput {
        reason: err.to_string(),
    })?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.control)
        .map_err(|source| HubError::SaveSessionFailed { source })?;
    writeln!(file, "{line}").map_err(|source| HubError::SaveSessionFailed { source })?;
    Ok(())
}

/// Consumes newly appended control-pipe lines, tracking the last offset so
/// each message is parsed exactly once and in file-append order.
#[derive(Debug, Default)]
pub struct ControlPipeReader {
    offset: u64,
    partial: Vec<u8>,
}

impl ControlPipeReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll(&mut self, path: &Path) -> Vec<ControlCommand> {
        let mut commands = Vec::new();
        let Ok(mut file) = File::open(path) else {
            return commands;
        };
        let Ok(metadata) = file.metadata() else {
            return commands;
        };
        if metadata.len() < self.offset {
            // pipe was truncated or replaced
            self.offset = 0;
            self.partial.clear();
        }
        if metadata.len() == self.offset {
            return commands;
        }
        use std::io::Seek;
        if file.seek(std::io::SeekFrom::Start(self.offset)).is_err() {
            return commands;
        }
        let mut fresh = Vec::new();
        if file.read_to_end(&mut fresh).is_err() {
            return commands;
        }
        self.offset += fresh.len() as u64;
        self.partial.extend_from_slice(&fresh);

        while let Some(newline) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ControlCommand>(trimmed) {
                Ok(command) => commands.push(command),
                Err(err) => warn!(%err, line = trimmed, "ignoring unknown control message"),
            }
        }
        commands
    }
}

/// Opens a FIFO non-blocking, polls for writability, then writes. A FIFO
/// with no reader errors out instead of hanging the caller forever.
pub fn write_to_pipe_with_timeout(
    pipe_path: &Path,
    data: &[u8],
    timeout: Duration,
) -> std::result::Result<(), anyhow::Error> {
    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(pipe_path)?;

    let fd = file.as_raw_fd();
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis() as libc::c_int;
    let poll_result = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    match poll_result {
        -1 => return Err(anyhow!("poll failed: {}", std::io::Error::last_os_error())),
        0 => return Err(anyhow!("write timed out after {timeout:?}")),
        _ => {
            if pollfd.revents & libc::POLLERR != 0 {
                return Err(anyhow!("pipe error"));
            }
            if pollfd.revents & libc::POLLHUP != 0 {
                return Err(anyhow!("pipe has no readers"));
            }
            if pollfd.revents & libc::POLLNVAL != 0 {
                return Err(anyhow!("invalid pipe descriptor"));
            }
            if pollfd.revents & libc::POLLOUT == 0 {
                return Err(anyhow!("pipe not ready for writing"));
            }
        }
    }

    drop(file);
    let mut blocking_file = OpenOptions::new().append(true).open(pipe_path)?;
    blocking_file.write_all(data)?;
    blocking_file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;
    use std::ffi::CString;
    use tempfile::TempDir;

    #[test]
    fn test_control_pipe_reader_consumes_in_append_order() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let paths = store.create_directory("s1").unwrap();

        append_control(
            &paths,
            &ControlCommand::Resize {
                cols: 100,
                rows: 40,
            },
        )
        .unwrap();
        append_control(&paths, &ControlCommand::ResetSize).unwrap();

        let mut reader = ControlPipeReader::new();
        let commands = reader.poll(&paths.control);
        assert_eq!(
            commands,
            vec![
                ControlCommand::Resize {
                    cols: 100,
                    rows: 40
                },
                ControlCommand::ResetSize,
            ]
        );

        // nothing new: nothing re-delivered
        assert!(reader.poll(&paths.control).is_empty());

        append_control(&paths, &ControlCommand::Kill { signal: None }).unwrap();
        let commands = reader.poll(&paths.control);
        assert_eq!(commands, vec![ControlCommand::Kill { signal: None }]);
    }

    #[test]
    fn test_control_pipe_reader_skips_unknown_messages() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control");
        std::fs::write(
            &path,
            "{\"cmd\":\"dance\"}\nnot json\n{\"cmd\":\"reset-size\"}\n",
        )
        .unwrap();

        let mut reader = ControlPipeReader::new();
        let commands = reader.poll(&path);
        // the next valid message is still processed
        assert_eq!(commands, vec![ControlCommand::ResetSize]);
    }

    #[test]
    fn test_control_pipe_reader_handles_partial_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control");
        std::fs::write(&path, "{\"cmd\":\"res").unwrap();

        let mut reader = ControlPipeReader::new();
        assert!(reader.poll(&path).is_empty());

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"et-size\"}\n").unwrap();
        drop(file);

        assert_eq!(reader.poll(&path), vec![ControlCommand::ResetSize]);
    }

    #[test]
    fn test_control_pipe_reader_restarts_after_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("control");
        std::fs::write(&path, "{\"cmd\":\"reset-size\"}\n").unwrap();

        let mut reader = ControlPipeReader::new();
        assert_eq!(reader.poll(&path).len(), 1);

        std::fs::write(&path, "{\"cmd\":\"reset-size\"}\n").unwrap();
        assert_eq!(reader.poll(&path).len(), 1);
    }

    #[test]
    fn test_write_to_pipe_without_reader_times_out() {
        let dir = TempDir::new().unwrap();
        let pipe_path = dir.path().join("fifo");
        unsafe {
            let path = CString::new(pipe_path.to_str().unwrap()).unwrap();
            libc::mkfifo(path.as_ptr(), 0o666);
        }
        let result = write_to_pipe_with_timeout(&pipe_path, b"data", Duration::from_millis(100));
        assert!(result.is_err());
    }

    #[test]
    fn test_input_client_cache_missing_paths() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let paths = store.paths("ghost");
        let cache = InputClientCache::new();
        let err = cache.send("ghost", &paths, b"hi").unwrap_err();
        assert_eq!(err.code(), "sessionPathsNotFound");
    }

    #[test]
    fn test_input_server_skips_over_long_paths() {
        let dir = TempDir::new().unwrap();
        let long = dir
            .path()
            .join("a".repeat(SOCKET_PATH_LIMIT + 10))
            .join("input.sock");
        let master = unsafe {
            use std::os::fd::FromRawFd;
            Arc::new(OwnedFd::from_raw_fd(libc::dup(libc::STDOUT_FILENO)))
        };
        let recorder = {
            let path = dir.path().join("stdout");
            let recorder = Recorder::create(&path, 80, 24, None, None, None).unwrap();
            Arc::new(Mutex::new(recorder))
        };
        let input = Arc::new(PtyInput::new(master, recorder));
        assert!(InputServer::start(&long, input).is_none());
    }
}
