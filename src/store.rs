use std::fs;
use std::path::{Path, PathBuf};

use jiff::Timestamp;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::errors::{HubError, Result};
use crate::protocol::{SessionInfo, SessionStatus};
use crate::utils::is_pid_alive;

/// Absolute paths of everything inside one session directory.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub session_json: PathBuf,
    pub stdout: PathBuf,
    pub stdin: PathBuf,
    pub input_sock: PathBuf,
    pub control: PathBuf,
    pub activity: PathBuf,
}

impl SessionPaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            session_json: dir.join("session.json"),
            stdout: dir.join("stdout"),
            stdin: dir.join("stdin"),
            input_sock: dir.join("input.sock"),
            control: dir.join("control"),
            activity: dir.join("activity.json"),
            dir,
        }
    }
}

/// A session as enumerated from disk.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: String,
    pub info: SessionInfo,
    pub last_modified: Option<Timestamp>,
}

/// The on-disk session store: one directory per session under the control
/// root. The directory is the authoritative record of session existence;
/// everything here must be re-derivable from disk alone.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, session_id: &str) -> SessionPaths {
        SessionPaths::new(self.root.join(session_id))
    }

    /// Idempotently creates the session directory and the stdin FIFO.
    /// Falls back to a regular file where FIFOs are unsupported.
    pub fn create_directory(&self, session_id: &str) -> Result<SessionPaths> {
        let paths = self.paths(session_id);
        fs::create_dir_all(&paths.dir).map_err(|source| HubError::SaveSessionFailed { source })?;
        match mkfifo(&paths.stdin, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(()) | Err(Errno::EEXIST) => {}
            Err(err) => {
                warn!(session_id, %err, "mkfifo failed, falling back to a regular stdin file");
                fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&paths.stdin)
                    .map_err(|source| HubError::SaveSessionFailed { source })?;
            }
        }
        Ok(paths)
    }

    /// Atomic write via temp file + rename so readers never observe a torn
    /// `session.json`.
    pub fn save_info(&self, session_id: &str, info: &SessionInfo) -> Result<()> {
        let paths = self.paths(session_id);
        let body = serde_json::to_string_pretty(info)
            .map_err(|err| HubError::SaveSessionFailed { source: err.into() })?;
        let temp = NamedTempFile::new_in(&paths.dir)
            .map_err(|source| HubError::SaveSessionFailed { source })?;
        fs::write(temp.path(), body).map_err(|source| HubError::SaveSessionFailed { source })?;
        temp.persist(&paths.session_json)
            .map_err(|err| HubError::SaveSessionFailed { source: err.error })?;
        Ok(())
    }

    /// Returns `None` for a missing file; a corrupt file is logged and
    /// treated as "session unknown" so enumeration never crashes on it.
    pub fn load_info(&self, session_id: &str) -> Option<SessionInfo> {
        let paths = self.paths(session_id);
        let content = fs::read_to_string(&paths.session_json).ok()?;
        match serde_json::from_str(&content) {
            Ok(info) => Some(info),
            Err(err) => {
                warn!(session_id, %err, "unparseable session.json");
                None
            }
        }
    }

    /// Load-modify-save of the status fields.
    pub fn update_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        pid: Option<u32>,
        exit_code: Option<i32>,
    ) -> Result<()> {
        let mut info = self
            .load_info(session_id)
            .ok_or_else(|| HubError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        info.status = status;
        if pid.is_some() {
            info.pid = pid;
        }
        if exit_code.is_some() {
            info.exit_code = exit_code;
        }
        self.save_info(session_id, &info)
    }

    /// Enumerates the control root, reconciling zombies on the way: a
    /// `running` session whose pid is gone is rewritten to `exited` with
    /// exit code 1. Results are sorted by `started_at` descending.
    pub fn list(&self) -> Result<Vec<SessionEntry>> {
        let mut sessions = Vec::new();
        if !self.root.exists() {
            return Ok(sessions);
        }

        let entries =
            fs::read_dir(&self.root).map_err(|source| HubError::ListSessionsFailed { source })?;
        for entry in entries {
            let entry = entry.map_err(|source| HubError::ListSessionsFailed { source })?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(session_id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(mut info) = self.load_info(session_id) else {
                continue;
            };

            if info.status == SessionStatus::Running {
                let alive = info.pid.is_some_and(is_pid_alive);
                if !alive {
                    info.status = SessionStatus::Exited;
                    info.exit_code = Some(1);
                    if let Err(err) = self.save_info(session_id, &info) {
                        warn!(session_id, %err, "failed to persist zombie sweep");
                    }
                }
            }

            let last_modified = recording_mtime(&self.paths(session_id).stdout);
            sessions.push(SessionEntry {
                id: session_id.to_string(),
                info,
                last_modified,
            });
        }

        sessions.sort_by(|a, b| b.info.started_at.cmp(&a.info.started_at));
        Ok(sessions)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        let info = self.load_info(session_id)?;
        let last_modified = recording_mtime(&self.paths(session_id).stdout);
        Some(SessionEntry {
            id: session_id.to_string(),
            info,
            last_modified,
        })
    }

    /// Recursive removal. Removing a session that does not exist is a no-op.
    pub fn cleanup(&self, session_id: &str) -> Result<()> {
        let paths = self.paths(session_id);
        if !paths.dir.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&paths.dir).map_err(|source| HubError::CleanupFailed {
            session_id: session_id.to_string(),
            source,
        })
    }

    /// Removes every exited session, returning the ids that went away.
    pub fn cleanup_exited(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for entry in self.list()? {
            if entry.info.status == SessionStatus::Exited {
                self.cleanup(&entry.id)?;
                removed.push(entry.id);
            }
        }
        Ok(removed)
    }
}

fn recording_mtime(path: &Path) -> Option<Timestamp> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    let secs = modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .ok()?
        .as_secs();
    Timestamp::from_second(secs as i64).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        (dir, store)
    }

    fn sample_info(pid: Option<u32>, status: SessionStatus) -> SessionInfo {
        SessionInfo {
            command: vec!["bash".to_string()],
            name: "bash".to_string(),
            working_dir: "/tmp".to_string(),
            status,
            pid,
            exit_code: None,
            started_at: Some(Timestamp::now()),
            ..SessionInfo::default()
        }
    }

    #[test]
    fn test_create_directory_is_idempotent() {
        let (_dir, store) = store();
        let first = store.create_directory("s1").unwrap();
        let second = store.create_directory("s1").unwrap();
        assert_eq!(first.dir, second.dir);
        assert!(first.dir.exists());
        assert!(first.stdin.exists());
    }

    #[test]
    fn test_save_and_load_info() {
        let (_dir, store) = store();
        store.create_directory("s1").unwrap();
        let info = sample_info(Some(123), SessionStatus::Starting);
        store.save_info("s1", &info).unwrap();

        let loaded = store.load_info("s1").unwrap();
        assert_eq!(loaded.command, vec!["bash"]);
        assert_eq!(loaded.pid, Some(123));
        assert_eq!(loaded.status, SessionStatus::Starting);
    }

    #[test]
    fn test_load_info_missing_and_corrupt() {
        let (_dir, store) = store();
        assert!(store.load_info("nope").is_none());

        let paths = store.create_directory("bad").unwrap();
        fs::write(&paths.session_json, "{ not json").unwrap();
        assert!(store.load_info("bad").is_none());
        // corrupt sessions never break enumeration
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_update_status() {
        let (_dir, store) = store();
        store.create_directory("s1").unwrap();
        store
            .save_info("s1", &sample_info(None, SessionStatus::Starting))
            .unwrap();

        store
            .update_status("s1", SessionStatus::Running, Some(77), None)
            .unwrap();
        let info = store.load_info("s1").unwrap();
        assert_eq!(info.status, SessionStatus::Running);
        assert_eq!(info.pid, Some(77));

        store
            .update_status("s1", SessionStatus::Exited, None, Some(0))
            .unwrap();
        let info = store.load_info("s1").unwrap();
        assert_eq!(info.status, SessionStatus::Exited);
        assert_eq!(info.exit_code, Some(0));
        // pid survives the exit transition
        assert_eq!(info.pid, Some(77));

        assert!(store
            .update_status("ghost", SessionStatus::Exited, None, None)
            .is_err());
    }

    #[test]
    fn test_list_zombie_sweep() {
        let (_dir, store) = store();
        store.create_directory("dead").unwrap();
        store
            .save_info("dead", &sample_info(Some(999_999), SessionStatus::Running))
            .unwrap();
        store.create_directory("alive").unwrap();
        store
            .save_info(
                "alive",
                &sample_info(Some(std::process::id()), SessionStatus::Running),
            )
            .unwrap();

        let sessions = store.list().unwrap();
        let dead = sessions.iter().find(|s| s.id == "dead").unwrap();
        assert_eq!(dead.info.status, SessionStatus::Exited);
        assert_eq!(dead.info.exit_code, Some(1));
        // the sweep is persisted, not just reported
        assert_eq!(
            store.load_info("dead").unwrap().status,
            SessionStatus::Exited
        );

        let alive = sessions.iter().find(|s| s.id == "alive").unwrap();
        assert_eq!(alive.info.status, SessionStatus::Running);
    }

    #[test]
    fn test_list_sorted_by_started_at_descending() {
        let (_dir, store) = store();
        for (id, offset) in [("older", 100), ("newest", 0), ("oldest", 200)] {
            store.create_directory(id).unwrap();
            let mut info = sample_info(None, SessionStatus::Exited);
            info.started_at = Some(Timestamp::from_second(Timestamp::now().as_second() - offset).unwrap());
            store.save_info(id, &info).unwrap();
        }

        let ids: Vec<_> = store.list().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["newest", "older", "oldest"]);
    }

    #[test]
    fn test_list_ignores_non_directories() {
        let (_dir, store) = store();
        fs::create_dir_all(store.root()).unwrap();
        fs::write(store.root().join("stray.txt"), "x").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_missing_session_is_noop() {
        let (_dir, store) = store();
        assert!(store.cleanup("never-existed").is_ok());
    }

    #[test]
    fn test_cleanup_exited_only_removes_exited() {
        let (_dir, store) = store();
        store.create_directory("gone").unwrap();
        store
            .save_info("gone", &sample_info(None, SessionStatus::Exited))
            .unwrap();
        store.create_directory("live").unwrap();
        store
            .save_info(
                "live",
                &sample_info(Some(std::process::id()), SessionStatus::Running),
            )
            .unwrap();

        let removed = store.cleanup_exited().unwrap();
        assert_eq!(removed, vec!["gone".to_string()]);
        assert!(!store.paths("gone").dir.exists());
        assert!(store.paths("live").dir.exists());
    }

    #[test]
    fn test_atomic_save_never_tears() {
        let (_dir, store) = store();
        store.create_directory("s1").unwrap();
        store
            .save_info("s1", &sample_info(None, SessionStatus::Starting))
            .unwrap();
        // Every save leaves a parseable file behind.
        for i in 0..20 {
            let mut info = sample_info(Some(i), SessionStatus::Running);
            info.name = format!("gen-{i}");
            store.save_info("s1", &info).unwrap();
            let loaded = store.load_info("s1").unwrap();
            assert_eq!(loaded.pid, Some(i));
        }
    }
}
