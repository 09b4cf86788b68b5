use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Polling cadence for recording growth.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// A session with no output for this long is marked inactive.
const IDLE_AFTER: Duration = Duration::from_millis(500);

/// The serialized shape of `activity.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    pub is_active: bool,
    pub timestamp: Timestamp,
}

#[derive(Debug)]
struct Tracked {
    size: u64,
    last_growth: Instant,
    active: bool,
}

/// Watches every session's recording for size growth and mirrors an
/// active/inactive flag into `activity.json`. Size, not mtime, so coarse
/// filesystem timestamp resolution cannot starve it.
pub struct ActivityMonitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ActivityMonitor {
    pub fn start(control_root: PathBuf) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("activity-monitor".to_string())
            .spawn(move || run(&control_root, &stop_flag))
            .expect("failed to spawn activity monitor thread");
        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ActivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(control_root: &Path, stop: &AtomicBool) {
    let mut tracked: HashMap<String, Tracked> = HashMap::new();
    while !stop.load(Ordering::SeqCst) && !crate::utils::is_shutting_down() {
        sweep(control_root, &mut tracked);
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn sweep(control_root: &Path, tracked: &mut HashMap<String, Tracked>) {
    let Ok(entries) = fs::read_dir(control_root) else {
        return;
    };
    let mut seen = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let Some(session_id) = dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let stdout = dir.join("stdout");
        let Ok(metadata) = fs::metadata(&stdout) else {
            continue;
        };
        seen.push(session_id.to_string());
        let size = metadata.len();

        let state = tracked
            .entry(session_id.to_string())
            .or_insert_with(|| Tracked {
                size,
                last_growth: Instant::now(),
                active: false,
            });

        if size > state.size {
            state.size = size;
            state.last_growth = Instant::now();
            if !state.active {
                state.active = true;
                write_activity(&dir, true);
                debug!(session_id, "session became active");
            }
        } else if state.active && state.last_growth.elapsed() >= IDLE_AFTER {
            state.active = false;
            write_activity(&dir, false);
            debug!(session_id, "session became inactive");
        }
    }
    tracked.retain(|session_id, _| seen.iter().any(|s| s == session_id));
}

fn write_activity(session_dir: &Path, is_active: bool) {
    let state = ActivityState {
        is_active,
        timestamp: Timestamp::now(),
    };
    let Ok(body) = serde_json::to_string_pretty(&state) else {
        return;
    };
    let target = session_dir.join("activity.json");
    let result = NamedTempFile::new_in(session_dir)
        .and_then(|temp| {
            fs::write(temp.path(), body)?;
            Ok(temp)
        })
        .and_then(|temp| temp.persist(&target).map_err(|err| err.error));
    if let Err(err) = result {
        warn!(?target, %err, "failed to write activity state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_session(root: &Path, id: &str) -> PathBuf {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::File::create(dir.join("stdout")).unwrap();
        dir
    }

    fn read_activity(dir: &Path) -> Option<ActivityState> {
        let content = fs::read_to_string(dir.join("activity.json")).ok()?;
        serde_json::from_str(&content).ok()
    }

    #[test]
    fn test_growth_marks_active_then_idle_marks_inactive() {
        let root = TempDir::new().unwrap();
        let dir = make_session(root.path(), "s1");
        let mut tracked = HashMap::new();

        sweep(root.path(), &mut tracked);
        assert!(read_activity(&dir).is_none());

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(dir.join("stdout"))
            .unwrap();
        file.write_all(b"output").unwrap();
        file.flush().unwrap();

        sweep(root.path(), &mut tracked);
        let state = read_activity(&dir).unwrap();
        assert!(state.is_active);

        std::thread::sleep(IDLE_AFTER + Duration::from_millis(50));
        sweep(root.path(), &mut tracked);
        let state = read_activity(&dir).unwrap();
        assert!(!state.is_active);
    }

    #[test]
    fn test_removed_sessions_are_forgotten() {
        let root = TempDir::new().unwrap();
        let dir = make_session(root.path(), "gone");
        let mut tracked = HashMap::new();
        sweep(root.path(), &mut tracked);
        assert_eq!(tracked.len(), 1);

        fs::remove_dir_all(&dir).unwrap();
        sweep(root.path(), &mut tracked);
        assert!(tracked.is_empty());
    }

    #[test]
    fn test_monitor_thread_lifecycle() {
        let root = TempDir::new().unwrap();
        let mut monitor = ActivityMonitor::start(root.path().to_path_buf());
        std::thread::sleep(Duration::from_millis(150));
        monitor.stop();
    }
}
