use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::errors::{HubError, Result};
use crate::protocol::{parse_record_line, CastEvent, CastEventKind, RecordLine};
use crate::store::SessionStore;

/// What a subscriber receives: rebased recording lines, then `End`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Line(String),
    End,
}

enum WatcherCmd {
    Join {
        subscriber_id: u64,
        tx: Sender<StreamMessage>,
    },
    Leave {
        subscriber_id: u64,
    },
    Wake,
}

/// A live subscription to one session's recording. Dropping it detaches
/// from the watcher; the watcher itself closes when its last subscriber
/// leaves.
#[derive(Debug)]
pub struct StreamSubscription {
    pub rx: Receiver<StreamMessage>,
    subscriber_id: u64,
    watcher_tx: Sender<WatcherCmd>,
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        let _ = self.watcher_tx.send(WatcherCmd::Leave {
            subscriber_id: self.subscriber_id,
        });
    }
}

/// Fan-out hub: one tailing watcher per session with live subscribers.
///
/// New subscribers first get the recorded history with every timestamp
/// rebased to zero, then live events stamped relative to their own
/// subscribe time, so replay looks instantaneous and live output flows at
/// real pace.
pub struct StreamHub {
    store: SessionStore,
    watchers: Mutex<HashMap<String, Sender<WatcherCmd>>>,
    next_subscriber: Mutex<u64>,
}

impl StreamHub {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            watchers: Mutex::new(HashMap::new()),
            next_subscriber: Mutex::new(0),
        }
    }

    pub fn subscribe(&self, session_id: &str) -> Result<StreamSubscription> {
        let paths = self.store.paths(session_id);
        if !paths.stdout.exists() {
            return Err(HubError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }

        let subscriber_id = {
            let mut next = self.next_subscriber.lock().unwrap_or_else(|e| e.into_inner());
            *next += 1;
            *next
        };
        let (tx, rx) = channel();

        let mut watchers = self.watchers.lock().unwrap_or_else(|e| e.into_inner());
        // a dead watcher (last subscriber left) is replaced transparently
        let needs_new = watchers
            .get(session_id)
            .map_or(true, |watcher_tx| {
                watcher_tx
                    .send(WatcherCmd::Join {
                        subscriber_id,
                        tx: tx.clone(),
                    })
                    .is_err()
            });
        if needs_new {
            let watcher_tx = spawn_watcher(session_id.to_string(), paths.stdout.clone());
            let _ = watcher_tx.send(WatcherCmd::Join {
                subscriber_id,
                tx,
            });
            watchers.insert(session_id.to_string(), watcher_tx);
        }
        let watcher_tx = watchers
            .get(session_id)
            .expect("watcher just ensured")
            .clone();

        Ok(StreamSubscription {
            rx,
            subscriber_id,
            watcher_tx,
        })
    }
}

struct Subscriber {
    tx: Sender<StreamMessage>,
    started: Instant,
}

struct TailState {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
    subscribers: HashMap<u64, Subscriber>,
    ended: bool,
}

fn spawn_watcher(session_id: String, path: PathBuf) -> Sender<WatcherCmd> {
    let (cmd_tx, cmd_rx) = channel::<WatcherCmd>();

    // notify wakes the loop early; the 100ms recv timeout is the fallback
    // for filesystems where events are unreliable.
    let wake_tx = cmd_tx.clone();
    let fs_watcher: Option<RecommendedWatcher> = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            if res.is_ok() {
                let _ = wake_tx.send(WatcherCmd::Wake);
            }
        },
        notify::Config::default(),
    )
    .ok()
    .and_then(|mut watcher| {
        let dir = path.parent()?.to_path_buf();
        watcher.watch(&dir, RecursiveMode::NonRecursive).ok()?;
        Some(watcher)
    });

    std::thread::Builder::new()
        .name(format!("stream-{session_id}"))
        .spawn(move || {
            let _fs_watcher = fs_watcher;
            let mut state = TailState {
                path,
                offset: 0,
                partial: Vec::new(),
                subscribers: HashMap::new(),
                ended: false,
            };
            // tail from the current end; history is served per-join
            if let Ok(metadata) = std::fs::metadata(&state.path) {
                state.offset = metadata.len();
            }

            loop {
                match cmd_rx.recv_timeout(Duration::from_millis(100)) {
                    Ok(WatcherCmd::Join { subscriber_id, tx }) => {
                        poll_file(&mut state);
                        handle_join(&mut state, subscriber_id, tx);
                    }
                    Ok(WatcherCmd::Leave { subscriber_id }) => {
                        state.subscribers.remove(&subscriber_id);
                        if state.subscribers.is_empty() {
                            // a join racing the last leave must not get lost
                            while let Ok(cmd) = cmd_rx.try_recv() {
                                if let WatcherCmd::Join { subscriber_id, tx } = cmd {
                                    poll_file(&mut state);
                                    handle_join(&mut state, subscriber_id, tx);
                                }
                            }
                            if state.subscribers.is_empty() {
                                debug!(session_id, "last subscriber left, closing watcher");
                                break;
                            }
                        }
                    }
                    Ok(WatcherCmd::Wake) | Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                        if !state.subscribers.is_empty() {
                            poll_file(&mut state);
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .expect("failed to spawn stream watcher thread");

    cmd_tx
}

/// Streams the recorded history to a new subscriber with all event
/// timestamps rebased to zero. An exit trailer in the history closes the
/// subscription immediately after replay.
fn handle_join(state: &mut TailState, subscriber_id: u64, tx: Sender<StreamMessage>) {
    let mut saw_exit = false;
    if let Ok(content) = read_range(&state.path, 0, state.offset) {
        for line in String::from_utf8_lossy(&content).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_record_line(line) {
                Some(RecordLine::Header(_)) => {
                    let _ = tx.send(StreamMessage::Line(line.to_string()));
                }
                Some(RecordLine::Event(event)) => {
                    let rebased = CastEvent { time: 0.0, ..event };
                    let _ = tx.send(StreamMessage::Line(rebased.to_line()));
                }
                Some(RecordLine::Exit { .. }) => {
                    let _ = tx.send(StreamMessage::Line(line.to_string()));
                    saw_exit = true;
                }
                None => {
                    let wrapped = CastEvent {
                        time: 0.0,
                        kind: CastEventKind::Output,
                        data: line.to_string(),
                    };
                    let _ = tx.send(StreamMessage::Line(wrapped.to_line()));
                }
            }
        }
    }

    if saw_exit || state.ended {
        let _ = tx.send(StreamMessage::End);
        return;
    }
    state.subscribers.insert(
        subscriber_id,
        Subscriber {
            tx,
            started: Instant::now(),
        },
    );
}

/// Reads newly appended bytes and broadcasts complete lines, re-stamping
/// event times per subscriber. Truncation or replacement restarts the tail
/// from offset zero.
fn poll_file(state: &mut TailState) {
    let Ok(metadata) = std::fs::metadata(&state.path) else {
        return;
    };
    if metadata.len() < state.offset {
        debug!(path = ?state.path, "recording truncated, restarting from zero");
        state.offset = 0;
        state.partial.clear();
    }
    if metadata.len() == state.offset {
        return;
    }

    let Ok(fresh) = read_range(&state.path, state.offset, metadata.len()) else {
        return;
    };
    state.offset += fresh.len() as u64;
    state.partial.extend_from_slice(&fresh);

    while let Some(newline) = state.partial.iter().position(|&b| b == b'\n') {
        let raw: Vec<u8> = state.partial.drain(..=newline).collect();
        let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        broadcast_line(state, &line);
        if state.ended {
            break;
        }
    }
}

fn broadcast_line(state: &mut TailState, line: &str) {
    let mut dead = Vec::new();
    match parse_record_line(line) {
        Some(RecordLine::Header(_)) => {
            for (id, subscriber) in &state.subscribers {
                if subscriber
                    .tx
                    .send(StreamMessage::Line(line.to_string()))
                    .is_err()
                {
                    dead.push(*id);
                }
            }
        }
        Some(RecordLine::Event(event)) => {
            for (id, subscriber) in &state.subscribers {
                let rebased = CastEvent {
                    time: subscriber.started.elapsed().as_secs_f64(),
                    ..event.clone()
                };
                if subscriber
                    .tx
                    .send(StreamMessage::Line(rebased.to_line()))
                    .is_err()
                {
                    dead.push(*id);
                }
            }
        }
        Some(RecordLine::Exit { .. }) => {
            for subscriber in state.subscribers.values() {
                let _ = subscriber.tx.send(StreamMessage::Line(line.to_string()));
                let _ = subscriber.tx.send(StreamMessage::End);
            }
            state.subscribers.clear();
            state.ended = true;
        }
        None => {
            // raw non-JSON output gets wrapped as an output event
            for (id, subscriber) in &state.subscribers {
                let wrapped = CastEvent {
                    time: subscriber.started.elapsed().as_secs_f64(),
                    kind: CastEventKind::Output,
                    data: line.to_string(),
                };
                if subscriber
                    .tx
                    .send(StreamMessage::Line(wrapped.to_line()))
                    .is_err()
                {
                    dead.push(*id);
                }
            }
        }
    }
    for id in dead {
        state.subscribers.remove(&id);
        warn!(subscriber = id, "dropped unresponsive stream subscriber");
    }
}

fn read_range(path: &Path, from: u64, to: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(from))?;
    let mut buf = vec![0u8; (to.saturating_sub(from)) as usize];
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            buf.truncate(filled);
            break;
        }
        filled += n;
    }
    Ok(buf)
}
