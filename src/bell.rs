use std::collections::HashMap;
use std::process::Command;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{Duration, Instant};

use jiff::Timestamp;
use serde::Serialize;
use tracing::debug;

use crate::protocol::SessionInfo;

/// Bells detected within this window after a session exits are discarded;
/// they are the shell's own death rattle, not something to notify about.
const POST_EXIT_SUPPRESSION: Duration = Duration::from_millis(1500);

/// Direct children younger than this are likely prompt helpers, not the
/// process that rang the bell.
const MIN_CHILD_AGE: Duration = Duration::from_millis(100);

const SHELL_NAMES: &[&str] = &["bash", "zsh", "sh", "fish", "dash", "ksh", "-bash", "-zsh"];

/// Short-lived utilities that prompts run constantly; never blamed for a bell.
const PROMPT_UTILITIES: &[&str] = &[
    "git status",
    "git branch",
    "git rev-parse",
    "pwd",
    "hostname",
    "date",
    "ls -la",
    "whoami",
    "uname",
];

/// Scans PTY output for bells, excluding the `BEL` that terminates an OSC
/// sequence (`ESC ] ... BEL`). State survives across chunk boundaries so a
/// sequence split between reads is still recognized.
#[derive(Debug, Default)]
pub struct BellDetector {
    saw_esc: bool,
    in_osc: bool,
}

impl BellDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of real (non-OSC-terminator) bells in `chunk`.
    pub fn scan(&mut self, chunk: &[u8]) -> usize {
        let mut bells = 0;
        for &byte in chunk {
            if self.saw_esc {
                self.saw_esc = false;
                if byte == b']' {
                    self.in_osc = true;
                    continue;
                }
            }
            match byte {
                0x1b => {
                    self.saw_esc = true;
                    // ESC inside an OSC begins the ST terminator (ESC \)
                    if self.in_osc {
                        self.in_osc = false;
                    }
                }
                0x07 => {
                    if self.in_osc {
                        self.in_osc = false;
                    } else {
                        bells += 1;
                    }
                }
                _ => {}
            }
        }
        bells
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    pub ppid: u32,
    pub command: String,
    pub args: String,
    /// Seconds since the process started, as reported by `ps`.
    pub elapsed_secs: u64,
}

impl ProcessInfo {
    fn is_shell(&self) -> bool {
        SHELL_NAMES.contains(&self.command.as_str())
    }

    fn is_prompt_utility(&self) -> bool {
        PROMPT_UTILITIES
            .iter()
            .any(|utility| self.args.starts_with(utility))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    /// The session process plus all its descendants.
    pub processes: Vec<ProcessInfo>,
    pub suspected_source: Option<ProcessInfo>,
}

/// A bell observed on a session's output, enriched with the process tree so
/// downstream notifiers can name the culprit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BellEvent {
    pub session_id: String,
    pub session: SessionInfo,
    pub timestamp: Timestamp,
    pub bell_count: usize,
    pub snapshot: ProcessSnapshot,
}

/// Typed bell channel: the supervisor emits, one consumer receives all
/// events in order.
pub struct BellChannel {
    tx: Sender<BellEvent>,
}

impl BellChannel {
    pub fn new() -> (Self, Receiver<BellEvent>) {
        let (tx, rx) = channel();
        (Self { tx }, rx)
    }

    pub fn emit(
        &self,
        session_id: &str,
        session: &SessionInfo,
        bell_count: usize,
        exited_at: Option<Instant>,
    ) {
        if let Some(exited) = exited_at {
            if exited.elapsed() < POST_EXIT_SUPPRESSION {
                debug!(session_id, "suppressing bell right after session exit");
                return;
            }
        }
        let snapshot = session
            .pid
            .map_or_else(ProcessSnapshot::empty, snapshot_process_tree);
        let event = BellEvent {
            session_id: session_id.to_string(),
            session: session.clone(),
            timestamp: Timestamp::now(),
            bell_count,
            snapshot,
        };
        let _ = self.tx.send(event);
    }
}

impl ProcessSnapshot {
    fn empty() -> Self {
        Self {
            processes: Vec::new(),
            suspected_source: None,
        }
    }
}

/// Enumerates all processes via `ps`, builds the parent→children map, and
/// collects the subtree under `root_pid`. Always contains at least the root
/// itself when it is still alive.
pub fn snapshot_process_tree(root_pid: u32) -> ProcessSnapshot {
    let all = list_all_processes();
    let mut children: HashMap<u32, Vec<&ProcessInfo>> = HashMap::new();
    for process in &all {
        children.entry(process.ppid).or_default().push(process);
    }

    let mut subtree = Vec::new();
    let mut queue = vec![root_pid];
    while let Some(pid) = queue.pop() {
        if let Some(process) = all.iter().find(|p| p.pid == pid) {
            subtree.push(process.clone());
        }
        if let Some(kids) = children.get(&pid) {
            queue.extend(kids.iter().map(|p| p.pid));
        }
    }

    let suspected_source = pick_suspected_source(root_pid, &subtree);
    ProcessSnapshot {
        processes: subtree,
        suspected_source,
    }
}

/// Suspect selection: the most recent non-shell direct child that is not a
/// prompt helper, then any most recent non-shell descendant, then the shell
/// itself.
fn pick_suspected_source(root_pid: u32, subtree: &[ProcessInfo]) -> Option<ProcessInfo> {
    let min_age_secs = MIN_CHILD_AGE.as_secs();
    let direct_child = subtree
        .iter()
        .filter(|p| p.ppid == root_pid && !p.is_shell() && !p.is_prompt_utility())
        .filter(|p| p.elapsed_secs > min_age_secs)
        .min_by_key(|p| p.elapsed_secs);
    if let Some(child) = direct_child {
        return Some(child.clone());
    }

    let descendant = subtree
        .iter()
        .filter(|p| p.pid != root_pid && !p.is_shell() && !p.is_prompt_utility())
        .min_by_key(|p| p.elapsed_secs);
    if let Some(descendant) = descendant {
        return Some(descendant.clone());
    }

    subtree.iter().find(|p| p.pid == root_pid).cloned()
}

fn list_all_processes() -> Vec<ProcessInfo> {
    let output = Command::new("ps")
        .args(["-axo", "pid=,ppid=,etimes=,comm=,args="])
        .output();
    let Ok(output) = output else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_ps_line)
        .collect()
}

fn parse_ps_line(line: &str) -> Option<ProcessInfo> {
    let mut parts = line.split_whitespace();
    let pid = parts.next()?.parse().ok()?;
    let ppid = parts.next()?.parse().ok()?;
    let elapsed_secs = parts.next()?.parse().ok()?;
    let command = basename(parts.next()?).to_string();
    let args = parts.collect::<Vec<_>>().join(" ");
    Some(ProcessInfo {
        pid,
        ppid,
        command,
        args,
        elapsed_secs,
    })
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_bell_is_counted() {
        let mut detector = BellDetector::new();
        assert_eq!(detector.scan(b"hello\x07world"), 1);
        assert_eq!(detector.scan(b"\x07\x07"), 2);
        assert_eq!(detector.scan(b"quiet"), 0);
    }

    #[test]
    fn test_osc_terminator_bell_is_not_counted() {
        let mut detector = BellDetector::new();
        // OSC 0 title-set sequence terminated by BEL
        assert_eq!(detector.scan(b"\x1b]0;my title\x07"), 0);
        // a real bell right after still counts
        assert_eq!(detector.scan(b"\x07"), 1);
    }

    #[test]
    fn test_osc_split_across_chunks() {
        let mut detector = BellDetector::new();
        assert_eq!(detector.scan(b"\x1b]0;partial tit"), 0);
        assert_eq!(detector.scan(b"le\x07 and \x07"), 1);
    }

    #[test]
    fn test_osc_with_st_terminator() {
        let mut detector = BellDetector::new();
        // OSC terminated by ESC \ instead of BEL; the next BEL is real
        assert_eq!(detector.scan(b"\x1b]0;title\x1b\\\x07"), 1);
    }

    #[test]
    fn test_esc_split_across_chunks() {
        let mut detector = BellDetector::new();
        assert_eq!(detector.scan(b"\x1b"), 0);
        assert_eq!(detector.scan(b"]0;t\x07"), 0);
    }

    #[test]
    fn test_parse_ps_line() {
        let process = parse_ps_line("  123   1  42 /usr/bin/vim vim notes.txt").unwrap();
        assert_eq!(process.pid, 123);
        assert_eq!(process.ppid, 1);
        assert_eq!(process.elapsed_secs, 42);
        assert_eq!(process.command, "vim");
        assert_eq!(process.args, "vim notes.txt");

        assert!(parse_ps_line("garbage").is_none());
    }

    #[test]
    fn test_snapshot_contains_at_least_self() {
        let snapshot = snapshot_process_tree(std::process::id());
        assert!(snapshot
            .processes
            .iter()
            .any(|p| p.pid == std::process::id()));
        assert!(snapshot.suspected_source.is_some());
    }

    #[test]
    fn test_suspected_source_prefers_recent_non_shell_child() {
        let subtree = vec![
            ProcessInfo {
                pid: 10,
                ppid: 1,
                command: "zsh".to_string(),
                args: "-zsh".to_string(),
                elapsed_secs: 500,
            },
            ProcessInfo {
                pid: 11,
                ppid: 10,
                command: "vim".to_string(),
                args: "vim notes.txt".to_string(),
                elapsed_secs: 30,
            },
            ProcessInfo {
                pid: 12,
                ppid: 10,
                command: "git".to_string(),
                args: "git status".to_string(),
                elapsed_secs: 0,
            },
        ];
        let suspect = pick_suspected_source(10, &subtree).unwrap();
        assert_eq!(suspect.pid, 11);
    }

    #[test]
    fn test_suspected_source_falls_back_to_shell() {
        let subtree = vec![ProcessInfo {
            pid: 10,
            ppid: 1,
            command: "zsh".to_string(),
            args: "-zsh".to_string(),
            elapsed_secs: 500,
        }];
        let suspect = pick_suspected_source(10, &subtree).unwrap();
        assert_eq!(suspect.pid, 10);
    }

    #[test]
    fn test_bell_channel_suppresses_after_exit() {
        let (channel, rx) = BellChannel::new();
        let info = SessionInfo::default();
        channel.emit("s1", &info, 1, Some(Instant::now()));
        assert!(rx.try_recv().is_err());

        channel.emit("s1", &info, 1, None);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.session_id, "s1");
        assert_eq!(event.bell_count, 1);
    }
}
