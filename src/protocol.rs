use std::collections::HashMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

/// The serialized shape of `session.json`.
///
/// The session directory is a control plane shared with external producers,
/// so this struct is the authoritative wire format, not an internal detail.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// The resolved argv actually handed to the OS.
    pub command: Vec<String>,
    pub name: String,
    pub working_dir: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    pub term: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            name: String::new(),
            working_dir: String::new(),
            status: SessionStatus::Starting,
            pid: None,
            exit_code: None,
            started_at: None,
            term: crate::tty_spawn::DEFAULT_TERM.to_string(),
            cols: None,
            rows: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CastHeader {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastEventKind {
    Output,
    Input,
    Resize,
    Marker,
}

impl CastEventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Output => "o",
            Self::Input => "i",
            Self::Resize => "r",
            Self::Marker => "m",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "o" => Some(Self::Output),
            "i" => Some(Self::Input),
            "r" => Some(Self::Resize),
            "m" => Some(Self::Marker),
            _ => None,
        }
    }
}

/// One `[time, type, data]` line of the recording.
#[derive(Debug, Clone, PartialEq)]
pub struct CastEvent {
    pub time: f64,
    pub kind: CastEventKind,
    pub data: String,
}

impl CastEvent {
    pub fn to_line(&self) -> String {
        serde_json::to_string(&serde_json::json!([
            self.time,
            self.kind.as_str(),
            self.data
        ]))
        .unwrap_or_default()
    }
}

/// A parsed line of the recording file.
#[derive(Debug, Clone)]
pub enum RecordLine {
    Header(CastHeader),
    Event(CastEvent),
    Exit { code: i32, session_id: String },
}

/// Parses one recording line. Returns `None` for lines that are neither a
/// header, an event array, nor the exit trailer; callers decide whether to
/// skip them or wrap them as raw output.
pub fn parse_record_line(line: &str) -> Option<RecordLine> {
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("version").is_some() {
        return serde_json::from_value(value).ok().map(RecordLine::Header);
    }
    let array = value.as_array()?;
    if array.first().and_then(Value::as_str) == Some("exit") {
        let code = array.get(1).and_then(Value::as_i64).unwrap_or(1) as i32;
        let session_id = array
            .get(2)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Some(RecordLine::Exit { code, session_id });
    }
    if array.len() < 3 {
        return None;
    }
    let time = array[0].as_f64()?;
    let kind = CastEventKind::from_str(array[1].as_str()?)?;
    let data = array[2].as_str()?.to_string();
    Some(RecordLine::Event(CastEvent { time, kind, data }))
}

/// Messages accepted on a session's control pipe, one JSON object per line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum ControlCommand {
    Resize { cols: u16, rows: u16 },
    Kill { signal: Option<SignalSpec> },
    ResetSize,
}

/// A signal given either by name (`"SIGTERM"`) or number (`15`).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum SignalSpec {
    Number(i32),
    Name(String),
}

impl SignalSpec {
    pub fn as_signal_number(&self) -> i32 {
        match self {
            Self::Number(n) => *n,
            Self::Name(name) => match name.trim_start_matches("SIG") {
                "KILL" => libc::SIGKILL,
                "INT" => libc::SIGINT,
                "HUP" => libc::SIGHUP,
                "QUIT" => libc::SIGQUIT,
                "USR1" => libc::SIGUSR1,
                "USR2" => libc::SIGUSR2,
                _ => libc::SIGTERM,
            },
        }
    }
}

/// Maps the dashboard's named keys onto the ANSI sequences the PTY expects.
pub fn special_key_sequence(key: &str) -> Option<&'static [u8]> {
    Some(match key {
        "arrow_up" => b"\x1b[A",
        "arrow_down" => b"\x1b[B",
        "arrow_right" => b"\x1b[C",
        "arrow_left" => b"\x1b[D",
        "escape" => b"\x1b",
        "enter" => b"\r",
        "ctrl_enter" => b"\n",
        "shift_enter" => b"\r\n",
        _ => return None,
    })
}

pub const SPECIAL_KEYS: &[&str] = &[
    "arrow_up",
    "arrow_down",
    "arrow_left",
    "arrow_right",
    "escape",
    "enter",
    "ctrl_enter",
    "shift_enter",
];

/// JSON frames a buffer-WebSocket client may send.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BufferClientMessage {
    Subscribe { session_id: String },
    Unsubscribe { session_id: String },
    Ping,
    Pong,
}

/// JSON frames the buffer-WebSocket server sends. Binary payloads use the
/// magic-byte envelope in `buffers` instead.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BufferServerMessage {
    Connected { version: u32 },
    Subscribed { session_id: String },
    Ping,
    Pong,
    Error { message: String },
}
