use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

use jiff::Timestamp;
use serde_json::Value;

use crate::protocol::{CastEvent, CastEventKind, CastHeader};

/// Append-only asciicast v2 writer: one header object line followed by
/// `[elapsed, type, data]` event lines.
///
/// Payload bytes are stored as JSON strings. Invalid UTF-8 sequences are
/// replaced with U+FFFD, so every recording is valid UTF-8 end to end.
pub struct Recorder {
    file: Option<File>,
    start: Instant,
    last_elapsed: f64,
}

impl Recorder {
    /// Opens `path` for append and writes the header line.
    pub fn create(
        path: &Path,
        cols: u16,
        rows: u16,
        command: Option<String>,
        title: Option<String>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, std::io::Error> {
        let file = File::options()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        let header = CastHeader {
            version: 2,
            width: u32::from(cols),
            height: u32::from(rows),
            timestamp: Some(Timestamp::now().as_second() as u64),
            command,
            title,
            env,
        };
        Self::with_file(file, &header)
    }

    /// Writes the header to an already-open file. Used directly by tests.
    pub fn with_file(mut file: File, header: &CastHeader) -> Result<Self, std::io::Error> {
        let header_json = serde_json::to_string(header)?;
        writeln!(file, "{header_json}")?;
        file.flush()?;
        Ok(Self {
            file: Some(file),
            start: Instant::now(),
            last_elapsed: 0.0,
        })
    }

    /// Seconds since the header, clamped so it never runs backwards.
    fn elapsed(&mut self) -> f64 {
        let now = self.start.elapsed().as_secs_f64();
        if now < self.last_elapsed {
            return self.last_elapsed;
        }
        self.last_elapsed = now;
        now
    }

    pub const fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn write_event(&mut self, kind: CastEventKind, data: String) -> Result<(), std::io::Error> {
        let time = self.elapsed();
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        let event = CastEvent { time, kind, data };
        writeln!(file, "{}", event.to_line())?;
        file.flush()
    }

    pub fn write_output(&mut self, bytes: &[u8]) -> Result<(), std::io::Error> {
        self.write_event(
            CastEventKind::Output,
            String::from_utf8_lossy(bytes).into_owned(),
        )
    }

    pub fn write_input(&mut self, bytes: &[u8]) -> Result<(), std::io::Error> {
        self.write_event(
            CastEventKind::Input,
            String::from_utf8_lossy(bytes).into_owned(),
        )
    }

    pub fn write_resize(&mut self, cols: u16, rows: u16) -> Result<(), std::io::Error> {
        self.write_event(CastEventKind::Resize, format!("{cols}x{rows}"))
    }

    pub fn write_marker(&mut self, label: &str) -> Result<(), std::io::Error> {
        self.write_event(CastEventKind::Marker, label.to_string())
    }

    /// Appends any JSON value verbatim; used for the `["exit", code, id]`
    /// trailer which is not a regular event.
    pub fn write_raw_json(&mut self, value: &Value) -> Result<(), std::io::Error> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        writeln!(file, "{value}")?;
        file.flush()
    }

    /// Flush and close; idempotent afterwards.
    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{parse_record_line, RecordLine};
    use std::fs;
    use tempfile::TempDir;

    fn recorder_at(dir: &TempDir) -> (std::path::PathBuf, Recorder) {
        let path = dir.path().join("stdout");
        let recorder = Recorder::create(
            &path,
            80,
            24,
            Some("bash -l".to_string()),
            Some("demo".to_string()),
            None,
        )
        .unwrap();
        (path, recorder)
    }

    #[test]
    fn test_header_reflects_creation_parameters() {
        let dir = TempDir::new().unwrap();
        let (path, mut recorder) = recorder_at(&dir);
        recorder.close();

        let content = fs::read_to_string(&path).unwrap();
        let first = content.lines().next().unwrap();
        match parse_record_line(first) {
            Some(RecordLine::Header(header)) => {
                assert_eq!(header.version, 2);
                assert_eq!(header.width, 80);
                assert_eq!(header.height, 24);
                assert_eq!(header.command.as_deref(), Some("bash -l"));
                assert_eq!(header.title.as_deref(), Some("demo"));
                assert!(header.timestamp.is_some());
            }
            other => panic!("expected header, got {other:?}"),
        }
    }

    #[test]
    fn test_event_round_trip_in_order() {
        let dir = TempDir::new().unwrap();
        let (path, mut recorder) = recorder_at(&dir);
        recorder.write_output(b"hello\r\n").unwrap();
        recorder.write_input(b"ls\r").unwrap();
        recorder.write_resize(120, 30).unwrap();
        recorder.write_marker("checkpoint").unwrap();
        recorder.close();

        let content = fs::read_to_string(&path).unwrap();
        let events: Vec<CastEvent> = content
            .lines()
            .skip(1)
            .map(|line| match parse_record_line(line) {
                Some(RecordLine::Event(event)) => event,
                other => panic!("expected event, got {other:?}"),
            })
            .collect();

        assert_eq!(events.len(), 4);
        assert_eq!(events[0].kind, CastEventKind::Output);
        assert_eq!(events[0].data, "hello\r\n");
        assert_eq!(events[1].kind, CastEventKind::Input);
        assert_eq!(events[1].data, "ls\r");
        assert_eq!(events[2].kind, CastEventKind::Resize);
        assert_eq!(events[2].data, "120x30");
        assert_eq!(events[3].kind, CastEventKind::Marker);
        assert_eq!(events[3].data, "checkpoint");
    }

    #[test]
    fn test_elapsed_is_monotone() {
        let dir = TempDir::new().unwrap();
        let (path, mut recorder) = recorder_at(&dir);
        for _ in 0..50 {
            recorder.write_output(b"x").unwrap();
        }
        recorder.close();

        let content = fs::read_to_string(&path).unwrap();
        let mut last = 0.0;
        for line in content.lines().skip(1) {
            match parse_record_line(line) {
                Some(RecordLine::Event(event)) => {
                    assert!(event.time >= last);
                    last = event.time;
                }
                other => panic!("expected event, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_invalid_utf8_is_replaced_not_fatal() {
        let dir = TempDir::new().unwrap();
        let (path, mut recorder) = recorder_at(&dir);
        recorder.write_output(b"ok \xff\xfe bytes").unwrap();
        recorder.close();

        let content = fs::read_to_string(&path).unwrap();
        let line = content.lines().nth(1).unwrap();
        match parse_record_line(line) {
            Some(RecordLine::Event(event)) => {
                assert!(event.data.starts_with("ok "));
                assert!(event.data.contains('\u{FFFD}'));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_exit_trailer_and_idempotent_close() {
        let dir = TempDir::new().unwrap();
        let (path, mut recorder) = recorder_at(&dir);
        recorder.write_output(b"bye").unwrap();
        recorder
            .write_raw_json(&serde_json::json!(["exit", 0, "s1"]))
            .unwrap();
        recorder.close();
        assert!(!recorder.is_open());
        recorder.close();
        // writes after close are swallowed
        recorder.write_output(b"late").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let last = content.lines().last().unwrap();
        match parse_record_line(last) {
            Some(RecordLine::Exit { code, session_id }) => {
                assert_eq!(code, 0);
                assert_eq!(session_id, "s1");
            }
            other => panic!("expected exit trailer, got {other:?}"),
        }
        assert!(!content.contains("late"));
    }

    #[test]
    fn test_header_only_recording_replays_as_header_alone() {
        let dir = TempDir::new().unwrap();
        let (path, mut recorder) = recorder_at(&dir);
        recorder.close();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
