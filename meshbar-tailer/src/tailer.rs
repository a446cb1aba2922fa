use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use meshbar_core::EventRecord;
use thiserror::Error;

use crate::ansi::strip_ansi;
use crate::parse::parse_event_line;

/// Upper bound on bytes consumed by a single poll.
pub const MAX_READ_PER_POLL: u64 = 4 * 1024 * 1024;

/// A trailing fragment longer than this is flushed as a line of its own.
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TailerError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Output of one [`LogTailer::poll`].
#[derive(Debug, Default)]
pub struct TailBatch {
    pub events: Vec<EventRecord>,
    /// Non-empty lines that carried no structured event.
    pub lines: Vec<String>,
    /// The file was replaced or truncated since the previous poll.
    pub rotated: bool,
}

impl TailBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.lines.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(_meta: &fs::Metadata) -> Self {
        Self { dev: 0, ino: 0 }
    }
}

/// Incremental reader over a growing, possibly rotating log file.
///
/// A line split across two polls is held back until its newline arrives, so
/// events are never parsed from half a line. Bytes appended to a file after
/// the last poll but before it was rotated away are not read.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
    identity: Option<FileIdentity>,
    pending: Vec<u8>,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            identity: None,
            pending: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Forget offset, identity and any partial line.
    pub fn reset(&mut self) {
        self.offset = 0;
        self.identity = None;
        self.pending.clear();
    }

    pub fn poll(&mut self) -> Result<TailBatch, TailerError> {
        self.poll_at(Local::now())
    }

    /// Read everything appended since the last poll. A missing file is an
    /// empty batch, not an error.
    pub fn poll_at(&mut self, now: DateTime<Local>) -> Result<TailBatch, TailerError> {
        let mut batch = TailBatch::default();

        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(batch),
            Err(err) => return Err(self.io_err(err)),
        };
        let meta = file.metadata().map_err(|e| self.io_err(e))?;
        let identity = FileIdentity::of(&meta);

        let replaced = self.identity.is_some_and(|known| known != identity);
        let truncated = meta.len() < self.offset;
        if replaced || truncated {
            tracing::debug!(
                path = %self.path.display(),
                replaced,
                truncated,
                "log file rotated, reading from start",
            );
            self.offset = 0;
            self.pending.clear();
            batch.rotated = true;
        }
        self.identity = Some(identity);

        if meta.len() == self.offset {
            return Ok(batch);
        }

        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| self.io_err(e))?;
        let mut chunk = Vec::new();
        let read = file
            .take(MAX_READ_PER_POLL)
            .read_to_end(&mut chunk)
            .map_err(|e| self.io_err(e))?;
        self.offset += read as u64;

        for line in self.split_complete_lines(&chunk) {
            self.classify(&line, now, &mut batch);
        }
        Ok(batch)
    }

    /// Join with the held-back fragment and return complete lines; keeps the
    /// new trailing fragment for the next poll.
    fn split_complete_lines(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();

        let mut start = 0;
        while let Some(pos) = self.pending[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            lines.push(String::from_utf8_lossy(&self.pending[start..end]).into_owned());
            start = end + 1;
        }
        self.pending.drain(..start);

        if self.pending.len() > MAX_PENDING_BYTES {
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
        }
        lines
    }

    fn classify(&self, raw: &str, now: DateTime<Local>, batch: &mut TailBatch) {
        let stripped = strip_ansi(raw.trim_end_matches('\r'));
        let line = stripped.trim();
        if line.is_empty() {
            return;
        }
        match parse_event_line(line, now) {
            Some(event) => batch.events.push(event),
            None => batch.lines.push(line.to_string()),
        }
    }

    fn io_err(&self, source: io::Error) -> TailerError {
        TailerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &Path, text: &str) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open log");
        file.write_all(text.as_bytes()).expect("append");
    }

    #[test]
    fn missing_file_is_empty_batch() {
        let dir = TempDir::new().expect("tempdir");
        let mut tailer = LogTailer::new(dir.path().join("absent.log"));
        let batch = tailer.poll().expect("poll");
        assert!(batch.is_empty());
        assert!(!batch.rotated);
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("core.log");
        let mut tailer = LogTailer::new(&log);

        append(&log, "INFO {\"event\":{\"PeerAdded\":");
        let first = tailer.poll().expect("first poll");
        assert!(first.is_empty());

        append(&log, "7}}\nplain tail\n");
        let second = tailer.poll().expect("second poll");
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].details, "7");
        assert_eq!(second.lines, vec!["plain tail".to_string()]);
    }

    #[test]
    fn ansi_and_blank_lines_are_cleaned() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("core.log");
        append(&log, "\x1b[32m INFO\x1b[0m started\r\n\n   \n");

        let mut tailer = LogTailer::new(&log);
        let batch = tailer.poll().expect("poll");
        assert_eq!(batch.lines, vec!["INFO started".to_string()]);
    }

    #[test]
    fn truncation_in_place_restarts_at_zero() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("core.log");
        append(&log, "first line that is fairly long\n");

        let mut tailer = LogTailer::new(&log);
        tailer.poll().expect("poll");

        fs::write(&log, "short\n").expect("truncate");
        let batch = tailer.poll().expect("poll after truncate");
        assert!(batch.rotated);
        assert_eq!(batch.lines, vec!["short".to_string()]);
        assert_eq!(tailer.offset(), 6);
    }

    #[test]
    fn reset_rereads_from_start() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("core.log");
        append(&log, "one\n");

        let mut tailer = LogTailer::new(&log);
        assert_eq!(tailer.poll().expect("poll").lines.len(), 1);
        assert!(tailer.poll().expect("idle poll").is_empty());

        tailer.reset();
        assert_eq!(tailer.poll().expect("poll after reset").lines, vec!["one"]);
    }
}
