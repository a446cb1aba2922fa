//! Incremental engine-log reader for `meshbar-tailer`.
//!
//! [`LogTailer::poll`] reads whatever bytes were appended since the last poll,
//! strips terminal escapes, and splits lines into structured
//! [`EventRecord`](meshbar_core::EventRecord)s and plain diagnostic text.
//! Rotation (new inode) and in-place truncation restart reading at offset 0.

pub mod ansi;
pub mod parse;
pub mod pretty;
mod tailer;

pub use parse::parse_event_line;
pub use pretty::{pretty_print, Pretty};
pub use tailer::{LogTailer, TailBatch, TailerError};
