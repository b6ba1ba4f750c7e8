//! Append-only transcript of every frame exchanged with the monitor.
//!
//! Entries look like:
//!
//! ```text
//! [2026-01-02T03:04:05Z] QUERY: {"execute":"cont","id":26}
//! [2026-01-02T03:04:05Z] REPLY: {"return": {}, "id": 26}
//!
//! [2026-01-02T03:04:06Z] EVENT: {"event":"RESUME"}
//!
//! ```
//!
//! Writes racing a concurrent [`WireLog::close`] are expected (the read loop
//! may still be logging an event while the connection is torn down), so a
//! write after close is a successful zero-byte write.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Kind of frame being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entry {
    /// Outbound request.
    Query,
    /// Inbound reply.
    Reply,
    /// Inbound event.
    Event,
}

impl Entry {
    /// Label and trailing separator for this kind of entry.
    const fn parts(self) -> (&'static str, &'static str) {
        match self {
            Self::Query => ("QUERY", "\n"),
            Self::Reply => ("REPLY", "\n\n"),
            Self::Event => ("EVENT", "\n\n"),
        }
    }
}

/// Lock-guarded log file. `None` once closed.
#[derive(Debug)]
pub struct WireLog {
    /// The open file, or `None` after [`close`](Self::close).
    file: Mutex<Option<File>>,
}

impl WireLog {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(Some(file)),
        })
    }

    /// Returns a log that is already closed; every write is a no-op.
    pub const fn closed() -> Self {
        Self {
            file: Mutex::new(None),
        }
    }

    /// Appends raw bytes. Returns `Ok(0)` if the log is closed.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self.lock().as_mut() {
            Some(f) => f.write(buf),
            None => Ok(0),
        }
    }

    /// Closes the log. Calling it again is a no-op.
    pub fn close(&self) -> io::Result<()> {
        let mut guard = self.lock();
        if let Some(mut f) = guard.take() {
            f.flush()?;
        }
        Ok(())
    }

    /// Returns `true` once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Appends one timestamped entry for `frame` in a single write.
    pub(crate) fn record(&self, entry: Entry, frame: &[u8]) -> io::Result<usize> {
        let (label, trailer) = entry.parts();
        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let frame = String::from_utf8_lossy(frame);
        let line = format!("[{now}] {label}: {}{trailer}", frame.trim_end());

        match self.lock().as_mut() {
            Some(f) => f.write_all(line.as_bytes()).map(|()| line.len()),
            None => Ok(0),
        }
    }

    /// Locks the file slot, ignoring poisoning (the slot has no invariants).
    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for &WireLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        WireLog::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.lock().as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}
