//! Journal service: append-only per-table action log.
//!
//! DESIGN
//! ======
//! One newline-delimited JSON file per table. Each record is
//! `{prev?, act?}`; `prev` points at the record this one follows. An absent
//! `prev` means the line directly above, `{line: -1}` marks the start of the
//! chain, and a pointer carrying `file` continues in another table's journal
//! (that is how a forked table inherits its parent's history).
//!
//! Loading walks backwards from the last line collecting every record with an
//! `act`, then returns them oldest first. Undo and redo only append
//! pointer records, so walking back from the tail always yields exactly the
//! actions that make up the current state.
//!
//! ERROR HANDLING
//! ==============
//! A line that fails to parse, or a pointer that does not point backwards,
//! discards what was collected so far and resumes one line further up; the
//! replay is then reported as not clean. Cycles and missing parents fail the
//! load. Write failures are logged once and the journal keeps running
//! without a file.
//!
//! WRITER
//! ======
//! Each open journal owns a writer task holding the file. `dump` only
//! buffers; flushing hands the buffer to the writer over an unbounded
//! channel, so table handlers never wait on disk I/O. The writer clears a
//! shared durability flag on its first failed write.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::services::action::RawAction;
use crate::services::events;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal {0} is referenced twice in one chain")]
    Cycle(String),
    #[error("journal {0} referenced by a pointer does not exist")]
    MissingParent(String),
    #[error("invalid journal name {0:?}")]
    InvalidName(String),
}

/// Position of a record. `file` is `None` for the table's own journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    pub line: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

impl Pointer {
    /// Start of the chain.
    pub const ORIGIN: Self = Self { line: -1, file: None };

    #[must_use]
    pub fn line(line: i64) -> Self {
        Self { line, file: None }
    }

    #[must_use]
    pub fn in_file(line: i64, file: impl Into<String>) -> Self {
        Self { line, file: Some(file.into()) }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<Pointer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub act: Option<RawAction>,
}

/// Journal names double as file names, so they are restricted to a safe alphabet.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

// =============================================================================
// SOURCES
// =============================================================================

/// Read access to journal contents by name.
pub trait RecordSource {
    /// Full text of the named journal, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns any error other than the journal being absent.
    fn read(&self, name: &str) -> Result<Option<String>, JournalError>;
}

/// Journals stored as files inside one directory.
pub struct FsSource<'a> {
    dir: &'a Path,
}

impl<'a> FsSource<'a> {
    #[must_use]
    pub fn new(dir: &'a Path) -> Self {
        Self { dir }
    }
}

impl RecordSource for FsSource<'_> {
    fn read(&self, name: &str) -> Result<Option<String>, JournalError> {
        if !is_valid_name(name) {
            return Err(JournalError::InvalidName(name.to_owned()));
        }
        match std::fs::read_to_string(self.dir.join(name)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl RecordSource for HashMap<String, String> {
    fn read(&self, name: &str) -> Result<Option<String>, JournalError> {
        Ok(self.get(name).cloned())
    }
}

// =============================================================================
// REPLAY
// =============================================================================

/// Result of walking a journal chain.
#[derive(Debug, Default)]
pub struct Replay {
    /// Actions oldest first, each with the place it was recorded at.
    pub entries: Vec<(Pointer, RawAction)>,
    /// `false` when corrupt records were skipped.
    pub clean: bool,
    /// Number of `\n`-separated segments in the table's own journal.
    pub segments: usize,
    /// The own journal does not end with a newline.
    pub partial_tail: bool,
}

/// Walk the chain ending at the tail of journal `name`.
///
/// # Errors
///
/// Fails on I/O errors, cyclic chains and pointers into missing journals. A
/// missing `name` itself is an empty history.
pub fn replay(source: &impl RecordSource, name: &str) -> Result<Replay, JournalError> {
    let mut result = Replay { clean: true, segments: 1, ..Replay::default() };
    // Newest first while walking.
    let mut collected: Vec<(Pointer, RawAction)> = Vec::new();
    let mut visited: HashSet<String> = HashSet::new();
    let mut current = name.to_owned();
    let mut start: Option<i64> = None;

    loop {
        if !visited.insert(current.clone()) {
            return Err(JournalError::Cycle(current));
        }
        let own = current == name;
        let text = match source.read(&current)? {
            Some(text) => text,
            None if own => return Ok(result),
            None => return Err(JournalError::MissingParent(current)),
        };
        let lines: Vec<&str> = text.split('\n').collect();
        if own {
            result.segments = lines.len();
            result.partial_tail = lines.last().is_some_and(|l| !l.is_empty());
        }

        let mut line = start.unwrap_or(lines.len() as i64 - 1);
        let mut next: Option<(String, i64)> = None;
        while line >= 0 {
            let parsed = usize::try_from(line)
                .ok()
                .and_then(|i| lines.get(i))
                .map(|text| (text.is_empty(), serde_json::from_str::<Record>(text)));
            let record = match parsed {
                Some((true, _)) => {
                    line -= 1;
                    continue;
                }
                Some((false, Ok(record))) => Some(record),
                Some((false, Err(e))) => {
                    warn!(journal = %current, line, error = %e, "unreadable journal record");
                    None
                }
                None => {
                    warn!(journal = %current, line, "journal pointer out of range");
                    line = line.min(lines.len() as i64);
                    None
                }
            };
            let Some(record) = record else {
                result.clean = false;
                collected.clear();
                line -= 1;
                continue;
            };

            if let Some(act) = record.act {
                let place = if own { Pointer::line(line) } else { Pointer::in_file(line, current.clone()) };
                collected.push((place, act));
            }
            match record.prev {
                Some(Pointer { line: prev, file: Some(file) }) if file != current => {
                    next = Some((file, prev));
                    break;
                }
                Some(Pointer { line: prev, .. }) if prev >= line => {
                    warn!(journal = %current, line, prev, "journal pointer does not point backwards");
                    result.clean = false;
                    collected.clear();
                    line -= 1;
                }
                Some(Pointer { line: prev, .. }) => line = prev,
                None => line -= 1,
            }
        }

        match next {
            Some((file, line)) => {
                current = file;
                start = Some(line);
            }
            None => break,
        }
    }

    collected.reverse();
    result.entries = collected;
    Ok(result)
}

// =============================================================================
// WRITER
// =============================================================================

enum WriteCommand {
    Append(String),
    Barrier(oneshot::Sender<()>),
}

/// Handle to the task that owns a journal file.
struct Writer {
    tx: mpsc::UnboundedSender<WriteCommand>,
    durable: Arc<AtomicBool>,
}

impl Writer {
    /// Spawn the writer task. Must be called inside a tokio runtime.
    fn spawn(name: &str, file: File) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let durable = Arc::new(AtomicBool::new(true));
        let flag = durable.clone();
        let name = name.to_owned();
        tokio::spawn(async move {
            let mut out = Some(tokio::fs::File::from_std(file));
            while let Some(command) = rx.recv().await {
                match command {
                    WriteCommand::Append(text) => {
                        let Some(file) = out.as_mut() else {
                            continue;
                        };
                        let written = match file.write_all(text.as_bytes()).await {
                            Ok(()) => file.flush().await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = written {
                            warn!(journal = %name, error = %e, "journal write failed; continuing without persistence");
                            events::log(
                                "tableDumpError",
                                serde_json::json!({ "place": "tableDumpWriting", "table": name, "err": e.to_string() }),
                            );
                            flag.store(false, Ordering::Release);
                            out = None;
                        }
                    }
                    WriteCommand::Barrier(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!(journal = %name, "journal writer stopped");
        });
        Self { tx, durable }
    }

    fn is_durable(&self) -> bool {
        self.durable.load(Ordering::Acquire)
    }

    /// Resolves once every command queued before it has been handled.
    fn barrier(&self) -> impl Future<Output = ()> + Send + 'static {
        let (done, wait) = oneshot::channel();
        let queued = self.tx.send(WriteCommand::Barrier(done)).is_ok();
        async move {
            if queued {
                let _ = wait.await;
            }
        }
    }
}

/// Appending side of a table's journal.
pub struct Journal {
    name: String,
    writer: Option<Writer>,
    buffer: String,
    /// Index the next appended record will occupy.
    next_line: i64,
    pending_since: Option<Instant>,
    debounce: Duration,
}

impl Journal {
    /// Open `dir/name` for appending and replay its chain. Reads the file
    /// synchronously; async callers run it on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns replay errors, or an I/O error if the file cannot be opened.
    pub fn open(dir: &Path, name: &str, debounce: Duration) -> Result<(Self, Replay), JournalError> {
        let replay = replay(&FsSource::new(dir), name)?;
        let mut out = OpenOptions::new().create(true).append(true).open(dir.join(name))?;
        let mut next_line = replay.segments as i64 - 1;
        if replay.partial_tail {
            out.write_all(b"\n")?;
            next_line += 1;
        }
        Ok((Self::with_file(name, out, next_line, debounce), replay))
    }

    fn with_file(name: &str, file: File, next_line: i64, debounce: Duration) -> Self {
        Self {
            name: name.to_owned(),
            writer: Some(Writer::spawn(name, file)),
            buffer: String::new(),
            next_line,
            pending_since: None,
            debounce,
        }
    }

    /// A journal that records nothing.
    #[cfg(test)]
    #[must_use]
    pub fn detached(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            writer: None,
            buffer: String::new(),
            next_line: 0,
            pending_since: None,
            debounce: Duration::ZERO,
        }
    }

    /// Create a new journal holding only `genesis`. Returns `false` when the
    /// name is already taken.
    ///
    /// # Errors
    ///
    /// Returns any I/O error other than the file already existing.
    pub fn create(dir: &Path, name: &str, genesis: &Record) -> Result<bool, JournalError> {
        if !is_valid_name(name) {
            return Err(JournalError::InvalidName(name.to_owned()));
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(dir.join(name)) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut line = serde_json::to_string(genesis).map_err(std::io::Error::other)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(true)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Place the next appended record will occupy.
    #[must_use]
    pub fn current_place(&self) -> Pointer {
        Pointer::line(self.next_line)
    }

    /// Whether records are still being persisted.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.writer.as_ref().is_some_and(Writer::is_durable)
    }

    /// Resolves once the writer has handled everything flushed so far.
    #[cfg(test)]
    pub fn synced(&self) -> impl Future<Output = ()> + Send + 'static {
        let barrier = self.writer.as_ref().map(Writer::barrier);
        async move {
            if let Some(barrier) = barrier {
                barrier.await;
            }
        }
    }

    fn simplify(&self, place: &Pointer) -> Option<Pointer> {
        match &place.file {
            Some(file) if *file != self.name => Some(place.clone()),
            _ if place.line == self.next_line - 1 => None,
            _ => Some(Pointer::line(place.line)),
        }
    }

    /// Append a record following `prev`. Important records are written
    /// immediately, others once the debounce window elapses.
    pub fn dump(&mut self, prev: &Pointer, important: bool, act: Option<RawAction>) {
        if !self.is_durable() {
            return;
        }
        let record = Record { prev: self.simplify(prev), act };
        let text = match serde_json::to_string(&record) {
            Ok(text) => text,
            Err(e) => {
                warn!(journal = %self.name, error = %e, "failed to encode journal record");
                return;
            }
        };
        self.buffer.push_str(&text);
        self.buffer.push('\n');
        self.next_line += 1;
        if important {
            self.flush();
        } else if self.pending_since.is_none() {
            self.pending_since = Some(Instant::now());
        }
    }

    /// Hand buffered records to the writer.
    pub fn flush(&mut self) {
        self.pending_since = None;
        if self.buffer.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.buffer);
        let Some(writer) = self.writer.as_ref() else {
            return;
        };
        debug!(journal = %self.name, bytes = text.len(), "flushing journal");
        if writer.tx.send(WriteCommand::Append(text)).is_err() {
            warn!(journal = %self.name, "journal writer is gone; continuing without persistence");
            self.writer = None;
        }
    }

    /// Flush if the oldest buffered record has waited out the debounce window.
    pub fn flush_if_due(&mut self, now: Instant) {
        if let Some(since) = self.pending_since {
            if now.duration_since(since) >= self.debounce {
                self.flush();
            }
        }
    }

    /// Flush and stop the writer. The returned future resolves once the
    /// file holds every record.
    pub fn close(&mut self) -> impl Future<Output = ()> + Send + 'static {
        self.flush();
        let writer = self.writer.take();
        async move {
            if let Some(writer) = writer {
                writer.barrier().await;
            }
        }
    }
}

#[cfg(test)]
#[path = "journal_test.rs"]
mod tests;
