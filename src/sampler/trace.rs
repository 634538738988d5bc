//! Trial trace as JSON lines.
//!
//! Records are serialized on the sampler's side and handed to a dedicated
//! writer thread as finished lines, so a bad record fails at `record` and the
//! file only ever holds complete rows.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::judgment::{Outcome, Presentation};

/// One attempted trial. Failed and unparseable trials are traced too.
#[derive(Debug, Clone, Serialize)]
pub struct TrialTrace {
    pub timestamp: DateTime<Utc>,
    pub subject_key: String,
    pub item_a: String,
    pub item_b: String,
    pub pair_index: usize,
    pub trial: u32,
    pub presentation: Presentation,
    pub attempts: u32,
    pub outcome: Option<Outcome>,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not encode trial trace: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("trace writer has stopped")]
    Closed,
    #[error("trace writer thread panicked")]
    Panicked,
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: TrialTrace) -> Result<(), TraceError>;
}

/// Cloneable handle feeding one trace file.
///
/// The file is complete once every clone is dropped and the paired
/// [`TraceWorker`] has been joined.
#[derive(Clone)]
pub struct JsonlTraceSink {
    lines: Sender<String>,
}

/// Owns the writer thread.
pub struct TraceWorker {
    thread: JoinHandle<Result<usize, TraceError>>,
}

impl JsonlTraceSink {
    /// Create (or truncate) `path` and start its writer.
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let out = BufWriter::new(File::create(path)?);
        let (lines, rx) = channel();
        let thread = thread::Builder::new()
            .name("trial-trace".to_string())
            .spawn(move || drain(rx, out))?;
        Ok((Self { lines }, TraceWorker { thread }))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: TrialTrace) -> Result<(), TraceError> {
        let line = serde_json::to_string(&event)?;
        self.lines.send(line).map_err(|_| TraceError::Closed)
    }
}

impl TraceWorker {
    /// Wait for the writer to flush. Returns the number of rows written.
    ///
    /// Blocks until every [`JsonlTraceSink`] clone has been dropped.
    pub fn join(self) -> Result<usize, TraceError> {
        self.thread.join().map_err(|_| TraceError::Panicked)?
    }
}

fn drain(rx: Receiver<String>, mut out: BufWriter<File>) -> Result<usize, TraceError> {
    let mut rows = 0;
    while let Ok(line) = rx.recv() {
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        rows += 1;
    }
    out.flush()?;
    Ok(rows)
}
