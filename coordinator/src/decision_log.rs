//! Durable record of transaction decisions.
//!
//! The log is append-only. Each record carries the transaction ID, the
//! decision, a millisecond timestamp and the participant IDs so recovery
//! can find everyone that may hold tentative state. A transaction gets at
//! most one terminal record; writing the same terminal decision again is a
//! no-op and writing a different one fails with `ConflictingDecision`.
//!
//! `FileDecisionLog` stores one JSON object per line and syncs the file
//! after each append. A partial last line left by a crash mid-append is
//! dropped when the log is reopened.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use twophase_common::{unix_millis, Decision, ParticipantId, Result, TransactionId, TwoPhaseError};

/// One record in the decision log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionLogEntry {
    pub tx_id: TransactionId,
    pub outcome: Decision,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub participant_ids: Vec<ParticipantId>,
}

impl DecisionLogEntry {
    /// Build a record stamped with the current time.
    pub fn new(tx_id: TransactionId, outcome: Decision, participant_ids: Vec<ParticipantId>) -> Self {
        Self {
            tx_id,
            outcome,
            timestamp: unix_millis(),
            participant_ids,
        }
    }
}

/// Append-only store of decisions.
pub trait DecisionLog: Send + Sync {
    /// Record a decision. Returns `false` when the record was an idempotent repeat.
    fn append(&self, entry: DecisionLogEntry) -> Result<bool>;

    /// All records in append order.
    fn entries(&self) -> Result<Vec<DecisionLogEntry>>;

    /// Latest decision recorded for a transaction.
    fn decision(&self, tx_id: &TransactionId) -> Option<Decision>;

    /// Latest record of every transaction that has no terminal decision.
    fn pending(&self) -> Vec<DecisionLogEntry>;

    /// Number of stored records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-transaction view of the log used to check appends.
#[derive(Debug, Default)]
struct DecisionIndex {
    latest: HashMap<TransactionId, DecisionLogEntry>,
    /// First-seen order of transactions.
    order: Vec<TransactionId>,
    records: usize,
}

impl DecisionIndex {
    /// Decide whether `entry` must be written.
    fn check(&self, entry: &DecisionLogEntry) -> Result<bool> {
        let Some(latest) = self.latest.get(&entry.tx_id) else {
            return Ok(true);
        };

        if latest.outcome.is_terminal() {
            if latest.outcome == entry.outcome {
                return Ok(false);
            }
            return Err(TwoPhaseError::ConflictingDecision {
                tx_id: entry.tx_id,
                existing: latest.outcome,
                attempted: entry.outcome,
            });
        }

        Ok(latest.outcome != entry.outcome || latest.participant_ids != entry.participant_ids)
    }

    /// Record an entry that has already been written.
    fn apply(&mut self, entry: DecisionLogEntry) {
        if !self.latest.contains_key(&entry.tx_id) {
            self.order.push(entry.tx_id);
        }
        self.latest.insert(entry.tx_id, entry);
        self.records += 1;
    }

    fn decision(&self, tx_id: &TransactionId) -> Option<Decision> {
        self.latest.get(tx_id).map(|entry| entry.outcome)
    }

    fn pending(&self) -> Vec<DecisionLogEntry> {
        self.order
            .iter()
            .filter_map(|tx_id| self.latest.get(tx_id))
            .filter(|entry| !entry.outcome.is_terminal())
            .cloned()
            .collect()
    }
}

/// Decision log held in memory. Decisions do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryDecisionLog {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    entries: Vec<DecisionLogEntry>,
    index: DecisionIndex,
}

impl MemoryDecisionLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DecisionLog for MemoryDecisionLog {
    fn append(&self, entry: DecisionLogEntry) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.index.check(&entry)? {
            return Ok(false);
        }
        inner.entries.push(entry.clone());
        inner.index.apply(entry);
        Ok(true)
    }

    fn entries(&self) -> Result<Vec<DecisionLogEntry>> {
        Ok(self.inner.lock().entries.clone())
    }

    fn decision(&self, tx_id: &TransactionId) -> Option<Decision> {
        self.inner.lock().index.decision(tx_id)
    }

    fn pending(&self) -> Vec<DecisionLogEntry> {
        self.inner.lock().index.pending()
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

/// Decision log backed by a JSON-lines file.
pub struct FileDecisionLog {
    path: PathBuf,
    inner: Mutex<FileInner>,
}

struct FileInner {
    writer: BufWriter<File>,
    index: DecisionIndex,
}

impl FileDecisionLog {
    /// Open or create the log at `path`, replaying existing records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut index = DecisionIndex::default();
        if path.exists() {
            let replay = read_records(&path)?;
            if let Some(tail) = replay.tail {
                repair_tail(&path, replay.valid_len, tail)?;
            }
            for entry in replay.entries {
                index.apply(entry);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        info!(
            path = %path.display(),
            records = index.records,
            pending = index.pending().len(),
            "Decision log opened"
        );

        Ok(Self {
            path,
            inner: Mutex::new(FileInner {
                writer: BufWriter::new(file),
                index,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DecisionLog for FileDecisionLog {
    fn append(&self, entry: DecisionLogEntry) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.index.check(&entry)? {
            return Ok(false);
        }

        let line = serde_json::to_string(&entry)
            .map_err(|e| TwoPhaseError::DecisionLog(format!("Failed to encode record: {e}")))?;
        writeln!(inner.writer, "{line}")?;
        inner.writer.flush()?;
        inner.writer.get_ref().sync_data()?;

        debug!(tx_id = %entry.tx_id, outcome = %entry.outcome, "Decision recorded");
        inner.index.apply(entry);
        Ok(true)
    }

    fn entries(&self) -> Result<Vec<DecisionLogEntry>> {
        // Hold the lock so a concurrent append cannot leave a partial line.
        let _inner = self.inner.lock();
        Ok(read_records(&self.path)?.entries)
    }

    fn decision(&self, tx_id: &TransactionId) -> Option<Decision> {
        self.inner.lock().index.decision(tx_id)
    }

    fn pending(&self) -> Vec<DecisionLogEntry> {
        self.inner.lock().index.pending()
    }

    fn len(&self) -> usize {
        self.inner.lock().index.records
    }
}

/// What replay found after the last newline-terminated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    /// A complete record missing only its newline.
    Unterminated,
    /// A partial record left by an interrupted append.
    Torn,
}

struct Replay {
    entries: Vec<DecisionLogEntry>,
    /// Bytes up to and including the last good record.
    valid_len: u64,
    tail: Option<Tail>,
}

/// Parse every record in the file.
///
/// A malformed line fails the replay unless it is the final line and has no
/// newline, which is what a crash in the middle of an append leaves behind.
fn read_records(path: &Path) -> Result<Replay> {
    let bytes = std::fs::read(path)?;
    let mut entries = Vec::new();
    let mut offset = 0usize;
    let mut tail = None;

    for (number, line) in bytes.split_inclusive(|b| *b == b'\n').enumerate() {
        let terminated = line.last() == Some(&b'\n');
        let body = if terminated { &line[..line.len() - 1] } else { line };

        if body.iter().all(u8::is_ascii_whitespace) {
            offset += line.len();
            continue;
        }

        match serde_json::from_slice::<DecisionLogEntry>(body) {
            Ok(entry) => {
                entries.push(entry);
                offset += line.len();
                if !terminated {
                    tail = Some(Tail::Unterminated);
                }
            }
            Err(e) if !terminated => {
                warn!(
                    path = %path.display(),
                    line = number + 1,
                    bytes = body.len(),
                    error = %e,
                    "Ignoring partial record at end of decision log"
                );
                tail = Some(Tail::Torn);
            }
            Err(e) => {
                return Err(TwoPhaseError::DecisionLog(format!(
                    "Malformed record at {}:{}: {e}",
                    path.display(),
                    number + 1
                )));
            }
        }
    }

    Ok(Replay {
        entries,
        valid_len: offset as u64,
        tail,
    })
}

/// Make the file end on a record boundary before appending to it.
fn repair_tail(path: &Path, valid_len: u64, tail: Tail) -> Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    match tail {
        Tail::Torn => {
            file.set_len(valid_len)?;
            warn!(path = %path.display(), len = valid_len, "Truncated partial record");
        }
        Tail::Unterminated => {
            file.seek(SeekFrom::End(0))?;
            file.write_all(b"\n")?;
        }
    }
    file.sync_data()?;
    Ok(())
}
