//! Attendance ledger: who has been marked present in this session.
//!
//! Each identity is persisted at most once per session. The row is written to
//! the sink before the identity joins the seen-set, so a failed write leaves
//! the identity unmarked and a later detection can retry.

use chrono::{DateTime, Local};
use rollcall_core::Identity;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Column names of a session file, in order.
pub const CSV_HEADER: [&str; 3] = ["identity", "timestamp", "confidence"];

/// One identity's first sighting in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity: Identity,
    pub timestamp: DateTime<Local>,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    Recorded(AttendanceRecord),
    AlreadyMarked,
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("session file already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("{path}: unexpected header {found:?}")]
    BadHeader { path: PathBuf, found: Vec<String> },
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("persisting record failed: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("timestamp went backwards: {given} is before {last}")]
    TimestampRegressed {
        last: DateTime<Local>,
        given: DateTime<Local>,
    },
    #[error("identity {0} appears more than once in the session")]
    DuplicateRecord(Identity),
}

/// Durable, append-only destination for attendance records.
pub trait RecordSink {
    fn append(&mut self, record: &AttendanceRecord) -> Result<(), PersistenceError>;
}

/// In-memory sink, mostly for tests and dry runs.
impl RecordSink for Vec<AttendanceRecord> {
    fn append(&mut self, record: &AttendanceRecord) -> Result<(), PersistenceError> {
        self.push(record.clone());
        Ok(())
    }
}

/// CSV session file.
///
/// Each row is encoded in memory and written to the file in one step, then
/// synced. A row that fails to reach the disk is cut off again, so the file
/// only ever holds whole rows that `append` reported as written.
pub struct CsvSink {
    path: PathBuf,
    file: File,
}

impl CsvSink {
    /// Create a new session file with a header row. Refuses to overwrite.
    pub fn create(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(path)
            .map_err(|source| match source.kind() {
                io::ErrorKind::AlreadyExists => PersistenceError::AlreadyExists(path.to_path_buf()),
                _ => PersistenceError::Io {
                    path: path.to_path_buf(),
                    source,
                },
            })?;

        let mut sink = Self {
            path: path.to_path_buf(),
            file,
        };
        let header = sink.encode(|w| w.write_record(CSV_HEADER))?;
        sink.write_row(&header)?;
        tracing::info!(path = %path.display(), "session file created");
        Ok(sink)
    }

    /// Append rows to an existing session file; the header is not rewritten.
    pub fn append_to(path: &Path) -> Result<Self, PersistenceError> {
        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|source| PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode<F>(&self, fill: F) -> Result<Vec<u8>, PersistenceError>
    where
        F: FnOnce(&mut csv::Writer<Vec<u8>>) -> csv::Result<()>,
    {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        fill(&mut writer)?;
        writer.into_inner().map_err(|e| PersistenceError::Io {
            path: self.path.clone(),
            source: io::Error::new(e.error().kind(), e.error().to_string()),
        })
    }

    fn write_row(&mut self, row: &[u8]) -> Result<(), PersistenceError> {
        write_or_rollback(&mut self.file, row, |file, bytes| {
            file.write_all(bytes)?;
            file.sync_data()
        })
        .map_err(|source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl RecordSink for CsvSink {
    fn append(&mut self, record: &AttendanceRecord) -> Result<(), PersistenceError> {
        let row = self.encode(|w| w.serialize(record))?;
        self.write_row(&row)
    }
}

/// Run `write` against `file`; if it fails, truncate the file back to its
/// previous length so no partial row survives.
fn write_or_rollback<W>(file: &mut File, bytes: &[u8], write: W) -> io::Result<()>
where
    W: FnOnce(&mut File, &[u8]) -> io::Result<()>,
{
    let prev_len = file.metadata()?.len();
    if let Err(e) = write(file, bytes) {
        if let Err(trunc) = file.set_len(prev_len) {
            tracing::error!(error = %trunc, len = prev_len, "cannot roll back partial row");
        }
        return Err(e);
    }
    Ok(())
}

/// Read every record of a session file, checking the header first.
pub fn read_records(path: &Path) -> Result<Vec<AttendanceRecord>, PersistenceError> {
    let mut reader = csv::Reader::from_path(path)?;
    let header = reader.headers()?;
    if !header.iter().eq(CSV_HEADER) {
        return Err(PersistenceError::BadHeader {
            path: path.to_path_buf(),
            found: header.iter().map(str::to_string).collect(),
        });
    }
    reader
        .deserialize()
        .collect::<Result<Vec<AttendanceRecord>, csv::Error>>()
        .map_err(PersistenceError::from)
}

/// Session state plus the sink it persists to.
pub struct AttendanceLedger<S = CsvSink> {
    sink: S,
    seen: HashSet<Identity>,
    records: Vec<AttendanceRecord>,
    last_timestamp: Option<DateTime<Local>>,
}

impl AttendanceLedger<CsvSink> {
    /// Start a fresh session file at `path`.
    pub fn create(path: &Path) -> Result<Self, LedgerError> {
        Ok(Self::new(CsvSink::create(path)?))
    }

    /// Continue an earlier session file: its identities count as already marked.
    pub fn resume(path: &Path) -> Result<Self, LedgerError> {
        let records = read_records(path)?;
        let ledger = Self::with_records(CsvSink::append_to(path)?, records)?;
        tracing::info!(path = %path.display(), marked = ledger.len(), "session resumed");
        Ok(ledger)
    }
}

impl<S: RecordSink> AttendanceLedger<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            seen: HashSet::new(),
            records: Vec::new(),
            last_timestamp: None,
        }
    }

    /// Seed the session with records that are already persisted in `sink`.
    pub fn with_records(sink: S, records: Vec<AttendanceRecord>) -> Result<Self, LedgerError> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.identity.clone()) {
                return Err(LedgerError::DuplicateRecord(record.identity.clone()));
            }
        }
        let last_timestamp = records.iter().map(|r| r.timestamp).max();
        Ok(Self {
            sink,
            seen,
            records,
            last_timestamp,
        })
    }

    /// Mark `identity` present at `timestamp`.
    ///
    /// Timestamps must not go backwards between calls. The first sighting of
    /// an identity is persisted and returned; later sightings are no-ops.
    pub fn mark_present(
        &mut self,
        identity: &Identity,
        timestamp: DateTime<Local>,
        confidence: f32,
    ) -> Result<MarkOutcome, LedgerError> {
        if let Some(last) = self.last_timestamp {
            if timestamp < last {
                return Err(LedgerError::TimestampRegressed {
                    last,
                    given: timestamp,
                });
            }
        }

        if self.seen.contains(identity) {
            self.last_timestamp = Some(timestamp);
            return Ok(MarkOutcome::AlreadyMarked);
        }

        let record = AttendanceRecord {
            identity: identity.clone(),
            timestamp,
            confidence,
        };
        self.sink.append(&record)?;

        self.seen.insert(identity.clone());
        self.records.push(record.clone());
        self.last_timestamp = Some(timestamp);
        tracing::info!(identity = %identity, confidence, "marked present");
        Ok(MarkOutcome::Recorded(record))
    }

    /// Records in the order they were marked.
    pub fn records(&self) -> &[AttendanceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_marked(&self, identity: &Identity) -> bool {
        self.seen.contains(identity)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Local>> {
        self.last_timestamp
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn at(secs: i64) -> DateTime<Local> {
        Local.timestamp_opt(1_725_000_000 + secs, 0).unwrap()
    }

    pub(crate) fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    /// Fails the first `failures` appends, then behaves like a Vec.
    pub(crate) struct FlakySink {
        pub failures: usize,
        pub written: Vec<AttendanceRecord>,
    }

    impl RecordSink for FlakySink {
        fn append(&mut self, record: &AttendanceRecord) -> Result<(), PersistenceError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(PersistenceError::Io {
                    path: PathBuf::from("/dev/full"),
                    source: io::Error::new(io::ErrorKind::Other, "no space left on device"),
                });
            }
            self.written.push(record.clone());
            Ok(())
        }
    }

    #[test]
    fn test_first_sighting_recorded_then_already_marked() {
        let mut ledger = AttendanceLedger::new(Vec::new());
        let outcome = ledger.mark_present(&id("alice"), at(0), 0.9).unwrap();
        assert!(matches!(outcome, MarkOutcome::Recorded(ref r) if r.identity == id("alice")));
        assert_eq!(ledger.mark_present(&id("alice"), at(5), 0.95).unwrap(), MarkOutcome::AlreadyMarked);

        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.sink().len(), 1);
        assert_eq!(ledger.records()[0].timestamp, at(0));
        assert!((ledger.records()[0].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_records_keep_marking_order() {
        let mut ledger = AttendanceLedger::new(Vec::new());
        for (i, who) in ["carol", "alice", "bob"].iter().enumerate() {
            ledger.mark_present(&id(who), at(i as i64), 0.7).unwrap();
        }
        let order: Vec<&str> = ledger.records().iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(order, ["carol", "alice", "bob"]);
    }

    #[test]
    fn test_timestamp_regression_rejected_without_write() {
        let mut ledger = AttendanceLedger::new(Vec::new());
        ledger.mark_present(&id("alice"), at(10), 0.9).unwrap();
        let err = ledger.mark_present(&id("bob"), at(9), 0.9).unwrap_err();
        assert!(matches!(err, LedgerError::TimestampRegressed { .. }));
        assert!(!ledger.is_marked(&id("bob")));
        assert_eq!(ledger.sink().len(), 1);

        // equal timestamps are fine
        ledger.mark_present(&id("bob"), at(10), 0.9).unwrap();
        assert!(ledger.is_marked(&id("bob")));
    }

    #[test]
    fn test_failed_write_leaves_identity_unmarked() {
        let sink = FlakySink { failures: 1, written: Vec::new() };
        let mut ledger = AttendanceLedger::new(sink);
        let err = ledger.mark_present(&id("alice"), at(0), 0.8).unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(_)));
        assert!(!ledger.is_marked(&id("alice")));
        assert!(ledger.is_empty());
        assert_eq!(ledger.last_timestamp(), None);

        let retry = ledger.mark_present(&id("alice"), at(1), 0.8).unwrap();
        assert!(matches!(retry, MarkOutcome::Recorded(_)));
        assert_eq!(ledger.sink().written.len(), 1);
    }

    #[test]
    fn test_with_records_rejects_duplicates() {
        let record = AttendanceRecord { identity: id("alice"), timestamp: at(0), confidence: 0.5 };
        let result = AttendanceLedger::with_records(Vec::new(), vec![record.clone(), record]);
        assert!(matches!(result, Err(LedgerError::DuplicateRecord(_))));
    }

    #[test]
    fn test_csv_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("attendance_20240830_090000.csv");
        let mut ledger = AttendanceLedger::create(&path).unwrap();
        ledger.mark_present(&id("alice"), at(0), 0.9).unwrap();
        ledger.mark_present(&id("alice"), at(1), 0.9).unwrap();
        ledger.mark_present(&id("bob"), at(2), 0.75).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "identity,timestamp,confidence");
        assert!(lines[1].starts_with("alice,"));
        assert!(lines[2].starts_with("bob,"));

        let records = read_records(&path).unwrap();
        assert_eq!(records, ledger.records());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.csv");
        std::fs::write(&path, "identity,timestamp,confidence\n").unwrap();
        let err = CsvSink::create(&path).err().unwrap();
        assert!(matches!(err, PersistenceError::AlreadyExists(_)));
    }

    #[test]
    fn test_resume_continues_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.csv");
        {
            let mut ledger = AttendanceLedger::create(&path).unwrap();
            ledger.mark_present(&id("alice"), at(0), 0.9).unwrap();
        }

        let mut ledger = AttendanceLedger::resume(&path).unwrap();
        assert!(ledger.is_marked(&id("alice")));
        assert_eq!(ledger.last_timestamp(), Some(at(0)));
        assert_eq!(ledger.mark_present(&id("alice"), at(3), 0.9).unwrap(), MarkOutcome::AlreadyMarked);
        ledger.mark_present(&id("bob"), at(4), 0.6).unwrap();

        let records = read_records(&path).unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(names, ["alice", "bob"]);
    }

    #[test]
    fn test_resume_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.csv");
        std::fs::write(&path, "name,time\nalice,09:00\n").unwrap();
        let err = AttendanceLedger::resume(&path).err().unwrap();
        assert!(matches!(err, LedgerError::Persistence(PersistenceError::BadHeader { .. })));
    }

    #[test]
    fn test_resume_rejects_duplicate_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.csv");
        let ts = at(0).to_rfc3339();
        std::fs::write(
            &path,
            format!("identity,timestamp,confidence\nalice,{ts},0.9\nalice,{ts},0.8\n"),
        )
        .unwrap();
        let err = AttendanceLedger::resume(&path).err().unwrap();
        assert!(matches!(err, LedgerError::DuplicateRecord(_)));
    }

    #[test]
    fn test_failed_csv_write_then_retry_keeps_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.csv");
        let mut ledger = AttendanceLedger::create(&path).unwrap();
        ledger.mark_present(&id("bob"), at(0), 0.7).unwrap();

        // a read-only handle makes every write fail
        let writable = std::mem::replace(&mut ledger.sink.file, File::open(&path).unwrap());
        let err = ledger.mark_present(&id("alice"), at(1), 0.9).unwrap_err();
        assert!(matches!(err, LedgerError::Persistence(PersistenceError::Io { .. })));
        assert!(!ledger.is_marked(&id("alice")));

        ledger.sink.file = writable;
        let retry = ledger.mark_present(&id("alice"), at(2), 0.9).unwrap();
        assert!(matches!(retry, MarkOutcome::Recorded(_)));
        drop(ledger);

        let records = read_records(&path).unwrap();
        let alice: Vec<&AttendanceRecord> =
            records.iter().filter(|r| r.identity == id("alice")).collect();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].timestamp, at(2));
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_torn_write_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.csv");
        let mut sink = CsvSink::create(&path).unwrap();
        let before = std::fs::metadata(&path).unwrap().len();

        let record = AttendanceRecord { identity: id("alice"), timestamp: at(0), confidence: 0.9 };
        let row = sink.encode(|w| w.serialize(&record)).unwrap();
        let err = write_or_rollback(&mut sink.file, &row, |file, bytes| {
            file.write_all(&bytes[..bytes.len() / 2])?;
            Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "no space left on device");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), before);

        sink.append(&record).unwrap();
        drop(sink);
        assert_eq!(read_records(&path).unwrap(), vec![record]);
    }
}
