//! Reports over session files on disk: one file, or every session in a
//! date range.

use crate::ledger::{read_records, AttendanceRecord, PersistenceError};
use chrono::{DateTime, Local, NaiveDate};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct SessionFileSummary {
    pub path: PathBuf,
    pub total_records: usize,
    pub unique_identities: usize,
    /// Earliest entry by timestamp.
    pub first: Option<AttendanceRecord>,
    /// Latest entry by timestamp.
    pub last: Option<AttendanceRecord>,
}

pub fn summarize(path: &Path) -> Result<SessionFileSummary, PersistenceError> {
    let records = read_records(path)?;
    let unique_identities = records.iter().map(|r| &r.identity).collect::<HashSet<_>>().len();
    let first = records.iter().min_by_key(|r| r.timestamp).cloned();
    let last = records.iter().max_by_key(|r| r.timestamp).cloned();

    Ok(SessionFileSummary {
        path: path.to_path_buf(),
        total_records: records.len(),
        unique_identities,
        first,
        last,
    })
}

/// Attendance across every session file in a directory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AttendanceStats {
    /// Session files with at least one record in range.
    pub sessions: usize,
    pub total_records: usize,
    pub unique_identities: usize,
    /// Sessions attended, per identity.
    pub per_identity: BTreeMap<String, usize>,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    /// `attendance_*.csv` files that could not be read as session files.
    pub unreadable: Vec<PathBuf>,
}

/// Session files (`attendance_*.csv`) in `dir`, sorted by name and so by
/// start time. A missing directory holds no sessions.
pub fn session_files(dir: &Path) -> Result<Vec<PathBuf>, PersistenceError> {
    let io_err = |source: io::Error| PersistenceError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(io_err)?.path();
        let is_session = path.is_file()
            && path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("attendance_") && !n.contains("_backup_"));
        if is_session {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Totals over every session file in `dir` whose records fall between `from`
/// and `to` (inclusive, by local date of the record). Files that are not
/// valid session files are listed in [`AttendanceStats::unreadable`].
pub fn stats(
    dir: &Path,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<AttendanceStats, PersistenceError> {
    let in_range = |date: NaiveDate| from.map_or(true, |f| date >= f) && to.map_or(true, |t| date <= t);
    let mut stats = AttendanceStats::default();

    for path in session_files(dir)? {
        let records = match read_records(&path) {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "skipping unreadable session file");
                stats.unreadable.push(path);
                continue;
            }
        };

        let mut counted = false;
        for record in records.iter().filter(|r| in_range(r.timestamp.date_naive())) {
            let date = record.timestamp.date_naive();
            stats.total_records += 1;
            *stats.per_identity.entry(record.identity.as_str().to_string()).or_default() += 1;
            stats.first_date = Some(stats.first_date.map_or(date, |d| d.min(date)));
            stats.last_date = Some(stats.last_date.map_or(date, |d| d.max(date)));
            counted = true;
        }
        if counted {
            stats.sessions += 1;
        }
    }

    stats.unique_identities = stats.per_identity.len();
    tracing::debug!(dir = %dir.display(), sessions = stats.sessions, records = stats.total_records, "stats computed");
    Ok(stats)
}

/// Copy a session file into `backup_dir` as `<stem>_backup_<YYYYmmdd_HHMMSS>.csv`.
///
/// Only files that read back as session files are copied, and an existing
/// backup is never overwritten.
pub fn backup(path: &Path, backup_dir: &Path, at: DateTime<Local>) -> Result<PathBuf, PersistenceError> {
    read_records(path)?;

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("attendance");
    let target = backup_dir.join(format!("{stem}_backup_{}.csv", at.format("%Y%m%d_%H%M%S")));
    if target.exists() {
        return Err(PersistenceError::AlreadyExists(target));
    }
    std::fs::create_dir_all(backup_dir).map_err(|source| PersistenceError::Io {
        path: backup_dir.to_path_buf(),
        source,
    })?;
    std::fs::copy(path, &target).map_err(|source| PersistenceError::Io {
        path: target.clone(),
        source,
    })?;
    tracing::info!(from = %path.display(), to = %target.display(), "session file backed up");
    Ok(target)
}
