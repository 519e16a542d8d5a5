//! Append-only JSON-lines algo journal.
//!
//! One `AlgoRecord` per line, flushed after every append. A torn final line
//! (crash mid-write) is skipped on load; any other undecodable line is reported
//! as corrupt with its line number.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::domain::errors::PersistError;
use crate::domain::repositories::{AlgoRecord, AlgoStore};

pub struct JournalStore {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JournalStore {
    /// Opens (creating if needed) the journal at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        if path.exists() {
            truncate_torn_tail(&path)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("Algo journal opened at {:?}", path);
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Cuts a partial last line left by a crash mid-append, so new records start
/// on a line of their own.
fn truncate_torn_tail(path: &Path) -> Result<(), PersistError> {
    let content = fs::read(path)?;
    if content.is_empty() || content.ends_with(b"\n") {
        return Ok(());
    }
    let keep = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |pos| pos + 1);
    warn!(
        path = %path.display(),
        dropped_bytes = content.len() - keep,
        tail = %String::from_utf8_lossy(&content[keep..]),
        "Truncating torn journal tail"
    );
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_all()?;
    Ok(())
}

impl AlgoStore for JournalStore {
    fn append(&self, record: &AlgoRecord) -> Result<(), PersistError> {
        let line = serde_json::to_string(record)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn load(&self, seq0: u32) -> Result<Vec<AlgoRecord>, PersistError> {
        // Make sure everything appended so far is visible to the reader
        self.writer.lock().flush()?;

        let reader = BufReader::new(File::open(&self.path)?);
        let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
        let last = lines.len();

        let mut records = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AlgoRecord>(line) {
                Ok(record) if record.seq >= seq0 => records.push(record),
                Ok(_) => {}
                Err(e) if index + 1 == last => {
                    warn!(line = index + 1, error = %e, "Skipping torn journal tail");
                }
                Err(e) => {
                    return Err(PersistError::Corrupt {
                        line: index + 1,
                        reason: e.to_string(),
                    })
                }
            }
        }
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repositories::RecordStatus;
    use crate::domain::types::User;
    use chrono::Utc;

    fn record(seq: u32, status: RecordStatus, body: &str) -> AlgoRecord {
        AlgoRecord {
            seq,
            tm: Utc::now(),
            algo_id: 1,
            token: "tok-1".to_string(),
            name: "TWAP".to_string(),
            user: User::new(7, "desk"),
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_append_then_load_from_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(dir.path().join("journal.jsonl")).unwrap();

        store.append(&record(0, RecordStatus::Started, "{}")).unwrap();
        store
            .append(&record(1, RecordStatus::Custom("progress".into()), "a\nb"))
            .unwrap();
        store.append(&record(2, RecordStatus::Stopped, "")).unwrap();

        let all = store.load(0).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].body, "a\nb");

        let tail = store.load(2).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].status, RecordStatus::Stopped);
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("journal.jsonl");
        {
            let store = JournalStore::open(&path).unwrap();
            store.append(&record(0, RecordStatus::Started, "{}")).unwrap();
        }
        let store = JournalStore::open(&path).unwrap();
        store.append(&record(1, RecordStatus::Stopped, "")).unwrap();
        assert_eq!(store.load(0).unwrap().len(), 2);
    }

    #[test]
    fn test_torn_tail_is_skipped_but_corruption_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let good = serde_json::to_string(&record(0, RecordStatus::Started, "{}")).unwrap();

        fs::write(&path, format!("{}\n{{\"seq\":1,\"tm", good)).unwrap();
        let store = JournalStore::open(&path).unwrap();
        assert_eq!(store.load(0).unwrap().len(), 1);

        fs::write(&path, format!("not json\n{}\n", good)).unwrap();
        let err = store.load(0).unwrap_err();
        assert!(matches!(err, PersistError::Corrupt { line: 1, .. }));
    }

    #[test]
    fn test_appends_after_a_torn_tail_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let good = serde_json::to_string(&record(0, RecordStatus::Started, "{}")).unwrap();
        fs::write(&path, format!("{}\n{{\"seq\":1,\"tm", good)).unwrap();

        // 1. Reopen after the crash and keep writing
        {
            let store = JournalStore::open(&path).unwrap();
            store.append(&record(1, RecordStatus::Modified, "{}")).unwrap();
            store.append(&record(2, RecordStatus::Stopped, "")).unwrap();
        }

        // 2. Next boot sees every complete record and nothing else
        let store = JournalStore::open(&path).unwrap();
        let seqs: Vec<u32> = store.load(0).unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[test]
    fn test_torn_first_line_is_dropped_entirely() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        fs::write(&path, "{\"seq\":0,").unwrap();

        let store = JournalStore::open(&path).unwrap();
        store.append(&record(0, RecordStatus::Started, "{}")).unwrap();
        assert_eq!(store.load(0).unwrap().len(), 1);
    }

    #[test]
    fn test_last_seq_covers_the_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JournalStore::open(dir.path().join("journal.jsonl")).unwrap();
        assert_eq!(store.last_seq().unwrap(), None);

        store.append(&record(0, RecordStatus::Started, "{}")).unwrap();
        store.append(&record(4, RecordStatus::Stopped, "")).unwrap();
        assert_eq!(store.last_seq().unwrap(), Some(4));
    }
}
