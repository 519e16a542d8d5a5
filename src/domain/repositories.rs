//! Repository Pattern Abstractions
//!
//! The algo journal is an append-only log of algo state transitions. Every
//! record carries a monotonically increasing sequence number; replaying the
//! records from a given sequence rebuilds the set of live algos (crash
//! recovery) or feeds recent history to a monitoring connection.
//!
//! # Implementations
//!
//! - `JournalStore`: JSON lines file, one record per line
//! - `InMemoryAlgoStore`: tests and embedded use

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

use crate::domain::errors::PersistError;
use crate::domain::types::{AlgoId, User};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Started,
    Modified,
    Stopped,
    /// Strategy-defined status label
    Custom(String),
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::Started => write!(f, "started"),
            RecordStatus::Modified => write!(f, "modified"),
            RecordStatus::Stopped => write!(f, "stopped"),
            RecordStatus::Custom(label) => write!(f, "{}", label),
        }
    }
}

/// One state transition of one algo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgoRecord {
    pub seq: u32,
    pub tm: DateTime<Utc>,
    pub algo_id: AlgoId,
    pub token: String,
    pub name: String,
    pub user: User,
    pub status: RecordStatus,
    pub body: String,
}

/// Append-only storage for algo records
pub trait AlgoStore: Send + Sync {
    /// Append one record. Callers append in sequence order.
    fn append(&self, record: &AlgoRecord) -> Result<(), PersistError>;

    /// All records with `seq >= seq0`, in sequence order.
    fn load(&self, seq0: u32) -> Result<Vec<AlgoRecord>, PersistError>;

    /// Highest sequence stored, whatever replay start a caller uses.
    fn last_seq(&self) -> Result<Option<u32>, PersistError> {
        Ok(self.load(0)?.iter().map(|r| r.seq).max())
    }
}

/// Receiver of replayed records, e.g. a freshly attached monitoring connection.
pub trait RecordSink {
    fn on_record(&self, record: &AlgoRecord);
}

/// Blocks while a bounded channel is full, so no replayed record is lost.
impl RecordSink for crossbeam_channel::Sender<AlgoRecord> {
    fn on_record(&self, record: &AlgoRecord) {
        if self.send(record.clone()).is_err() {
            warn!(seq = record.seq, token = %record.token, "Replay connection closed, record not delivered");
        }
    }
}

/// An algo that was started and not stopped according to the journal.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredAlgo {
    pub algo_id: AlgoId,
    pub token: String,
    pub name: String,
    pub user: User,
    /// Raw params of the `started` record
    pub params_raw: String,
    /// JSON-encoded params of every later `modified` record, oldest first
    pub modifications: Vec<String>,
    pub started_seq: u32,
}

/// Result of replaying the journal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryState {
    /// Live algos ordered by the sequence of their `started` record
    pub live: Vec<RecoveredAlgo>,
    pub last_seq: Option<u32>,
    pub records: usize,
}

impl RecoveryState {
    pub fn from_records(records: &[AlgoRecord]) -> Self {
        let mut live: HashMap<&str, RecoveredAlgo> = HashMap::new();
        let mut last_seq = None;

        for record in records {
            last_seq = Some(last_seq.map_or(record.seq, |s: u32| s.max(record.seq)));
            match &record.status {
                RecordStatus::Started => {
                    live.insert(
                        record.token.as_str(),
                        RecoveredAlgo {
                            algo_id: record.algo_id,
                            token: record.token.clone(),
                            name: record.name.clone(),
                            user: record.user.clone(),
                            params_raw: record.body.clone(),
                            modifications: Vec::new(),
                            started_seq: record.seq,
                        },
                    );
                }
                RecordStatus::Modified => {
                    if let Some(algo) = live.get_mut(record.token.as_str()) {
                        algo.modifications.push(record.body.clone());
                    }
                }
                RecordStatus::Stopped => {
                    live.remove(record.token.as_str());
                }
                RecordStatus::Custom(_) => {}
            }
        }

        let mut live: Vec<RecoveredAlgo> = live.into_values().collect();
        live.sort_by_key(|a| a.started_seq);

        Self {
            live,
            last_seq,
            records: records.len(),
        }
    }
}
