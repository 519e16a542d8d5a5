//! In-Memory Repository Implementations
//!
//! Thread-safe, in-memory implementation of the `AlgoStore` trait defined in
//! `domain::repositories`.
//!
//! # Features
//!
//! - **Thread-safe**: `parking_lot::RwLock` around a plain `Vec`
//! - **Testing**: ideal for unit tests and embedded use
//! - **Fault injection**: appends can be made to fail on demand
//!
//! # Limitations
//!
//! - Records are lost on restart; use `JournalStore` for durability

use parking_lot::RwLock;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::errors::PersistError;
use crate::domain::repositories::{AlgoRecord, AlgoStore};

#[derive(Default)]
pub struct InMemoryAlgoStore {
    records: RwLock<Vec<AlgoRecord>>,
    fail_writes: AtomicBool,
}

impl InMemoryAlgoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<AlgoRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every following append fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    pub fn records(&self) -> Vec<AlgoRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl AlgoStore for InMemoryAlgoStore {
    fn append(&self, record: &AlgoRecord) -> Result<(), PersistError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(io::Error::other("simulated write failure").into());
        }
        self.records.write().push(record.clone());
        Ok(())
    }

    fn load(&self, seq0: u32) -> Result<Vec<AlgoRecord>, PersistError> {
        let mut records: Vec<AlgoRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| r.seq >= seq0)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.seq);
        Ok(records)
    }

    fn last_seq(&self) -> Result<Option<u32>, PersistError> {
        Ok(self.records.read().iter().map(|r| r.seq).max())
    }
}
