//! Per-thread sequential execution queue.
//!
//! Every algo is pinned to one strand. Everything that touches the algo is
//! posted here as a [`Job`] and executed by the strand's single worker thread in
//! post order, so an algo never sees two of its callbacks overlap.

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::application::algo::{Algo, AlgoHandle};
use crate::application::subscriptions::RefTable;
use crate::domain::params::ParamMap;
use crate::domain::types::{AlgoId, Confirmation, MarketData, MdKey};

thread_local! {
    static CURRENT_STRAND: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Index of the strand whose worker is running the current thread, if any.
pub(crate) fn current_strand() -> Option<usize> {
    CURRENT_STRAND.with(|c| c.get())
}

pub(crate) fn bind_current_thread(index: usize) {
    CURRENT_STRAND.with(|c| c.set(Some(index)));
}

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum Job {
    Start {
        algo: Box<dyn Algo>,
        handle: Arc<AlgoHandle>,
        params: ParamMap,
        reply: Sender<Result<(), String>>,
    },
    Modify {
        id: AlgoId,
        params: ParamMap,
    },
    Confirmation {
        id: AlgoId,
        cm: Confirmation,
    },
    Timeout {
        id: AlgoId,
        tag: u64,
    },
    Task {
        id: AlgoId,
        task: Task,
    },
    /// Fan out whatever market data is currently dirty
    Drain,
    Stop {
        id: AlgoId,
    },
    Shutdown,
}

/// The thread-shared half of a worker: its queue, its subscription counts and
/// its dirty set. The thread-local half is the `AlgoRunner`.
pub struct Strand {
    index: usize,
    tx: Sender<Job>,
    md_refs: RefTable,
    dirties: Mutex<HashMap<MdKey, MarketData>>,
}

impl Strand {
    pub(crate) fn new(index: usize, tx: Sender<Job>) -> Self {
        Self {
            index,
            tx,
            md_refs: RefTable::default(),
            dirties: Mutex::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn post(&self, job: Job) -> bool {
        if self.tx.send(job).is_err() {
            warn!(strand = self.index, "Strand worker is gone, job dropped");
            return false;
        }
        true
    }

    pub(crate) fn add_ref(&self, key: MdKey) -> u32 {
        self.md_refs.acquire(key)
    }

    pub(crate) fn release_ref(&self, key: MdKey) -> u32 {
        let remaining = self.md_refs.release(key);
        if remaining == 0 {
            self.dirties.lock().remove(&key);
        }
        remaining
    }

    /// Records the newest snapshot for `key`. Only the first update of a batch
    /// posts a drain; later ones overwrite the pending snapshot.
    pub(crate) fn mark_dirty(&self, key: MdKey, md: MarketData) {
        if !self.md_refs.is_subscribed(key) {
            return;
        }
        let first = self.dirties.lock().insert(key, md).is_none();
        if first {
            self.post(Job::Drain);
        }
    }

    pub(crate) fn take_dirties(&self) -> HashMap<MdKey, MarketData> {
        std::mem::take(&mut *self.dirties.lock())
    }
}
