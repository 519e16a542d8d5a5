//! Worker-side half of a strand.
//!
//! An `AlgoRunner` lives on exactly one worker thread. It owns the algos pinned
//! to its strand together with their instruments, and the interest table that
//! maps each (source, security) pair to the instruments on this strand that
//! want it. Nothing here is shared, so none of it is locked: other threads only
//! reach the runner by posting a [`Job`].

use crossbeam_channel::{Receiver, Sender};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::application::algo::{Algo, AlgoContext, AlgoHandle};
use crate::application::manager::AlgoManager;
use crate::application::strand::{bind_current_thread, Job, Strand};
use crate::domain::instrument::Instrument;
use crate::domain::params::ParamMap;
use crate::domain::repositories::RecordStatus;
use crate::domain::types::{AlgoId, MarketData, MdKey};

#[derive(Default)]
struct MdSlot {
    /// Last snapshot delivered on this strand
    md: MarketData,
    instruments: Vec<Arc<Instrument>>,
}

/// (source, security) -> cached snapshot and interested instruments.
#[derive(Default)]
pub(crate) struct InterestTable {
    slots: HashMap<MdKey, MdSlot>,
}

impl InterestTable {
    pub(crate) fn add(&mut self, inst: &Arc<Instrument>) {
        let slot = self.slots.entry(inst.key()).or_default();
        inst.set_md(slot.md);
        slot.instruments.push(Arc::clone(inst));
    }

    pub(crate) fn remove(&mut self, inst: &Instrument) {
        let key = inst.key();
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.instruments.retain(|i| i.id() != inst.id());
            if slot.instruments.is_empty() {
                self.slots.remove(&key);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn interested(&self, key: MdKey) -> usize {
        self.slots.get(&key).map_or(0, |slot| slot.instruments.len())
    }

    /// Stores `md` as the latest snapshot for `key` and returns the previous one
    /// with the instruments to notify. `None` when nobody here wants `key`.
    fn advance(&mut self, key: MdKey, md: MarketData) -> Option<(MarketData, Vec<Arc<Instrument>>)> {
        let slot = self.slots.get_mut(&key)?;
        let md0 = std::mem::replace(&mut slot.md, md);
        Some((md0, slot.instruments.clone()))
    }
}

struct AlgoSlot {
    algo: Box<dyn Algo>,
    handle: Arc<AlgoHandle>,
    instruments: HashMap<MdKey, Arc<Instrument>>,
}

pub(crate) struct AlgoRunner {
    strand: Arc<Strand>,
    algos: HashMap<AlgoId, AlgoSlot>,
    interest: InterestTable,
}

impl AlgoRunner {
    pub(crate) fn new(strand: Arc<Strand>) -> Self {
        Self {
            strand,
            algos: HashMap::new(),
            interest: InterestTable::default(),
        }
    }

    /// Worker loop. Returns on `Job::Shutdown` or once the manager is gone.
    pub(crate) fn run(mut self, rx: Receiver<Job>, manager: Weak<AlgoManager>) {
        let index = self.strand.index();
        bind_current_thread(index);
        info!(strand = index, "Algo runner started");

        while let Ok(job) = rx.recv() {
            if matches!(job, Job::Shutdown) {
                break;
            }
            let Some(manager) = manager.upgrade() else {
                warn!(strand = index, "Algo manager dropped, runner exiting");
                return;
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.process(&manager, job)));
            if let Err(payload) = outcome {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(strand = index, %reason, "Algo callback panicked, aborting");
                std::process::abort();
            }
        }

        match manager.upgrade() {
            Some(manager) => self.teardown(&manager),
            None => debug!(strand = index, algos = self.algos.len(), "Dropping algos without manager"),
        }
        info!(strand = index, "Algo runner stopped");
    }

    fn process(&mut self, manager: &AlgoManager, job: Job) {
        match job {
            Job::Start {
                algo,
                handle,
                params,
                reply,
            } => self.start(manager, algo, handle, params, reply),
            Job::Modify { id, params } => {
                self.with_algo(manager, id, |algo, ctx| algo.on_modify(ctx, &params))
            }
            Job::Confirmation { id, cm } => {
                self.with_algo(manager, id, |algo, ctx| algo.on_confirmation(ctx, &cm))
            }
            Job::Timeout { id, tag } => {
                self.with_algo(manager, id, |algo, ctx| algo.on_timeout(ctx, tag))
            }
            Job::Task { id, task } => {
                if self.algos.get(&id).is_some_and(|slot| slot.handle.is_active()) {
                    task();
                } else {
                    debug!(algo_id = id, "Dropping timer task of inactive algo");
                }
            }
            Job::Drain => self.drain(manager),
            Job::Stop { id } => self.finish(manager, id),
            Job::Shutdown => {}
        }
    }

    fn start(
        &mut self,
        manager: &AlgoManager,
        mut algo: Box<dyn Algo>,
        handle: Arc<AlgoHandle>,
        params: ParamMap,
        reply: Sender<Result<(), String>>,
    ) {
        let mut instruments = HashMap::new();
        let result = {
            let mut ctx = AlgoContext {
                manager,
                handle: &handle,
                instruments: &mut instruments,
                interest: &mut self.interest,
                strand: &self.strand,
            };
            algo.on_start(&mut ctx, &params)
        };

        let result = match result {
            Ok(()) => {
                self.algos.insert(
                    handle.id(),
                    AlgoSlot {
                        algo,
                        handle,
                        instruments,
                    },
                );
                Ok(())
            }
            Err(reason) => {
                self.release(manager, &instruments);
                Err(reason)
            }
        };

        if reply.send(result).is_err() {
            debug!(strand = self.strand.index(), "Spawn caller went away");
        }
    }

    /// Runs `f` against an active algo of this strand.
    fn with_algo(
        &mut self,
        manager: &AlgoManager,
        id: AlgoId,
        f: impl FnOnce(&mut dyn Algo, &mut AlgoContext<'_>),
    ) {
        let Some(slot) = self.algos.get_mut(&id) else {
            debug!(algo_id = id, "Event for unknown algo ignored");
            return;
        };
        if !slot.handle.is_active() {
            return;
        }
        let mut ctx = AlgoContext {
            manager,
            handle: &slot.handle,
            instruments: &mut slot.instruments,
            interest: &mut self.interest,
            strand: &self.strand,
        };
        f(slot.algo.as_mut(), &mut ctx);
    }

    /// Delivers the newest snapshot of every dirty pair. Several updates that
    /// arrived since the last drain show up as one, carrying the latest values.
    fn drain(&mut self, manager: &AlgoManager) {
        for (key, md) in self.strand.take_dirties() {
            let Some((md0, targets)) = self.interest.advance(key, md) else {
                continue;
            };
            let trade = md.trade_changed(&md0);
            let quote = md.quote_changed(&md0);

            for inst in targets {
                inst.set_md(md);
                if !trade && !quote {
                    continue;
                }
                self.with_algo(manager, inst.algo_id(), |algo, ctx| {
                    if trade {
                        algo.on_market_trade(ctx, &inst, &md, &md0);
                    }
                    if quote {
                        algo.on_market_quote(ctx, &inst, &md, &md0);
                    }
                });
            }
        }
    }

    /// Runs `on_stop` and tears the algo down.
    fn finish(&mut self, manager: &AlgoManager, id: AlgoId) {
        let Some(mut slot) = self.algos.remove(&id) else {
            return;
        };
        {
            let mut ctx = AlgoContext {
                manager,
                handle: &slot.handle,
                instruments: &mut slot.instruments,
                interest: &mut self.interest,
                strand: &self.strand,
            };
            slot.algo.on_stop(&mut ctx);
        }
        self.release(manager, &slot.instruments);
        manager.unregister(&slot.handle);
        info!(algo_id = id, token = slot.handle.token(), "Algo stopped");
    }

    fn release(&mut self, manager: &AlgoManager, instruments: &HashMap<MdKey, Arc<Instrument>>) {
        for inst in instruments.values() {
            self.interest.remove(inst);
            self.strand.release_ref(inst.key());
            manager.unregister_instrument(inst);
        }
    }

    /// Stops whatever is still pinned here when the worker exits.
    fn teardown(&mut self, manager: &AlgoManager) {
        let ids: Vec<AlgoId> = self.algos.keys().copied().collect();
        for id in ids {
            if let Some(slot) = self.algos.get(&id) {
                if slot.handle.deactivate() {
                    manager.persist(&slot.handle, RecordStatus::Stopped, "shutdown");
                }
            }
            self.finish(manager, id);
        }
    }
}
