//! The strategy contract and the context strategies act through.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::application::manager::AlgoManager;
use crate::application::runner::InterestTable;
use crate::application::strand::{Job, Strand};
use crate::domain::errors::ExecutionError;
use crate::domain::instrument::Instrument;
use crate::domain::params::{ParamDefs, ParamMap};
use crate::domain::repositories::RecordStatus;
use crate::domain::types::{
    AlgoId, Confirmation, Contract, DataSrc, MarketData, MdKey, Order, Security, SecurityId, User,
};

/// A trading strategy instance.
///
/// All callbacks of one instance run on its strand, one at a time, so
/// implementations need no internal locking. Callbacks must not block and must
/// not panic: a panic inside a callback aborts the process.
pub trait Algo: Send {
    /// Configuration schema, checked before `on_start` sees any params.
    fn param_defs(&self) -> ParamDefs;

    /// Apply the initial params. An error aborts the spawn.
    fn on_start(&mut self, ctx: &mut AlgoContext<'_>, params: &ParamMap) -> Result<(), String>;

    fn on_modify(&mut self, ctx: &mut AlgoContext<'_>, params: &ParamMap);

    /// Called exactly once, after every event queued ahead of the stop.
    fn on_stop(&mut self, ctx: &mut AlgoContext<'_>);

    fn on_market_trade(
        &mut self,
        ctx: &mut AlgoContext<'_>,
        inst: &Instrument,
        md: &MarketData,
        md0: &MarketData,
    );

    fn on_market_quote(
        &mut self,
        ctx: &mut AlgoContext<'_>,
        inst: &Instrument,
        md: &MarketData,
        md0: &MarketData,
    );

    fn on_confirmation(&mut self, ctx: &mut AlgoContext<'_>, cm: &Confirmation);

    /// Fired by timers armed with [`AlgoContext::set_timeout`].
    fn on_timeout(&mut self, _ctx: &mut AlgoContext<'_>, _tag: u64) {}
}

/// Registry entry of a spawned algo, shared between threads.
#[derive(Debug)]
pub struct AlgoHandle {
    id: AlgoId,
    token: String,
    name: String,
    user: User,
    strand: usize,
    defs: ParamDefs,
    active: AtomicBool,
    securities: Mutex<HashSet<SecurityId>>,
}

impl AlgoHandle {
    pub(crate) fn new(
        id: AlgoId,
        token: &str,
        name: &str,
        user: User,
        strand: usize,
        defs: ParamDefs,
    ) -> Self {
        Self {
            id,
            token: token.to_string(),
            name: name.to_string(),
            user,
            strand,
            defs,
            active: AtomicBool::new(true),
            securities: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> AlgoId {
        self.id
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Registered strategy name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn strand(&self) -> usize {
        self.strand
    }

    pub fn param_defs(&self) -> &ParamDefs {
        &self.defs
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn trades(&self, sec: SecurityId) -> bool {
        self.securities.lock().contains(&sec)
    }

    /// Returns true only for the call that actually deactivated the algo.
    pub(crate) fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }

    fn add_security(&self, sec: SecurityId) {
        self.securities.lock().insert(sec);
    }
}

/// What a strategy callback can do: subscribe, trade, arm timers, persist and
/// stop. Only valid for the duration of the callback.
pub struct AlgoContext<'a> {
    pub(crate) manager: &'a AlgoManager,
    pub(crate) handle: &'a Arc<AlgoHandle>,
    pub(crate) instruments: &'a mut HashMap<MdKey, Arc<Instrument>>,
    pub(crate) interest: &'a mut InterestTable,
    pub(crate) strand: &'a Arc<Strand>,
}

impl AlgoContext<'_> {
    pub fn id(&self) -> AlgoId {
        self.handle.id()
    }

    pub fn token(&self) -> &str {
        self.handle.token()
    }

    pub fn user(&self) -> &User {
        self.handle.user()
    }

    pub fn handle(&self) -> &Arc<AlgoHandle> {
        self.handle
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    /// Returns this algo's instrument for (`sec`, `src`), creating and
    /// registering it on first use.
    pub fn subscribe(&mut self, sec: &Security, src: DataSrc) -> Arc<Instrument> {
        let key = (src, sec.id);
        if let Some(inst) = self.instruments.get(&key) {
            return Arc::clone(inst);
        }

        let inst = Arc::new(Instrument::new(
            self.manager.next_instrument_id(),
            self.handle.id(),
            sec.clone(),
            src,
        ));
        self.instruments.insert(key, Arc::clone(&inst));
        self.handle.add_security(sec.id);
        self.interest.add(&inst);
        self.strand.add_ref(key);
        self.manager.register(&inst);
        inst
    }

    pub fn instrument(&self, sec: SecurityId, src: DataSrc) -> Option<Arc<Instrument>> {
        self.instruments.get(&(src, sec)).cloned()
    }

    pub fn instruments(&self) -> impl Iterator<Item = &Arc<Instrument>> {
        self.instruments.values()
    }

    /// Sends a new order for one of this algo's instruments.
    pub fn place(&mut self, contract: Contract, inst: &Instrument) -> Result<Order, ExecutionError> {
        let owned = self
            .instruments
            .get(&inst.key())
            .filter(|owned| owned.id() == inst.id())
            .cloned()
            .ok_or(ExecutionError::ForeignInstrument {
                instrument_id: inst.id(),
            })?;
        self.manager.place(self.handle, &owned, contract)
    }

    pub fn cancel(&self, order: &Order) -> Result<(), ExecutionError> {
        self.manager.cancel(order)
    }

    /// Arms a one-shot timer; `Algo::on_timeout(tag)` runs on this strand once
    /// at least `ms` milliseconds have passed.
    pub fn set_timeout(&self, ms: u64, tag: u64) {
        self.manager.schedule(
            ms,
            Arc::clone(self.strand),
            Job::Timeout {
                id: self.handle.id(),
                tag,
            },
        );
    }

    /// Appends a custom record to the algo journal.
    pub fn persist(&self, status: &str, body: &str) {
        self.manager
            .persist(self.handle, RecordStatus::Custom(status.to_string()), body);
    }

    /// Deactivates the algo. `on_stop` follows once the current callback and
    /// everything already queued have run.
    pub fn stop(&self) {
        self.manager.stop_algo(self.handle);
    }
}
