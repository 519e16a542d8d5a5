//! AlgoManager: registry, scheduler and journal front-end.
//!
//! # Threading
//!
//! The manager is shared as `Arc<AlgoManager>` between adapter threads (which
//! call [`AlgoManager::update`] and [`AlgoManager::handle`]), API callers
//! (spawn, modify, stop) and the worker threads (which hold only a `Weak`).
//! Every algo callback runs on the algo's strand; everything here either reads
//! shared tables or posts a job.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::application::algo::AlgoHandle;
use crate::application::registry::AlgoRegistry;
use crate::application::runner::AlgoRunner;
use crate::application::strand::{current_strand, Job, Strand};
use crate::application::subscriptions::RefTable;
use crate::domain::errors::{EngineError, ExecutionError, PersistError, SpawnError};
use crate::domain::instrument::Instrument;
use crate::domain::params::ParamMap;
use crate::domain::ports::{ExecutionService, MarketDataService};
use crate::domain::repositories::{AlgoRecord, AlgoStore, RecordSink, RecordStatus, RecoveryState};
use crate::domain::types::{
    AlgoId, Confirmation, Contract, DataSrc, ExecType, InstrumentId, MarketData, Order, OrderId,
    SecurityId, User,
};

/// A live order and the instrument whose quantities it moves.
struct OrderBinding {
    order: Order,
    instrument: Arc<Instrument>,
    /// Quantity still working at the venue
    leaves: Mutex<f64>,
}

impl OrderBinding {
    /// Books `cm` against the instrument. Returns true once the order is done.
    fn apply(&self, cm: &Confirmation) -> bool {
        let side = self.order.contract.side;
        let mut leaves = self.leaves.lock();

        if matches!(cm.exec_type, ExecType::PartiallyFilled | ExecType::Filled) {
            let released = cm.last_shares.clamp(0.0, *leaves);
            *leaves -= released;
            self.instrument.fill(side, cm.last_shares, released);
        }

        if cm.exec_type.is_terminal() {
            self.instrument.close_order(self.order.id, side, *leaves);
            *leaves = 0.0;
            return true;
        }
        false
    }
}

pub struct AlgoManager {
    registry: AlgoRegistry,
    execution: Arc<dyn ExecutionService>,
    market_data: Arc<dyn MarketDataService>,
    store: Arc<dyn AlgoStore>,

    algo_id_counter: AtomicU32,
    instrument_id_counter: AtomicUsize,
    order_id_counter: AtomicU64,

    algos: DashMap<AlgoId, Arc<AlgoHandle>>,
    algo_of_token: DashMap<String, Arc<AlgoHandle>>,
    md_refs: RefTable,
    orders: DashMap<OrderId, Arc<OrderBinding>>,

    strands: OnceLock<Vec<Arc<Strand>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    timer: Mutex<Option<tokio::runtime::Runtime>>,
    timer_handle: OnceLock<tokio::runtime::Handle>,

    /// Next journal sequence; the lock also orders appends
    seq: Mutex<u32>,
    durability_compromised: AtomicBool,
    shutting_down: AtomicBool,
    stopped: Mutex<bool>,
    stopped_cv: Condvar,
}

impl AlgoManager {
    pub fn new(
        registry: AlgoRegistry,
        execution: Arc<dyn ExecutionService>,
        market_data: Arc<dyn MarketDataService>,
        store: Arc<dyn AlgoStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            execution,
            market_data,
            store,
            algo_id_counter: AtomicU32::new(1),
            instrument_id_counter: AtomicUsize::new(1),
            order_id_counter: AtomicU64::new(1),
            algos: DashMap::new(),
            algo_of_token: DashMap::new(),
            md_refs: RefTable::default(),
            orders: DashMap::new(),
            strands: OnceLock::new(),
            workers: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
            timer_handle: OnceLock::new(),
            seq: Mutex::new(0),
            durability_compromised: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            stopped: Mutex::new(false),
            stopped_cv: Condvar::new(),
        })
    }

    pub fn registry(&self) -> &AlgoRegistry {
        &self.registry
    }

    /// Starts `nthreads` workers plus the timer service and returns.
    pub fn start(self: &Arc<Self>, nthreads: usize) -> Result<(), EngineError> {
        if nthreads == 0 {
            return Err(EngineError::NoThreads);
        }
        if self.strands.get().is_some() || self.shutting_down.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyRunning);
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("algo-timer")
            .enable_time()
            .build()
            .map_err(EngineError::TimerRuntime)?;

        let mut strands = Vec::with_capacity(nthreads);
        let mut receivers = Vec::with_capacity(nthreads);
        for index in 0..nthreads {
            let (tx, rx) = crossbeam_channel::unbounded();
            strands.push(Arc::new(Strand::new(index, tx)));
            receivers.push(rx);
        }
        if self.strands.set(strands.clone()).is_err() {
            return Err(EngineError::AlreadyRunning);
        }
        let _ = self.timer_handle.set(runtime.handle().clone());
        *self.timer.lock() = Some(runtime);

        let mut workers = self.workers.lock();
        for (strand, rx) in strands.into_iter().zip(receivers) {
            let name = format!("algo-strand-{}", strand.index());
            let runner = AlgoRunner::new(strand);
            let manager = Arc::downgrade(self);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || runner.run(rx, manager))
                .map_err(EngineError::ThreadSpawn)?;
            workers.push(handle);
        }

        info!(threads = nthreads, "Algo manager started");
        Ok(())
    }

    /// Starts the workers and blocks until [`AlgoManager::shutdown`] completes.
    pub fn run(self: &Arc<Self>, nthreads: usize) -> Result<(), EngineError> {
        self.start(nthreads)?;
        self.wait();
        Ok(())
    }

    /// Blocks until [`AlgoManager::shutdown`] completes.
    pub fn wait(&self) {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            self.stopped_cv.wait(&mut stopped);
        }
    }

    /// Stops every algo, lets each strand finish its queue, joins the workers and
    /// stops the timer service. Later calls are no-ops.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Algo manager shutting down");
        self.stop_all();

        let strands = self.strands.get().map(Vec::as_slice).unwrap_or_default();
        for strand in strands {
            strand.post(Job::Shutdown);
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        if current_strand().is_some() {
            warn!("Shutdown requested from a strand worker, not joining workers");
        } else {
            for worker in workers {
                if worker.join().is_err() {
                    error!("Algo worker thread panicked");
                }
            }
        }

        if let Some(runtime) = self.timer.lock().take() {
            runtime.shutdown_background();
        }
        *self.stopped.lock() = true;
        self.stopped_cv.notify_all();
        info!("Algo manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.strands.get().is_some() && !self.shutting_down.load(Ordering::Acquire)
    }

    pub fn threads(&self) -> usize {
        self.strands.get().map_or(0, Vec::len)
    }

    /// Creates, registers and starts an algo. Blocks until `on_start` has run on
    /// the algo's strand.
    pub fn spawn(
        &self,
        params: ParamMap,
        name: &str,
        user: &User,
        params_raw: &str,
        token: &str,
    ) -> Result<Arc<AlgoHandle>, SpawnError> {
        let strands = match self.strands.get() {
            Some(strands) if !self.shutting_down.load(Ordering::Acquire) => strands,
            _ => return Err(SpawnError::NotRunning),
        };
        if token.is_empty() {
            return Err(SpawnError::EmptyToken);
        }
        let algo = self
            .registry
            .create(name)
            .ok_or_else(|| SpawnError::UnknownAlgo {
                name: name.to_string(),
            })?;
        let defs = algo.param_defs();
        let params = defs.resolve(params)?;

        let id = self.algo_id_counter.fetch_add(1, Ordering::Relaxed);
        let strand = &strands[id as usize % strands.len()];
        if current_strand() == Some(strand.index()) {
            return Err(SpawnError::Reentrant {
                strand: strand.index(),
            });
        }

        let handle = Arc::new(AlgoHandle::new(
            id,
            token,
            name,
            user.clone(),
            strand.index(),
            defs,
        ));
        match self.algo_of_token.entry(token.to_string()) {
            Entry::Occupied(_) => {
                return Err(SpawnError::DuplicateToken {
                    token: token.to_string(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
            }
        }
        self.algos.insert(id, Arc::clone(&handle));
        self.persist(&handle, RecordStatus::Started, params_raw);

        let (reply, outcome) = crossbeam_channel::bounded(1);
        strand.post(Job::Start {
            algo,
            handle: Arc::clone(&handle),
            params,
            reply,
        });

        let failure = match outcome.recv() {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(SpawnError::StartRejected(reason)),
            Err(_) => Some(SpawnError::WorkerGone {
                strand: strand.index(),
            }),
        };
        match failure {
            None => {
                info!(algo_id = id, token, name, user = %user.name, strand = strand.index(), "Algo started");
                Ok(handle)
            }
            Some(err) => {
                warn!(algo_id = id, token, name, error = %err, "Algo failed to start");
                handle.deactivate();
                self.unregister(&handle);
                self.persist(&handle, RecordStatus::Stopped, &err.to_string());
                Err(err)
            }
        }
    }

    /// Validates a partial update against the algo's schema, journals it and
    /// posts `on_modify` onto its strand.
    pub fn modify(&self, id: AlgoId, params: ParamMap) -> Result<(), EngineError> {
        let handle = self
            .get(id)
            .filter(|h| h.is_active())
            .ok_or_else(|| EngineError::UnknownAlgo(id.to_string()))?;
        self.modify_algo(&handle, params)
    }

    pub fn modify_by_token(&self, token: &str, params: ParamMap) -> Result<(), EngineError> {
        let handle = self
            .get_by_token(token)
            .filter(|h| h.is_active())
            .ok_or_else(|| EngineError::UnknownAlgo(token.to_string()))?;
        self.modify_algo(&handle, params)
    }

    fn modify_algo(&self, handle: &Arc<AlgoHandle>, params: ParamMap) -> Result<(), EngineError> {
        if let Err(e) = handle.param_defs().validate_update(&params) {
            warn!(algo_id = handle.id(), token = handle.token(), error = %e, "Modify rejected");
            return Err(e.into());
        }
        let body = params.to_json()?;
        self.persist(handle, RecordStatus::Modified, &body);
        self.post(
            handle.strand(),
            Job::Modify {
                id: handle.id(),
                params,
            },
        );
        Ok(())
    }

    /// Stops every algo.
    pub fn stop_all(&self) {
        let handles: Vec<Arc<AlgoHandle>> =
            self.algos.iter().map(|e| Arc::clone(e.value())).collect();
        for handle in handles {
            self.stop_algo(&handle);
        }
    }

    /// Stops the algos holding an instrument on `sec`. Returns how many.
    pub fn stop_security(&self, sec: SecurityId) -> usize {
        let handles: Vec<Arc<AlgoHandle>> = self
            .algos
            .iter()
            .filter(|e| e.value().trades(sec))
            .map(|e| Arc::clone(e.value()))
            .collect();
        handles.iter().filter(|h| self.stop_algo(h)).count()
    }

    pub fn stop_token(&self, token: &str) -> bool {
        match self.get_by_token(token) {
            Some(handle) => self.stop_algo(&handle),
            None => false,
        }
    }

    pub fn stop_id(&self, id: AlgoId) -> bool {
        match self.get(id) {
            Some(handle) => self.stop_algo(&handle),
            None => false,
        }
    }

    /// Deactivates the algo and queues its `on_stop`. Returns false when it was
    /// already stopping.
    pub fn stop_algo(&self, handle: &AlgoHandle) -> bool {
        if !handle.deactivate() {
            return false;
        }
        debug!(algo_id = handle.id(), token = handle.token(), "Stopping algo");
        self.persist(handle, RecordStatus::Stopped, "");
        self.post(handle.strand(), Job::Stop { id: handle.id() });
        true
    }

    /// Entry point for order confirmations from execution adapters.
    pub fn handle(&self, cm: Confirmation) {
        if !cm.last_shares.is_finite() {
            warn!(
                order_id = cm.order_id,
                exec_type = %cm.exec_type,
                last_shares = cm.last_shares,
                "Confirmation with non-finite quantity dropped"
            );
            return;
        }
        let Some(binding) = self
            .orders
            .get(&cm.order_id)
            .map(|b| Arc::clone(b.value()))
        else {
            debug!(order_id = cm.order_id, exec_type = %cm.exec_type, "Confirmation for unknown order");
            return;
        };
        let algo_id = binding.order.algo_id;
        let Some(handle) = self.get(algo_id).filter(|h| h.is_active()) else {
            return;
        };

        if binding.apply(&cm) {
            self.orders.remove(&cm.order_id);
        }
        self.post(handle.strand(), Job::Confirmation { id: algo_id, cm });
    }

    /// Entry point for market data. Marks the pair dirty on every strand that
    /// wants it and returns without waiting for any callback.
    pub fn update(&self, src: DataSrc, sec: SecurityId, md: MarketData) {
        let key = (src, sec);
        if !self.md_refs.is_subscribed(key) {
            return;
        }
        for strand in self.strands.get().map(Vec::as_slice).unwrap_or_default() {
            strand.mark_dirty(key, md);
        }
    }

    /// Runs `f` on the algo's strand once at least `ms` milliseconds have passed.
    /// Skipped if the algo is no longer active by then.
    pub fn set_timeout<F>(&self, id: AlgoId, f: F, ms: u64) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(handle) = self.get(id).filter(|h| h.is_active()) else {
            return false;
        };
        let Some(strand) = self.strand(handle.strand()) else {
            return false;
        };
        self.schedule(ms, strand, Job::Task {
            id,
            task: Box::new(f),
        });
        true
    }

    pub(crate) fn schedule(&self, ms: u64, strand: Arc<Strand>, job: Job) {
        let Some(timer) = self.timer_handle.get() else {
            warn!("Timer service not running, timeout dropped");
            return;
        };
        timer.spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            strand.post(job);
        });
    }

    /// Appends a record for `handle`. A failed write is logged and flags
    /// durability as compromised; in-memory state is unaffected.
    pub fn persist(&self, handle: &AlgoHandle, status: RecordStatus, body: &str) {
        let mut seq = self.seq.lock();
        let record = AlgoRecord {
            seq: *seq,
            tm: Utc::now(),
            algo_id: handle.id(),
            token: handle.token().to_string(),
            name: handle.name().to_string(),
            user: handle.user().clone(),
            status,
            body: body.to_string(),
        };
        if let Err(e) = self.store.append(&record) {
            error!(seq = record.seq, token = %record.token, status = %record.status, error = %e, "Failed to persist algo record");
            self.durability_compromised.store(true, Ordering::Release);
        }
        *seq = seq.wrapping_add(1);
    }

    /// Replays the journal from `seq0`.
    ///
    /// With a `conn`, every record is streamed to it (monitoring). Without one
    /// this is the boot replay and the sequence counter resumes after the last
    /// replayed record.
    pub fn load_store(
        &self,
        seq0: u32,
        conn: Option<&dyn RecordSink>,
    ) -> Result<RecoveryState, PersistError> {
        let records = self.store.load(seq0)?;
        match conn {
            Some(conn) => {
                for record in &records {
                    conn.on_record(record);
                }
            }
            None => {
                // Resume after everything on disk, not just the replayed part
                if let Some(last) = self.store.last_seq()? {
                    let mut seq = self.seq.lock();
                    *seq = (*seq).max(last.wrapping_add(1));
                }
            }
        }
        let state = RecoveryState::from_records(&records);
        info!(seq0, records = state.records, live = state.live.len(), "Algo journal replayed");
        Ok(state)
    }

    /// Respawns every algo the journal shows as live, with its modifications
    /// applied. Returns how many came back.
    pub fn restore(&self, state: &RecoveryState) -> usize {
        let mut restored = 0;
        for algo in &state.live {
            let mut params = match ParamMap::from_json(&algo.params_raw) {
                Ok(params) => params,
                Err(e) => {
                    error!(token = %algo.token, error = %e, "Cannot decode params of journaled algo");
                    continue;
                }
            };
            for raw in &algo.modifications {
                match ParamMap::from_json(raw) {
                    Ok(update) => params.merge(update),
                    Err(e) => warn!(token = %algo.token, error = %e, "Skipping undecodable modification"),
                }
            }
            let params_raw = if algo.modifications.is_empty() {
                algo.params_raw.clone()
            } else {
                params.to_json().unwrap_or_else(|_| algo.params_raw.clone())
            };

            match self.spawn(params, &algo.name, &algo.user, &params_raw, &algo.token) {
                Ok(handle) => {
                    info!(
                        token = %algo.token,
                        previous_id = algo.algo_id,
                        algo_id = handle.id(),
                        "Journaled algo respawned"
                    );
                    restored += 1;
                }
                Err(e) => error!(token = %algo.token, name = %algo.name, error = %e, "Failed to restore algo"),
            }
        }
        info!(restored, live = state.live.len(), "Algos restored from journal");
        restored
    }

    pub fn get(&self, id: AlgoId) -> Option<Arc<AlgoHandle>> {
        self.algos.get(&id).map(|h| Arc::clone(h.value()))
    }

    pub fn get_by_token(&self, token: &str) -> Option<Arc<AlgoHandle>> {
        self.algo_of_token.get(token).map(|h| Arc::clone(h.value()))
    }

    pub fn algos(&self) -> Vec<Arc<AlgoHandle>> {
        let mut handles: Vec<Arc<AlgoHandle>> =
            self.algos.iter().map(|e| Arc::clone(e.value())).collect();
        handles.sort_by_key(|h| h.id());
        handles
    }

    pub fn is_subscribed(&self, src: DataSrc, sec: SecurityId) -> bool {
        self.md_refs.is_subscribed((src, sec))
    }

    pub fn subscriber_count(&self, src: DataSrc, sec: SecurityId) -> u32 {
        self.md_refs.count((src, sec))
    }

    pub fn is_durability_compromised(&self) -> bool {
        self.durability_compromised.load(Ordering::Acquire)
    }

    pub(crate) fn next_instrument_id(&self) -> InstrumentId {
        self.instrument_id_counter.fetch_add(1, Ordering::Relaxed)
    }

    /// Counts a new subscriber; the first one opens the feed.
    pub(crate) fn register(&self, inst: &Instrument) {
        if self.md_refs.acquire(inst.key()) == 1 {
            info!(src = %inst.src(), sec = inst.sec().id, symbol = %inst.sec().symbol, "Subscribing market data");
            self.market_data.subscribe(inst.src(), inst.sec().id);
        }
    }

    /// Drops a subscriber; the last one closes the feed.
    pub(crate) fn unregister_instrument(&self, inst: &Instrument) {
        for order_id in inst.active_orders() {
            self.orders.remove(&order_id);
        }
        if self.md_refs.release(inst.key()) == 0 {
            info!(src = %inst.src(), sec = inst.sec().id, "Unsubscribing market data");
            self.market_data.unsubscribe(inst.src(), inst.sec().id);
        }
    }

    pub(crate) fn unregister(&self, handle: &Arc<AlgoHandle>) {
        self.algo_of_token
            .remove_if(handle.token(), |_, h| Arc::ptr_eq(h, handle));
        self.algos.remove(&handle.id());
    }

    pub(crate) fn place(
        &self,
        handle: &AlgoHandle,
        inst: &Arc<Instrument>,
        contract: Contract,
    ) -> Result<Order, ExecutionError> {
        if !handle.is_active() {
            return Err(ExecutionError::Inactive {
                algo_id: handle.id(),
            });
        }

        let order = Order {
            id: self.order_id_counter.fetch_add(1, Ordering::Relaxed),
            algo_id: handle.id(),
            instrument_id: inst.id(),
            security_id: inst.sec().id,
            src: inst.src(),
            contract,
            tm: Utc::now().timestamp_millis(),
        };
        let side = order.contract.side;
        let qty = order.contract.qty.max(0.0);

        inst.open_order(order.id, side, qty);
        self.orders.insert(
            order.id,
            Arc::new(OrderBinding {
                order: order.clone(),
                instrument: Arc::clone(inst),
                leaves: Mutex::new(qty),
            }),
        );

        if let Err(e) = self.execution.place(&order) {
            warn!(algo_id = handle.id(), order_id = order.id, error = %e, "Order placement refused");
            self.orders.remove(&order.id);
            inst.close_order(order.id, side, qty);
            return Err(e);
        }
        debug!(algo_id = handle.id(), order_id = order.id, side = %side, qty, price = order.contract.price, "Order placed");
        Ok(order)
    }

    pub(crate) fn cancel(&self, order: &Order) -> Result<(), ExecutionError> {
        if !self.orders.contains_key(&order.id) {
            return Err(ExecutionError::UnknownOrder { order_id: order.id });
        }
        self.execution.cancel(order)
    }

    fn strand(&self, index: usize) -> Option<Arc<Strand>> {
        self.strands.get()?.get(index).cloned()
    }

    fn post(&self, index: usize, job: Job) {
        match self.strands.get().and_then(|s| s.get(index)) {
            Some(strand) => {
                strand.post(job);
            }
            None => warn!(strand = index, "No such strand, job dropped"),
        }
    }
}

impl Drop for AlgoManager {
    fn drop(&mut self) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        // Runners keep their own strand alive, so they need an explicit exit
        if let Some(strands) = self.strands.get() {
            for strand in strands {
                strand.post(Job::Shutdown);
            }
        }
        if let Some(runtime) = self.timer.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
