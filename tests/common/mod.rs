#![allow(dead_code)]

use algo_engine::application::{Algo, AlgoContext, AlgoManager, AlgoRegistry};
use algo_engine::domain::instrument::Instrument;
use algo_engine::domain::params::{ParamDef, ParamDefs, ParamMap};
use algo_engine::domain::repositories::AlgoStore;
use algo_engine::domain::types::{
    AlgoId, Confirmation, Contract, DataSrc, ExecType, InstrumentId, MarketData, Order, OrderId,
    OrderSide, Security, User,
};
use algo_engine::infrastructure::{InMemoryAlgoStore, MockExecutionService, MockMarketDataService};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const RECORDER: &str = "RECORDER";
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Started(AlgoId),
    Modified(AlgoId, ParamMap),
    Trade {
        id: AlgoId,
        close: f64,
        prev_close: f64,
    },
    Quote {
        id: AlgoId,
        bid: f64,
        prev_bid: f64,
    },
    Confirmation(AlgoId, OrderId, ExecType),
    Timeout(AlgoId, u64),
    Stopped(AlgoId),
}

/// State shared by every recorder algo of one engine.
pub struct Recorder {
    pub events: Sender<Event>,
    busy: Mutex<Vec<AlgoId>>,
    pub overlaps: AtomicUsize,
    pub instruments: Mutex<Vec<Arc<Instrument>>>,
    pub orders: Mutex<Vec<Order>>,
    pub place_on_trade: AtomicBool,
}

impl Recorder {
    fn enter(&self, id: AlgoId) {
        let mut busy = self.busy.lock();
        if busy.contains(&id) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        busy.push(id);
    }

    fn exit(&self, id: AlgoId) {
        let mut busy = self.busy.lock();
        if let Some(pos) = busy.iter().position(|b| *b == id) {
            busy.remove(pos);
        }
    }

    pub fn instruments_of(&self, id: AlgoId) -> Vec<Arc<Instrument>> {
        self.instruments
            .lock()
            .iter()
            .filter(|i| i.algo_id() == id)
            .cloned()
            .collect()
    }

    pub fn orders_of(&self, id: AlgoId) -> Vec<Order> {
        self.orders
            .lock()
            .iter()
            .filter(|o| o.algo_id == id)
            .cloned()
            .collect()
    }
}

/// Test strategy recording every callback it receives.
///
/// Params: `qty` (required), `sec` first security to subscribe (0 for none),
/// `extra` further consecutive securities, `orders` buy orders of `qty` placed
/// at start, `fail` to reject the start, `work_us` busy time per callback,
/// `timer_ms` to arm one timer at start.
pub struct RecorderAlgo {
    recorder: Arc<Recorder>,
    work: Duration,
}

impl RecorderAlgo {
    fn busy_wait(&self) {
        let until = Instant::now() + self.work;
        while Instant::now() < until {
            std::hint::spin_loop();
        }
    }

    fn start_recording(&mut self, ctx: &mut AlgoContext<'_>, params: &ParamMap) -> Result<(), String> {
        if params.get_bool("fail").unwrap_or(false) {
            let sec = params.get_i64("sec").unwrap_or(0) as u32;
            if sec > 0 {
                ctx.subscribe(&Security::new(sec, "FAIL"), DataSrc::DEFAULT);
            }
            return Err("forced failure".to_string());
        }

        let qty = params.get_f64("qty").ok_or("qty missing")?;
        let sec = params.get_i64("sec").unwrap_or(0) as u32;
        let extra = params.get_i64("extra").unwrap_or(0) as u32;
        if sec > 0 {
            for s in sec..=sec + extra {
                let inst = ctx.subscribe(&Security::new(s, format!("S{}", s)), DataSrc::DEFAULT);
                // Subscribing twice hands back the same instrument
                let again = ctx.subscribe(&Security::new(s, format!("S{}", s)), DataSrc::DEFAULT);
                assert_eq!(inst.id(), again.id());
                self.recorder.instruments.lock().push(inst);
            }
            let inst = ctx
                .instrument(sec, DataSrc::DEFAULT)
                .ok_or("instrument missing")?;
            for _ in 0..params.get_i64("orders").unwrap_or(0) {
                let order = ctx
                    .place(Contract::limit(OrderSide::Buy, qty, 10.0), &inst)
                    .map_err(|e| e.to_string())?;
                self.recorder.orders.lock().push(order);
            }
        }
        let timer_ms = params.get_i64("timer_ms").unwrap_or(0);
        if timer_ms > 0 {
            ctx.set_timeout(timer_ms as u64, 7);
        }
        Ok(())
    }

    fn guarded<F: FnOnce()>(&self, id: AlgoId, f: F) {
        self.recorder.enter(id);
        self.busy_wait();
        f();
        self.recorder.exit(id);
    }
}

impl Algo for RecorderAlgo {
    fn param_defs(&self) -> ParamDefs {
        ParamDefs::new(vec![
            ParamDef::new("qty", 0.0).required().bounds(0.0, 1_000_000.0),
            ParamDef::new("sec", 0),
            ParamDef::new("extra", 0).bounds(0.0, 100.0),
            ParamDef::new("orders", 0).bounds(0.0, 100.0),
            ParamDef::new("fail", false),
            ParamDef::new("work_us", 0).bounds(0.0, 10_000.0),
            ParamDef::new("timer_ms", 0),
        ])
    }

    fn on_start(&mut self, ctx: &mut AlgoContext<'_>, params: &ParamMap) -> Result<(), String> {
        let id = ctx.id();
        self.recorder.enter(id);
        self.work = Duration::from_micros(params.get_i64("work_us").unwrap_or(0) as u64);

        let result = self.start_recording(ctx, params);

        if result.is_ok() {
            let _ = self.recorder.events.send(Event::Started(id));
        }
        self.recorder.exit(id);
        result
    }

    fn on_modify(&mut self, ctx: &mut AlgoContext<'_>, params: &ParamMap) {
        let id = ctx.id();
        self.guarded(id, || {
            let _ = self.recorder.events.send(Event::Modified(id, params.clone()));
        });
    }

    fn on_stop(&mut self, ctx: &mut AlgoContext<'_>) {
        let id = ctx.id();
        self.guarded(id, || {
            let _ = self.recorder.events.send(Event::Stopped(id));
        });
    }

    fn on_market_trade(
        &mut self,
        ctx: &mut AlgoContext<'_>,
        inst: &Instrument,
        md: &MarketData,
        md0: &MarketData,
    ) {
        let id = ctx.id();
        self.recorder.enter(id);
        self.busy_wait();
        let _ = self.recorder.events.send(Event::Trade {
            id,
            close: md.trade.close,
            prev_close: md0.trade.close,
        });
        if self.recorder.place_on_trade.load(Ordering::SeqCst) {
            if let Ok(order) = ctx.place(Contract::limit(OrderSide::Sell, 1.0, md.trade.close), inst) {
                self.recorder.orders.lock().push(order);
            }
        }
        self.recorder.exit(id);
    }

    fn on_market_quote(
        &mut self,
        ctx: &mut AlgoContext<'_>,
        _inst: &Instrument,
        md: &MarketData,
        md0: &MarketData,
    ) {
        let id = ctx.id();
        self.guarded(id, || {
            let _ = self.recorder.events.send(Event::Quote {
                id,
                bid: md.quote.bid_price,
                prev_bid: md0.quote.bid_price,
            });
        });
    }

    fn on_confirmation(&mut self, ctx: &mut AlgoContext<'_>, cm: &Confirmation) {
        let id = ctx.id();
        self.guarded(id, || {
            let _ = self
                .recorder
                .events
                .send(Event::Confirmation(id, cm.order_id, cm.exec_type));
        });
    }

    fn on_timeout(&mut self, ctx: &mut AlgoContext<'_>, tag: u64) {
        let id = ctx.id();
        self.guarded(id, || {
            let _ = self.recorder.events.send(Event::Timeout(id, tag));
        });
    }
}

pub struct Harness<S: AlgoStore + 'static = InMemoryAlgoStore> {
    pub manager: Arc<AlgoManager>,
    pub recorder: Arc<Recorder>,
    pub events: Receiver<Event>,
    pub execution: Arc<MockExecutionService>,
    pub market_data: Arc<MockMarketDataService>,
    pub store: Arc<S>,
}

impl Harness {
    pub fn new(threads: usize) -> Self {
        Self::with_store(threads, Arc::new(InMemoryAlgoStore::new()))
    }
}

impl<S: AlgoStore + 'static> Harness<S> {
    pub fn with_store(threads: usize, store: Arc<S>) -> Self {
        let (tx, events) = crossbeam_channel::unbounded();
        let recorder = Arc::new(Recorder {
            events: tx,
            busy: Mutex::new(Vec::new()),
            overlaps: AtomicUsize::new(0),
            instruments: Mutex::new(Vec::new()),
            orders: Mutex::new(Vec::new()),
            place_on_trade: AtomicBool::new(false),
        });

        let mut registry = AlgoRegistry::with_builtin();
        let factory_recorder = Arc::clone(&recorder);
        registry.register(RECORDER, move || {
            Box::new(RecorderAlgo {
                recorder: Arc::clone(&factory_recorder),
                work: Duration::ZERO,
            })
        });

        let execution = Arc::new(MockExecutionService::new());
        let market_data = Arc::new(MockMarketDataService::new());
        let manager = AlgoManager::new(
            registry,
            execution.clone(),
            market_data.clone(),
            store.clone() as Arc<dyn AlgoStore>,
        );
        manager.start(threads).unwrap();

        Self {
            manager,
            recorder,
            events,
            execution,
            market_data,
            store,
        }
    }

    pub fn spawn(&self, token: &str, params: ParamMap) -> AlgoId {
        let raw = params.to_json().unwrap();
        self.manager
            .spawn(params, RECORDER, &user(), &raw, token)
            .unwrap()
            .id()
    }

    /// Next event, failing the test if none arrives in time.
    pub fn next_event(&self) -> Event {
        self.events
            .recv_timeout(WAIT)
            .expect("timed out waiting for an algo event")
    }

    /// Skips events until one matches `pred`.
    pub fn wait_for<F: Fn(&Event) -> bool>(&self, pred: F) -> Event {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.events.recv_timeout(remaining) {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(_) => panic!("timed out waiting for a matching algo event"),
            }
        }
    }

    /// Collects whatever arrives within `quiet`.
    pub fn drain_events(&self, quiet: Duration) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.recv_timeout(quiet) {
            events.push(event);
        }
        events
    }

    pub fn instrument_of(&self, id: AlgoId) -> Arc<Instrument> {
        self.recorder
            .instruments_of(id)
            .into_iter()
            .next()
            .expect("algo has no instrument")
    }

    pub fn instrument_ids(&self) -> Vec<InstrumentId> {
        self.recorder.instruments.lock().iter().map(|i| i.id()).collect()
    }
}

impl<S: AlgoStore + 'static> Drop for Harness<S> {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}

pub fn user() -> User {
    User::new(1, "tester")
}

pub fn params(qty: f64, sec: i32) -> ParamMap {
    ParamMap::new().with("qty", qty).with("sec", sec)
}

pub fn trade(px: f64) -> MarketData {
    let mut md = MarketData::default();
    md.trade.update(px, 1.0);
    md
}

/// Polls `cond` until it holds or the wait expires.
pub fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
