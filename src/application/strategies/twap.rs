//! Time-Weighted Average Price (TWAP) execution algorithm.
//!
//! Splits the quantity of a `SecurityTuple` evenly over a duration, sending one
//! limit slice per timer tick priced at the touch. An unfilled slice is
//! cancelled before the next one goes out, so its remainder rolls forward. The
//! algo stops itself once the target is filled or the last slice has had one
//! interval to work.

use tracing::{debug, info, warn};

use crate::application::algo::{Algo, AlgoContext};
use crate::domain::instrument::Instrument;
use crate::domain::params::{ParamDef, ParamDefs, ParamMap, SecurityTuple};
use crate::domain::types::{
    Confirmation, Contract, DataSrc, ExecType, MarketData, Order, OrderSide, Security,
    SubAccountId,
};

const SLICE_TIMER: u64 = 1;

#[derive(Debug, Default)]
pub struct TwapAlgo {
    src: DataSrc,
    security: Option<Security>,
    side: Option<OrderSide>,
    sub_account: SubAccountId,

    total_qty: f64,
    filled_qty: f64,
    num_slices: u32,
    executed_slices: u32,
    interval_ms: u64,
    /// Cross the spread instead of joining the near touch
    aggressive: bool,

    working: Vec<Order>,
}

impl TwapAlgo {
    pub const NAME: &'static str = "TWAP";

    fn apply(&mut self, params: &ParamMap) -> Result<(), String> {
        if let Some(tuple) = params.get_security("security") {
            self.apply_tuple(tuple)?;
        }
        let duration_secs = params
            .get_i64("duration_secs")
            .map_or(self.duration_secs(), |v| v.max(1) as u64);
        if let Some(slices) = params.get_i64("slices") {
            self.num_slices = (slices.max(1) as u32).max(self.executed_slices + 1);
        }
        if let Some(aggressive) = params.get_bool("aggressive") {
            self.aggressive = aggressive;
        }
        self.interval_ms = (duration_secs * 1000 / u64::from(self.num_slices.max(1))).max(1);
        Ok(())
    }

    fn apply_tuple(&mut self, tuple: &SecurityTuple) -> Result<(), String> {
        if tuple.qty <= 0.0 {
            return Err("TWAP total quantity must be positive".to_string());
        }
        if self.security.is_some() {
            // The traded security is fixed once started, only the target may move
            self.total_qty = tuple.qty.max(self.filled_qty);
            return Ok(());
        }
        self.src = tuple.src;
        self.security = Some(Security::new(tuple.sec, tuple.sec.to_string()));
        self.side = Some(tuple.side);
        self.sub_account = tuple.acc;
        self.total_qty = tuple.qty;
        Ok(())
    }

    fn duration_secs(&self) -> u64 {
        self.interval_ms * u64::from(self.num_slices) / 1000
    }

    fn is_complete(&self) -> bool {
        self.filled_qty >= self.total_qty
    }

    fn limit_price(&self, side: OrderSide, md: &MarketData) -> Option<f64> {
        let quote = &md.quote;
        let px = match (side, self.aggressive) {
            (OrderSide::Buy, false) | (OrderSide::Sell, true) => quote.bid_price,
            (OrderSide::Buy, true) | (OrderSide::Sell, false) => quote.ask_price,
        };
        if px > 0.0 {
            Some(px)
        } else if md.trade.close > 0.0 {
            Some(md.trade.close)
        } else {
            None
        }
    }

    fn cancel_working(&self, ctx: &AlgoContext<'_>) {
        for order in &self.working {
            if let Err(e) = ctx.cancel(order) {
                debug!(algo_id = ctx.id(), order_id = order.id, error = %e, "Cancel skipped");
            }
        }
    }

    fn send_slice(&mut self, ctx: &mut AlgoContext<'_>) {
        let (Some(sec), Some(side)) = (self.security.clone(), self.side) else {
            return;
        };
        let Some(inst) = ctx.instrument(sec.id, self.src) else {
            return;
        };
        self.cancel_working(ctx);

        let outstanding = match side {
            OrderSide::Buy => inst.outstanding_buy_qty(),
            OrderSide::Sell => inst.outstanding_sell_qty(),
        };
        let remaining = (self.total_qty - self.filled_qty - outstanding).max(0.0);
        let slices_left = self.num_slices.saturating_sub(self.executed_slices).max(1);
        let mut qty = remaining / f64::from(slices_left);
        if sec.lot_size > 0.0 && slices_left > 1 {
            qty = (qty / sec.lot_size).floor() * sec.lot_size;
        }
        self.executed_slices += 1;

        if qty <= 0.0 {
            return;
        }
        let Some(price) = self.limit_price(side, &inst.md()) else {
            warn!(algo_id = ctx.id(), slice = self.executed_slices, "No price yet, slice skipped");
            return;
        };

        let contract = Contract {
            sub_account: self.sub_account,
            ..Contract::limit(side, qty, price)
        };
        match ctx.place(contract, &inst) {
            Ok(order) => {
                debug!(
                    algo_id = ctx.id(),
                    order_id = order.id,
                    qty,
                    price,
                    slice = self.executed_slices,
                    "TWAP slice sent"
                );
                self.working.push(order);
            }
            Err(e) => warn!(algo_id = ctx.id(), error = %e, "TWAP slice rejected"),
        }
    }
}

impl Algo for TwapAlgo {
    fn param_defs(&self) -> ParamDefs {
        let tuple = SecurityTuple {
            src: DataSrc::DEFAULT,
            sec: 0,
            acc: 0,
            side: OrderSide::Buy,
            qty: 0.0,
        };
        ParamDefs::new(vec![
            ParamDef::new("security", tuple).required().precision(0),
            ParamDef::new("duration_secs", 300).bounds(1.0, 86_400.0),
            ParamDef::new("slices", 10).bounds(1.0, 10_000.0),
            ParamDef::new("aggressive", false),
        ])
    }

    fn on_start(&mut self, ctx: &mut AlgoContext<'_>, params: &ParamMap) -> Result<(), String> {
        self.num_slices = 1;
        self.apply(params)?;
        let Some(sec) = self.security.clone() else {
            return Err("TWAP needs a security".to_string());
        };
        ctx.subscribe(&sec, self.src);
        ctx.set_timeout(self.interval_ms, SLICE_TIMER);

        info!(
            algo_id = ctx.id(),
            token = ctx.token(),
            sec = sec.id,
            total_qty = self.total_qty,
            slices = self.num_slices,
            interval_ms = self.interval_ms,
            "TWAP algorithm started"
        );
        Ok(())
    }

    fn on_modify(&mut self, ctx: &mut AlgoContext<'_>, params: &ParamMap) {
        match self.apply(params) {
            Ok(()) => debug!(
                algo_id = ctx.id(),
                slices = self.num_slices,
                interval_ms = self.interval_ms,
                "TWAP parameters updated"
            ),
            Err(e) => ctx.persist("error", &e),
        }
    }

    fn on_stop(&mut self, ctx: &mut AlgoContext<'_>) {
        self.cancel_working(ctx);
        info!(
            algo_id = ctx.id(),
            filled = self.filled_qty,
            total = self.total_qty,
            slices = self.executed_slices,
            "TWAP algorithm stopped"
        );
    }

    fn on_market_trade(
        &mut self,
        _ctx: &mut AlgoContext<'_>,
        _inst: &Instrument,
        _md: &MarketData,
        _md0: &MarketData,
    ) {
    }

    fn on_market_quote(
        &mut self,
        _ctx: &mut AlgoContext<'_>,
        _inst: &Instrument,
        _md: &MarketData,
        _md0: &MarketData,
    ) {
    }

    fn on_confirmation(&mut self, ctx: &mut AlgoContext<'_>, cm: &Confirmation) {
        if matches!(cm.exec_type, ExecType::PartiallyFilled | ExecType::Filled) {
            self.filled_qty += cm.last_shares;
            ctx.persist(
                "progress",
                &format!("{:.4}/{:.4}", self.filled_qty, self.total_qty),
            );
        }
        if cm.exec_type.is_terminal() {
            self.working.retain(|o| o.id != cm.order_id);
        }
        if self.is_complete() {
            info!(algo_id = ctx.id(), filled = self.filled_qty, "TWAP target reached");
            ctx.stop();
        }
    }

    fn on_timeout(&mut self, ctx: &mut AlgoContext<'_>, tag: u64) {
        if tag != SLICE_TIMER {
            return;
        }
        if self.is_complete() || self.executed_slices >= self.num_slices {
            ctx.stop();
            return;
        }
        self.send_slice(ctx);
        ctx.set_timeout(self.interval_ms, SLICE_TIMER);
    }
}
