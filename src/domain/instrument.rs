//! Per-algo subscription handle for one (source, security) pair.

use parking_lot::Mutex;
use std::collections::BTreeSet;

use crate::domain::types::{
    AlgoId, DataSrc, InstrumentId, MarketData, MdKey, OrderId, OrderSide, Security,
};

/// Filled and outstanding quantities of one instrument.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InstrumentPosition {
    pub bought_qty: f64,
    pub sold_qty: f64,
    pub outstanding_buy_qty: f64,
    pub outstanding_sell_qty: f64,
}

impl InstrumentPosition {
    pub fn net_qty(&self) -> f64 {
        self.bought_qty - self.sold_qty
    }

    pub fn total_qty(&self) -> f64 {
        self.bought_qty + self.sold_qty
    }

    pub fn net_outstanding_qty(&self) -> f64 {
        self.outstanding_buy_qty - self.outstanding_sell_qty
    }

    pub fn total_outstanding_qty(&self) -> f64 {
        self.outstanding_buy_qty + self.outstanding_sell_qty
    }

    /// Quantity a risk check should use.
    pub fn total_exposure(&self) -> f64 {
        self.total_qty() + self.total_outstanding_qty()
    }
}

#[derive(Debug, Default)]
struct InstrumentState {
    md: MarketData,
    active_orders: BTreeSet<OrderId>,
    position: InstrumentPosition,
}

/// An algo's subscription to one security on one data source.
///
/// Strategy code only reads it; quantities change through the manager as orders
/// are placed and confirmations arrive.
#[derive(Debug)]
pub struct Instrument {
    id: InstrumentId,
    algo_id: AlgoId,
    sec: Security,
    src: DataSrc,
    state: Mutex<InstrumentState>,
}

impl Instrument {
    pub(crate) fn new(id: InstrumentId, algo_id: AlgoId, sec: Security, src: DataSrc) -> Self {
        Self {
            id,
            algo_id,
            sec,
            src,
            state: Mutex::new(InstrumentState::default()),
        }
    }

    pub fn id(&self) -> InstrumentId {
        self.id
    }

    /// Id of the owning algo.
    pub fn algo_id(&self) -> AlgoId {
        self.algo_id
    }

    pub fn sec(&self) -> &Security {
        &self.sec
    }

    pub fn src(&self) -> DataSrc {
        self.src
    }

    pub fn key(&self) -> MdKey {
        (self.src, self.sec.id)
    }

    /// Last snapshot delivered to the owning algo for this pair.
    pub fn md(&self) -> MarketData {
        self.state.lock().md
    }

    pub fn active_orders(&self) -> Vec<OrderId> {
        self.state.lock().active_orders.iter().copied().collect()
    }

    pub fn position(&self) -> InstrumentPosition {
        self.state.lock().position
    }

    pub fn bought_qty(&self) -> f64 {
        self.position().bought_qty
    }

    pub fn sold_qty(&self) -> f64 {
        self.position().sold_qty
    }

    pub fn outstanding_buy_qty(&self) -> f64 {
        self.position().outstanding_buy_qty
    }

    pub fn outstanding_sell_qty(&self) -> f64 {
        self.position().outstanding_sell_qty
    }

    pub fn net_qty(&self) -> f64 {
        self.position().net_qty()
    }

    pub fn total_qty(&self) -> f64 {
        self.position().total_qty()
    }

    pub fn net_outstanding_qty(&self) -> f64 {
        self.position().net_outstanding_qty()
    }

    pub fn total_outstanding_qty(&self) -> f64 {
        self.position().total_outstanding_qty()
    }

    pub fn total_exposure(&self) -> f64 {
        self.position().total_exposure()
    }

    pub(crate) fn set_md(&self, md: MarketData) {
        self.state.lock().md = md;
    }

    /// Books a freshly placed order as outstanding.
    pub(crate) fn open_order(&self, order_id: OrderId, side: OrderSide, qty: f64) {
        let mut state = self.state.lock();
        state.active_orders.insert(order_id);
        let qty = qty.max(0.0);
        match side {
            OrderSide::Buy => state.position.outstanding_buy_qty += qty,
            OrderSide::Sell => state.position.outstanding_sell_qty += qty,
        }
    }

    /// Books a fill of `fill_qty`, releasing `released_qty` of outstanding.
    /// The two differ only when an order is overfilled.
    pub(crate) fn fill(&self, side: OrderSide, fill_qty: f64, released_qty: f64) {
        let mut state = self.state.lock();
        let fill_qty = fill_qty.max(0.0);
        let released_qty = released_qty.max(0.0);
        let position = &mut state.position;
        match side {
            OrderSide::Buy => {
                position.bought_qty += fill_qty;
                position.outstanding_buy_qty =
                    (position.outstanding_buy_qty - released_qty).max(0.0);
            }
            OrderSide::Sell => {
                position.sold_qty += fill_qty;
                position.outstanding_sell_qty =
                    (position.outstanding_sell_qty - released_qty).max(0.0);
            }
        }
    }

    /// Releases the unfilled remainder of an order that reached a terminal state.
    pub(crate) fn close_order(&self, order_id: OrderId, side: OrderSide, leaves_qty: f64) {
        let mut state = self.state.lock();
        state.active_orders.remove(&order_id);
        let qty = leaves_qty.max(0.0);
        let position = &mut state.position;
        match side {
            OrderSide::Buy => {
                position.outstanding_buy_qty = (position.outstanding_buy_qty - qty).max(0.0)
            }
            OrderSide::Sell => {
                position.outstanding_sell_qty = (position.outstanding_sell_qty - qty).max(0.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument() -> Instrument {
        Instrument::new(1, 1, Security::new(42, "ACME"), DataSrc::DEFAULT)
    }

    fn assert_invariants(inst: &Instrument) {
        let p = inst.position();
        assert!(p.bought_qty >= 0.0);
        assert!(p.sold_qty >= 0.0);
        assert!(p.outstanding_buy_qty >= 0.0);
        assert!(p.outstanding_sell_qty >= 0.0);
        assert_eq!(p.total_exposure(), p.total_qty() + p.total_outstanding_qty());
        assert!(p.total_exposure() >= (p.net_qty() + p.net_outstanding_qty()).abs());
    }

    #[test]
    fn test_open_fill_close_lifecycle() {
        let inst = instrument();

        inst.open_order(10, OrderSide::Buy, 100.0);
        assert_eq!(inst.outstanding_buy_qty(), 100.0);
        assert_eq!(inst.active_orders(), vec![10]);
        assert_invariants(&inst);

        inst.fill(OrderSide::Buy, 40.0, 40.0);
        assert_eq!(inst.bought_qty(), 40.0);
        assert_eq!(inst.outstanding_buy_qty(), 60.0);
        assert_invariants(&inst);

        inst.close_order(10, OrderSide::Buy, 60.0);
        assert_eq!(inst.outstanding_buy_qty(), 0.0);
        assert!(inst.active_orders().is_empty());
        assert_eq!(inst.net_qty(), 40.0);
        assert_invariants(&inst);
    }

    #[test]
    fn test_quantities_never_go_negative() {
        let inst = instrument();

        inst.open_order(1, OrderSide::Sell, 10.0);
        // Overfill and over-release must saturate at zero
        inst.fill(OrderSide::Sell, 15.0, 15.0);
        inst.close_order(1, OrderSide::Sell, 5.0);
        inst.close_order(2, OrderSide::Buy, 5.0);

        assert_eq!(inst.sold_qty(), 15.0);
        assert_eq!(inst.outstanding_sell_qty(), 0.0);
        assert_eq!(inst.outstanding_buy_qty(), 0.0);
        assert_eq!(inst.net_qty(), -15.0);
        assert_invariants(&inst);
    }

    #[test]
    fn test_mixed_sides_exposure() {
        let inst = instrument();
        inst.open_order(1, OrderSide::Buy, 10.0);
        inst.open_order(2, OrderSide::Sell, 4.0);
        inst.fill(OrderSide::Buy, 10.0, 10.0);
        inst.close_order(1, OrderSide::Buy, 0.0);

        let p = inst.position();
        assert_eq!(p.net_qty(), 10.0);
        assert_eq!(p.net_outstanding_qty(), -4.0);
        assert_eq!(p.total_exposure(), 14.0);
        assert_invariants(&inst);
    }
}
