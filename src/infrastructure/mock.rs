//! In-process adapters for local runs and tests.

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::info;

use crate::domain::errors::ExecutionError;
use crate::domain::ports::{ExecutionService, MarketDataService};
use crate::domain::types::{DataSrc, MdKey, Order, SecurityId};

/// Records every order sent and cancelled. Optionally forwards placed orders
/// to a channel so a driver can answer them with confirmations.
#[derive(Default)]
pub struct MockExecutionService {
    placed: RwLock<Vec<Order>>,
    cancelled: RwLock<Vec<Order>>,
    reject_reason: RwLock<Option<String>>,
    notify: Option<Sender<Order>>,
}

impl MockExecutionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notify(notify: Sender<Order>) -> Self {
        Self {
            notify: Some(notify),
            ..Self::default()
        }
    }

    /// Refuse every following placement with `reason`, or accept again on `None`.
    pub fn set_reject(&self, reason: Option<&str>) {
        *self.reject_reason.write() = reason.map(str::to_string);
    }

    pub fn placed(&self) -> Vec<Order> {
        self.placed.read().clone()
    }

    pub fn cancelled(&self) -> Vec<Order> {
        self.cancelled.read().clone()
    }
}

impl ExecutionService for MockExecutionService {
    fn place(&self, order: &Order) -> Result<(), ExecutionError> {
        if let Some(reason) = self.reject_reason.read().clone() {
            return Err(ExecutionError::Rejected { reason });
        }
        info!(
            "MockExecution: Placing order {} {} {} @ {}",
            order.id, order.contract.side, order.contract.qty, order.contract.price
        );
        self.placed.write().push(order.clone());
        if let Some(notify) = &self.notify {
            let _ = notify.send(order.clone());
        }
        Ok(())
    }

    fn cancel(&self, order: &Order) -> Result<(), ExecutionError> {
        info!("MockExecution: Cancelling order {}", order.id);
        self.cancelled.write().push(order.clone());
        Ok(())
    }
}

/// Tracks which feeds are open and how often each was opened.
#[derive(Default)]
pub struct MockMarketDataService {
    active: RwLock<HashSet<MdKey>>,
    subscribe_calls: RwLock<Vec<MdKey>>,
    unsubscribe_calls: RwLock<Vec<MdKey>>,
}

impl MockMarketDataService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, src: DataSrc, sec: SecurityId) -> bool {
        self.active.read().contains(&(src, sec))
    }

    pub fn subscribe_calls(&self) -> Vec<MdKey> {
        self.subscribe_calls.read().clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<MdKey> {
        self.unsubscribe_calls.read().clone()
    }
}

impl MarketDataService for MockMarketDataService {
    fn subscribe(&self, src: DataSrc, sec: SecurityId) {
        info!("MockMarketDataService: subscribe {}:{}", src, sec);
        self.active.write().insert((src, sec));
        self.subscribe_calls.write().push((src, sec));
    }

    fn unsubscribe(&self, src: DataSrc, sec: SecurityId) {
        info!("MockMarketDataService: unsubscribe {}:{}", src, sec);
        self.active.write().remove(&(src, sec));
        self.unsubscribe_calls.write().push((src, sec));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Contract, OrderSide};

    fn order(id: u64) -> Order {
        Order {
            id,
            algo_id: 1,
            instrument_id: 1,
            security_id: 3,
            src: DataSrc::DEFAULT,
            contract: Contract::limit(OrderSide::Buy, 5.0, 10.0),
            tm: 0,
        }
    }

    #[test]
    fn test_mock_execution_records_and_rejects() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let exec = MockExecutionService::with_notify(tx);

        exec.place(&order(1)).unwrap();
        assert_eq!(rx.try_recv().unwrap().id, 1);

        exec.set_reject(Some("halted"));
        let err = exec.place(&order(2)).unwrap_err();
        assert_eq!(
            err,
            ExecutionError::Rejected {
                reason: "halted".to_string()
            }
        );
        assert_eq!(exec.placed().len(), 1);

        exec.cancel(&order(1)).unwrap();
        assert_eq!(exec.cancelled().len(), 1);
    }

    #[test]
    fn test_mock_market_data_tracks_feeds() {
        let md = MockMarketDataService::new();
        md.subscribe(DataSrc::DEFAULT, 3);
        assert!(md.is_active(DataSrc::DEFAULT, 3));
        md.unsubscribe(DataSrc::DEFAULT, 3);
        assert!(!md.is_active(DataSrc::DEFAULT, 3));
        assert_eq!(md.subscribe_calls().len(), 1);
        assert_eq!(md.unsubscribe_calls().len(), 1);
    }
}
