use crate::domain::errors::ExecutionError;
use crate::domain::types::{DataSrc, Order, SecurityId};

// Adapters must return immediately; outcomes arrive later through
// `AlgoManager::handle` and `AlgoManager::update`.

/// Outbound order routing to an exchange connectivity adapter.
pub trait ExecutionService: Send + Sync {
    fn place(&self, order: &Order) -> Result<(), ExecutionError>;
    fn cancel(&self, order: &Order) -> Result<(), ExecutionError>;
}

/// Feed control on a market-data adapter.
///
/// Called on the first subscriber of a pair and again when the last one leaves.
pub trait MarketDataService: Send + Sync {
    fn subscribe(&self, src: DataSrc, sec: SecurityId);
    fn unsubscribe(&self, src: DataSrc, sec: SecurityId);
}
