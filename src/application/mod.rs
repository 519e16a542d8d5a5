//! Scheduling core: strategy contract, strands, runners and the manager.

pub mod algo;
pub mod manager;
pub mod registry;
pub mod runner;
pub mod strand;
pub mod strategies;
pub(crate) mod subscriptions;

pub use algo::{Algo, AlgoContext, AlgoHandle};
pub use manager::AlgoManager;
pub use registry::{AlgoFactory, AlgoRegistry};
pub use strand::Strand;
