mod twap;

pub use twap::TwapAlgo;
