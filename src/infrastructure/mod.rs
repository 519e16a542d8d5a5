pub mod journal;
pub mod mock;
pub mod repositories;

pub use journal::JournalStore;
pub use mock::{MockExecutionService, MockMarketDataService};
pub use repositories::InMemoryAlgoStore;
