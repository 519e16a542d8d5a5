mod store;

pub use store::JournalStore;
