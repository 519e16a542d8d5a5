use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::domain::types::MdKey;

/// Subscriber counts per (source, security).
///
/// Count changes on a known key only touch its atomic under a shard read
/// lock. A new key takes the shard write lock once.
#[derive(Debug, Default)]
pub(crate) struct RefTable {
    refs: DashMap<MdKey, AtomicU32>,
}

impl RefTable {
    /// Adds one subscriber and returns the new count.
    pub(crate) fn acquire(&self, key: MdKey) -> u32 {
        if let Some(count) = self.refs.get(&key) {
            return count.fetch_add(1, Ordering::AcqRel) + 1;
        }
        self.refs
            .entry(key)
            .or_default()
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }

    /// Removes one subscriber and returns the new count. Never underflows.
    pub(crate) fn release(&self, key: MdKey) -> u32 {
        match self.refs.get(&key) {
            Some(count) => count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
                .map(|previous| previous - 1)
                .unwrap_or(0),
            None => 0,
        }
    }

    pub(crate) fn count(&self, key: MdKey) -> u32 {
        self.refs
            .get(&key)
            .map_or(0, |count| count.load(Ordering::Acquire))
    }

    pub(crate) fn is_subscribed(&self, key: MdKey) -> bool {
        self.count(key) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::DataSrc;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_acquire_release_counts() {
        let table = RefTable::default();
        let key = (DataSrc::DEFAULT, 1);

        assert!(!table.is_subscribed(key));
        assert_eq!(table.acquire(key), 1);
        assert_eq!(table.acquire(key), 2);
        assert_eq!(table.release(key), 1);
        assert!(table.is_subscribed(key));
        assert_eq!(table.release(key), 0);
        assert!(!table.is_subscribed(key));

        // Extra releases stay at zero
        assert_eq!(table.release(key), 0);
        assert_eq!(table.release((DataSrc::DEFAULT, 99)), 0);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let table = Arc::new(RefTable::default());
        let key = (DataSrc::from_code("TEST"), 7);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        table.acquire(key);
                    }
                    for _ in 0..500 {
                        table.release(key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(table.count(key), 8 * 500);
    }
}
