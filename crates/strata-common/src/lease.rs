//! Reference-counted timestamp leases.
//!
//! A reader that performs several page reads at one snapshot timestamp holds a
//! lease on that timestamp. Compaction and garbage collection never discard
//! data that is visible at or after the oldest leased timestamp.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Set of timestamps currently in use.
#[derive(Debug, Default)]
pub struct TimestampLeases {
    /// Timestamp to holder count.
    counts: Mutex<BTreeMap<i64, usize>>,
}

impl TimestampLeases {
    /// Creates an empty lease set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a timestamp as in use.
    pub fn acquire(&self, timestamp: i64) {
        *self.counts.lock().entry(timestamp).or_insert(0) += 1;
    }

    /// Drops one hold on a timestamp. Releasing an unheld timestamp is a no-op.
    pub fn release(&self, timestamp: i64) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(&timestamp) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&timestamp);
            }
        }
    }

    /// Returns the oldest timestamp currently in use.
    pub fn oldest(&self) -> Option<i64> {
        self.counts.lock().keys().next().copied()
    }

    /// Returns true if no timestamp is in use.
    pub fn is_empty(&self) -> bool {
        self.counts.lock().is_empty()
    }

    /// Returns the number of holders of a timestamp.
    pub fn holders(&self, timestamp: i64) -> usize {
        self.counts.lock().get(&timestamp).copied().unwrap_or(0)
    }

    /// Acquires a timestamp and returns a guard that releases it on drop.
    pub fn lease(self: &Arc<Self>, timestamp: i64) -> TimestampLease {
        self.acquire(timestamp);
        TimestampLease {
            leases: Arc::clone(self),
            timestamp,
        }
    }
}

/// Scoped hold on a timestamp.
#[derive(Debug)]
pub struct TimestampLease {
    leases: Arc<TimestampLeases>,
    timestamp: i64,
}

impl TimestampLease {
    /// Returns the leased timestamp.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

impl Drop for TimestampLease {
    fn drop(&mut self) {
        self.leases.release(self.timestamp);
    }
}
