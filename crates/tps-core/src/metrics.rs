//! Atomic counters for domain observability.
//!
//! All counters use relaxed ordering. They are diagnostic only and never
//! used for synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-domain operation counters.
#[derive(Debug)]
pub struct TpsMetrics {
    /// Successful `create` calls.
    pub creates: AtomicU64,
    /// Successful `destroy` calls.
    pub destroys: AtomicU64,
    /// Successful clones.
    pub clones: AtomicU64,
    /// Successful reads.
    pub reads: AtomicU64,
    /// Successful writes (in place or forked).
    pub writes: AtomicU64,
    /// Writes that duplicated a shared page.
    pub cow_forks: AtomicU64,
    /// Regions obtained from the backend.
    pub pages_reserved: AtomicU64,
    /// Regions returned to the backend.
    pub pages_released: AtomicU64,
    /// Protection changes the backend refused.
    pub protection_failures: AtomicU64,
    /// Regions the backend refused to take back (leaked).
    pub release_failures: AtomicU64,
    /// Reads/writes rejected for bounds or buffer errors.
    pub rejected_accesses: AtomicU64,
}

impl TpsMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            creates: AtomicU64::new(0),
            destroys: AtomicU64::new(0),
            clones: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            cow_forks: AtomicU64::new(0),
            pages_reserved: AtomicU64::new(0),
            pages_released: AtomicU64::new(0),
            protection_failures: AtomicU64::new(0),
            release_failures: AtomicU64::new(0),
            rejected_accesses: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            creates: Self::get(&self.creates),
            destroys: Self::get(&self.destroys),
            clones: Self::get(&self.clones),
            reads: Self::get(&self.reads),
            writes: Self::get(&self.writes),
            cow_forks: Self::get(&self.cow_forks),
            pages_reserved: Self::get(&self.pages_reserved),
            pages_released: Self::get(&self.pages_released),
            protection_failures: Self::get(&self.protection_failures),
            release_failures: Self::get(&self.release_failures),
            rejected_accesses: Self::get(&self.rejected_accesses),
        }
    }
}

impl Default for TpsMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`TpsMetrics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub creates: u64,
    pub destroys: u64,
    pub clones: u64,
    pub reads: u64,
    pub writes: u64,
    pub cow_forks: u64,
    pub pages_reserved: u64,
    pub pages_released: u64,
    pub protection_failures: u64,
    pub release_failures: u64,
    pub rejected_accesses: u64,
}

impl MetricsSnapshot {
    /// Regions reserved and not yet released.
    #[must_use]
    pub const fn pages_outstanding(&self) -> u64 {
        self.pages_reserved.saturating_sub(self.pages_released)
    }
}
