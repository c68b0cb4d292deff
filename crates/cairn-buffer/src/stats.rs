//! Buffer pool statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the buffer manager.
///
/// Atomic so the pool never needs a lock to bump them; relaxed ordering
/// is enough because the counters are observational only.
#[derive(Debug, Default)]
pub struct BufferStats {
    /// Buffer accesses (reads, allocations, unpins, flush probes).
    pub accesses: AtomicU64,
    /// Pages read from the paged file.
    pub disk_reads: AtomicU64,
    /// Pages written back to the paged file.
    pub disk_writes: AtomicU64,
}

impl BufferStats {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_access(&self) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_disk_read(&self) {
        self.disk_reads.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_disk_write(&self) {
        self.disk_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a plain copy of the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accesses: self.accesses.load(Ordering::Relaxed),
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.disk_writes.load(Ordering::Relaxed),
        }
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        self.accesses.store(0, Ordering::Relaxed);
        self.disk_reads.store(0, Ordering::Relaxed);
        self.disk_writes.store(0, Ordering::Relaxed);
    }
}

/// A point-in-time copy of the buffer pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accesses: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accesses: {}, disk reads: {}, disk writes: {}",
            self.accesses, self.disk_reads, self.disk_writes
        )
    }
}
