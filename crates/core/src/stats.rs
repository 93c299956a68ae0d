//! Pass-wide counters (§12), grounded on the teacher's `p2p::metrics::Metrics`
//! struct: plain `AtomicU64` fields bumped from wherever the event happens,
//! snapshotted into a plain struct for logging at the end of a pass.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct PassStats {
    pub reconstruction_part_count: AtomicU64,
    pub suffix_count: AtomicU64,
    pub suffix_sync: AtomicU64,
    pub handoffs_remaining: AtomicU64,
    pub jobs_succeeded: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_deferred: AtomicU64,
    pub objects_deleted: AtomicU64,
    pub bytes_rebuilt: AtomicU64,
}

impl PassStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PassStatsSnapshot {
        PassStatsSnapshot {
            reconstruction_part_count: self.reconstruction_part_count.load(Ordering::Relaxed),
            suffix_count: self.suffix_count.load(Ordering::Relaxed),
            suffix_sync: self.suffix_sync.load(Ordering::Relaxed),
            handoffs_remaining: self.handoffs_remaining.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_deferred: self.jobs_deferred.load(Ordering::Relaxed),
            objects_deleted: self.objects_deleted.load(Ordering::Relaxed),
            bytes_rebuilt: self.bytes_rebuilt.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PassStatsSnapshot {
    pub reconstruction_part_count: u64,
    pub suffix_count: u64,
    pub suffix_sync: u64,
    pub handoffs_remaining: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_deferred: u64,
    pub objects_deleted: u64,
    pub bytes_rebuilt: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let stats = PassStats::new();
        PassStats::incr(&stats.jobs_succeeded, 3);
        PassStats::incr(&stats.jobs_succeeded, 2);
        let snap = stats.snapshot();
        assert_eq!(snap.jobs_succeeded, 5);
    }
}
