//! Pipeline stage timing.
//!
//! Provides nanosecond-resolution timestamps and per-stage duration accumulators.
//! On Linux, timestamps use `CLOCK_MONOTONIC_RAW` (immune to NTP slew).
//! On other platforms, an `Instant`-based fallback is used.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Nanosecond timestamp via `CLOCK_MONOTONIC_RAW` (Linux) or `Instant` (other platforms).
#[inline(always)]
pub fn now_ns() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::time::Instant;
        static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_nanos() as u64
    }
}

/// Total duration and call count of one stage.
pub struct StageTotals {
    total_ns: AtomicU64,
    count: AtomicU64,
}

impl StageTotals {
    pub const fn new() -> Self {
        Self { total_ns: AtomicU64::new(0), count: AtomicU64::new(0) }
    }

    pub fn record(&self, duration_ns: u64) {
        self.total_ns.fetch_add(duration_ns, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn avg_ns(&self) -> u64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0;
        }
        self.total_ns.load(Ordering::Relaxed) / count
    }
}

/// Receive-to-assemble queueing latency, per-packet assembly and per-frame
/// reorder durations.
///
/// All fields use `Relaxed` ordering; these are sampling metrics.
pub struct StageMetrics {
    pub queue: StageTotals,
    pub assemble: StageTotals,
    pub reorder: StageTotals,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StageSnapshot {
    pub queue_avg_ns: u64,
    pub queue_count: u64,
    pub assemble_avg_ns: u64,
    pub assemble_count: u64,
    pub reorder_avg_ns: u64,
    pub reorder_count: u64,
}

impl StageMetrics {
    pub const fn new() -> Self {
        Self { queue: StageTotals::new(), assemble: StageTotals::new(), reorder: StageTotals::new() }
    }

    pub fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            queue_avg_ns: self.queue.avg_ns(),
            queue_count: self.queue.count(),
            assemble_avg_ns: self.assemble.avg_ns(),
            assemble_count: self.assemble.count(),
            reorder_avg_ns: self.reorder.avg_ns(),
            reorder_count: self.reorder.count(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_avg_ns() {
        let m = StageMetrics::new();
        assert_eq!(m.reorder.avg_ns(), 0);
        m.reorder.record(100);
        m.reorder.record(300);
        let snap = m.snapshot();
        assert_eq!(snap.reorder_avg_ns, 200);
        assert_eq!(snap.reorder_count, 2);
        assert_eq!(snap.assemble_count, 0);
        assert_eq!(snap.queue_count, 0);
    }

    #[test]
    fn test_now_ns_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
