//! Plain atomic-counter metrics structs shared by pools and the scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct PoolMetrics {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    avg_latency_ms: Mutex<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolMetricsSnapshot {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
}

impl PoolMetrics {
    /// `avg' = ((n-1)*avg + duration) / n` (§4.5).
    pub fn record(&self, success: bool, duration_ms: f64) {
        let n = self.total.fetch_add(1, Ordering::Relaxed) + 1;
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut avg = self.avg_latency_ms.lock().expect("avg_latency_ms mutex poisoned");
        *avg = ((n - 1) as f64 * *avg + duration_ms) / n as f64;
    }

    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            avg_latency_ms: *self.avg_latency_ms.lock().expect("avg_latency_ms mutex poisoned"),
        }
    }
}

#[derive(Debug, Default)]
pub struct GlobalMetrics {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl GlobalMetrics {
    pub fn record(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }
}
