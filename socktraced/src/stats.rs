use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use socktrace_common::{KernStats, OffsetConfig};

/// Counters shared across the reader, workers and periodic tasks.
///
/// Everything here is touched from hot paths, so all fields are relaxed
/// atomics; snapshots are taken without locks.
#[derive(Default)]
pub struct Stats {
    /// Events the perf ring dropped before the reader saw them.
    pub kern_lost: AtomicU64,
    /// Burst payloads that failed to parse.
    pub parse_errors: AtomicU64,
    pub perf_poll_errors: AtomicU64,
    /// Entries reclaimed from the session map.
    pub socket_reclaims: AtomicU64,
    /// Entries reclaimed from the trace map.
    pub trace_reclaims: AtomicU64,
    /// Gauges refreshed by the reclaimer's scan.
    pub socket_map_used: AtomicU64,
    pub trace_map_used: AtomicU64,
    pub adapt_success: AtomicBool,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_kern_lost(&self, n: u64) {
        self.kern_lost.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_perf_poll_error(&self) {
        self.perf_poll_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_adapt_success(&self) -> bool {
        self.adapt_success.load(Ordering::Relaxed)
    }

    pub fn set_adapt_success(&self) {
        self.adapt_success.store(true, Ordering::Relaxed);
    }
}

/// Per-queue counter snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct QueueCounters {
    pub enqueued: u64,
    pub dequeued: u64,
    pub enqueue_lost: u64,
    pub burst_count: u64,
}

/// Snapshot returned by `socket_tracer_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct SocketTracerStats {
    pub state: &'static str,
    pub is_adapt_success: bool,
    pub kern_lost: u64,
    pub parse_errors: u64,
    pub perf_poll_errors: u64,
    pub worker_num: usize,
    pub perf_pages_cnt: usize,
    pub queue_capacity: usize,
    pub queues: Vec<QueueCounters>,
    pub socket_map_used: u64,
    pub socket_map_max: u32,
    pub trace_map_used: u64,
    pub trace_map_max: u32,
    pub socket_reclaims: u64,
    pub trace_reclaims: u64,
    pub kernel: KernStats,
    pub boot_time_delta_us: i64,
}

/// Everything `socket_tracer_stats` reports plus the per-CPU offset params,
/// for the introspection getter.
#[derive(Debug, Clone, Serialize)]
pub struct TracerShow {
    pub stats: SocketTracerStats,
    pub offsets: OffsetConfig,
    pub per_cpu_offsets: Vec<OffsetConfig>,
}
