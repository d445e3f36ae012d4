//! Bounded dispatch queues between the perf reader and the worker pool.
//!
//! Enqueue failures are counted and the record dropped; nothing on the hot
//! path retries or blocks. Workers block on the channel's own wakeup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use socktrace_common::ProcessEventRecord;

use crate::record::SocketRecord;
use crate::stats::QueueCounters;

pub enum WorkItem {
    Data(SocketRecord),
    Extra(ProcessEventRecord),
    Shutdown,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    enqueue_lost: AtomicU64,
    burst_count: AtomicU64,
}

pub struct WorkQueue {
    tx: Sender<WorkItem>,
    rx: Receiver<WorkItem>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lossy enqueue; returns false when the queue was full.
    pub fn push(&self, item: WorkItem) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.enqueue_lost.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Blocking enqueue, used only for shutdown sentinels.
    pub fn push_blocking(&self, item: WorkItem) {
        let _ = self.tx.send(item);
    }

    pub fn note_burst(&self) {
        self.counters.burst_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn receiver(&self) -> Receiver<WorkItem> {
        self.rx.clone()
    }

    pub fn note_dequeue(&self) {
        self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueCounters {
        QueueCounters {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dequeued: self.counters.dequeued.load(Ordering::Relaxed),
            enqueue_lost: self.counters.enqueue_lost.load(Ordering::Relaxed),
            burst_count: self.counters.burst_count.load(Ordering::Relaxed),
        }
    }
}

/// Queue index for a session: all records of one uid deserialize in order on
/// a single worker.
pub fn shard_by_socket(uid: u64, queues: usize) -> usize {
    (fxhash(uid) % queues as u64) as usize
}

pub fn shard_by_event_type(event_type: u32, queues: usize) -> usize {
    (fxhash(event_type as u64) % queues as u64) as usize
}

/// Fibonacci-multiplicative mix; enough spread for queue selection.
fn fxhash(v: u64) -> u64 {
    v.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_counts_losses() {
        let q = WorkQueue::new(2);
        assert!(q.push(WorkItem::Shutdown));
        assert!(q.push(WorkItem::Shutdown));
        assert!(!q.push(WorkItem::Shutdown));
        let snap = q.snapshot();
        assert_eq!(snap.enqueued, 2);
        assert_eq!(snap.enqueue_lost, 1);
    }

    #[test]
    fn sharding_is_stable_and_in_range() {
        for uid in [0u64, 1, 42, u64::MAX] {
            let a = shard_by_socket(uid, 4);
            let b = shard_by_socket(uid, 4);
            assert_eq!(a, b);
            assert!(a < 4);
        }
    }

    #[test]
    fn same_uid_always_lands_on_one_queue() {
        let target = shard_by_socket(777, 8);
        for _ in 0..100 {
            assert_eq!(shard_by_socket(777, 8), target);
        }
    }
}
