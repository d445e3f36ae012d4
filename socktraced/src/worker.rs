//! Fixed worker pool. Each worker owns one dispatch queue and blocks on it;
//! data records go to the L7 callback, extra events to whatever handle was
//! registered for their type.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use log::debug;
use socktrace_common::ProcessEventRecord;

use crate::queue::{WorkItem, WorkQueue};
use crate::record::SocketRecord;

pub type L7EventHandle = Arc<dyn Fn(&SocketRecord) + Send + Sync + 'static>;
pub type ExtraEventHandle = Arc<dyn Fn(&ProcessEventRecord) + Send + Sync + 'static>;

pub type ExtraHandleRegistry = Arc<RwLock<HashMap<u32, ExtraEventHandle>>>;

pub fn spawn_workers(
    queues: &Arc<Vec<WorkQueue>>,
    handle: L7EventHandle,
    registry: ExtraHandleRegistry,
) -> Vec<JoinHandle<()>> {
    let mut workers = Vec::with_capacity(queues.len());
    for (idx, queue) in queues.iter().enumerate() {
        let rx = queue.receiver();
        let queues = Arc::clone(queues);
        let handle = Arc::clone(&handle);
        let registry = Arc::clone(&registry);
        workers.push(
            std::thread::Builder::new()
                .name(format!("st-worker-{idx}"))
                .spawn(move || {
                    while let Ok(item) = rx.recv() {
                        queues[idx].note_dequeue();
                        match item {
                            WorkItem::Data(record) => handle(&record),
                            WorkItem::Extra(event) => dispatch_extra(&registry, &event),
                            WorkItem::Shutdown => break,
                        }
                    }
                    debug!("worker {idx} exiting");
                })
                .expect("spawn worker thread"),
        );
    }
    workers
}

fn dispatch_extra(registry: &ExtraHandleRegistry, event: &ProcessEventRecord) {
    let handle = registry
        .read()
        .ok()
        .and_then(|map| map.get(&event.event_type).cloned());
    if let Some(handle) = handle {
        handle(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socktrace_common::EVENT_TYPE_PROC_EXEC;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn workers_drain_and_shut_down() {
        let queues = Arc::new(vec![WorkQueue::new(16), WorkQueue::new(16)]);
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        let registry: ExtraHandleRegistry = Arc::new(RwLock::new(HashMap::new()));
        registry.write().unwrap().insert(
            EVENT_TYPE_PROC_EXEC,
            Arc::new(move |_e: &ProcessEventRecord| {
                seen_clone.fetch_add(1, Ordering::Relaxed);
            }) as ExtraEventHandle,
        );

        let handle: L7EventHandle = Arc::new(|_r| {});
        let workers = spawn_workers(&queues, handle, registry);

        let event = ProcessEventRecord {
            event_type: EVENT_TYPE_PROC_EXEC,
            pid: 1,
            comm: [0; 16],
        };
        queues[0].push(WorkItem::Extra(event));
        queues[1].push(WorkItem::Extra(event));

        for q in queues.iter() {
            q.push_blocking(WorkItem::Shutdown);
        }
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(seen.load(Ordering::Relaxed), 2);
        // Both extras plus both sentinels were dequeued.
        let dequeued: u64 = queues.iter().map(|q| q.snapshot().dequeued).sum();
        assert_eq!(dequeued, 4);
    }

    #[test]
    fn unregistered_extra_events_are_ignored() {
        let registry: ExtraHandleRegistry = Arc::new(RwLock::new(HashMap::new()));
        let event = ProcessEventRecord {
            event_type: EVENT_TYPE_PROC_EXEC + 7,
            pid: 1,
            comm: [0; 16],
        };
        // Must not panic.
        dispatch_extra(&registry, &event);
    }
}
