//! Perf channel readers: one task per CPU buffer, each waiting on the
//! buffer's fd and handing every payload to the dispatcher.

use std::{io, mem, sync::Arc};

use aya::maps::perf::PerfEventArrayBuffer;
use aya::maps::MapData;
use bytes::BytesMut;
use log::warn;
use tokio::io::unix::AsyncFd;
use tokio::sync::watch;

use crate::dispatch::dispatch_payload;
use crate::queue::WorkQueue;
use crate::stats::Stats;

const SCRATCH_SLOTS: usize = 16;

pub fn spawn_readers(
    rt: &tokio::runtime::Handle,
    buffers: Vec<PerfEventArrayBuffer<MapData>>,
    queues: Arc<Vec<WorkQueue>>,
    stats: Arc<Stats>,
    boot_delta_us: i64,
    shutdown: watch::Receiver<bool>,
) {
    for buffer in buffers {
        let queues = Arc::clone(&queues);
        let stats = Arc::clone(&stats);
        let mut shutdown = shutdown.clone();

        rt.spawn(async move {
            let mut async_buffer = match AsyncFd::new(buffer) {
                Ok(fd) => fd,
                Err(e) => {
                    warn!("failed to register perf buffer fd: {e}");
                    return;
                }
            };

            let mut scratch: Vec<BytesMut> = (0..SCRATCH_SLOTS)
                .map(|_| BytesMut::with_capacity(64 * 1024))
                .collect();

            loop {
                let mut ready = tokio::select! {
                    _ = shutdown.changed() => break,
                    guard = async_buffer.readable_mut() => match guard {
                        Ok(guard) => guard,
                        Err(e) => {
                            warn!("perf buffer readable wait failed: {e}");
                            stats.inc_perf_poll_error();
                            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                            continue;
                        }
                    },
                };

                let events = match ready.try_io(|inner| {
                    inner
                        .get_mut()
                        .read_events(scratch.as_mut_slice())
                        .map_err(io::Error::other)
                }) {
                    Ok(Ok(events)) => events,
                    Ok(Err(e)) => {
                        ready.clear_ready();
                        warn!("perf read_events error: {e}");
                        stats.inc_perf_poll_error();
                        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                        continue;
                    }
                    Err(_would_block) => {
                        ready.clear_ready();
                        continue;
                    }
                };
                ready.clear_ready();

                if events.lost > 0 {
                    stats.add_kern_lost(events.lost as u64);
                }

                for buf in scratch.iter_mut().take(events.read) {
                    if buf.len() >= mem::size_of::<u32>() {
                        dispatch_payload(buf.as_ref(), &queues, &stats, boot_delta_us);
                    } else {
                        stats.inc_parse_error();
                    }
                    buf.clear();
                }
            }
        });
    }
}
