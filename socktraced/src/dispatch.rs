//! Payload discrimination and sharding.
//!
//! Every perf payload is either a flushed staging buffer (leading u32 is the
//! event count, at most EVENT_BURST_NUM) or a registered extra event (leading
//! u32 is an event type at or above EVENT_TYPE_MIN). Data records shard by
//! session uid so per-session order survives the fan-out; extra events shard
//! by their type.

use socktrace_common::{ProcessEventRecord, EVENT_TYPE_MIN};

use crate::queue::{shard_by_event_type, shard_by_socket, WorkItem, WorkQueue};
use crate::record::parse_burst;
use crate::stats::Stats;

pub fn dispatch_payload(bytes: &[u8], queues: &[WorkQueue], stats: &Stats, boot_delta_us: i64) {
    if bytes.len() < 4 {
        stats.inc_parse_error();
        return;
    }
    let first = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if first >= EVENT_TYPE_MIN {
        dispatch_extra(bytes, queues, stats);
    } else {
        dispatch_burst(bytes, queues, stats, boot_delta_us);
    }
}

fn dispatch_extra(bytes: &[u8], queues: &[WorkQueue], stats: &Stats) {
    if bytes.len() < std::mem::size_of::<ProcessEventRecord>() {
        stats.inc_parse_error();
        return;
    }
    let event: ProcessEventRecord =
        bytemuck::pod_read_unaligned(&bytes[..std::mem::size_of::<ProcessEventRecord>()]);
    let idx = shard_by_event_type(event.event_type, queues.len());
    queues[idx].push(WorkItem::Extra(event));
}

fn dispatch_burst(bytes: &[u8], queues: &[WorkQueue], stats: &Stats, boot_delta_us: i64) {
    let records = match parse_burst(bytes, boot_delta_us) {
        Ok(records) => records,
        Err(_) => {
            stats.inc_parse_error();
            return;
        }
    };
    let mut touched: u64 = 0;
    for record in records {
        let idx = shard_by_socket(record.uid(), queues.len());
        if idx < 64 && touched & (1 << idx) == 0 {
            touched |= 1 << idx;
            queues[idx].note_burst();
        }
        queues[idx].push(WorkItem::Data(record));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkQueue;
    use socktrace_common::{
        Direction, L7Protocol, MessageType, SocketDataHeader, EVENT_TYPE_PROC_EXEC, IPPROTO_TCP,
    };

    fn header(uid: u64, seq: u64, data_len: u32) -> SocketDataHeader {
        let mut h = SocketDataHeader::zeroed();
        h.uid = uid;
        h.seq = seq;
        h.syscall_len = data_len;
        h.data_len = data_len;
        h.addr_len = 4;
        h.l4_protocol = IPPROTO_TCP;
        h.direction = Direction::Egress as u8;
        h.msg_type = MessageType::Request as u8;
        h.l7_protocol = L7Protocol::Http1 as u8;
        h
    }

    fn burst_bytes(records: &[(SocketDataHeader, &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        for (h, p) in records {
            data.extend_from_slice(bytemuck::bytes_of(h));
            data.extend_from_slice(p);
            while data.len() % 8 != 0 {
                data.push(0);
            }
        }
        let mut out = Vec::new();
        out.extend_from_slice(&(records.len() as u32).to_ne_bytes());
        out.extend_from_slice(&(data.len() as u32).to_ne_bytes());
        out.extend_from_slice(&data);
        out
    }

    fn drain(q: &WorkQueue) -> Vec<WorkItem> {
        let mut out = Vec::new();
        while let Ok(item) = q.receiver().try_recv() {
            out.push(item);
        }
        out
    }

    #[test]
    fn same_session_records_land_on_one_queue() {
        let queues = vec![WorkQueue::new(64), WorkQueue::new(64), WorkQueue::new(64)];
        let stats = Stats::new();
        let bytes = burst_bytes(&[
            (header(7, 1, 2), b"ab"),
            (header(7, 2, 2), b"cd"),
            (header(7, 3, 2), b"ef"),
        ]);
        dispatch_payload(&bytes, &queues, &stats, 0);

        let populated: Vec<usize> = queues
            .iter()
            .enumerate()
            .filter(|(_, q)| q.snapshot().enqueued > 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(populated.len(), 1);
        let items = drain(&queues[populated[0]]);
        assert_eq!(items.len(), 3);
        let mut last_seq = 0;
        for item in items {
            match item {
                WorkItem::Data(r) => {
                    assert!(r.cap_seq() > last_seq);
                    last_seq = r.cap_seq();
                }
                _ => panic!("expected data record"),
            }
        }
    }

    #[test]
    fn extra_events_route_by_type() {
        let queues = vec![WorkQueue::new(8), WorkQueue::new(8)];
        let stats = Stats::new();
        let event = ProcessEventRecord {
            event_type: EVENT_TYPE_PROC_EXEC,
            pid: 33,
            comm: *b"nginx\0\0\0\0\0\0\0\0\0\0\0",
        };
        let bytes = bytemuck::bytes_of(&event).to_vec();
        dispatch_payload(&bytes, &queues, &stats, 0);

        let total: u64 = queues.iter().map(|q| q.snapshot().enqueued).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn garbage_counts_a_parse_error() {
        let queues = vec![WorkQueue::new(8)];
        let stats = Stats::new();
        dispatch_payload(&[1, 2], &queues, &stats, 0);
        dispatch_payload(&[0, 0, 0, 0, 0, 0, 0, 0], &queues, &stats, 0);
        assert_eq!(
            stats.parse_errors.load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }
}
