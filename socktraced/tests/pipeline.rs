//! End-to-end pipeline tests: a faithful model of the in-kernel data path
//! (session map, inference, trace engine, staging buffer) produces burst
//! payloads which then go through the real unpacker, so the delivered-record
//! contract can be checked scenario by scenario.

use std::collections::HashMap;

use socktrace_common::{
    conn_key,
    inference::{continuation_msg_type, infer_l7, InferenceCtx},
    trace::{trace_transition, TraceOp},
    Direction, L7Protocol, MessageType, SocketDataHeader, SocketInfo, SourceFn, TraceInfo,
    EVENT_BURST_NUM, IPPROTO_TCP, IPPROTO_UDP, SEQ_MASK,
};
use socktraced::record::{parse_burst, SocketRecord};

struct SyscallIn<'a> {
    pid_tgid: u64,
    fd: u32,
    source: SourceFn,
    l4: u8,
    sport: u16,
    dport: u16,
    payload: &'a [u8],
    is_go: bool,
}

impl<'a> SyscallIn<'a> {
    fn tcp(pid_tgid: u64, fd: u32, source: SourceFn, dport: u16, payload: &'a [u8]) -> Self {
        Self {
            pid_tgid,
            fd,
            source,
            l4: IPPROTO_TCP,
            sport: 40_000,
            dport,
            payload,
            is_go: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Emitted,
    Prestored,
    Skipped,
    Cleared,
}

/// Model of the per-CPU kernel state: drives the same shared decision code
/// the probes use, in the same order.
#[derive(Default)]
struct KernelSim {
    sockets: HashMap<u64, SocketInfo>,
    traces: HashMap<u64, TraceInfo>,
    uid_gen: u64,
    trace_gen: u64,
    now_secs: u64,
    burst_data: Vec<u8>,
    burst_events: u32,
    flushed: Vec<Vec<u8>>,
}

impl KernelSim {
    fn new() -> Self {
        Self {
            uid_gen: 1_000,
            trace_gen: 9_000,
            now_secs: 100,
            ..Default::default()
        }
    }

    fn syscall(&mut self, s: SyscallIn) -> Outcome {
        let direction = if s.source.is_ingress() {
            Direction::Ingress
        } else {
            Direction::Egress
        };
        let tgid = (s.pid_tgid >> 32) as u32;
        let key = conn_key(tgid, s.fd);

        let (mut info, _created) = match self.sockets.get(&key) {
            Some(v) => (*v, false),
            None => {
                self.uid_gen += 1;
                let mut fresh = SocketInfo::zeroed();
                fresh.uid = self.uid_gen;
                (fresh, true)
            }
        };
        let snapshot = info;

        let prev_len = (info.prev_data_len as usize).min(4);
        let prev = info.prev_data;
        let result = {
            let ictx = InferenceCtx {
                direction,
                l4_protocol: s.l4,
                sport: s.sport,
                dport: s.dport,
                prev_data: &prev[..prev_len],
                need_reconfirm: info.need_reconfirm != 0,
                correlation_id: info.correlation_id,
                current_protocol: L7Protocol::from_u8(info.l7_protocol),
            };
            infer_l7(s.payload, s.payload.len(), &ictx)
        };
        info.update_time = self.now_secs;

        match result.msg_type {
            MessageType::Prestore => {
                let n = s.payload.len().min(4);
                info.prev_data = [0; 4];
                info.prev_data[..n].copy_from_slice(&s.payload[..n]);
                info.prev_data_len = n as u8;
                self.sockets.insert(key, info);
                return Outcome::Prestored;
            }
            MessageType::Reconfirm => {
                info.need_reconfirm = 1;
                info.correlation_id = result.correlation_id;
                self.sockets.insert(key, info);
                return Outcome::Skipped;
            }
            MessageType::Clear => {
                self.sockets.remove(&key);
                return Outcome::Cleared;
            }
            _ => {}
        }

        if result.protocol == L7Protocol::Unknown
            && L7Protocol::from_u8(info.l7_protocol) == L7Protocol::Unknown
        {
            self.sockets.insert(key, info);
            return Outcome::Skipped;
        }

        if info.l7_protocol == L7Protocol::Unknown as u8 {
            info.l7_protocol = result.protocol as u8;
        }
        let msg_type = match result.msg_type {
            MessageType::Unknown => continuation_msg_type(
                Direction::from_u8(snapshot.direction),
                MessageType::from_u8(snapshot.msg_type),
                direction,
            ),
            m => m,
        };
        info.need_reconfirm = result.need_reconfirm as u8;
        if result.need_reconfirm {
            info.correlation_id = result.correlation_id;
        }

        let existing = self.traces.get(&s.pid_tgid).copied();
        let gen = &mut self.trace_gen;
        let decision = trace_transition(
            direction,
            msg_type,
            existing.as_ref(),
            &snapshot,
            info.uid,
            s.fd,
            s.is_go,
            || {
                *gen += 1;
                *gen
            },
        );
        match decision.op {
            TraceOp::Put(pending) => {
                self.traces.insert(
                    s.pid_tgid,
                    TraceInfo {
                        thread_trace_id: pending.thread_trace_id,
                        socket_id: pending.socket_id,
                        update_time: self.now_secs,
                        peer_fd: pending.peer_fd,
                        _pad: 0,
                    },
                );
            }
            TraceOp::Delete => {
                self.traces.remove(&s.pid_tgid);
            }
            TraceOp::None => {}
        }
        if decision.consume_parked {
            info.trace_id = 0;
        }

        if !decision.keep_data_seq {
            info.seq = (info.seq + 1) & SEQ_MASK;
        }

        let extra_count = snapshot.prev_data_len;
        if extra_count != 0 {
            info.prev_data = [0; 4];
            info.prev_data_len = 0;
        }

        info.direction = direction as u8;
        info.msg_type = msg_type as u8;
        self.sockets.insert(key, info);

        let mut header = SocketDataHeader::zeroed();
        header.uid = info.uid;
        header.seq = info.seq;
        header.thread_trace_id = decision.thread_trace_id;
        header.timestamp_us = self.now_secs * 1_000_000;
        header.tgid = tgid;
        header.pid = s.pid_tgid as u32;
        header.syscall_len = s.payload.len() as u32;
        header.data_len = s.payload.len() as u32;
        header.sport = s.sport;
        header.dport = s.dport;
        header.saddr[..4].copy_from_slice(&[127, 0, 0, 1]);
        header.daddr[..4].copy_from_slice(&[127, 0, 0, 1]);
        header.extra_data = snapshot.prev_data;
        header.extra_data_count = extra_count;
        header.addr_len = 4;
        header.l4_protocol = s.l4;
        header.direction = direction as u8;
        header.msg_type = msg_type as u8;
        header.l7_protocol = info.l7_protocol;
        header.source_fn = s.source as u8;
        header.need_reconfirm = info.need_reconfirm;

        self.burst_data.extend_from_slice(bytemuck::bytes_of(&header));
        self.burst_data.extend_from_slice(s.payload);
        while self.burst_data.len() % 8 != 0 {
            self.burst_data.push(0);
        }
        self.burst_events += 1;
        if self.burst_events >= EVENT_BURST_NUM {
            self.flush();
        }
        Outcome::Emitted
    }

    /// sys_exit_socket for a relay-configured process.
    fn open_relay_socket(&mut self, pid_tgid: u64, fd: u32) {
        let Some(trace) = self.traces.get(&pid_tgid).copied() else {
            return;
        };
        if trace.peer_fd == fd {
            return;
        }
        self.uid_gen += 1;
        let mut info = SocketInfo::zeroed();
        info.uid = self.uid_gen;
        info.trace_id = trace.thread_trace_id;
        info.peer_fd = trace.peer_fd;
        info.update_time = self.now_secs;
        let tgid = (pid_tgid >> 32) as u32;
        self.sockets.insert(conn_key(tgid, fd), info);
    }

    fn close(&mut self, pid_tgid: u64, fd: u32) {
        let tgid = (pid_tgid >> 32) as u32;
        self.sockets.remove(&conn_key(tgid, fd));
    }

    fn flush(&mut self) {
        if self.burst_events == 0 {
            return;
        }
        let mut out = Vec::with_capacity(8 + self.burst_data.len());
        out.extend_from_slice(&self.burst_events.to_ne_bytes());
        out.extend_from_slice(&(self.burst_data.len() as u32).to_ne_bytes());
        out.extend_from_slice(&self.burst_data);
        self.flushed.push(out);
        self.burst_data.clear();
        self.burst_events = 0;
    }

    fn delivered(&mut self) -> Vec<SocketRecord> {
        self.flush();
        let mut records = Vec::new();
        for payload in self.flushed.drain(..) {
            records.extend(parse_burst(&payload, 0).expect("parse burst"));
        }
        records
    }
}

const T1: u64 = (1000 << 32) | 2000;

#[test]
fn http_client_get_pairs_request_and_response() {
    let mut sim = KernelSim::new();
    let req = b"GET /x HTTP/1.1\r\nHost: y\r\n\r\n";
    let resp = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
    assert_eq!(
        sim.syscall(SyscallIn::tcp(T1, 5, SourceFn::Write, 80, req)),
        Outcome::Emitted
    );
    assert_eq!(
        sim.syscall(SyscallIn::tcp(T1, 5, SourceFn::Read, 80, resp)),
        Outcome::Emitted
    );

    let records = sim.delivered();
    assert_eq!(records.len(), 2);
    let (r0, r1) = (&records[0], &records[1]);
    assert_eq!(r0.uid(), r1.uid());
    assert_eq!(r0.cap_seq() + 1, r1.cap_seq());
    assert_eq!(r0.l7_protocol_hint(), L7Protocol::Http1);
    assert_eq!(r1.l7_protocol_hint(), L7Protocol::Http1);
    assert_eq!(r0.direction(), Direction::Egress);
    assert_eq!(r0.msg_type(), MessageType::Request);
    assert_eq!(r1.direction(), Direction::Ingress);
    assert_eq!(r1.msg_type(), MessageType::Response);
    assert!(r0.syscall_trace_id_call() != 0);
    assert_eq!(r0.syscall_trace_id_call(), r1.syscall_trace_id_call());
    // The trace closed with the response.
    assert!(sim.traces.is_empty());
}

#[test]
fn dns_udp_query_and_reply_pair() {
    let mut sim = KernelSim::new();
    let query = [
        0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ];
    let reply = [
        0x12, 0x34, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
    ];
    let mut send = SyscallIn::tcp(T1, 7, SourceFn::SendTo, 53, &query);
    send.l4 = IPPROTO_UDP;
    assert_eq!(sim.syscall(send), Outcome::Emitted);
    let mut recv = SyscallIn::tcp(T1, 7, SourceFn::RecvFrom, 53, &reply);
    recv.l4 = IPPROTO_UDP;
    assert_eq!(sim.syscall(recv), Outcome::Emitted);

    let records = sim.delivered();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].tuple().l4_protocol, IPPROTO_UDP);
    assert_eq!(records[0].l7_protocol_hint(), L7Protocol::Dns);
    assert_eq!(records[1].l7_protocol_hint(), L7Protocol::Dns);
    assert!(records[0].syscall_trace_id_call() != 0);
    assert_eq!(
        records[0].syscall_trace_id_call(),
        records[1].syscall_trace_id_call()
    );
}

#[test]
fn mysql_header_read_prestores_then_single_record() {
    let mut sim = KernelSim::new();
    // Server side: client command arrives in two reads, 4-byte packet header
    // first.
    let header = [0x05, 0x00, 0x00, 0x00];
    let body = [0x03, b'S', b'E', b'L', b'E'];
    assert_eq!(
        sim.syscall(SyscallIn::tcp(T1, 9, SourceFn::Read, 3306, &header)),
        Outcome::Prestored
    );
    assert_eq!(
        sim.syscall(SyscallIn::tcp(T1, 9, SourceFn::Read, 3306, &body)),
        Outcome::Emitted
    );

    let records = sim.delivered();
    assert_eq!(records.len(), 1);
    let r = &records[0];
    assert_eq!(r.l7_protocol_hint(), L7Protocol::Mysql);
    // Payload starts with the prestored header bytes, then the body.
    assert_eq!(r.cap_data(), b"\x05\x00\x00\x00\x03SELE");
    // First visible sequence of the session.
    assert_eq!(r.cap_seq(), 1);
}

#[test]
fn relay_forward_shares_the_trace_id() {
    let mut sim = KernelSim::new();
    let req = b"GET /upstream HTTP/1.1\r\nHost: u\r\n\r\n";

    // Ingress request on fd A.
    assert_eq!(
        sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Read, 8080, req)),
        Outcome::Emitted
    );
    // Relay opens fd B toward the upstream; the parked state records the pair.
    sim.open_relay_socket(T1, 6);
    let relay_info = sim.sockets[&conn_key(1000, 6)];
    assert_eq!(relay_info.peer_fd, 4);
    assert!(relay_info.trace_id != 0);

    // Forwarded egress request on fd B.
    assert_eq!(
        sim.syscall(SyscallIn::tcp(T1, 6, SourceFn::Write, 80, req)),
        Outcome::Emitted
    );

    let records = sim.delivered();
    assert_eq!(records.len(), 2);
    assert!(records[0].syscall_trace_id_call() != 0);
    assert_eq!(
        records[0].syscall_trace_id_call(),
        records[1].syscall_trace_id_call()
    );
    // Different sessions, one logical trace.
    assert_ne!(records[0].uid(), records[1].uid());
    assert!(sim.traces.is_empty());
}

#[test]
fn same_socket_response_does_not_cross_link() {
    let mut sim = KernelSim::new();
    let req = b"GET / HTTP/1.1\r\n\r\n";
    let resp = b"HTTP/1.1 200 OK\r\n\r\n";

    // Server: ingress request then egress response on the same socket.
    sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Read, 8080, req));
    sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Write, 8080, resp));

    let records = sim.delivered();
    assert_eq!(records.len(), 2);
    assert!(records[0].syscall_trace_id_call() != 0);
    assert_eq!(records[1].syscall_trace_id_call(), 0);
    assert!(sim.traces.is_empty());
}

#[test]
fn close_evicts_the_session_eagerly() {
    let mut sim = KernelSim::new();
    let req = b"GET / HTTP/1.1\r\n\r\n";
    sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Read, 8080, req));
    assert!(sim.sockets.contains_key(&conn_key(1000, 4)));
    sim.close(T1, 4);
    assert!(!sim.sockets.contains_key(&conn_key(1000, 4)));

    // The next event on the same fd starts a fresh session with a new uid.
    let old_uid = sim.delivered()[0].uid();
    sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Read, 8080, req));
    let new_uid = sim.delivered()[0].uid();
    assert_ne!(old_uid, new_uid);
}

#[test]
fn uids_are_unique_across_sessions() {
    let mut sim = KernelSim::new();
    let req = b"GET / HTTP/1.1\r\n\r\n";
    for fd in 10..40u32 {
        sim.syscall(SyscallIn::tcp(T1, fd, SourceFn::Read, 8080, req));
    }
    let records = sim.delivered();
    let mut uids: Vec<u64> = records.iter().map(|r| r.uid()).collect();
    let before = uids.len();
    uids.sort_unstable();
    uids.dedup();
    assert_eq!(uids.len(), before);
}

#[test]
fn aligned_fragments_share_a_sequence() {
    let mut sim = KernelSim::new();
    let req = b"GET /a HTTP/1.1\r\n\r\n";

    sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Read, 8080, req));
    // Two more aligned ingress requests: same direction, same message type.
    sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Read, 8080, req));
    sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Read, 8080, req));
    // Direction flips: the sequence advances again.
    sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Write, 8080, b"HTTP/1.1 200 OK\r\n\r\n"));

    let records = sim.delivered();
    let seqs: Vec<u64> = records.iter().map(|r| r.cap_seq()).collect();
    assert_eq!(seqs, vec![1, 1, 1, 2]);
    // Aligned fragments also share the trace id.
    assert_eq!(
        records[0].syscall_trace_id_call(),
        records[1].syscall_trace_id_call()
    );
}

#[test]
fn sequence_is_monotonic_per_session() {
    let mut sim = KernelSim::new();
    let req = b"GET / HTTP/1.1\r\n\r\n";
    let resp = b"HTTP/1.1 200 OK\r\n\r\n";
    for _ in 0..5 {
        sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Read, 8080, req));
        sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Write, 8080, resp));
    }
    let records = sim.delivered();
    let mut last = 0u64;
    for r in &records {
        assert!(r.cap_seq() == last + 1 || r.cap_seq() == last);
        last = r.cap_seq();
    }
    assert_eq!(last, 10);
}

#[test]
fn full_burst_flushes_at_sixteen_events() {
    let mut sim = KernelSim::new();
    let req = b"GET / HTTP/1.1\r\n\r\n";
    for i in 0..17u32 {
        sim.syscall(SyscallIn::tcp(T1, 100 + i, SourceFn::Read, 8080, req));
    }
    // Sixteen went out in the first burst; the seventeenth waits for a tick.
    assert_eq!(sim.flushed.len(), 1);
    assert_eq!(sim.burst_events, 1);
    let first = parse_burst(&sim.flushed[0], 0).expect("parse");
    assert_eq!(first.len(), EVENT_BURST_NUM as usize);
    let rest = sim.delivered();
    assert_eq!(rest.len(), 17);
}

#[test]
fn go_processes_carry_zero_trace_id() {
    let mut sim = KernelSim::new();
    let mut call = SyscallIn::tcp(T1, 4, SourceFn::Read, 8080, b"GET / HTTP/1.1\r\n\r\n");
    call.is_go = true;
    sim.syscall(call);
    let records = sim.delivered();
    assert_eq!(records[0].syscall_trace_id_call(), 0);
    assert!(sim.traces.is_empty());
}

#[test]
fn kafka_request_marks_reconfirm_and_response_confirms() {
    let mut sim = KernelSim::new();
    // len=12: api_key=18, v=3, corr=7, client id "ab".
    let mut req = Vec::new();
    req.extend_from_slice(&12u32.to_be_bytes());
    req.extend_from_slice(&18u16.to_be_bytes());
    req.extend_from_slice(&3u16.to_be_bytes());
    req.extend_from_slice(&7u32.to_be_bytes());
    req.extend_from_slice(&[0x00, 0x02, b'a', b'b']);

    assert_eq!(
        sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Write, 9092, &req)),
        Outcome::Emitted
    );
    let info = sim.sockets[&conn_key(1000, 4)];
    assert_eq!(info.need_reconfirm, 1);
    assert_eq!(info.correlation_id, 7);

    // Response echoing the correlation id confirms the session.
    let resp = [0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x07, 0xaa, 0xbb];
    assert_eq!(
        sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Read, 9092, &resp)),
        Outcome::Emitted
    );
    let info = sim.sockets[&conn_key(1000, 4)];
    assert_eq!(info.need_reconfirm, 0);

    let records = sim.delivered();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].l7_protocol_hint(), L7Protocol::Kafka);
    assert!(records[0].need_reconfirm());
    assert!(!records[1].need_reconfirm());
}

#[test]
fn kafka_mismatched_response_clears_the_session() {
    let mut sim = KernelSim::new();
    let mut req = Vec::new();
    req.extend_from_slice(&12u32.to_be_bytes());
    req.extend_from_slice(&18u16.to_be_bytes());
    req.extend_from_slice(&3u16.to_be_bytes());
    req.extend_from_slice(&7u32.to_be_bytes());
    req.extend_from_slice(&[0x00, 0x02, b'a', b'b']);
    sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Write, 9092, &req));

    let wrong = [0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x09, 0xaa, 0xbb];
    assert_eq!(
        sim.syscall(SyscallIn::tcp(T1, 4, SourceFn::Read, 9092, &wrong)),
        Outcome::Cleared
    );
    assert!(!sim.sockets.contains_key(&conn_key(1000, 4)));
}
