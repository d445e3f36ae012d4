//! User-facing records and the burst unpacker.
//!
//! A flushed staging buffer arrives as one perf payload. The unpacker walks
//! its records once, rewrites every payload (prestored bytes prepended) into
//! a single backing allocation shared by the whole burst, and hands out
//! records that reference it. The allocation is released when the last record
//! referencing it is dropped, wherever that worker runs.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use socktrace_common::{
    Direction, L7Protocol, MessageType, SocketDataHeader, SourceFn, EVENT_BURST_NUM,
};

const HEADER_SIZE: usize = std::mem::size_of::<SocketDataHeader>();
const CACHE_LINE: usize = 64;

/// Backing storage for all payloads of one burst.
pub struct BurstBlock {
    bytes: Vec<u8>,
}

/// 5-tuple of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuple {
    pub saddr: IpAddr,
    pub daddr: IpAddr,
    pub sport: u16,
    pub dport: u16,
    pub addr_len: u8,
    pub l4_protocol: u8,
}

/// One captured syscall, as delivered to the L7 callback.
pub struct SocketRecord {
    header: SocketDataHeader,
    block: Arc<BurstBlock>,
    payload_off: usize,
    payload_len: usize,
}

impl SocketRecord {
    pub fn uid(&self) -> u64 {
        self.header.uid
    }

    /// Per-session capture sequence.
    pub fn cap_seq(&self) -> u64 {
        self.header.seq
    }

    pub fn syscall_trace_id_call(&self) -> u64 {
        self.header.thread_trace_id
    }

    pub fn coroutine_id(&self) -> u64 {
        self.header.coroutine_id
    }

    /// Wall-clock microseconds (boot delta already applied by the reader).
    pub fn timestamp_us(&self) -> u64 {
        self.header.timestamp_us
    }

    pub fn process_id(&self) -> u32 {
        self.header.tgid
    }

    pub fn thread_id(&self) -> u32 {
        self.header.pid
    }

    pub fn tcp_seq(&self) -> u32 {
        self.header.tcp_seq
    }

    pub fn syscall_len(&self) -> u32 {
        self.header.syscall_len
    }

    pub fn direction(&self) -> Direction {
        Direction::from_u8(self.header.direction)
    }

    pub fn msg_type(&self) -> MessageType {
        MessageType::from_u8(self.header.msg_type)
    }

    pub fn l7_protocol_hint(&self) -> L7Protocol {
        L7Protocol::from_u8(self.header.l7_protocol)
    }

    pub fn need_reconfirm(&self) -> bool {
        self.header.need_reconfirm != 0
    }

    pub fn source_fn(&self) -> SourceFn {
        SourceFn::from_u8(self.header.source_fn)
    }

    pub fn process_name(&self) -> &str {
        let end = self
            .header
            .comm
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.header.comm.len());
        std::str::from_utf8(&self.header.comm[..end]).unwrap_or("")
    }

    pub fn tuple(&self) -> Tuple {
        let (saddr, daddr) = if self.header.addr_len == 4 {
            (
                IpAddr::V4(Ipv4Addr::new(
                    self.header.saddr[0],
                    self.header.saddr[1],
                    self.header.saddr[2],
                    self.header.saddr[3],
                )),
                IpAddr::V4(Ipv4Addr::new(
                    self.header.daddr[0],
                    self.header.daddr[1],
                    self.header.daddr[2],
                    self.header.daddr[3],
                )),
            )
        } else {
            (
                IpAddr::V6(Ipv6Addr::from(self.header.saddr)),
                IpAddr::V6(Ipv6Addr::from(self.header.daddr)),
            )
        };
        Tuple {
            saddr,
            daddr,
            sport: self.header.sport,
            dport: self.header.dport,
            addr_len: self.header.addr_len,
            l4_protocol: self.header.l4_protocol,
        }
    }

    pub fn cap_len(&self) -> usize {
        self.payload_len
    }

    /// Captured payload, prestored prefix included.
    pub fn cap_data(&self) -> &[u8] {
        &self.block.bytes[self.payload_off..self.payload_off + self.payload_len]
    }
}

impl fmt::Debug for SocketRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketRecord")
            .field("uid", &self.uid())
            .field("cap_seq", &self.cap_seq())
            .field("direction", &self.direction())
            .field("msg_type", &self.msg_type())
            .field("l7", &self.l7_protocol_hint())
            .field("cap_len", &self.cap_len())
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Truncated,
    BadEventCount(u32),
}

/// Unpack one flushed staging buffer.
///
/// `boot_delta_us` converts the kernel's boot-relative stamps to wall-clock
/// time while the burst is rewritten.
pub fn parse_burst(bytes: &[u8], boot_delta_us: i64) -> Result<Vec<SocketRecord>, ParseError> {
    if bytes.len() < 8 {
        return Err(ParseError::Truncated);
    }
    let events_num = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let data_len = u32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    if events_num == 0 || events_num > EVENT_BURST_NUM {
        return Err(ParseError::BadEventCount(events_num));
    }
    let data = &bytes[8..];
    if data.len() < data_len {
        return Err(ParseError::Truncated);
    }

    // First pass: walk the headers to size the shared allocation.
    let mut cursor = 0usize;
    let mut total = 0usize;
    let mut headers: Vec<(SocketDataHeader, usize)> = Vec::with_capacity(events_num as usize);
    for _ in 0..events_num {
        if cursor + HEADER_SIZE > data_len {
            return Err(ParseError::Truncated);
        }
        let header: SocketDataHeader =
            bytemuck::pod_read_unaligned(&data[cursor..cursor + HEADER_SIZE]);
        let rec_data = header.data_len as usize;
        if cursor + HEADER_SIZE + rec_data > data_len {
            return Err(ParseError::Truncated);
        }
        total += header.extra_data_count as usize + rec_data;
        headers.push((header, cursor + HEADER_SIZE));
        cursor += (HEADER_SIZE + rec_data + 7) & !7;
    }

    // Second pass: rewrite payloads into one cache-line rounded block.
    let mut block_bytes = Vec::with_capacity((total + CACHE_LINE - 1) & !(CACHE_LINE - 1));
    let mut records = Vec::with_capacity(headers.len());
    let mut offsets = Vec::with_capacity(headers.len());
    for (header, data_off) in &headers {
        let start = block_bytes.len();
        let extra = header.extra_data_count as usize;
        block_bytes.extend_from_slice(&header.extra_data[..extra.min(4)]);
        block_bytes.extend_from_slice(&data[*data_off..*data_off + header.data_len as usize]);
        offsets.push((start, block_bytes.len() - start));
    }
    let block = Arc::new(BurstBlock { bytes: block_bytes });

    for ((mut header, _), (off, len)) in headers.into_iter().zip(offsets) {
        header.timestamp_us = header.timestamp_us.wrapping_add(boot_delta_us as u64);
        records.push(SocketRecord {
            header,
            block: Arc::clone(&block),
            payload_off: off,
            payload_len: len,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use socktrace_common::{IPPROTO_TCP, SEQ_MASK};

    fn sample_header(uid: u64, seq: u64, data_len: u32) -> SocketDataHeader {
        let mut h = SocketDataHeader::zeroed();
        h.uid = uid;
        h.seq = seq & SEQ_MASK;
        h.tgid = 100;
        h.pid = 101;
        h.syscall_len = data_len;
        h.data_len = data_len;
        h.addr_len = 4;
        h.l4_protocol = IPPROTO_TCP;
        h.direction = Direction::Egress as u8;
        h.msg_type = MessageType::Request as u8;
        h.l7_protocol = L7Protocol::Http1 as u8;
        h.saddr[..4].copy_from_slice(&[127, 0, 0, 1]);
        h.daddr[..4].copy_from_slice(&[127, 0, 0, 1]);
        h.sport = 40000;
        h.dport = 80;
        h.comm[..4].copy_from_slice(b"curl");
        h
    }

    fn push_record(data: &mut Vec<u8>, header: &SocketDataHeader, payload: &[u8]) {
        data.extend_from_slice(bytemuck::bytes_of(header));
        data.extend_from_slice(payload);
        while data.len() % 8 != 0 {
            data.push(0);
        }
    }

    fn burst(records: &[(SocketDataHeader, &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        for (h, p) in records {
            push_record(&mut data, h, p);
        }
        let mut out = Vec::new();
        out.extend_from_slice(&(records.len() as u32).to_ne_bytes());
        out.extend_from_slice(&(data.len() as u32).to_ne_bytes());
        out.extend_from_slice(&data);
        out
    }

    #[test]
    fn unpacks_two_records_sharing_one_block() {
        let h1 = sample_header(1, 1, 5);
        let h2 = sample_header(1, 2, 3);
        let bytes = burst(&[(h1, b"hello"), (h2, b"abc")]);

        let records = parse_burst(&bytes, 0).expect("parse");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].cap_data(), b"hello");
        assert_eq!(records[1].cap_data(), b"abc");
        assert_eq!(records[0].uid(), records[1].uid());
        assert_eq!(records[0].cap_seq() + 1, records[1].cap_seq());
        assert!(Arc::ptr_eq(&records[0].block, &records[1].block));
    }

    #[test]
    fn prestored_bytes_are_prepended() {
        let mut h = sample_header(2, 1, 4);
        h.extra_data = [0x05, 0x00, 0x00, 0x00];
        h.extra_data_count = 4;
        h.l7_protocol = L7Protocol::Mysql as u8;
        let bytes = burst(&[(h, b"\x03SEL")]);

        let records = parse_burst(&bytes, 0).expect("parse");
        assert_eq!(records[0].cap_data(), b"\x05\x00\x00\x00\x03SEL");
        assert_eq!(records[0].cap_len(), 8);
    }

    #[test]
    fn boot_delta_rebases_timestamps() {
        let mut h = sample_header(3, 1, 1);
        h.timestamp_us = 1_000;
        let bytes = burst(&[(h, b"x")]);
        let records = parse_burst(&bytes, 500).expect("parse");
        assert_eq!(records[0].timestamp_us(), 1_500);
    }

    #[test]
    fn rejects_bad_event_counts() {
        let mut bytes = burst(&[(sample_header(1, 1, 1), b"x")]);
        bytes[0..4].copy_from_slice(&99u32.to_ne_bytes());
        assert!(matches!(
            parse_burst(&bytes, 0),
            Err(ParseError::BadEventCount(99))
        ));
    }

    #[test]
    fn rejects_truncated_buffers() {
        let bytes = burst(&[(sample_header(1, 1, 64), &[0u8; 64])]);
        assert!(matches!(
            parse_burst(&bytes[..40], 0),
            Err(ParseError::Truncated)
        ));
    }

    #[test]
    fn tuple_and_name_accessors() {
        let bytes = burst(&[(sample_header(1, 1, 1), b"x")]);
        let records = parse_burst(&bytes, 0).expect("parse");
        let t = records[0].tuple();
        assert_eq!(t.saddr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(t.dport, 80);
        assert_eq!(records[0].process_name(), "curl");
    }
}
