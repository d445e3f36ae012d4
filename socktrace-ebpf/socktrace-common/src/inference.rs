//! L7 protocol inference over the first captured payload bytes of a syscall.
//!
//! Runs once per session while the protocol is still unknown; afterwards the
//! stored protocol short-circuits the search and only the message type is
//! re-derived. Everything here is `core`-only and bounded so the kernel
//! programs can call it directly; userspace unit tests drive the same code.

use crate::{Direction, L7Protocol, MessageType, IPPROTO_TCP};

pub const DNS_PORT: u16 = 53;

/// Session context consulted by the recognizers.
pub struct InferenceCtx<'a> {
    pub direction: Direction,
    pub l4_protocol: u8,
    pub sport: u16,
    pub dport: u16,
    /// Bytes stashed by an earlier PRESTORE on this session (at most 4).
    pub prev_data: &'a [u8],
    /// Kafka request seen; the next ingress payload must echo its
    /// correlation id or the session is cleared.
    pub need_reconfirm: bool,
    pub correlation_id: u32,
    /// `Unknown` on first classification, the stored protocol afterwards.
    pub current_protocol: L7Protocol,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InferenceResult {
    pub protocol: L7Protocol,
    pub msg_type: MessageType,
    /// Correlation id to stash when `need_reconfirm` is set.
    pub correlation_id: u32,
    pub need_reconfirm: bool,
}

impl InferenceResult {
    const fn unknown() -> Self {
        Self {
            protocol: L7Protocol::Unknown,
            msg_type: MessageType::Unknown,
            correlation_id: 0,
            need_reconfirm: false,
        }
    }

    const fn of(protocol: L7Protocol, msg_type: MessageType) -> Self {
        Self {
            protocol,
            msg_type,
            correlation_id: 0,
            need_reconfirm: false,
        }
    }
}

/// Message type for a payload that no recognizer could classify on an already
/// tagged session: a fragment in the stored direction continues the stored
/// message, a direction flip toggles request and response.
pub const fn continuation_msg_type(
    stored_direction: Direction,
    stored_msg_type: MessageType,
    direction: Direction,
) -> MessageType {
    if stored_direction as u8 == direction as u8 {
        return stored_msg_type;
    }
    match stored_msg_type {
        MessageType::Request => MessageType::Response,
        MessageType::Response => MessageType::Request,
        other => other,
    }
}

/// Classify a payload. `syscall_len` is the full syscall return length, which
/// can exceed `payload.len()` when the capture was truncated.
pub fn infer_l7(payload: &[u8], syscall_len: usize, ctx: &InferenceCtx) -> InferenceResult {
    match ctx.current_protocol {
        L7Protocol::Unknown => infer_unknown(payload, syscall_len, ctx),
        known => infer_known(known, payload, syscall_len, ctx),
    }
}

fn infer_unknown(payload: &[u8], syscall_len: usize, ctx: &InferenceCtx) -> InferenceResult {
    let r = infer_http1(payload);
    if r.protocol != L7Protocol::Unknown {
        return r;
    }
    let r = infer_http2(payload, ctx);
    if r.protocol != L7Protocol::Unknown {
        return r;
    }
    let r = infer_dubbo(payload);
    if r.protocol != L7Protocol::Unknown {
        return r;
    }
    let r = infer_redis(payload);
    if r.protocol != L7Protocol::Unknown {
        return r;
    }
    let r = infer_dns(payload, syscall_len, ctx);
    if r.protocol != L7Protocol::Unknown {
        return r;
    }
    let r = infer_mysql(payload, syscall_len, ctx);
    if r.protocol != L7Protocol::Unknown || r.msg_type == MessageType::Prestore {
        return r;
    }
    let r = infer_kafka(payload, syscall_len, ctx);
    if r.protocol != L7Protocol::Unknown {
        return r;
    }
    let r = infer_mqtt(payload, syscall_len);
    if r.protocol != L7Protocol::Unknown {
        return r;
    }

    // Too short for any length-prefixed recognizer: stash and wait.
    if syscall_len <= 4 && payload.len() <= 4 && ctx.prev_data.is_empty() {
        return InferenceResult::of(L7Protocol::Unknown, MessageType::Prestore);
    }
    InferenceResult::unknown()
}

fn infer_known(
    protocol: L7Protocol,
    payload: &[u8],
    syscall_len: usize,
    ctx: &InferenceCtx,
) -> InferenceResult {
    let r = match protocol {
        L7Protocol::Http1 => infer_http1(payload),
        L7Protocol::Http2 => infer_http2(payload, ctx),
        L7Protocol::Dns => infer_dns(payload, syscall_len, ctx),
        L7Protocol::Mysql => infer_mysql(payload, syscall_len, ctx),
        L7Protocol::Redis => infer_redis(payload),
        L7Protocol::Kafka => infer_kafka(payload, syscall_len, ctx),
        L7Protocol::Dubbo => infer_dubbo(payload),
        L7Protocol::Mqtt => infer_mqtt(payload, syscall_len),
        L7Protocol::Unknown => InferenceResult::unknown(),
    };
    if r.protocol == protocol || r.msg_type == MessageType::Prestore || r.msg_type == MessageType::Clear
    {
        return r;
    }
    // Fragment of an in-flight message; keep the session protocol and let the
    // caller derive the message type from the stored direction.
    InferenceResult::of(protocol, MessageType::Unknown)
}

// ---------------------------------------------------------------------------
// HTTP/1
// ---------------------------------------------------------------------------

const HTTP1_METHODS: [&[u8]; 9] = [
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"TRACE ",
    b"CONNECT ",
];

fn infer_http1(payload: &[u8]) -> InferenceResult {
    if payload.len() >= 9 && (payload.starts_with(b"HTTP/1.1 ") || payload.starts_with(b"HTTP/1.0 "))
    {
        return InferenceResult::of(L7Protocol::Http1, MessageType::Response);
    }
    let mut i = 0;
    while i < HTTP1_METHODS.len() {
        if payload.starts_with(HTTP1_METHODS[i]) {
            return InferenceResult::of(L7Protocol::Http1, MessageType::Request);
        }
        i += 1;
    }
    InferenceResult::unknown()
}

// ---------------------------------------------------------------------------
// HTTP/2
// ---------------------------------------------------------------------------

const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const HTTP2_FRAME_SETTINGS: u8 = 0x4;

fn infer_http2(payload: &[u8], ctx: &InferenceCtx) -> InferenceResult {
    if payload.starts_with(HTTP2_PREFACE) {
        return InferenceResult::of(L7Protocol::Http2, MessageType::Request);
    }
    // A SETTINGS frame on stream 0 opens both sides of every h2 connection.
    if payload.len() >= 9 {
        let frame_len = be24(payload, 0);
        let frame_type = payload[3];
        let stream_id = be32(payload, 5) & 0x7fff_ffff;
        if frame_type == HTTP2_FRAME_SETTINGS && stream_id == 0 && frame_len % 6 == 0 {
            let msg = match ctx.direction {
                Direction::Egress => MessageType::Request,
                _ => MessageType::Response,
            };
            return InferenceResult::of(L7Protocol::Http2, msg);
        }
    }
    InferenceResult::unknown()
}

// ---------------------------------------------------------------------------
// DNS
// ---------------------------------------------------------------------------

fn infer_dns(payload: &[u8], syscall_len: usize, ctx: &InferenceCtx) -> InferenceResult {
    if ctx.sport != DNS_PORT && ctx.dport != DNS_PORT {
        return InferenceResult::unknown();
    }
    // TCP transport prefixes the message with a 16-bit length.
    let off = if ctx.l4_protocol == IPPROTO_TCP {
        if payload.len() < 14 || be16(payload, 0) as usize + 2 != syscall_len {
            return InferenceResult::unknown();
        }
        2
    } else {
        0
    };
    if payload.len() < off + 12 {
        return InferenceResult::unknown();
    }
    let flags = be16(payload, off + 2);
    let opcode = (flags >> 11) & 0xf;
    let qdcount = be16(payload, off + 4);
    let ancount = be16(payload, off + 6);
    let nscount = be16(payload, off + 8);
    if opcode > 2 || qdcount == 0 || qdcount > 8 || ancount > 100 || nscount > 100 {
        return InferenceResult::unknown();
    }
    let msg = if flags & 0x8000 == 0 {
        MessageType::Request
    } else {
        MessageType::Response
    };
    InferenceResult::of(L7Protocol::Dns, msg)
}

// ---------------------------------------------------------------------------
// MySQL
// ---------------------------------------------------------------------------
//
// Packets carry a 3-byte little-endian body length and a sequence byte. A
// client that reads the 4-byte header first produces a payload that cannot be
// classified alone; those bytes are stashed (PRESTORE) and prepended when the
// body arrives.

const MYSQL_COM_MAX: u8 = 0x1f;

fn infer_mysql(payload: &[u8], syscall_len: usize, ctx: &InferenceCtx) -> InferenceResult {
    if !ctx.prev_data.is_empty() {
        if ctx.prev_data.len() != 4 {
            return InferenceResult::unknown();
        }
        let body_len = le24(ctx.prev_data, 0) as usize;
        let seqno = ctx.prev_data[3];
        if body_len == 0 || body_len != syscall_len || payload.is_empty() {
            return InferenceResult::unknown();
        }
        return mysql_classify(seqno, payload[0]);
    }

    if syscall_len == 4 && payload.len() == 4 && le24(payload, 0) > 0 {
        // Header-only read; body follows in the next syscall.
        return InferenceResult::of(L7Protocol::Unknown, MessageType::Prestore);
    }
    if payload.len() < 5 {
        return InferenceResult::unknown();
    }
    let body_len = le24(payload, 0) as usize;
    let seqno = payload[3];
    if body_len == 0 || body_len + 4 != syscall_len {
        return InferenceResult::unknown();
    }
    mysql_classify(seqno, payload[4])
}

fn mysql_classify(seqno: u8, first: u8) -> InferenceResult {
    if seqno == 0 {
        // Command packet from the client.
        if first >= 1 && first <= MYSQL_COM_MAX {
            return InferenceResult::of(L7Protocol::Mysql, MessageType::Request);
        }
        return InferenceResult::unknown();
    }
    // OK / ERR / EOF / result-set column count.
    if first == 0x00 || first == 0xff || first == 0xfe || (1..=250).contains(&first) {
        return InferenceResult::of(L7Protocol::Mysql, MessageType::Response);
    }
    InferenceResult::unknown()
}

// ---------------------------------------------------------------------------
// Redis (RESP)
// ---------------------------------------------------------------------------

fn infer_redis(payload: &[u8]) -> InferenceResult {
    if payload.len() < 4 {
        return InferenceResult::unknown();
    }
    match payload[0] {
        b'*' => {
            // Commands are always arrays: "*<n>\r\n...".
            if payload[1].is_ascii_digit() {
                InferenceResult::of(L7Protocol::Redis, MessageType::Request)
            } else {
                InferenceResult::unknown()
            }
        }
        b'+' | b'-' | b':' => InferenceResult::of(L7Protocol::Redis, MessageType::Response),
        b'$' => {
            if payload[1].is_ascii_digit() || payload[1] == b'-' {
                InferenceResult::of(L7Protocol::Redis, MessageType::Response)
            } else {
                InferenceResult::unknown()
            }
        }
        _ => InferenceResult::unknown(),
    }
}

// ---------------------------------------------------------------------------
// Kafka
// ---------------------------------------------------------------------------
//
// Requests are recognizable (api key, version, correlation id ranges) but
// responses carry nothing but a length and the echoed correlation id, so a
// request only tags the session RECONFIRM; the session is confirmed when a
// response echoes the stashed id and cleared when it does not.

const KAFKA_API_KEY_MAX: u16 = 67;
const KAFKA_API_VERSION_MAX: u16 = 20;
const KAFKA_MSG_MAX: u32 = 0x0100_0000;

fn infer_kafka(payload: &[u8], syscall_len: usize, ctx: &InferenceCtx) -> InferenceResult {
    if ctx.need_reconfirm {
        if payload.len() < 8 {
            return InferenceResult::unknown();
        }
        let msg_len = be32(payload, 0);
        let correlation = be32(payload, 4);
        if msg_len == 0 || msg_len > KAFKA_MSG_MAX {
            return InferenceResult::of(L7Protocol::Kafka, MessageType::Clear);
        }
        if correlation == ctx.correlation_id {
            return InferenceResult::of(L7Protocol::Kafka, MessageType::Response);
        }
        return InferenceResult::of(L7Protocol::Kafka, MessageType::Clear);
    }

    // A stashed 4-byte prefix is the message length; the request header
    // starts at the beginning of the current payload.
    let (msg_len, rest) = if ctx.prev_data.len() == 4 {
        (be32(ctx.prev_data, 0), payload)
    } else {
        if payload.len() < 4 {
            return InferenceResult::unknown();
        }
        (be32(payload, 0), &payload[4..])
    };
    if msg_len == 0 || msg_len > KAFKA_MSG_MAX || rest.len() < 10 {
        return InferenceResult::unknown();
    }
    if ctx.prev_data.is_empty() && msg_len as usize + 4 != syscall_len {
        return InferenceResult::unknown();
    }
    let api_key = be16(rest, 0);
    let api_version = be16(rest, 2);
    let correlation = be32(rest, 4);
    let client_id_len = be16(rest, 8);
    if api_key > KAFKA_API_KEY_MAX || api_version > KAFKA_API_VERSION_MAX {
        return InferenceResult::unknown();
    }
    if correlation & 0x8000_0000 != 0 {
        return InferenceResult::unknown();
    }
    if client_id_len != 0xffff && client_id_len as u32 > msg_len {
        return InferenceResult::unknown();
    }
    InferenceResult {
        protocol: L7Protocol::Kafka,
        msg_type: MessageType::Request,
        correlation_id: correlation,
        need_reconfirm: true,
    }
}

// ---------------------------------------------------------------------------
// Dubbo
// ---------------------------------------------------------------------------

const DUBBO_MAGIC_HIGH: u8 = 0xda;
const DUBBO_MAGIC_LOW: u8 = 0xbb;

fn infer_dubbo(payload: &[u8]) -> InferenceResult {
    if payload.len() < 16 || payload[0] != DUBBO_MAGIC_HIGH || payload[1] != DUBBO_MAGIC_LOW {
        return InferenceResult::unknown();
    }
    let flags = payload[2];
    let serialization = flags & 0x1f;
    if !(2..=12).contains(&serialization) {
        return InferenceResult::unknown();
    }
    let body_len = be32(payload, 12);
    if body_len > 0x0800_0000 {
        return InferenceResult::unknown();
    }
    let msg = if flags & 0x80 != 0 {
        MessageType::Request
    } else {
        MessageType::Response
    };
    InferenceResult::of(L7Protocol::Dubbo, msg)
}

// ---------------------------------------------------------------------------
// MQTT
// ---------------------------------------------------------------------------

fn infer_mqtt(payload: &[u8], syscall_len: usize) -> InferenceResult {
    if payload.len() < 2 {
        return InferenceResult::unknown();
    }
    let packet_type = payload[0] >> 4;
    if packet_type == 0 || packet_type == 15 {
        return InferenceResult::unknown();
    }
    let Some((remaining, header_len)) = mqtt_remaining_len(payload) else {
        return InferenceResult::unknown();
    };
    if remaining as usize + header_len != syscall_len {
        return InferenceResult::unknown();
    }
    // CONNECT must carry a known protocol name; everything else is accepted
    // only once the session already saw a valid CONNECT or stands on the
    // exact-length check above.
    if packet_type == 1 {
        let off = header_len;
        if payload.len() < off + 2 {
            return InferenceResult::unknown();
        }
        let name_len = be16(payload, off) as usize;
        if payload.len() < off + 2 + name_len
            || !(&payload[off + 2..off + 2 + name_len] == b"MQTT"
                || &payload[off + 2..off + 2 + name_len] == b"MQIsdp")
        {
            return InferenceResult::unknown();
        }
    }
    let msg = match packet_type {
        1 | 3 | 8 | 10 | 12 | 14 => MessageType::Request,
        2 | 4 | 5 | 6 | 7 | 9 | 11 | 13 => MessageType::Response,
        _ => return InferenceResult::unknown(),
    };
    InferenceResult::of(L7Protocol::Mqtt, msg)
}

/// Decode the MQTT remaining-length varint; returns (value, fixed header len).
fn mqtt_remaining_len(payload: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    let mut shift = 0;
    let mut i = 1;
    while i < 5 {
        let byte = *payload.get(i)?;
        value |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
        i += 1;
    }
    None
}

// ---------------------------------------------------------------------------
// Byte helpers (bounds are the callers' responsibility)
// ---------------------------------------------------------------------------

#[inline]
fn be16(b: &[u8], off: usize) -> u16 {
    ((b[off] as u16) << 8) | b[off + 1] as u16
}

#[inline]
fn be24(b: &[u8], off: usize) -> u32 {
    ((b[off] as u32) << 16) | ((b[off + 1] as u32) << 8) | b[off + 2] as u32
}

#[inline]
fn be32(b: &[u8], off: usize) -> u32 {
    ((b[off] as u32) << 24)
        | ((b[off + 1] as u32) << 16)
        | ((b[off + 2] as u32) << 8)
        | b[off + 3] as u32
}

#[inline]
fn le24(b: &[u8], off: usize) -> u32 {
    (b[off] as u32) | ((b[off + 1] as u32) << 8) | ((b[off + 2] as u32) << 16)
}
