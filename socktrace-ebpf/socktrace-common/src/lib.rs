#![cfg_attr(all(feature = "bpf", not(feature = "user")), no_std)]

#[cfg(test)]
use core::mem::size_of;

use bytemuck::{Pod, Zeroable};

pub mod inference;
pub mod trace;

// =============================================================================
// WIRE FORMAT - Shared kernel/user layout definitions
// =============================================================================
//
// Kernel probes append fixed-size headers plus a bounded payload prefix into a
// per-CPU staging buffer, which is flushed through a perf channel as one burst.
// Userspace discriminates burst payloads from standalone process events by the
// first u32: burst buffers start with events_num in [1, EVENT_BURST_NUM],
// process events start with an event_type >= EVENT_TYPE_MIN.

/// Maximum payload prefix captured per syscall, in bytes.
pub const CAP_DATA_SIZE: usize = 1024;

/// Events accumulated in a per-CPU staging buffer before a forced flush.
pub const EVENT_BURST_NUM: u32 = 16;

/// Total staging buffer size. Power of two so every `len`-relative index in
/// the kernel can be masked instead of branch-checked.
pub const BURST_BUFFER_SIZE: usize = 32_768;

/// Payload area of the staging buffer (total minus the two u32 counters).
pub const BURST_DATA_SIZE: usize = BURST_BUFFER_SIZE - 8;

/// A staging buffer whose oldest pending event exceeds this age is flushed by
/// the next periodic tick even if the burst is not full.
pub const BURST_FLUSH_AGE_NS: u64 = 1_000_000_000;

/// First event type value reserved for registered extra events.
pub const EVENT_TYPE_MIN: u32 = 0x8000_0000;
pub const EVENT_TYPE_PROC_EXEC: u32 = EVENT_TYPE_MIN;
pub const EVENT_TYPE_PROC_EXIT: u32 = EVENT_TYPE_MIN + 1;

/// Loopback port used by the offset inference exchange.
pub const OFFSET_INFER_PORT: u16 = 54583;

/// Iovec walks copy at most this many segments.
pub const IOV_SEG_MAX: usize = 12;

/// Idle seconds after which a map entry becomes eligible for reclamation.
pub const RECLAIM_IDLE_SECS: u64 = 10;

pub const COMM_LEN: usize = 16;

/// Per-session sequence counters use the low 56 bits; the top byte of the
/// session uid carries the allocating CPU.
pub const SEQ_MASK: u64 = (1 << 56) - 1;

/// Maximum process names accepted by the relay-comm match list.
pub const RELAY_COMM_MAX: usize = 4;

/// Session key for a (process, file descriptor) pair.
#[inline]
pub const fn conn_key(tgid: u32, fd: u32) -> u64 {
    ((tgid as u64) << 32) | fd as u64
}

/// Seed for the per-CPU uid / trace-id generators: the CPU index in the top
/// byte, boot time in 100ns units below. Unique across a boot as long as two
/// generators on one CPU are not seeded within the same 100ns tick.
#[inline]
pub const fn id_seed(cpu: u32, boot_time_ns: u64) -> u64 {
    ((cpu as u64) << 56) | ((boot_time_ns / 100) & SEQ_MASK)
}

/// Fixed header preceding each captured payload in the staging buffer and in
/// the per-burst block handed to workers.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct SocketDataHeader {
    /// Session identity, unique across a boot.
    pub uid: u64,
    /// Per-session sequence (56 bits used). Repeats only for consecutive
    /// fragments that agree in direction and message type.
    pub seq: u64,
    /// Cross-socket correlation id; 0 when no pairing applies.
    pub thread_trace_id: u64,
    /// Stamped by the Go uprobe collaborator; 0 for non-Go processes.
    pub coroutine_id: u64,
    /// Boot-relative microseconds at syscall exit.
    pub timestamp_us: u64,
    pub tgid: u32,
    pub pid: u32,
    pub tcp_seq: u32,
    /// Full syscall return length.
    pub syscall_len: u32,
    /// Captured bytes following this header.
    pub data_len: u32,
    pub sport: u16,
    pub dport: u16,
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
    pub comm: [u8; COMM_LEN],
    /// Bytes stashed by a PRESTORE classification, logically preceding the
    /// captured payload.
    pub extra_data: [u8; 4],
    pub extra_data_count: u8,
    /// 4 for IPv4 addresses, 16 for IPv6.
    pub addr_len: u8,
    /// IPPROTO_TCP or IPPROTO_UDP.
    pub l4_protocol: u8,
    pub direction: u8,
    pub msg_type: u8,
    pub l7_protocol: u8,
    pub source_fn: u8,
    pub need_reconfirm: u8,
    pub _pad: [u8; 4],
}

impl SocketDataHeader {
    pub const fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

/// Per-CPU staging buffer flushed as one perf output.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct BurstBuffer {
    pub events_num: u32,
    pub len: u32,
    pub data: [u8; BURST_DATA_SIZE],
}

impl BurstBuffer {
    pub const fn zeroed() -> Self {
        Self {
            events_num: 0,
            len: 0,
            data: [0; BURST_DATA_SIZE],
        }
    }
}

/// Standalone record for registered extra events (process exec/exit).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct ProcessEventRecord {
    /// Always >= EVENT_TYPE_MIN so the reader can discriminate it from a
    /// burst buffer, whose leading events_num never exceeds EVENT_BURST_NUM.
    pub event_type: u32,
    pub pid: u32,
    pub comm: [u8; COMM_LEN],
}

// =============================================================================
// MAP VALUE TYPES
// =============================================================================

/// Per-(process, fd) session state, keyed by `conn_key`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct SocketInfo {
    pub uid: u64,
    pub seq: u64,
    /// Trace id parked on a speculative egress session (L4 relay case) until
    /// the first write on that fd consumes it.
    pub trace_id: u64,
    /// Seconds since boot of last activity; drives reclamation.
    pub update_time: u64,
    /// Nonzero when a distinct fd on the same process carries the paired
    /// direction.
    pub peer_fd: u32,
    /// Kafka request correlation id awaiting reconfirmation.
    pub correlation_id: u32,
    pub l7_protocol: u8,
    pub direction: u8,
    pub msg_type: u8,
    pub role: u8,
    /// Payload prefix stashed by PRESTORE for length-prefixed protocols.
    pub prev_data: [u8; 4],
    pub prev_data_len: u8,
    pub need_reconfirm: u8,
    pub _pad: [u8; 6],
}

impl SocketInfo {
    pub const fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

/// Per-thread in-flight trace, keyed by pid_tgid. Ingress creates, the paired
/// egress consumes and deletes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceInfo {
    pub thread_trace_id: u64,
    /// uid of the session that opened the trace.
    pub socket_id: u64,
    pub update_time: u64,
    /// The ingress fd, recoverable by a paired egress on a different fd.
    pub peer_fd: u32,
    pub _pad: u32,
}

impl TraceInfo {
    pub const fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

// =============================================================================
// OFFSET CONFIG - Kernel struct offsets discovered at runtime
// =============================================================================
//
// Kernels with BTF get these derived directly from /sys/kernel/btf/vmlinux.
// Without BTF, the in-kernel inferrer walks candidate tables against a live
// loopback TCP exchange until every field validates, then userspace broadcasts
// the proven struct here. Probes emit nothing until `ready` flips to 1.

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct OffsetConfig {
    pub ready: u32,
    /// task_struct.files
    pub task_files_offset: u32,
    /// files_struct.fdt
    pub files_fdt_offset: u32,
    /// fdtable.fd
    pub fdt_fd_offset: u32,
    /// file.private_data
    pub file_private_data_offset: u32,
    /// socket.sk
    pub socket_sk_offset: u32,
    /// socket.type
    pub socket_type_offset: u32,
    /// sock.__sk_common.skc_flags
    pub sock_flags_offset: u32,
    /// tcp_sock.copied_seq
    pub tcp_copied_seq_offset: u32,
    /// tcp_sock.write_seq
    pub tcp_write_seq_offset: u32,
    pub _pad: [u32; 2],
}

impl OffsetConfig {
    pub const fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }

    /// All structural offsets resolved (ready may still be 0 while userspace
    /// has not yet broadcast the proven struct).
    pub fn complete(&self) -> bool {
        self.task_files_offset != 0
            && self.file_private_data_offset != 0
            && self.socket_sk_offset != 0
            && self.tcp_copied_seq_offset != 0
            && self.tcp_write_seq_offset != 0
    }
}

/// Per-CPU scratch state for the loopback offset inference.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct OffsetInferState {
    pub config: OffsetConfig,
    /// Exchange rounds observed on this CPU.
    pub rounds: u32,
    /// copied_seq value seen at the previous candidate hit, for the
    /// delta-of-one check across consecutive one-byte reads.
    pub last_copied_seq: u32,
    pub last_write_seq: u32,
    pub _pad: u32,
}

impl OffsetInferState {
    pub const fn zeroed() -> Self {
        unsafe { core::mem::zeroed() }
    }
}

/// Process names treated as L4 relays (peer-fd pairing on egress sockets).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct RelayCommList {
    pub count: u32,
    pub _pad: u32,
    pub comms: [[u8; COMM_LEN]; RELAY_COMM_MAX],
}

impl RelayCommList {
    pub const fn zeroed() -> Self {
        Self {
            count: 0,
            _pad: 0,
            comms: [[0; COMM_LEN]; RELAY_COMM_MAX],
        }
    }
}

/// Per-CPU kernel-side counters, summed by userspace for stats reporting.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub struct KernStats {
    pub socket_map_drops: u64,
    pub trace_map_drops: u64,
    pub args_map_drops: u64,
    pub copy_failures: u64,
    pub burst_truncations: u64,
    pub events_emitted: u64,
    pub bytes_emitted: u64,
    pub flushes: u64,
}

// =============================================================================
// ENUMS - u8 tags shared across the wire format and map values
// =============================================================================

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    Unknown = 0,
    Ingress = 1,
    Egress = 2,
}

impl Direction {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Direction::Ingress,
            2 => Direction::Egress,
            _ => Direction::Unknown,
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum MessageType {
    Unknown = 0,
    Request = 1,
    Response = 2,
    /// Payload too short to classify; bytes stashed, nothing emitted.
    Prestore = 3,
    /// Protocol hint needs a later payload to confirm; nothing emitted.
    Reconfirm = 4,
    /// Recognizer invalidated the session; entry deleted, nothing emitted.
    Clear = 5,
}

impl MessageType {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => MessageType::Request,
            2 => MessageType::Response,
            3 => MessageType::Prestore,
            4 => MessageType::Reconfirm,
            5 => MessageType::Clear,
            _ => MessageType::Unknown,
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum SocketRole {
    Unknown = 0,
    Client = 1,
    Server = 2,
}

impl SocketRole {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => SocketRole::Client,
            2 => SocketRole::Server,
            _ => SocketRole::Unknown,
        }
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum L7Protocol {
    Unknown = 0,
    Http1 = 1,
    Http2 = 2,
    Dns = 3,
    Mysql = 4,
    Redis = 5,
    Kafka = 6,
    Dubbo = 7,
    Mqtt = 8,
}

impl L7Protocol {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => L7Protocol::Http1,
            2 => L7Protocol::Http2,
            3 => L7Protocol::Dns,
            4 => L7Protocol::Mysql,
            5 => L7Protocol::Redis,
            6 => L7Protocol::Kafka,
            7 => L7Protocol::Dubbo,
            8 => L7Protocol::Mqtt,
            _ => L7Protocol::Unknown,
        }
    }
}

/// Syscall family that produced a record.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(serde::Serialize, serde::Deserialize))]
pub enum SourceFn {
    Unknown = 0,
    Read = 1,
    Write = 2,
    SendTo = 3,
    RecvFrom = 4,
    SendMsg = 5,
    RecvMsg = 6,
    SendMMsg = 7,
    RecvMMsg = 8,
    Writev = 9,
    Readv = 10,
}

impl SourceFn {
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => SourceFn::Read,
            2 => SourceFn::Write,
            3 => SourceFn::SendTo,
            4 => SourceFn::RecvFrom,
            5 => SourceFn::SendMsg,
            6 => SourceFn::RecvMsg,
            7 => SourceFn::SendMMsg,
            8 => SourceFn::RecvMMsg,
            9 => SourceFn::Writev,
            10 => SourceFn::Readv,
            _ => SourceFn::Unknown,
        }
    }

    /// Kernel-to-user data movement.
    pub const fn is_ingress(&self) -> bool {
        matches!(
            self,
            SourceFn::Read | SourceFn::RecvFrom | SourceFn::RecvMsg | SourceFn::RecvMMsg | SourceFn::Readv
        )
    }
}

pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(size_of::<SocketDataHeader>(), 128);
        assert_eq!(size_of::<SocketDataHeader>() % 8, 0);
    }

    #[test]
    fn burst_buffer_is_power_of_two() {
        assert_eq!(size_of::<BurstBuffer>(), BURST_BUFFER_SIZE);
        assert!(BURST_BUFFER_SIZE.is_power_of_two());
        assert_eq!(BURST_DATA_SIZE + 8, BURST_BUFFER_SIZE);
    }

    #[test]
    fn map_value_layouts() {
        assert_eq!(size_of::<SocketInfo>(), 56);
        assert_eq!(size_of::<TraceInfo>(), 32);
        assert_eq!(size_of::<OffsetConfig>(), 48);
        assert_eq!(size_of::<OffsetInferState>(), 64);
        assert_eq!(size_of::<ProcessEventRecord>(), 24);
    }

    #[test]
    fn conn_key_packs_tgid_and_fd() {
        let key = conn_key(0x1234, 7);
        assert_eq!(key >> 32, 0x1234);
        assert_eq!(key & 0xffff_ffff, 7);
    }

    #[test]
    fn id_seed_carries_cpu_in_top_byte() {
        let seed = id_seed(3, 1_000_000_000);
        assert_eq!(seed >> 56, 3);
        assert_eq!(seed & SEQ_MASK, 10_000_000);
    }

    #[test]
    fn event_type_range_cannot_collide_with_burst_counts() {
        // First-u32 discrimination relies on this gap.
        assert!(EVENT_TYPE_MIN > EVENT_BURST_NUM);
        assert!(EVENT_TYPE_PROC_EXEC >= EVENT_TYPE_MIN);
        assert!(EVENT_TYPE_PROC_EXIT >= EVENT_TYPE_MIN);
    }

    #[cfg(feature = "user")]
    #[test]
    fn socket_info_serializes() {
        let info = SocketInfo::zeroed();
        let json = serde_json::to_string(&info).expect("serialize socket info");
        assert!(json.contains("\"uid\":0"));
    }
}
