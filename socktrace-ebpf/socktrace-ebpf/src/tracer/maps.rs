use aya_ebpf::{
    helpers::{bpf_get_smp_processor_id, bpf_ktime_get_ns},
    macros::map,
    maps::{Array, HashMap, PerCpuArray, PerfEventByteArray},
};
use socktrace_common::{
    id_seed, BurstBuffer, KernStats, OffsetConfig, OffsetInferState, RelayCommList, SocketInfo,
    TraceInfo,
};

/// Per-thread syscall-entry arguments, keyed by pid_tgid. Written by entry
/// handlers, consumed and deleted by the matching exit handler.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ActiveArgs {
    pub fd: u32,
    pub source_fn: u32,
    /// Direct buffer pointer for read/write/sendto/recvfrom.
    pub buf: u64,
    /// Iovec array pointer for the msg/mmsg/vec variants.
    pub iov: u64,
    pub iovlen: u32,
    pub _pad: u32,
    pub enter_ts: u64,
}

impl ActiveArgs {
    pub const fn zeroed() -> Self {
        Self {
            fd: 0,
            source_fn: 0,
            buf: 0,
            iov: 0,
            iovlen: 0,
            _pad: 0,
            enter_ts: 0,
        }
    }
}

/// Perf channel shared by burst buffers and standalone process events.
#[map(name = "SOCK_EVENTS")]
pub static mut SOCK_EVENTS: PerfEventByteArray = PerfEventByteArray::new(0);

/// Session state per (process, fd). Capacity is overridden at load time from
/// the tracer's max_socket_entries setting.
#[map(name = "SOCKET_INFO")]
pub static mut SOCKET_INFO: HashMap<u64, SocketInfo> = HashMap::with_max_entries(524_288, 0);

/// In-flight trace per thread. Capacity overridden at load time.
#[map(name = "TRACE_INFO")]
pub static mut TRACE_INFO: HashMap<u64, TraceInfo> = HashMap::with_max_entries(65_536, 0);

#[map(name = "ACTIVE_ARGS")]
pub static mut ACTIVE_ARGS: HashMap<u64, ActiveArgs> = HashMap::with_max_entries(65_536, 0);

/// Per-CPU staging buffer; flushed through SOCK_EVENTS on burst-full or tick.
#[map(name = "BURST_BUFFERS")]
pub static mut BURST_BUFFERS: PerCpuArray<BurstBuffer> = PerCpuArray::with_max_entries(1, 0);

/// Boot-relative nanoseconds of the oldest pending event in the staging
/// buffer; 0 when the buffer is empty.
#[map(name = "BURST_FIRST_TS")]
pub static mut BURST_FIRST_TS: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

/// Proven struct offsets, broadcast by userspace. Probes emit nothing while
/// `ready` is 0.
#[map(name = "TRACER_CONFIG")]
pub static mut TRACER_CONFIG: Array<OffsetConfig> = Array::with_max_entries(1, 0);

/// Per-CPU candidate-walking scratch for the loopback offset inference.
#[map(name = "INFER_STATE")]
pub static mut INFER_STATE: PerCpuArray<OffsetInferState> = PerCpuArray::with_max_entries(1, 0);

/// Process names treated as L4 relays.
#[map(name = "RELAY_COMMS")]
pub static mut RELAY_COMMS: Array<RelayCommList> = Array::with_max_entries(1, 0);

/// Session uid generator, seeded lazily per CPU.
#[map(name = "UID_GEN")]
pub static mut UID_GEN: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

/// Thread-trace-id generator, seeded lazily per CPU.
#[map(name = "TRACE_ID_GEN")]
pub static mut TRACE_ID_GEN: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

#[map(name = "KERN_STATS")]
pub static mut KERN_STATS: PerCpuArray<KernStats> = PerCpuArray::with_max_entries(1, 0);

/// Tgids identified as Go binaries by the uprobe collaborator.
#[map(name = "GO_PROCESS")]
pub static mut GO_PROCESS: HashMap<u32, u32> = HashMap::with_max_entries(4_096, 0);

/// Current goroutine id per thread, stamped by the uprobe collaborator.
#[map(name = "GO_COROUTINES")]
pub static mut GO_COROUTINES: HashMap<u64, u64> = HashMap::with_max_entries(65_536, 0);

#[inline(always)]
pub fn config() -> OffsetConfig {
    unsafe {
        match TRACER_CONFIG.get(0) {
            Some(cfg) => *cfg,
            None => OffsetConfig::zeroed(),
        }
    }
}

#[inline(always)]
pub fn stats_mut() -> Option<&'static mut KernStats> {
    unsafe { KERN_STATS.get_ptr_mut(0).map(|p| &mut *p) }
}

#[inline(always)]
pub fn stat_add(apply: impl FnOnce(&mut KernStats)) {
    if let Some(stats) = stats_mut() {
        apply(stats);
    }
}

/// Allocate the next session uid on this CPU.
#[inline(always)]
pub fn next_uid() -> u64 {
    next_from(unsafe { &mut UID_GEN })
}

/// Allocate the next thread-trace id on this CPU.
#[inline(always)]
pub fn next_trace_id() -> u64 {
    next_from(unsafe { &mut TRACE_ID_GEN })
}

#[inline(always)]
fn next_from(gen: &mut PerCpuArray<u64>) -> u64 {
    let Some(ptr) = gen.get_ptr_mut(0) else {
        return 0;
    };
    let slot = unsafe { &mut *ptr };
    if *slot == 0 {
        let cpu = unsafe { bpf_get_smp_processor_id() };
        *slot = id_seed(cpu, unsafe { bpf_ktime_get_ns() });
    }
    *slot = slot.wrapping_add(1);
    *slot
}

#[inline(always)]
pub fn is_relay_comm(comm: &[u8; 16]) -> bool {
    let Some(list) = (unsafe { RELAY_COMMS.get(0) }) else {
        return false;
    };
    let count = if list.count as usize > list.comms.len() {
        list.comms.len()
    } else {
        list.count as usize
    };
    let mut i = 0;
    while i < count {
        if comm_matches(&list.comms[i], comm) {
            return true;
        }
        i += 1;
    }
    false
}

/// Compare a configured name against a task comm, both NUL padded.
#[inline(always)]
fn comm_matches(want: &[u8; 16], got: &[u8; 16]) -> bool {
    let mut i = 0;
    while i < 16 {
        if want[i] != got[i] {
            return false;
        }
        if want[i] == 0 {
            return true;
        }
        i += 1;
    }
    true
}
