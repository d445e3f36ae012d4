//! Syscall attach points and the shared data path.
//!
//! Entry handlers stash the argument set per thread; exit handlers validate
//! the return value, resolve the fd to a classified socket, run protocol
//! inference and the trace engine, and append a record to the staging buffer.
//! The msg/mmsg/vec variants enter through kprobes because their tracepoint
//! argument layout shifted across kernel versions.

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_user,
        bpf_probe_read_user_buf,
    },
    macros::{kprobe, tracepoint},
    programs::{ProbeContext, TracePointContext},
};
use socktrace_common::{
    conn_key,
    inference::{continuation_msg_type, infer_l7, InferenceCtx},
    trace::{trace_transition, TraceOp},
    Direction, L7Protocol, MessageType, SocketDataHeader, SocketInfo, SocketRole, SourceFn,
    TraceInfo, CAP_DATA_SIZE, IOV_SEG_MAX, IPPROTO_TCP, SEQ_MASK,
};

use super::buffer;
use super::maps::{
    config, is_relay_comm, next_trace_id, next_uid, stat_add, ActiveArgs, ACTIVE_ARGS,
    GO_COROUTINES, GO_PROCESS, SOCKET_INFO, TRACE_INFO,
};
use super::offsets;
use super::sock;

// syscalls/sys_enter_*: args start at 16, 8 bytes each.
const TP_ARG0: usize = 16;
const TP_ARG1: usize = 24;
const TP_ARG2: usize = 32;
// syscalls/sys_exit_*: return value at 16.
const TP_RET: usize = 16;

// user_msghdr field offsets.
const MSGHDR_IOV: usize = 16;
const MSGHDR_IOVLEN: usize = 24;

// =============================================================================
// ENTRY HANDLERS
// =============================================================================

#[inline(always)]
fn stash_args(fd: u32, buf: u64, iov: u64, iovlen: u32, source: SourceFn) {
    let key = bpf_get_current_pid_tgid();
    let args = ActiveArgs {
        fd,
        source_fn: source as u32,
        buf,
        iov,
        iovlen,
        _pad: 0,
        enter_ts: unsafe { bpf_ktime_get_ns() },
    };
    if unsafe { ACTIVE_ARGS.insert(&key, &args, 0) }.is_err() {
        stat_add(|s| s.args_map_drops += 1);
    }
}

#[inline(always)]
fn enter_buf_syscall(ctx: &TracePointContext, source: SourceFn) -> u32 {
    let Ok(fd) = (unsafe { ctx.read_at::<u64>(TP_ARG0) }) else {
        return 0;
    };
    let Ok(buf) = (unsafe { ctx.read_at::<u64>(TP_ARG1) }) else {
        return 0;
    };
    stash_args(fd as u32, buf, 0, 0, source);
    0
}

#[tracepoint(category = "syscalls", name = "sys_enter_read")]
pub fn sys_enter_read(ctx: TracePointContext) -> u32 {
    enter_buf_syscall(&ctx, SourceFn::Read)
}

#[tracepoint(category = "syscalls", name = "sys_enter_write")]
pub fn sys_enter_write(ctx: TracePointContext) -> u32 {
    enter_buf_syscall(&ctx, SourceFn::Write)
}

#[tracepoint(category = "syscalls", name = "sys_enter_sendto")]
pub fn sys_enter_sendto(ctx: TracePointContext) -> u32 {
    enter_buf_syscall(&ctx, SourceFn::SendTo)
}

#[tracepoint(category = "syscalls", name = "sys_enter_recvfrom")]
pub fn sys_enter_recvfrom(ctx: TracePointContext) -> u32 {
    enter_buf_syscall(&ctx, SourceFn::RecvFrom)
}

/// Eager session eviction: the fd is gone, the reclaimer never needs to see
/// this entry.
#[tracepoint(category = "syscalls", name = "sys_enter_close")]
pub fn sys_enter_close(ctx: TracePointContext) -> u32 {
    let Ok(fd) = (unsafe { ctx.read_at::<u64>(TP_ARG0) }) else {
        return 0;
    };
    let pid_tgid = bpf_get_current_pid_tgid();
    let key = conn_key((pid_tgid >> 32) as u32, fd as u32);
    let _ = unsafe { SOCKET_INFO.remove(&key) };
    0
}

/// Hijacked as the periodic tick: flush a staging buffer whose oldest event
/// has waited longer than the flush threshold.
#[tracepoint(category = "syscalls", name = "sys_enter_getppid")]
pub fn sys_enter_getppid(ctx: TracePointContext) -> u32 {
    buffer::flush_aged(&ctx);
    0
}

#[inline(always)]
fn kprobe_msg_enter(ctx: &ProbeContext, source: SourceFn) -> u32 {
    let Some(fd) = ctx.arg::<usize>(0) else {
        return 0;
    };
    let Some(msghdr) = ctx.arg::<usize>(1) else {
        return 0;
    };
    if msghdr == 0 {
        return 0;
    }
    // Both msghdr and mmsghdr start with the iovec pointer block; for the
    // mmsg variants only the first message is captured.
    let iov = unsafe { bpf_probe_read_user((msghdr + MSGHDR_IOV) as *const u64) }.unwrap_or(0);
    let iovlen =
        unsafe { bpf_probe_read_user((msghdr + MSGHDR_IOVLEN) as *const u64) }.unwrap_or(0);
    stash_args(fd as u32, 0, iov, iovlen as u32, source);
    0
}

#[kprobe(function = "__sys_sendmsg")]
pub fn enter_sendmsg(ctx: ProbeContext) -> u32 {
    kprobe_msg_enter(&ctx, SourceFn::SendMsg)
}

#[kprobe(function = "__sys_recvmsg")]
pub fn enter_recvmsg(ctx: ProbeContext) -> u32 {
    kprobe_msg_enter(&ctx, SourceFn::RecvMsg)
}

#[kprobe(function = "__sys_sendmmsg")]
pub fn enter_sendmmsg(ctx: ProbeContext) -> u32 {
    kprobe_msg_enter(&ctx, SourceFn::SendMMsg)
}

#[kprobe(function = "__sys_recvmmsg")]
pub fn enter_recvmmsg(ctx: ProbeContext) -> u32 {
    kprobe_msg_enter(&ctx, SourceFn::RecvMMsg)
}

#[inline(always)]
fn kprobe_vec_enter(ctx: &ProbeContext, source: SourceFn) -> u32 {
    let Some(fd) = ctx.arg::<usize>(0) else {
        return 0;
    };
    let Some(iov) = ctx.arg::<usize>(1) else {
        return 0;
    };
    let Some(vlen) = ctx.arg::<usize>(2) else {
        return 0;
    };
    stash_args(fd as u32, 0, iov as u64, vlen as u32, source);
    0
}

#[kprobe(function = "do_writev")]
pub fn enter_writev(ctx: ProbeContext) -> u32 {
    kprobe_vec_enter(&ctx, SourceFn::Writev)
}

#[kprobe(function = "do_readv")]
pub fn enter_readv(ctx: ProbeContext) -> u32 {
    kprobe_vec_enter(&ctx, SourceFn::Readv)
}

// =============================================================================
// EXIT HANDLERS
// =============================================================================

#[inline(always)]
fn data_exit(ctx: &TracePointContext) -> u32 {
    let key = bpf_get_current_pid_tgid();
    let args = match unsafe { ACTIVE_ARGS.get(&key) } {
        Some(a) => *a,
        None => return 0,
    };
    let _ = unsafe { ACTIVE_ARGS.remove(&key) };
    let Ok(ret) = (unsafe { ctx.read_at::<i64>(TP_RET) }) else {
        return 0;
    };
    process_data(ctx, &args, ret);
    0
}

#[tracepoint(category = "syscalls", name = "sys_exit_read")]
pub fn sys_exit_read(ctx: TracePointContext) -> u32 {
    data_exit(&ctx)
}

#[tracepoint(category = "syscalls", name = "sys_exit_write")]
pub fn sys_exit_write(ctx: TracePointContext) -> u32 {
    data_exit(&ctx)
}

#[tracepoint(category = "syscalls", name = "sys_exit_sendto")]
pub fn sys_exit_sendto(ctx: TracePointContext) -> u32 {
    data_exit(&ctx)
}

#[tracepoint(category = "syscalls", name = "sys_exit_recvfrom")]
pub fn sys_exit_recvfrom(ctx: TracePointContext) -> u32 {
    data_exit(&ctx)
}

#[tracepoint(category = "syscalls", name = "sys_exit_sendmsg")]
pub fn sys_exit_sendmsg(ctx: TracePointContext) -> u32 {
    data_exit(&ctx)
}

#[tracepoint(category = "syscalls", name = "sys_exit_recvmsg")]
pub fn sys_exit_recvmsg(ctx: TracePointContext) -> u32 {
    data_exit(&ctx)
}

#[tracepoint(category = "syscalls", name = "sys_exit_sendmmsg")]
pub fn sys_exit_sendmmsg(ctx: TracePointContext) -> u32 {
    data_exit(&ctx)
}

#[tracepoint(category = "syscalls", name = "sys_exit_recvmmsg")]
pub fn sys_exit_recvmmsg(ctx: TracePointContext) -> u32 {
    data_exit(&ctx)
}

#[tracepoint(category = "syscalls", name = "sys_exit_writev")]
pub fn sys_exit_writev(ctx: TracePointContext) -> u32 {
    data_exit(&ctx)
}

#[tracepoint(category = "syscalls", name = "sys_exit_readv")]
pub fn sys_exit_readv(ctx: TracePointContext) -> u32 {
    data_exit(&ctx)
}

/// Speculative egress session for configured relay processes: a thread that
/// still holds an open ingress trace and creates a new socket is about to
/// forward the request on it.
#[tracepoint(category = "syscalls", name = "sys_exit_socket")]
pub fn sys_exit_socket(ctx: TracePointContext) -> u32 {
    let Ok(ret) = (unsafe { ctx.read_at::<i64>(TP_RET) }) else {
        return 0;
    };
    if ret < 0 {
        return 0;
    }
    let fd = ret as u32;
    let Ok(comm) = bpf_get_current_comm() else {
        return 0;
    };
    if !is_relay_comm(&comm) {
        return 0;
    }
    let pid_tgid = bpf_get_current_pid_tgid();
    let trace = match unsafe { TRACE_INFO.get(&pid_tgid) } {
        Some(t) => *t,
        None => return 0,
    };
    if trace.peer_fd == fd {
        return 0;
    }

    let mut info = SocketInfo::zeroed();
    info.uid = next_uid();
    info.trace_id = trace.thread_trace_id;
    info.peer_fd = trace.peer_fd;
    info.update_time = unsafe { bpf_ktime_get_ns() } / 1_000_000_000;

    let key = conn_key((pid_tgid >> 32) as u32, fd);
    if unsafe { SOCKET_INFO.insert(&key, &info, 0) }.is_err() {
        stat_add(|s| s.socket_map_drops += 1);
    }
    0
}

// =============================================================================
// SHARED DATA PATH
// =============================================================================

#[inline(always)]
fn process_data(ctx: &TracePointContext, args: &ActiveArgs, ret: i64) {
    if ret <= 0 || args.fd <= 2 {
        return;
    }
    let source = SourceFn::from_u8(args.source_fn as u8);

    let cfg = config();
    if cfg.ready == 0 {
        offsets::observe(args.fd, source);
        return;
    }

    let Some(socket_ptr) = sock::resolve_socket(args.fd, &cfg) else {
        return;
    };
    let Some(tuple) = sock::classify(socket_ptr, &cfg) else {
        return;
    };

    let ingress = source.is_ingress();
    let direction = if ingress {
        Direction::Ingress
    } else {
        Direction::Egress
    };

    let pid_tgid = bpf_get_current_pid_tgid();
    let tgid = (pid_tgid >> 32) as u32;
    let key = conn_key(tgid, args.fd);

    let (mut info, created) = match unsafe { SOCKET_INFO.get(&key) } {
        Some(v) => (*v, false),
        None => {
            let mut fresh = SocketInfo::zeroed();
            fresh.uid = next_uid();
            (fresh, true)
        }
    };
    // Snapshot as found at event arrival; the burst comparison and the trace
    // engine are defined against this, not the updated state.
    let snapshot = info;

    let Some(buf) = buffer::acquire() else {
        return;
    };
    let (rec_off, data_off) = buffer::reserve(ctx, buf);

    let syscall_len = ret as usize;
    let want = if syscall_len < CAP_DATA_SIZE {
        syscall_len
    } else {
        CAP_DATA_SIZE
    };
    let copied = copy_payload(args, buf, data_off, want);
    if copied == 0 {
        return;
    }

    let prev_len = if info.prev_data_len as usize > 4 {
        4
    } else {
        info.prev_data_len as usize
    };
    let prev = info.prev_data;
    let result = {
        let payload = &buf.data[data_off..data_off + copied];
        let ictx = InferenceCtx {
            direction,
            l4_protocol: tuple.l4_protocol,
            sport: tuple.sport,
            dport: tuple.dport,
            prev_data: &prev[..prev_len],
            need_reconfirm: info.need_reconfirm != 0,
            correlation_id: info.correlation_id,
            current_protocol: L7Protocol::from_u8(info.l7_protocol),
        };
        infer_l7(payload, syscall_len, &ictx)
    };

    let now = unsafe { bpf_ktime_get_ns() };
    info.update_time = now / 1_000_000_000;

    match result.msg_type {
        MessageType::Prestore => {
            let n = if copied > 4 { 4 } else { copied };
            let mut stash = [0u8; 4];
            let mut i = 0;
            while i < n {
                stash[i] = buf.data[data_off + i];
                i += 1;
            }
            info.prev_data = stash;
            info.prev_data_len = n as u8;
            store_socket_info(&key, &info, created);
            return;
        }
        MessageType::Reconfirm => {
            info.need_reconfirm = 1;
            info.correlation_id = result.correlation_id;
            if result.protocol != L7Protocol::Unknown {
                info.l7_protocol = result.protocol as u8;
            }
            store_socket_info(&key, &info, created);
            return;
        }
        MessageType::Clear => {
            let _ = unsafe { SOCKET_INFO.remove(&key) };
            return;
        }
        _ => {}
    }

    if result.protocol == L7Protocol::Unknown
        && L7Protocol::from_u8(info.l7_protocol) == L7Protocol::Unknown
    {
        // Nothing recognized; keep the session warm but emit nothing.
        store_socket_info(&key, &info, created);
        return;
    }

    if info.l7_protocol == L7Protocol::Unknown as u8 {
        info.l7_protocol = result.protocol as u8;
        info.role = first_role(direction, result.msg_type) as u8;
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

    let is_go = unsafe { GO_PROCESS.get(&tgid) }.is_some();
    let coroutine_id = unsafe { GO_COROUTINES.get(&pid_tgid) }.copied().unwrap_or(0);

    let existing = unsafe { TRACE_INFO.get(&pid_tgid) }.copied();
    let decision = trace_transition(
        direction,
        msg_type,
        existing.as_ref(),
        &snapshot,
        info.uid,
        args.fd,
        is_go,
        next_trace_id,
    );
    match decision.op {
        TraceOp::Put(pending) => {
            let entry = TraceInfo {
                thread_trace_id: pending.thread_trace_id,
                socket_id: pending.socket_id,
                update_time: now / 1_000_000_000,
                peer_fd: pending.peer_fd,
                _pad: 0,
            };
            if unsafe { TRACE_INFO.insert(&pid_tgid, &entry, 0) }.is_err() {
                stat_add(|s| s.trace_map_drops += 1);
            }
        }
        TraceOp::Delete => {
            let _ = unsafe { TRACE_INFO.remove(&pid_tgid) };
        }
        TraceOp::None => {}
    }
    if decision.consume_parked {
        info.trace_id = 0;
    }

    if !decision.keep_data_seq {
        info.seq = (info.seq + 1) & SEQ_MASK;
    }

    // Consumed prestore bytes ride along in the header so userspace can
    // prepend them when rebuilding the record.
    let extra_count = snapshot.prev_data_len;
    if extra_count != 0 {
        info.prev_data = [0; 4];
        info.prev_data_len = 0;
    }

    info.direction = direction as u8;
    info.msg_type = msg_type as u8;

    if created {
        if unsafe { SOCKET_INFO.insert(&key, &info, 0) }.is_err() {
            stat_add(|s| s.socket_map_drops += 1);
            return;
        }
    } else {
        let _ = unsafe { SOCKET_INFO.insert(&key, &info, 0) };
    }

    let comm = bpf_get_current_comm().unwrap_or([0u8; 16]);
    let mut header = SocketDataHeader::zeroed();
    header.uid = info.uid;
    header.seq = info.seq;
    header.thread_trace_id = decision.thread_trace_id;
    header.coroutine_id = coroutine_id;
    header.timestamp_us = now / 1_000;
    header.tgid = tgid;
    header.pid = pid_tgid as u32;
    header.tcp_seq = if tuple.l4_protocol == IPPROTO_TCP {
        sock::tcp_seq(socket_ptr, &cfg, ingress)
    } else {
        0
    };
    header.syscall_len = syscall_len as u32;
    header.data_len = copied as u32;
    header.sport = tuple.sport;
    header.dport = tuple.dport;
    header.saddr = tuple.saddr;
    header.daddr = tuple.daddr;
    header.comm = comm;
    header.extra_data = snapshot.prev_data;
    header.extra_data_count = extra_count;
    header.addr_len = tuple.addr_len;
    header.l4_protocol = tuple.l4_protocol;
    header.direction = direction as u8;
    header.msg_type = msg_type as u8;
    header.l7_protocol = info.l7_protocol;
    header.source_fn = source as u8;
    header.need_reconfirm = info.need_reconfirm;

    write_header(buf, rec_off, &header);
    buffer::commit(ctx, buf, buffer::HEADER_SIZE + copied);
}

#[inline(always)]
fn store_socket_info(key: &u64, info: &SocketInfo, created: bool) {
    if unsafe { SOCKET_INFO.insert(key, info, 0) }.is_err() && created {
        stat_add(|s| s.socket_map_drops += 1);
    }
}

#[inline(always)]
fn first_role(direction: Direction, msg_type: MessageType) -> SocketRole {
    match (direction, msg_type) {
        (Direction::Ingress, MessageType::Request) => SocketRole::Server,
        (Direction::Egress, MessageType::Request) => SocketRole::Client,
        (Direction::Ingress, MessageType::Response) => SocketRole::Client,
        (Direction::Egress, MessageType::Response) => SocketRole::Server,
        _ => SocketRole::Unknown,
    }
}

#[inline(always)]
fn write_header(buf: &mut socktrace_common::BurstBuffer, rec_off: usize, header: &SocketDataHeader) {
    if rec_off + buffer::HEADER_SIZE > buf.data.len() {
        return;
    }
    let dst = buf.data[rec_off..].as_mut_ptr() as *mut SocketDataHeader;
    unsafe { core::ptr::write_unaligned(dst, *header) };
}

/// Copy the payload prefix into the staging buffer, either from the direct
/// buffer pointer or by walking at most IOV_SEG_MAX iovec segments. Returns
/// the number of bytes copied.
#[inline(always)]
fn copy_payload(
    args: &ActiveArgs,
    buf: &mut socktrace_common::BurstBuffer,
    data_off: usize,
    want: usize,
) -> usize {
    let want = if want > CAP_DATA_SIZE { CAP_DATA_SIZE } else { want };
    if data_off + CAP_DATA_SIZE > buf.data.len() {
        return 0;
    }

    if args.buf != 0 {
        let dst = &mut buf.data[data_off..data_off + want];
        if unsafe { bpf_probe_read_user_buf(args.buf as *const u8, dst) }.is_err() {
            stat_add(|s| s.copy_failures += 1);
            return 0;
        }
        return want;
    }

    if args.iov == 0 {
        return 0;
    }
    let mut copied = 0usize;
    let mut seg = 0usize;
    let segs = if (args.iovlen as usize) < IOV_SEG_MAX {
        args.iovlen as usize
    } else {
        IOV_SEG_MAX
    };
    while seg < segs {
        if copied >= want {
            break;
        }
        let iov_base = unsafe { bpf_probe_read_user((args.iov as usize + seg * 16) as *const u64) }
            .unwrap_or(0);
        let iov_len = unsafe {
            bpf_probe_read_user((args.iov as usize + seg * 16 + 8) as *const u64)
        }
        .unwrap_or(0) as usize;
        if iov_base == 0 || iov_len == 0 {
            break;
        }
        let remaining = want - copied;
        let take = if iov_len < remaining { iov_len } else { remaining };
        let start = data_off + copied;
        let dst = &mut buf.data[start..start + take];
        if unsafe { bpf_probe_read_user_buf(iov_base as *const u8, dst) }.is_err() {
            stat_add(|s| s.copy_failures += 1);
            break;
        }
        copied += take;
        seg += 1;
    }
    copied
}
