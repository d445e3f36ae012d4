//! Loopback offset inference, kernel half.
//!
//! While the offset config is not ready, read/write exits are fed through
//! here. Userspace runs one pinned client per CPU against a local TCP server
//! on OFFSET_INFER_PORT, exchanging one byte per direction per round. Those
//! sockets are the only ones that can satisfy the chain validation below, so
//! traffic from unrelated processes falls out of the walk harmlessly.
//!
//! Field acceptance:
//! - fd-walk chain (files / private_data / sk): a candidate combination is
//!   accepted when the sock it reaches is AF_INET with the exchange port as
//!   its destination.
//! - copied_seq: after the client consumed the one-byte response, copied_seq
//!   has caught up with rcv_nxt and the advertised window update, so the
//!   candidate and its two u32 neighbours agree and are nonzero.
//! - write_seq: the client writes exactly one byte per round, so the
//!   candidate advances by exactly one between consecutive write exits.
//! - sock flags: the probe socket carries no exotic flags, so the candidate
//!   word must fit in the low 16 bits.

use aya_ebpf::helpers::bpf_get_current_task;
use socktrace_common::{OffsetInferState, SourceFn, OFFSET_INFER_PORT};

use super::maps::INFER_STATE;
use super::sock::read_kernel;

const SKC_DPORT: usize = 0x0c;
const SKC_FAMILY: usize = 0x10;
const AF_INET: u16 = 2;

// files_struct.fdt and fdtable.fd have not moved since long before 4.14.
const FILES_FDT_OFFSET: u32 = 0x20;
const FDT_FD_OFFSET: u32 = 0x08;
// socket.type sits behind the state word.
const SOCKET_TYPE_OFFSET: u32 = 0x04;

const TASK_FILES_CANDIDATES: [u32; 12] = [
    0x5c0, 0x5d0, 0x648, 0x6c0, 0x700, 0x740, 0x780, 0x7c0, 0x800, 0x840, 0xa80, 0xb48,
];
const FILE_PRIVATE_DATA_CANDIDATES: [u32; 4] = [0xc8, 0xc0, 0xb0, 0xa8];
const SOCKET_SK_CANDIDATES: [u32; 3] = [0x18, 0x20, 0x10];
const TCP_COPIED_SEQ_CANDIDATES: [u32; 8] = [0x514, 0x51c, 0x524, 0x52c, 0x5a4, 0x644, 0x654, 0x664];
const TCP_WRITE_SEQ_CANDIDATES: [u32; 8] = [0x5e4, 0x5ec, 0x5f4, 0x5fc, 0x674, 0x714, 0x724, 0x734];
const SOCK_FLAGS_CANDIDATES: [u32; 4] = [0x108, 0x110, 0x118, 0x120];

#[inline(always)]
fn state_mut() -> Option<&'static mut OffsetInferState> {
    unsafe { INFER_STATE.get_ptr_mut(0).map(|p| &mut *p) }
}

/// Feed one read/write exit of the current thread into the inferrer.
#[inline(always)]
pub fn observe(fd: u32, source: SourceFn) {
    let Some(state) = state_mut() else { return };
    if state.config.ready != 0 {
        return;
    }

    let task = unsafe { bpf_get_current_task() } as usize;

    if state.config.task_files_offset == 0 {
        infer_fd_chain(state, task, fd);
    }
    if state.config.task_files_offset == 0 {
        return;
    }

    // Re-resolve with the accepted chain and keep only exchange sockets.
    let Some(sk) = resolve_probe_sock(state, task, fd) else {
        return;
    };

    match source {
        SourceFn::Read => infer_copied_seq(state, sk),
        SourceFn::Write => infer_write_seq(state, sk),
        _ => return,
    }
    if state.config.sock_flags_offset == 0 {
        infer_sock_flags(state, sk);
    }

    state.rounds += 1;
    if state.config.task_files_offset != 0
        && state.config.tcp_copied_seq_offset != 0
        && state.config.tcp_write_seq_offset != 0
        && state.config.sock_flags_offset != 0
    {
        state.config.socket_type_offset = SOCKET_TYPE_OFFSET;
        state.config.ready = 1;
    }
}

/// Walk every chain candidate until one reaches an AF_INET sock whose
/// destination is the exchange port.
#[inline(always)]
fn infer_fd_chain(state: &mut OffsetInferState, task: usize, fd: u32) {
    let mut fi = 0;
    while fi < TASK_FILES_CANDIDATES.len() {
        let files_off = TASK_FILES_CANDIDATES[fi];
        fi += 1;
        let Some(file) = chain_file(task, files_off, fd) else {
            continue;
        };
        let mut pi = 0;
        while pi < FILE_PRIVATE_DATA_CANDIDATES.len() {
            let pd_off = FILE_PRIVATE_DATA_CANDIDATES[pi];
            pi += 1;
            let Some(socket) = nonzero_ptr(file, pd_off as usize) else {
                continue;
            };
            let mut si = 0;
            while si < SOCKET_SK_CANDIDATES.len() {
                let sk_off = SOCKET_SK_CANDIDATES[si];
                si += 1;
                let Some(sk) = nonzero_ptr(socket, sk_off as usize) else {
                    continue;
                };
                if is_probe_sock(sk) {
                    state.config.task_files_offset = files_off;
                    state.config.files_fdt_offset = FILES_FDT_OFFSET;
                    state.config.fdt_fd_offset = FDT_FD_OFFSET;
                    state.config.file_private_data_offset = pd_off;
                    state.config.socket_sk_offset = sk_off;
                    return;
                }
            }
        }
    }
}

#[inline(always)]
fn chain_file(task: usize, files_off: u32, fd: u32) -> Option<usize> {
    let files = nonzero_ptr(task, files_off as usize)?;
    let fdt = nonzero_ptr(files, FILES_FDT_OFFSET as usize)?;
    let max_fds: u32 = read_kernel(fdt, 0)?;
    // A freshly created fdtable rounds its capacity to a multiple of 64.
    if max_fds == 0 || max_fds > 1 << 20 || fd >= max_fds {
        return None;
    }
    let fd_array = nonzero_ptr(fdt, FDT_FD_OFFSET as usize)?;
    nonzero_ptr(fd_array, fd as usize * 8)
}

#[inline(always)]
fn resolve_probe_sock(state: &OffsetInferState, task: usize, fd: u32) -> Option<usize> {
    let cfg = &state.config;
    let files = nonzero_ptr(task, cfg.task_files_offset as usize)?;
    let fdt = nonzero_ptr(files, cfg.files_fdt_offset as usize)?;
    let fd_array = nonzero_ptr(fdt, cfg.fdt_fd_offset as usize)?;
    let file = nonzero_ptr(fd_array, fd as usize * 8)?;
    let socket = nonzero_ptr(file, cfg.file_private_data_offset as usize)?;
    let sk = nonzero_ptr(socket, cfg.socket_sk_offset as usize)?;
    if is_probe_sock(sk) {
        Some(sk)
    } else {
        None
    }
}

#[inline(always)]
fn is_probe_sock(sk: usize) -> bool {
    let Some(family) = read_kernel::<u16>(sk, SKC_FAMILY) else {
        return false;
    };
    if family != AF_INET {
        return false;
    }
    let Some(dport_be) = read_kernel::<u16>(sk, SKC_DPORT) else {
        return false;
    };
    u16::from_be(dport_be) == OFFSET_INFER_PORT
}

#[inline(always)]
fn infer_copied_seq(state: &mut OffsetInferState, sk: usize) {
    if state.config.tcp_copied_seq_offset != 0 {
        return;
    }
    let mut i = 0;
    while i < TCP_COPIED_SEQ_CANDIDATES.len() {
        let cand = TCP_COPIED_SEQ_CANDIDATES[i];
        i += 1;
        let Some(copied) = read_kernel::<u32>(sk, cand as usize) else {
            continue;
        };
        let Some(rcv_nxt) = read_kernel::<u32>(sk, cand as usize - 4) else {
            continue;
        };
        let Some(rcv_wup) = read_kernel::<u32>(sk, cand as usize + 4) else {
            continue;
        };
        if copied != 0 && copied == rcv_nxt && copied == rcv_wup {
            if state.last_copied_seq != 0 && copied > state.last_copied_seq {
                state.config.tcp_copied_seq_offset = cand;
                return;
            }
            state.last_copied_seq = copied;
            return;
        }
    }
}

#[inline(always)]
fn infer_write_seq(state: &mut OffsetInferState, sk: usize) {
    if state.config.tcp_write_seq_offset != 0 {
        return;
    }
    let mut i = 0;
    while i < TCP_WRITE_SEQ_CANDIDATES.len() {
        let cand = TCP_WRITE_SEQ_CANDIDATES[i];
        i += 1;
        let Some(write_seq) = read_kernel::<u32>(sk, cand as usize) else {
            continue;
        };
        if write_seq == 0 {
            continue;
        }
        if state.last_write_seq != 0 && write_seq == state.last_write_seq + 1 {
            state.config.tcp_write_seq_offset = cand;
            return;
        }
        state.last_write_seq = write_seq;
        return;
    }
}

#[inline(always)]
fn infer_sock_flags(state: &mut OffsetInferState, sk: usize) {
    let mut i = 0;
    while i < SOCK_FLAGS_CANDIDATES.len() {
        let cand = SOCK_FLAGS_CANDIDATES[i];
        i += 1;
        let Some(flags) = read_kernel::<u64>(sk, cand as usize) else {
            continue;
        };
        if flags != 0 && flags & !0xffff == 0 {
            state.config.sock_flags_offset = cand;
            return;
        }
    }
}

#[inline(always)]
fn nonzero_ptr(base: usize, offset: usize) -> Option<usize> {
    let addr: usize = read_kernel(base, offset)?;
    if addr == 0 {
        None
    } else {
        Some(addr)
    }
}
