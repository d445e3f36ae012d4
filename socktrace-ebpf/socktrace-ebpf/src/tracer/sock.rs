//! fd -> struct sock resolution and L4 classification.
//!
//! The walk task_struct -> files -> fdtable -> file -> socket -> sock uses
//! the runtime-discovered offsets; the sock_common field block at the head of
//! struct sock has kept its layout since 4.x and is addressed with fixed
//! offsets. Every read goes through the fallible probe-read primitive and any
//! failure aborts the record.

use aya_ebpf::helpers::{bpf_get_current_task, bpf_probe_read_kernel};
use socktrace_common::{OffsetConfig, IPPROTO_TCP, IPPROTO_UDP};

use super::maps::stat_add;

// sock_common, stable since 4.x.
const SKC_DADDR: usize = 0x00;
const SKC_RCV_SADDR: usize = 0x04;
const SKC_DPORT: usize = 0x0c;
const SKC_NUM: usize = 0x0e;
const SKC_FAMILY: usize = 0x10;
const SKC_STATE: usize = 0x12;
const SKC_FLAG_BITS: usize = 0x13;
const SKC_V6_DADDR: usize = 0x38;
const SKC_V6_RCV_SADDR: usize = 0x48;

/// skc_ipv6only within the skc_reuse/reuseport/ipv6only bitfield byte.
const SKC_IPV6ONLY_BIT: u8 = 1 << 5;

pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

const SOCK_STREAM: u16 = 1;
const SOCK_DGRAM: u16 = 2;

const TCP_ESTABLISHED: u8 = 1;
const TCP_CLOSE_WAIT: u8 = 8;

/// L4 identity of a classified socket.
#[derive(Copy, Clone)]
pub struct SockTuple {
    pub l4_protocol: u8,
    pub addr_len: u8,
    pub saddr: [u8; 16],
    pub daddr: [u8; 16],
    pub sport: u16,
    pub dport: u16,
}

#[inline(always)]
pub fn read_kernel<T: Copy>(base: usize, offset: usize) -> Option<T> {
    if base == 0 {
        return None;
    }
    match unsafe { bpf_probe_read_kernel((base + offset) as *const T) } {
        Ok(v) => Some(v),
        Err(_) => {
            stat_add(|s| s.copy_failures += 1);
            None
        }
    }
}

#[inline(always)]
fn read_kernel_ptr(base: usize, offset: usize) -> Option<usize> {
    let addr: usize = read_kernel(base, offset)?;
    if addr == 0 {
        None
    } else {
        Some(addr)
    }
}

/// Resolve the `struct socket` behind an fd of the current task.
#[inline(always)]
pub fn resolve_socket(fd: u32, cfg: &OffsetConfig) -> Option<usize> {
    let task = unsafe { bpf_get_current_task() } as usize;
    resolve_socket_of(task, fd, cfg)
}

#[inline(always)]
pub fn resolve_socket_of(task: usize, fd: u32, cfg: &OffsetConfig) -> Option<usize> {
    let files = read_kernel_ptr(task, cfg.task_files_offset as usize)?;
    let fdt = read_kernel_ptr(files, cfg.files_fdt_offset as usize)?;
    let max_fds: u32 = read_kernel(fdt, 0)?;
    if fd >= max_fds {
        return None;
    }
    let fd_array = read_kernel_ptr(fdt, cfg.fdt_fd_offset as usize)?;
    let file = read_kernel_ptr(fd_array, fd as usize * 8)?;
    read_kernel_ptr(file, cfg.file_private_data_offset as usize)
}

/// Resolve the `struct sock` behind an fd of the current task.
#[inline(always)]
pub fn resolve_sock(fd: u32, cfg: &OffsetConfig) -> Option<usize> {
    let socket = resolve_socket(fd, cfg)?;
    read_kernel_ptr(socket, cfg.socket_sk_offset as usize)
}

/// Classify a socket and extract its 5-tuple. Returns None for address
/// families or states the tracer does not capture.
#[inline(always)]
pub fn classify(socket: usize, cfg: &OffsetConfig) -> Option<SockTuple> {
    let sk = read_kernel_ptr(socket, cfg.socket_sk_offset as usize)?;
    let sock_type: u16 = read_kernel(socket, cfg.socket_type_offset as usize)?;
    let l4_protocol = match sock_type {
        SOCK_STREAM => IPPROTO_TCP,
        SOCK_DGRAM => IPPROTO_UDP,
        _ => return None,
    };

    let family: u16 = read_kernel(sk, SKC_FAMILY)?;
    if family != AF_INET && family != AF_INET6 {
        return None;
    }
    if family == AF_INET6 {
        let flag_bits: u8 = read_kernel(sk, SKC_FLAG_BITS)?;
        if flag_bits & SKC_IPV6ONLY_BIT != 0 {
            return None;
        }
    }

    if l4_protocol == IPPROTO_TCP {
        let state: u8 = read_kernel(sk, SKC_STATE)?;
        if state != TCP_ESTABLISHED && state != TCP_CLOSE_WAIT {
            return None;
        }
    }

    let mut saddr = [0u8; 16];
    let mut daddr = [0u8; 16];
    let addr_len;
    if family == AF_INET {
        let s: [u8; 4] = read_kernel(sk, SKC_RCV_SADDR)?;
        let d: [u8; 4] = read_kernel(sk, SKC_DADDR)?;
        saddr[..4].copy_from_slice(&s);
        daddr[..4].copy_from_slice(&d);
        addr_len = 4;
    } else {
        saddr = read_kernel(sk, SKC_V6_RCV_SADDR)?;
        daddr = read_kernel(sk, SKC_V6_DADDR)?;
        addr_len = 16;
    }

    // skc_dport is stored in network order, skc_num in host order.
    let dport_be: u16 = read_kernel(sk, SKC_DPORT)?;
    let sport: u16 = read_kernel(sk, SKC_NUM)?;

    Some(SockTuple {
        l4_protocol,
        addr_len,
        saddr,
        daddr,
        sport,
        dport: u16::from_be(dport_be),
    })
}

/// TCP sequence to stamp on a record: bytes delivered to userspace so far for
/// ingress, bytes queued for transmission for egress.
#[inline(always)]
pub fn tcp_seq(sk_socket: usize, cfg: &OffsetConfig, ingress: bool) -> u32 {
    let Some(sk) = read_kernel_ptr(sk_socket, cfg.socket_sk_offset as usize) else {
        return 0;
    };
    let offset = if ingress {
        cfg.tcp_copied_seq_offset
    } else {
        cfg.tcp_write_seq_offset
    };
    read_kernel::<u32>(sk, offset as usize).unwrap_or(0)
}
