//! Offset derivation, userspace half.
//!
//! Preferred path: parse /sys/kernel/btf/vmlinux and read every field offset
//! directly; the config is proven before any probe fires. Fallback path:
//! drive the in-kernel candidate walker with a loopback TCP exchange, one
//! pinned client per online CPU, and poll the per-CPU inference map until
//! some CPU reports a proven struct.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use btf::btf::{Btf, Struct, Type};
use log::{debug, warn};
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use socktrace_common::{OffsetConfig, OFFSET_INFER_PORT};

const KERNEL_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";
const ENV_KERNEL_BTF_PATH: &str = "SOCKTRACE_KERNEL_BTF";

pub fn kernel_btf_path() -> String {
    std::env::var(ENV_KERNEL_BTF_PATH).unwrap_or_else(|_| KERNEL_BTF_PATH.to_string())
}

pub fn kernel_btf_available() -> bool {
    std::path::Path::new(&kernel_btf_path()).is_file()
}

/// Derive every offset the probes need from kernel BTF.
pub fn derive_offsets_btf() -> Result<OffsetConfig> {
    let btf = Btf::from_file(kernel_btf_path()).context("failed to load kernel BTF metadata")?;

    let task_struct = expect_named_struct(&btf, "task_struct")?;
    let files_struct = expect_named_struct(&btf, "files_struct")?;
    let fdtable = expect_named_struct(&btf, "fdtable")?;
    let file = expect_named_struct(&btf, "file")?;
    let socket = expect_named_struct(&btf, "socket")?;
    let sock = expect_named_struct(&btf, "sock")?;
    let sock_common = expect_named_struct(&btf, "sock_common")?;
    let tcp_sock = expect_named_struct(&btf, "tcp_sock")?;

    let (files_bits, _) = member_offset(task_struct, "files")?;
    let (fdt_bits, _) = member_offset(files_struct, "fdt")?;
    let (fd_bits, _) = member_offset(fdtable, "fd")?;
    let (private_data_bits, _) = member_offset(file, "private_data")?;
    let (sk_bits, _) = member_offset(socket, "sk")?;
    let (sock_type_bits, _) = member_offset(socket, "type")?;
    let (sk_common_bits, _) = member_offset(sock, "__sk_common")?;
    let (skc_flags_bits, _) = member_offset(sock_common, "skc_flags")?;
    let (copied_seq_bits, _) = member_offset(tcp_sock, "copied_seq")?;
    let (write_seq_bits, _) = member_offset(tcp_sock, "write_seq")?;

    let mut cfg = OffsetConfig::zeroed();
    cfg.task_files_offset = to_bytes(files_bits)?;
    cfg.files_fdt_offset = to_bytes(fdt_bits)?;
    cfg.fdt_fd_offset = to_bytes(fd_bits)?;
    cfg.file_private_data_offset = to_bytes(private_data_bits)?;
    cfg.socket_sk_offset = to_bytes(sk_bits)?;
    cfg.socket_type_offset = to_bytes(sock_type_bits)?;
    cfg.sock_flags_offset = to_bytes(sk_common_bits)? + to_bytes(skc_flags_bits)?;
    cfg.tcp_copied_seq_offset = to_bytes(copied_seq_bits)?;
    cfg.tcp_write_seq_offset = to_bytes(write_seq_bits)?;
    cfg.ready = 1;
    Ok(cfg)
}

fn expect_named_struct<'a>(btf: &'a Btf, name: &str) -> Result<&'a Struct> {
    let ty = btf
        .get_type_by_name(name)
        .with_context(|| format!("type {name} not found in BTF"))?;
    match &ty.base_type {
        Type::Struct(st) => Ok(st),
        other => Err(anyhow!("type {name} is not a struct (found {:?})", other)),
    }
}

fn member_offset(st: &Struct, name: &str) -> Result<(u32, u32)> {
    st.members
        .iter()
        .find(|member| member.name.as_deref() == Some(name))
        .map(|member| (member.offset, member.type_id))
        .ok_or_else(|| anyhow!("member {name} not found"))
}

#[allow(clippy::manual_is_multiple_of)]
fn to_bytes(bits: u32) -> Result<u32> {
    if bits % 8 == 0 {
        Ok(bits / 8)
    } else {
        Err(anyhow!("member offset {bits} is not byte aligned"))
    }
}

// =============================================================================
// LOOPBACK EXCHANGE
// =============================================================================

/// Running loopback exchange: a local echo server plus one pinned client per
/// online CPU, each writing and reading one byte per round so the in-kernel
/// walker sees deterministic sequence deltas.
pub struct LoopbackExchange {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl LoopbackExchange {
    pub fn start(cpus: &[u32]) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", OFFSET_INFER_PORT))
            .with_context(|| format!("bind loopback exchange port {OFFSET_INFER_PORT}"))?;
        listener
            .set_nonblocking(true)
            .context("set exchange listener nonblocking")?;

        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        {
            let stop = Arc::clone(&stop);
            threads.push(
                std::thread::Builder::new()
                    .name("st-infer-srv".into())
                    .spawn(move || serve(listener, &stop))
                    .context("spawn exchange server")?,
            );
        }

        for &cpu in cpus {
            let stop = Arc::clone(&stop);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("st-infer-{cpu}"))
                    .spawn(move || client(cpu, &stop))
                    .with_context(|| format!("spawn exchange client for cpu {cpu}"))?,
            );
        }

        Ok(Self { stop, threads })
    }

    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        for t in self.threads {
            let _ = t.join();
        }
    }
}

fn serve(listener: TcpListener, stop: &AtomicBool) {
    let mut conns: Vec<TcpStream> = Vec::new();
    while !stop.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((conn, _)) => {
                let _ = conn.set_nonblocking(true);
                conns.push(conn);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!("exchange accept error: {e}");
            }
        }
        let mut byte = [0u8; 1];
        conns.retain_mut(|conn| match conn.read(&mut byte) {
            Ok(0) => false,
            Ok(_) => conn.write_all(&byte).is_ok(),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        });
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn client(cpu: u32, stop: &AtomicBool) {
    if let Err(e) = pin_to_cpu(cpu) {
        warn!("could not pin exchange client to cpu {cpu}: {e}");
    }
    let Ok(mut conn) = TcpStream::connect(("127.0.0.1", OFFSET_INFER_PORT)) else {
        warn!("exchange client for cpu {cpu} failed to connect");
        return;
    };
    let _ = conn.set_read_timeout(Some(Duration::from_millis(500)));

    let mut byte = [0u8; 1];
    while !stop.load(Ordering::Relaxed) {
        if conn.write_all(b"1").is_err() {
            break;
        }
        match conn.read_exact(&mut byte) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(_) => break,
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn pin_to_cpu(cpu: u32) -> Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu as usize).context("cpu outside CpuSet range")?;
    sched_setaffinity(Pid::from_raw(0), &set).context("sched_setaffinity")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_bytes_requires_byte_alignment() {
        assert_eq!(to_bytes(0).unwrap(), 0);
        assert_eq!(to_bytes(64).unwrap(), 8);
        assert!(to_bytes(3).is_err());
    }

    #[test]
    fn exchange_clients_get_echoes() {
        let exchange = LoopbackExchange::start(&[0]).expect("start exchange");
        std::thread::sleep(Duration::from_millis(100));
        exchange.stop();
    }
}
