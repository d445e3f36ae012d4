//! BPF object loading and probe attachment.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use aya::maps::{Array, MapData};
use aya::programs::{
    kprobe::KProbeLinkId, trace_point::TracePointLinkId, KProbe, ProgramError, TracePoint,
};
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use log::{info, warn};
use socktrace_common::{OffsetConfig, RelayCommList, COMM_LEN, RELAY_COMM_MAX};

use crate::pod::{OffsetConfigPod, RelayCommListPod};

/// Locate and read the eBPF object from common install/build paths.
pub fn read_bpf_bytes() -> Result<(Vec<u8>, String)> {
    const CANDIDATES: [&str; 6] = [
        "/usr/local/share/socktrace/socktrace-ebpf",
        "/usr/local/share/socktrace/socktrace-ebpf.o",
        "target/bpfel-unknown-none/release/socktrace-ebpf",
        "./target/bpfel-unknown-none/release/socktrace-ebpf",
        "../target/bpfel-unknown-none/release/socktrace-ebpf",
        "target/bpf/socktrace-ebpf.o",
    ];
    if let Ok(path) = std::env::var("SOCKTRACE_BPF_PATH") {
        let data = fs::read(&path).with_context(|| format!("read BPF object {path}"))?;
        return Ok((data, path));
    }
    for candidate in CANDIDATES {
        if Path::new(candidate).exists() {
            return Ok((fs::read(candidate)?, candidate.to_string()));
        }
    }
    anyhow::bail!(
        "BPF object not found. Set SOCKTRACE_BPF_PATH or install to /usr/local/share/socktrace/"
    );
}

/// Load the object with runtime map capacities applied.
pub fn load_ebpf(
    bpf_bytes: &[u8],
    max_socket_entries: u32,
    max_trace_entries: u32,
) -> Result<(Ebpf, Option<EbpfLogger>)> {
    let mut loader = EbpfLoader::new();
    loader.set_max_entries("SOCKET_INFO", max_socket_entries);
    loader.set_max_entries("TRACE_INFO", max_trace_entries);
    let mut bpf = loader.load(bpf_bytes).context("load BPF object")?;

    let logger = match EbpfLogger::init(&mut bpf) {
        Ok(logger) => Some(logger),
        Err(e) => {
            warn!("BPF logger not active: {e}");
            None
        }
    };
    Ok((bpf, logger))
}

/// Push the relay process-name list into the kernel.
pub fn write_relay_comms(bpf: &mut Ebpf, names: &[String]) -> Result<()> {
    let mut list = RelayCommList::zeroed();
    for (i, name) in names.iter().take(RELAY_COMM_MAX).enumerate() {
        let bytes = name.as_bytes();
        let n = bytes.len().min(COMM_LEN - 1);
        list.comms[i][..n].copy_from_slice(&bytes[..n]);
        list.count += 1;
    }
    if names.len() > RELAY_COMM_MAX {
        warn!(
            "relay comm list truncated to {} entries ({} configured)",
            RELAY_COMM_MAX,
            names.len()
        );
    }
    let mut map: Array<&mut MapData, RelayCommListPod> = Array::try_from(
        bpf.map_mut("RELAY_COMMS")
            .context("RELAY_COMMS map not found")?,
    )?;
    map.set(0, RelayCommListPod(list), 0)
        .context("write RELAY_COMMS")?;
    Ok(())
}

/// Broadcast a proven offset struct to every probe.
pub fn write_offset_config(bpf: &mut Ebpf, cfg: OffsetConfig) -> Result<()> {
    let mut map: Array<&mut MapData, OffsetConfigPod> = Array::try_from(
        bpf.map_mut("TRACER_CONFIG")
            .context("TRACER_CONFIG map not found")?,
    )?;
    map.set(0, OffsetConfigPod(cfg), 0)
        .context("write TRACER_CONFIG")?;
    Ok(())
}

/// An attached probe that can be detached by name + link id.
pub enum AttachedProbe {
    TracePoint { program: String, link: TracePointLinkId },
    KProbe { program: String, link: KProbeLinkId },
}

pub fn attach_tracepoint(
    bpf: &mut Ebpf,
    program: &str,
    category: &str,
    name: &str,
) -> Result<AttachedProbe> {
    let tp: &mut TracePoint = bpf
        .program_mut(program)
        .with_context(|| format!("{program} program not found"))?
        .try_into()?;
    match tp.load() {
        Ok(()) | Err(ProgramError::AlreadyLoaded) => {}
        Err(e) => return Err(e.into()),
    }
    let link = tp.attach(category, name)?;
    Ok(AttachedProbe::TracePoint {
        program: program.to_string(),
        link,
    })
}

pub fn attach_kprobe(bpf: &mut Ebpf, program: &str, symbol: &str) -> Result<AttachedProbe> {
    let probe: &mut KProbe = bpf
        .program_mut(program)
        .with_context(|| format!("{program} program not found"))?
        .try_into()?;
    match probe.load() {
        Ok(()) | Err(ProgramError::AlreadyLoaded) => {}
        Err(e) => return Err(e.into()),
    }
    let link = probe.attach(symbol, 0)?;
    Ok(AttachedProbe::KProbe {
        program: program.to_string(),
        link,
    })
}

pub fn attach_kprobe_optional(bpf: &mut Ebpf, program: &str, symbol: &str) -> Option<AttachedProbe> {
    match attach_kprobe(bpf, program, symbol) {
        Ok(probe) => Some(probe),
        Err(err) => {
            warn!("optional kprobe {symbol} ({program}) not attached: {err:?}");
            None
        }
    }
}

pub fn detach(bpf: &mut Ebpf, probe: AttachedProbe) {
    let result = match probe {
        AttachedProbe::TracePoint { program, link } => bpf
            .program_mut(&program)
            .and_then(|p| <&mut TracePoint>::try_from(p).ok())
            .map(|tp| tp.detach(link).map_err(anyhow::Error::from)),
        AttachedProbe::KProbe { program, link } => bpf
            .program_mut(&program)
            .and_then(|p| <&mut KProbe>::try_from(p).ok())
            .map(|kp| kp.detach(link).map_err(anyhow::Error::from)),
    };
    if let Some(Err(e)) = result {
        warn!("probe detach failed: {e:?}");
    }
}

/// Probe set driving the offset inference: just the plain read/write paths.
pub fn attach_inference_probes(bpf: &mut Ebpf) -> Result<Vec<AttachedProbe>> {
    let mut probes = Vec::new();
    for (program, name) in [
        ("sys_enter_read", "sys_enter_read"),
        ("sys_enter_write", "sys_enter_write"),
        ("sys_exit_read", "sys_exit_read"),
        ("sys_exit_write", "sys_exit_write"),
    ] {
        probes.push(attach_tracepoint(bpf, program, "syscalls", name)?);
    }
    info!("inference probe set attached");
    Ok(probes)
}

/// The full capture probe set.
pub fn attach_capture_probes(bpf: &mut Ebpf) -> Result<Vec<AttachedProbe>> {
    let mut probes = Vec::new();

    for name in [
        "sys_enter_read",
        "sys_enter_write",
        "sys_enter_sendto",
        "sys_enter_recvfrom",
        "sys_enter_close",
        "sys_enter_getppid",
        "sys_exit_read",
        "sys_exit_write",
        "sys_exit_sendto",
        "sys_exit_recvfrom",
        "sys_exit_sendmsg",
        "sys_exit_recvmsg",
        "sys_exit_sendmmsg",
        "sys_exit_recvmmsg",
        "sys_exit_writev",
        "sys_exit_readv",
        "sys_exit_socket",
    ] {
        probes.push(attach_tracepoint(bpf, name, "syscalls", name)?);
    }

    for name in ["sched_process_exec", "sched_process_exit"] {
        probes.push(attach_tracepoint(bpf, name, "sched", name)?);
    }

    // The msg/mmsg/vec entries attach to the kernel functions; symbol names
    // differ slightly on older kernels, so these stay optional.
    for (program, symbol) in [
        ("enter_sendmsg", "__sys_sendmsg"),
        ("enter_recvmsg", "__sys_recvmsg"),
        ("enter_sendmmsg", "__sys_sendmmsg"),
        ("enter_recvmmsg", "__sys_recvmmsg"),
        ("enter_writev", "do_writev"),
        ("enter_readv", "do_readv"),
    ] {
        if let Some(probe) = attach_kprobe_optional(bpf, program, symbol) {
            probes.push(probe);
        }
    }

    info!("capture probe set attached ({} probes)", probes.len());
    Ok(probes)
}
