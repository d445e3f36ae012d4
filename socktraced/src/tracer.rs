//! The tracer context: owns the BPF object, the reader/worker plumbing, the
//! periodic tasks and the INIT -> STOP -> RUNNING state machine. Probe
//! attach/detach always happens under the context mutex.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context};
use aya::maps::perf::PerfEventArray;
use aya::maps::{Array, MapData, PerCpuArray};
use aya::util::online_cpus;
use aya::Ebpf;
use aya_log::EbpfLogger;
use caps::{CapSet, Capability};
use log::{info, warn};
use socktrace_common::{KernStats, OffsetConfig};
use tokio::sync::watch;

use crate::config::TracerConfig;
use crate::error::TracerError;
use crate::load::{
    attach_capture_probes, attach_inference_probes, detach, load_ebpf, read_bpf_bytes,
    write_offset_config, write_relay_comms, AttachedProbe,
};
use crate::offsets::{derive_offsets_btf, kernel_btf_available, pin_to_cpu, LoopbackExchange};
use crate::pod::{KernStatsPod, OffsetConfigPod, OffsetInferStatePod};
use crate::queue::WorkQueue;
use crate::reader::spawn_readers;
use crate::reclaim::reclaim_maps;
use crate::stats::{SocketTracerStats, Stats, TracerShow};
use crate::time::boot_time_delta_us;
use crate::worker::{spawn_workers, ExtraHandleRegistry, L7EventHandle};

const MIN_KERNEL: (u32, u32) = (4, 14);
const ADAPT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const ADAPT_POLL_LIMIT: u32 = 120;
const TICK_INTERVAL: Duration = Duration::from_millis(500);
/// Reclaim runs every this many ticks.
const RECLAIM_EVERY_TICKS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerState {
    Init,
    Stop,
    Running,
}

impl TracerState {
    pub const fn name(&self) -> &'static str {
        match self {
            TracerState::Init => "INIT",
            TracerState::Stop => "STOP",
            TracerState::Running => "RUNNING",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TracerOptions {
    pub worker_threads: usize,
    pub perf_pages: usize,
    pub queue_size: usize,
    pub max_socket_entries: u32,
    pub max_trace_entries: u32,
    pub socket_map_max_reclaim: u32,
    pub relay_comms: Vec<String>,
}

impl From<&TracerConfig> for TracerOptions {
    fn from(cfg: &TracerConfig) -> Self {
        Self {
            worker_threads: cfg.worker_threads,
            perf_pages: cfg.perf_pages,
            queue_size: cfg.queue_size,
            max_socket_entries: cfg.max_socket_entries,
            max_trace_entries: cfg.max_trace_entries,
            socket_map_max_reclaim: cfg.socket_map_max_reclaim,
            relay_comms: cfg.relay_comms.clone(),
        }
    }
}

impl Default for TracerOptions {
    fn default() -> Self {
        (&TracerConfig::default()).into()
    }
}

struct TracerInner {
    bpf: Ebpf,
    _logger: Option<EbpfLogger>,
    state: TracerState,
    probes: Vec<AttachedProbe>,
}

pub struct SocketTracer {
    inner: Mutex<TracerInner>,
    stats: Arc<Stats>,
    opts: TracerOptions,
    queues: Arc<Vec<WorkQueue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    extra_handles: ExtraHandleRegistry,
    // Keeps the reader tasks alive; dropped last.
    _runtime: tokio::runtime::Runtime,
    shutdown_tx: watch::Sender<bool>,
    boot_delta_us: i64,
    tick_stop: Arc<AtomicBool>,
    tick_thread: Mutex<Option<JoinHandle<()>>>,
}

impl SocketTracer {
    /// One-shot startup: loads the object, spins up readers and workers,
    /// kicks off offset adaptation and returns. The tracer reaches RUNNING on
    /// its own once offsets are proven.
    pub fn run(handle: L7EventHandle, opts: TracerOptions) -> Result<Arc<Self>, TracerError> {
        ensure_environment()?;

        let boot_delta_us = boot_time_delta_us();
        let (bytes, path) = read_bpf_bytes().map_err(TracerError::Load)?;
        info!("using BPF object: {path}");
        let (mut bpf, logger) = load_ebpf(&bytes, opts.max_socket_entries, opts.max_trace_entries)
            .map_err(TracerError::Load)?;
        write_relay_comms(&mut bpf, &opts.relay_comms).map_err(TracerError::Load)?;

        let cpus = online_cpus().map_err(|(_, e)| TracerError::Load(e.into()))?;

        let events_map = bpf
            .take_map("SOCK_EVENTS")
            .ok_or_else(|| TracerError::Load(anyhow!("SOCK_EVENTS map not found")))?;
        let mut perf_array =
            PerfEventArray::try_from(events_map).map_err(|e| TracerError::Load(e.into()))?;
        let mut perf_buffers = Vec::new();
        for &cpu in &cpus {
            perf_buffers.push(
                perf_array
                    .open(cpu, Some(opts.perf_pages))
                    .map_err(|e| TracerError::Load(e.into()))?,
            );
        }

        let queues: Arc<Vec<WorkQueue>> = Arc::new(
            (0..opts.worker_threads.max(1))
                .map(|_| WorkQueue::new(opts.queue_size))
                .collect(),
        );
        let extra_handles: ExtraHandleRegistry = Default::default();
        let stats = Arc::new(Stats::new());
        let workers = spawn_workers(&queues, handle, Arc::clone(&extra_handles));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("st-reader")
            .enable_all()
            .build()
            .map_err(|e| TracerError::Load(e.into()))?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        spawn_readers(
            runtime.handle(),
            perf_buffers,
            Arc::clone(&queues),
            Arc::clone(&stats),
            boot_delta_us,
            shutdown_rx,
        );

        let tracer = Arc::new(Self {
            inner: Mutex::new(TracerInner {
                bpf,
                _logger: logger,
                state: TracerState::Init,
                probes: Vec::new(),
            }),
            stats,
            opts,
            queues,
            workers: Mutex::new(workers),
            extra_handles,
            _runtime: runtime,
            shutdown_tx,
            boot_delta_us,
            tick_stop: Arc::new(AtomicBool::new(false)),
            tick_thread: Mutex::new(None),
        });

        tracer.spawn_periodic(cpus.clone());
        tracer.spawn_adaptation(cpus);
        Ok(tracer)
    }

    /// STOP -> RUNNING. Calling on a running tracer is a no-op; INIT cannot
    /// jump straight to RUNNING.
    pub fn start(&self) -> Result<(), TracerError> {
        let mut inner = self.inner.lock().expect("tracer mutex poisoned");
        match inner.state {
            TracerState::Running => Ok(()),
            TracerState::Init => Err(TracerError::InvalidTransition {
                from: "INIT",
                to: "RUNNING",
            }),
            TracerState::Stop => {
                let probes =
                    attach_capture_probes(&mut inner.bpf).map_err(|e| TracerError::Attach {
                        probe: "capture set".into(),
                        reason: e,
                    })?;
                inner.probes = probes;
                inner.state = TracerState::Running;
                info!("socket tracer RUNNING");
                Ok(())
            }
        }
    }

    /// RUNNING -> STOP. Probes detach; in-flight buffers drain naturally.
    pub fn stop(&self) -> Result<(), TracerError> {
        let mut inner = self.inner.lock().expect("tracer mutex poisoned");
        match inner.state {
            TracerState::Stop => Ok(()),
            TracerState::Init => Err(TracerError::InvalidTransition {
                from: "INIT",
                to: "STOP",
            }),
            TracerState::Running => {
                let probes = std::mem::take(&mut inner.probes);
                for probe in probes {
                    detach(&mut inner.bpf, probe);
                }
                inner.state = TracerState::Stop;
                info!("socket tracer STOP");
                Ok(())
            }
        }
    }

    pub fn state(&self) -> TracerState {
        self.inner.lock().expect("tracer mutex poisoned").state
    }

    pub fn register_event_handle(
        &self,
        event_type: u32,
        handle: crate::worker::ExtraEventHandle,
    ) -> Result<(), TracerError> {
        if event_type < socktrace_common::EVENT_TYPE_MIN {
            return Err(TracerError::EventTypeOutOfRange(event_type));
        }
        self.extra_handles
            .write()
            .expect("handle registry poisoned")
            .insert(event_type, handle);
        Ok(())
    }

    pub fn stats(&self) -> SocketTracerStats {
        let (state, kernel) = {
            let mut inner = self.inner.lock().expect("tracer mutex poisoned");
            let kernel = read_kernel_stats(&mut inner.bpf).unwrap_or_default();
            (inner.state, kernel)
        };
        SocketTracerStats {
            state: state.name(),
            is_adapt_success: self.stats.is_adapt_success(),
            kern_lost: self.stats.kern_lost.load(Ordering::Relaxed),
            parse_errors: self.stats.parse_errors.load(Ordering::Relaxed),
            perf_poll_errors: self.stats.perf_poll_errors.load(Ordering::Relaxed),
            worker_num: self.queues.len(),
            perf_pages_cnt: self.opts.perf_pages,
            queue_capacity: self.opts.queue_size,
            queues: self.queues.iter().map(|q| q.snapshot()).collect(),
            socket_map_used: self.stats.socket_map_used.load(Ordering::Relaxed),
            socket_map_max: self.opts.max_socket_entries,
            trace_map_used: self.stats.trace_map_used.load(Ordering::Relaxed),
            trace_map_max: self.opts.max_trace_entries,
            socket_reclaims: self.stats.socket_reclaims.load(Ordering::Relaxed),
            trace_reclaims: self.stats.trace_reclaims.load(Ordering::Relaxed),
            kernel,
            boot_time_delta_us: self.boot_delta_us,
        }
    }

    /// Introspection getter: stats plus the offset params, overall and per
    /// CPU.
    pub fn show(&self) -> TracerShow {
        let stats = self.stats();
        let (offsets, per_cpu_offsets) = {
            let inner = self.inner.lock().expect("tracer mutex poisoned");
            let offsets = read_offset_config(&inner.bpf).unwrap_or_else(|_| OffsetConfig::zeroed());
            let per_cpu = read_per_cpu_infer(&inner.bpf).unwrap_or_default();
            (offsets, per_cpu)
        };
        TracerShow {
            stats,
            offsets,
            per_cpu_offsets,
        }
    }

    /// Full teardown for process exit: detach, stop periodic work, drain
    /// workers.
    pub fn shutdown(&self) {
        let _ = self.stop();
        self.tick_stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.tick_thread.lock().expect("tick mutex poisoned").take() {
            let _ = t.join();
        }
        let _ = self.shutdown_tx.send(true);
        for q in self.queues.iter() {
            q.push_blocking(crate::queue::WorkItem::Shutdown);
        }
        let mut workers = self.workers.lock().expect("worker mutex poisoned");
        for w in workers.drain(..) {
            let _ = w.join();
        }
    }

    /// The periodic-task thread: flush ticks plus map reclamation.
    fn spawn_periodic(self: &Arc<Self>, cpus: Vec<u32>) {
        let tracer = Arc::clone(self);
        let stop = Arc::clone(&self.tick_stop);
        let thread = std::thread::Builder::new()
            .name("st-periodic".into())
            .spawn(move || {
                let mut ticks: u32 = 0;
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(TICK_INTERVAL);
                    ticks = ticks.wrapping_add(1);
                    flush_tick(&cpus);
                    if ticks % RECLAIM_EVERY_TICKS == 0 {
                        let mut inner = tracer.inner.lock().expect("tracer mutex poisoned");
                        let socket_threshold = tracer.opts.socket_map_max_reclaim as usize;
                        let trace_threshold = (tracer.opts.max_trace_entries / 2) as usize;
                        if let Err(e) = reclaim_maps(
                            &mut inner.bpf,
                            socket_threshold,
                            trace_threshold,
                            &tracer.stats,
                        ) {
                            warn!("map reclaim failed: {e:?}");
                        }
                    }
                }
            })
            .expect("spawn periodic thread");
        *self.tick_thread.lock().expect("tick mutex poisoned") = Some(thread);
    }

    /// Offset adaptation: BTF when available, the loopback inference
    /// otherwise. Ends with INIT -> STOP, then RUNNING on success.
    fn spawn_adaptation(self: &Arc<Self>, cpus: Vec<u32>) {
        let tracer = Arc::clone(self);
        std::thread::Builder::new()
            .name("st-adapt".into())
            .spawn(move || tracer.adapt(cpus))
            .expect("spawn adaptation thread");
    }

    fn adapt(self: Arc<Self>, cpus: Vec<u32>) {
        if kernel_btf_available() {
            match derive_offsets_btf() {
                Ok(cfg) => {
                    let mut inner = self.inner.lock().expect("tracer mutex poisoned");
                    if let Err(e) = write_offset_config(&mut inner.bpf, cfg) {
                        warn!("failed to broadcast BTF offsets: {e:?}");
                    } else {
                        inner.state = TracerState::Stop;
                        drop(inner);
                        self.finish_adaptation();
                        return;
                    }
                }
                Err(e) => {
                    warn!("BTF offset derivation failed ({e:?}); falling back to loopback probe");
                }
            }
        }

        // Loopback fallback: attach the minimal probe set, run the exchange,
        // poll the per-CPU inference map.
        {
            let mut inner = self.inner.lock().expect("tracer mutex poisoned");
            match attach_inference_probes(&mut inner.bpf) {
                Ok(probes) => inner.probes = probes,
                Err(e) => {
                    warn!("failed to attach inference probes: {e:?}");
                    inner.state = TracerState::Stop;
                    return;
                }
            }
        }
        let exchange = match LoopbackExchange::start(&cpus) {
            Ok(ex) => ex,
            Err(e) => {
                warn!("failed to start loopback exchange: {e:?}");
                self.end_inference(None);
                return;
            }
        };

        let mut proven: Option<OffsetConfig> = None;
        for _ in 0..ADAPT_POLL_LIMIT {
            std::thread::sleep(ADAPT_POLL_INTERVAL);
            let inner = self.inner.lock().expect("tracer mutex poisoned");
            match read_per_cpu_infer(&inner.bpf) {
                Ok(states) => {
                    if let Some(cfg) = states.into_iter().find(|c| c.ready == 1) {
                        proven = Some(cfg);
                        break;
                    }
                }
                Err(e) => warn!("inference map poll failed: {e:?}"),
            }
        }
        exchange.stop();
        self.end_inference(proven);
    }

    fn end_inference(self: &Arc<Self>, proven: Option<OffsetConfig>) {
        {
            let mut inner = self.inner.lock().expect("tracer mutex poisoned");
            let probes = std::mem::take(&mut inner.probes);
            for probe in probes {
                detach(&mut inner.bpf, probe);
            }
            if let Some(cfg) = proven {
                if let Err(e) = write_offset_config(&mut inner.bpf, cfg) {
                    warn!("failed to broadcast inferred offsets: {e:?}");
                    inner.state = TracerState::Stop;
                    return;
                }
                inner.state = TracerState::Stop;
            } else {
                // Offsets never converged; the tracer stays parked in STOP
                // and stats keep reporting adapt_success = false.
                inner.state = TracerState::Stop;
                warn!("offset inference did not converge; tracer stays in STOP");
                return;
            }
        }
        self.finish_adaptation();
    }

    fn finish_adaptation(self: &Arc<Self>) {
        self.stats.set_adapt_success();
        info!("offset adaptation complete");
        if let Err(e) = self.start() {
            warn!("auto start after adaptation failed: {e}");
        }
    }
}

/// One getppid per CPU wakes the in-kernel tick handler everywhere.
fn flush_tick(cpus: &[u32]) {
    for &cpu in cpus {
        if pin_to_cpu(cpu).is_ok() {
            unsafe { libc::getppid() };
        }
    }
    // Leave the thread free-floating between ticks.
    let mut all = nix::sched::CpuSet::new();
    for &cpu in cpus {
        let _ = all.set(cpu as usize);
    }
    let _ = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &all);
}

fn read_kernel_stats(bpf: &mut Ebpf) -> anyhow::Result<KernStats> {
    let map: PerCpuArray<&MapData, KernStatsPod> = PerCpuArray::try_from(
        bpf.map("KERN_STATS")
            .context("KERN_STATS map not found")?,
    )?;
    let values = map.get(&0, 0)?;
    let mut total = KernStats::default();
    for v in values.iter() {
        total.socket_map_drops += v.0.socket_map_drops;
        total.trace_map_drops += v.0.trace_map_drops;
        total.args_map_drops += v.0.args_map_drops;
        total.copy_failures += v.0.copy_failures;
        total.burst_truncations += v.0.burst_truncations;
        total.events_emitted += v.0.events_emitted;
        total.bytes_emitted += v.0.bytes_emitted;
        total.flushes += v.0.flushes;
    }
    Ok(total)
}

fn read_offset_config(bpf: &Ebpf) -> anyhow::Result<OffsetConfig> {
    let map: Array<&MapData, OffsetConfigPod> = Array::try_from(
        bpf.map("TRACER_CONFIG")
            .context("TRACER_CONFIG map not found")?,
    )?;
    Ok(map.get(&0, 0)?.0)
}

fn read_per_cpu_infer(bpf: &Ebpf) -> anyhow::Result<Vec<OffsetConfig>> {
    let map: PerCpuArray<&MapData, OffsetInferStatePod> = PerCpuArray::try_from(
        bpf.map("INFER_STATE")
            .context("INFER_STATE map not found")?,
    )?;
    let values = map.get(&0, 0)?;
    Ok(values.iter().map(|v| v.0.config).collect())
}

/// Pre-flight: kernel version and capabilities.
pub fn ensure_environment() -> Result<(), TracerError> {
    let release = fs::read_to_string("/proc/sys/kernel/osrelease")
        .map_err(|e| TracerError::Other(anyhow!("read kernel release: {e}")))?;
    let (major, minor) = parse_kernel_version(&release)
        .ok_or_else(|| TracerError::Other(anyhow!("unparseable kernel release {release:?}")))?;
    if (major, minor) < MIN_KERNEL {
        return Err(TracerError::UnsupportedKernel {
            found_major: major,
            found_minor: minor,
            min_major: MIN_KERNEL.0,
            min_minor: MIN_KERNEL.1,
        });
    }
    check_capabilities()
}

fn check_capabilities() -> Result<(), TracerError> {
    let has = |cap| caps::has_cap(None, CapSet::Effective, cap).unwrap_or(false);
    if has(Capability::CAP_SYS_ADMIN) {
        return Ok(());
    }
    for cap in [Capability::CAP_BPF, Capability::CAP_PERFMON] {
        if !has(cap) {
            return Err(TracerError::MissingCapability(format!("{cap:?}")));
        }
    }
    Ok(())
}

pub fn parse_kernel_version(raw: &str) -> Option<(u32, u32)> {
    let version_part = raw.trim().split('-').next()?;
    let mut segments = version_part.split('.');
    let major = segments.next()?.parse().ok()?;
    let minor = segments.next().unwrap_or("0").parse().ok()?;
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_version_parsing() {
        assert_eq!(parse_kernel_version("5.15.0-generic"), Some((5, 15)));
        assert_eq!(parse_kernel_version("4.14.0"), Some((4, 14)));
        assert_eq!(parse_kernel_version("6.8"), Some((6, 8)));
        assert_eq!(parse_kernel_version("junk"), None);
    }

    #[test]
    fn version_gate_matches_minimum() {
        assert!((4, 13) < MIN_KERNEL);
        assert!((4, 14) >= MIN_KERNEL);
        assert!((5, 4) >= MIN_KERNEL);
    }

    #[test]
    fn state_names() {
        assert_eq!(TracerState::Init.name(), "INIT");
        assert_eq!(TracerState::Stop.name(), "STOP");
        assert_eq!(TracerState::Running.name(), "RUNNING");
    }

    #[test]
    fn options_mirror_config() {
        let cfg = TracerConfig::default();
        let opts = TracerOptions::from(&cfg);
        assert_eq!(opts.worker_threads, cfg.worker_threads);
        assert_eq!(opts.max_socket_entries, cfg.max_socket_entries);
    }
}
