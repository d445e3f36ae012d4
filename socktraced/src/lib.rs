//! socktrace userspace runtime.
//!
//! `running_socket_tracer` loads the kernel programs, proves struct offsets
//! (BTF when available, a loopback inference exchange otherwise) and starts
//! delivering reconstructed L4/L7 records to the supplied callback. The
//! process-wide tracer registry follows the one-context-per-process model;
//! the free functions below operate on it.

use std::sync::Arc;

use once_cell::sync::OnceCell;

pub mod config;
pub mod dispatch;
pub mod error;
pub mod load;
pub mod offsets;
pub mod pod;
pub mod queue;
pub mod reader;
pub mod reclaim;
pub mod record;
pub mod sockopt;
pub mod stats;
pub mod time;
pub mod tracer;
pub mod worker;

pub use error::TracerError;
pub use record::{SocketRecord, Tuple};
pub use socktrace_common::{
    Direction, L7Protocol, MessageType, ProcessEventRecord, SourceFn, EVENT_TYPE_MIN,
    EVENT_TYPE_PROC_EXEC, EVENT_TYPE_PROC_EXIT,
};
pub use stats::SocketTracerStats;
pub use tracer::{SocketTracer, TracerOptions, TracerState};
pub use worker::{ExtraEventHandle, L7EventHandle};

static TRACER: OnceCell<Arc<SocketTracer>> = OnceCell::new();

/// One-shot start of the process-wide tracer.
///
/// Loads the BPF object, sizes the maps and queues, spins up the reader and
/// worker pool, and begins offset adaptation. The tracer transitions
/// INIT -> STOP -> RUNNING on its own once offsets are proven; on an
/// unsupported kernel or load failure an error is returned and nothing is
/// attached.
#[allow(clippy::too_many_arguments)]
pub fn running_socket_tracer(
    handle: L7EventHandle,
    thread_nr: usize,
    perf_pages_cnt: usize,
    queue_size: usize,
    max_socket_entries: u32,
    max_trace_entries: u32,
    socket_map_max_reclaim: u32,
) -> Result<(), TracerError> {
    let mut opts = TracerOptions::default();
    opts.worker_threads = thread_nr;
    opts.perf_pages = perf_pages_cnt;
    opts.queue_size = queue_size;
    opts.max_socket_entries = max_socket_entries;
    opts.max_trace_entries = max_trace_entries;
    opts.socket_map_max_reclaim = socket_map_max_reclaim;
    running_socket_tracer_with(handle, opts)
}

/// `running_socket_tracer` with the full option struct (relay comm list
/// included).
pub fn running_socket_tracer_with(
    handle: L7EventHandle,
    opts: TracerOptions,
) -> Result<(), TracerError> {
    let tracer = SocketTracer::run(handle, opts)?;
    TRACER
        .set(tracer)
        .map_err(|_| TracerError::AlreadyRunning)?;
    Ok(())
}

fn global() -> Result<&'static Arc<SocketTracer>, TracerError> {
    TRACER.get().ok_or(TracerError::NotInitialized)
}

/// STOP -> RUNNING; no-op when already running.
pub fn socket_tracer_start() -> Result<(), TracerError> {
    global()?.start()
}

/// RUNNING -> STOP; no-op when already stopped.
pub fn socket_tracer_stop() -> Result<(), TracerError> {
    global()?.stop()
}

pub fn socket_tracer_state() -> Result<TracerState, TracerError> {
    Ok(global()?.state())
}

/// Register a callback for an extra event type (`>= EVENT_TYPE_MIN`).
pub fn register_event_handle(event_type: u32, handle: ExtraEventHandle) -> Result<(), TracerError> {
    global()?.register_event_handle(event_type, handle)
}

pub fn socket_tracer_stats() -> Result<SocketTracerStats, TracerError> {
    Ok(global()?.stats())
}

/// The process-wide tracer, for callers that need the context itself.
pub fn socket_tracer() -> Result<Arc<SocketTracer>, TracerError> {
    global().map(Arc::clone)
}
