//! Process lifecycle events, delivered through the same perf channel as the
//! data bursts and discriminated by their leading event_type word.

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid},
    macros::tracepoint,
    programs::TracePointContext,
    EbpfContext,
};
use socktrace_common::{ProcessEventRecord, EVENT_TYPE_PROC_EXEC, EVENT_TYPE_PROC_EXIT};

use super::maps::{ACTIVE_ARGS, GO_COROUTINES, SOCK_EVENTS, TRACE_INFO};

#[tracepoint(category = "sched", name = "sched_process_exec")]
pub fn sched_process_exec(ctx: TracePointContext) -> u32 {
    emit_process_event(&ctx, EVENT_TYPE_PROC_EXEC);
    0
}

#[tracepoint(category = "sched", name = "sched_process_exit")]
pub fn sched_process_exit(ctx: TracePointContext) -> u32 {
    emit_process_event(&ctx, EVENT_TYPE_PROC_EXIT);

    // The thread is gone; drop its in-flight state.
    let pid_tgid = bpf_get_current_pid_tgid();
    let _ = unsafe { TRACE_INFO.remove(&pid_tgid) };
    let _ = unsafe { ACTIVE_ARGS.remove(&pid_tgid) };
    let _ = unsafe { GO_COROUTINES.remove(&pid_tgid) };
    0
}

#[inline(always)]
fn emit_process_event<C: EbpfContext>(ctx: &C, event_type: u32) {
    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    if pid == 0 {
        return;
    }
    let record = ProcessEventRecord {
        event_type,
        pid,
        comm: bpf_get_current_comm().unwrap_or([0u8; 16]),
    };
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &record as *const ProcessEventRecord as *const u8,
            core::mem::size_of::<ProcessEventRecord>(),
        )
    };
    unsafe { SOCK_EVENTS.output(ctx, bytes, 0) };
}
