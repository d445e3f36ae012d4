//! Per-CPU staging buffer: records accumulate here and leave as one perf
//! output per burst. All offsets into the data area are masked against the
//! power-of-two buffer size so the verifier can bound them.

use aya_ebpf::{helpers::bpf_ktime_get_ns, EbpfContext};
use socktrace_common::{
    BurstBuffer, SocketDataHeader, BURST_BUFFER_SIZE, BURST_DATA_SIZE, BURST_FLUSH_AGE_NS,
    CAP_DATA_SIZE, EVENT_BURST_NUM,
};

use super::maps::{stat_add, BURST_BUFFERS, BURST_FIRST_TS, SOCK_EVENTS};

pub const HEADER_SIZE: usize = core::mem::size_of::<SocketDataHeader>();
const DATA_MASK: usize = BURST_BUFFER_SIZE - 1;

/// Largest footprint one record can take in the data area.
const RECORD_MAX: usize = HEADER_SIZE + CAP_DATA_SIZE;

#[inline(always)]
pub fn acquire() -> Option<&'static mut BurstBuffer> {
    unsafe { BURST_BUFFERS.get_ptr_mut(0).map(|p| &mut *p) }
}

/// Offset where the next record's payload will land, flushing first when the
/// remaining space cannot hold a maximal record. Returns (record_off,
/// payload_off).
#[inline(always)]
pub fn reserve<C: EbpfContext>(ctx: &C, buf: &mut BurstBuffer) -> (usize, usize) {
    if buf.len as usize + RECORD_MAX > BURST_DATA_SIZE {
        flush(ctx, buf);
    }
    let off = buf.len as usize & DATA_MASK;
    (off, (off + HEADER_SIZE) & DATA_MASK)
}

/// Commit a record whose header and payload were already written at the
/// offsets returned by `reserve`. `total_len` includes the header.
#[inline(always)]
pub fn commit<C: EbpfContext>(ctx: &C, buf: &mut BurstBuffer, total_len: usize) {
    // Records stay 8-aligned so headers can be written by pointer.
    let padded = (total_len + 7) & !7;
    buf.len = (buf.len as usize + padded) as u32 & DATA_MASK as u32;
    buf.events_num += 1;

    if buf.events_num == 1 {
        if let Some(ts) = unsafe { BURST_FIRST_TS.get_ptr_mut(0) } {
            unsafe { *ts = bpf_ktime_get_ns() };
        }
    }
    stat_add(|s| s.events_emitted += 1);

    if buf.events_num >= EVENT_BURST_NUM {
        flush(ctx, buf);
    }
}

/// Send the filled prefix of the buffer to the perf channel on this CPU and
/// reset the counters.
#[inline(always)]
pub fn flush<C: EbpfContext>(ctx: &C, buf: &mut BurstBuffer) {
    if buf.events_num == 0 {
        return;
    }
    let out_len = 8 + (buf.len as usize & DATA_MASK);
    let bytes =
        unsafe { core::slice::from_raw_parts(buf as *const BurstBuffer as *const u8, out_len) };
    unsafe { SOCK_EVENTS.output(ctx, bytes, 0) };
    stat_add(|s| {
        s.flushes += 1;
        s.bytes_emitted += out_len as u64;
    });
    buf.events_num = 0;
    buf.len = 0;
    if let Some(ts) = unsafe { BURST_FIRST_TS.get_ptr_mut(0) } {
        unsafe { *ts = 0 };
    }
}

/// Periodic-tick flush: fires when the oldest pending event has aged past the
/// flush threshold.
#[inline(always)]
pub fn flush_aged<C: EbpfContext>(ctx: &C) {
    let Some(buf) = acquire() else { return };
    if buf.events_num == 0 {
        return;
    }
    let first = unsafe {
        match BURST_FIRST_TS.get_ptr_mut(0) {
            Some(ts) => *ts,
            None => return,
        }
    };
    let now = unsafe { bpf_ktime_get_ns() };
    if first != 0 && now.wrapping_sub(first) >= BURST_FLUSH_AGE_NS {
        flush(ctx, buf);
    }
}
