//! Time-based map reclamation.
//!
//! Kernel probes only ever insert or refresh entries; eviction beyond the
//! eager close-path delete happens here. A map is scanned only once its usage
//! crosses the configured threshold, and only entries idle longer than the
//! idle cutoff are removed.

use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use aya::maps::{HashMap, MapData};
use aya::Ebpf;
use log::info;
use socktrace_common::RECLAIM_IDLE_SECS;

use crate::pod::{SocketInfoPod, TraceInfoPod};
use crate::stats::Stats;
use crate::time::boot_time_secs;

/// Select stale entries from (key, update_time) pairs.
///
/// Kept separate from the map plumbing so the policy is testable: an entry is
/// stale when it has been idle for more than `idle_secs`, and nothing is
/// selected at all while usage sits below `threshold`.
pub fn stale_keys(
    entries: &[(u64, u64)],
    now_secs: u64,
    idle_secs: u64,
    threshold: usize,
) -> Vec<u64> {
    if entries.len() < threshold {
        return Vec::new();
    }
    entries
        .iter()
        .filter(|(_, update_time)| now_secs.saturating_sub(*update_time) > idle_secs)
        .map(|(key, _)| *key)
        .collect()
}

pub fn reclaim_maps(
    bpf: &mut Ebpf,
    socket_reclaim_threshold: usize,
    trace_reclaim_threshold: usize,
    stats: &Stats,
) -> Result<()> {
    let now = boot_time_secs();

    let socket_removed = {
        let mut map: HashMap<&mut MapData, u64, SocketInfoPod> = HashMap::try_from(
            bpf.map_mut("SOCKET_INFO")
                .context("SOCKET_INFO map not found")?,
        )?;
        let entries: Vec<(u64, u64)> = map
            .iter()
            .filter_map(|r| r.ok())
            .map(|(k, v)| (k, v.0.update_time))
            .collect();
        stats
            .socket_map_used
            .store(entries.len() as u64, Ordering::Relaxed);
        let stale = stale_keys(&entries, now, RECLAIM_IDLE_SECS, socket_reclaim_threshold);
        let mut removed = 0u64;
        for key in stale {
            if map.remove(&key).is_ok() {
                removed += 1;
            }
        }
        removed
    };
    if socket_removed > 0 {
        stats
            .socket_reclaims
            .fetch_add(socket_removed, Ordering::Relaxed);
        info!("reclaimed {socket_removed} idle socket sessions");
    }

    let trace_removed = {
        let mut map: HashMap<&mut MapData, u64, TraceInfoPod> = HashMap::try_from(
            bpf.map_mut("TRACE_INFO")
                .context("TRACE_INFO map not found")?,
        )?;
        let entries: Vec<(u64, u64)> = map
            .iter()
            .filter_map(|r| r.ok())
            .map(|(k, v)| (k, v.0.update_time))
            .collect();
        stats
            .trace_map_used
            .store(entries.len() as u64, Ordering::Relaxed);
        let stale = stale_keys(&entries, now, RECLAIM_IDLE_SECS, trace_reclaim_threshold);
        let mut removed = 0u64;
        for key in stale {
            if map.remove(&key).is_ok() {
                removed += 1;
            }
        }
        removed
    };
    if trace_removed > 0 {
        stats
            .trace_reclaims
            .fetch_add(trace_removed, Ordering::Relaxed);
        info!("reclaimed {trace_removed} idle thread traces");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_threshold_nothing_is_selected() {
        let entries = vec![(1, 0), (2, 0)];
        assert!(stale_keys(&entries, 100, RECLAIM_IDLE_SECS, 10).is_empty());
    }

    #[test]
    fn only_idle_entries_are_selected() {
        // now=100: entry 1 idle for 50s, entry 2 active 5s ago, entry 3
        // exactly at the cutoff (not selected; the policy is strictly-over).
        let entries = vec![(1, 50), (2, 95), (3, 90)];
        let stale = stale_keys(&entries, 100, RECLAIM_IDLE_SECS, 2);
        assert_eq!(stale, vec![1]);
    }

    #[test]
    fn count_matches_idled_entries() {
        let entries: Vec<(u64, u64)> = (0..20).map(|i| (i, if i < 7 { 0 } else { 98 })).collect();
        let stale = stale_keys(&entries, 100, RECLAIM_IDLE_SECS, 10);
        assert_eq!(stale.len(), 7);
    }

    #[test]
    fn clock_going_backwards_is_harmless() {
        let entries = vec![(1, 200)];
        assert!(stale_keys(&entries, 100, RECLAIM_IDLE_SECS, 1).is_empty());
    }
}
