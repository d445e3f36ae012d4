use nix::time::{clock_gettime, ClockId};

/// Nanoseconds since boot, the clock the kernel programs stamp records with.
pub fn boot_time_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_BOOTTIME) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

pub fn boot_time_secs() -> u64 {
    boot_time_ns() / 1_000_000_000
}

/// Microseconds to add to a boot-relative timestamp to obtain wall-clock
/// time. Computed once at startup.
pub fn boot_time_delta_us() -> i64 {
    let wall = match clock_gettime(ClockId::CLOCK_REALTIME) {
        Ok(ts) => (ts.tv_sec() as i64) * 1_000_000 + ts.tv_nsec() as i64 / 1_000,
        Err(_) => 0,
    };
    let boot = (boot_time_ns() / 1_000) as i64;
    wall - boot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_clock_advances() {
        let a = boot_time_ns();
        let b = boot_time_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn delta_reconstructs_wall_clock() {
        let delta = boot_time_delta_us();
        let wall_now = (boot_time_ns() / 1_000) as i64 + delta;
        let direct = clock_gettime(ClockId::CLOCK_REALTIME)
            .map(|ts| ts.tv_sec() as i64 * 1_000_000 + ts.tv_nsec() as i64 / 1_000)
            .unwrap_or(0);
        // Within a second of each other.
        assert!((wall_now - direct).abs() < 1_000_000);
    }
}
