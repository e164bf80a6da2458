//! Monotonic and cycle clocks used by the listener and the profiler.

use cfg_if::cfg_if;

/// Monotonic time in nanoseconds.
pub fn hrtime() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Cheap per-sample cycle counter.
        pub fn cycleclock() -> u64 {
            unsafe { core::arch::x86_64::_rdtsc() }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// Virtual counter register; close enough to a cycle counter for
        /// sample annotation.
        pub fn cycleclock() -> u64 {
            let cnt: u64;
            unsafe { core::arch::asm!("mrs {}, cntvct_el0", out(reg) cnt) };
            cnt
        }
    } else {
        /// No userspace counter register; fall back to the monotonic
        /// clock.
        pub fn cycleclock() -> u64 {
            hrtime()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hrtime_monotonic() {
        let a = hrtime();
        let b = hrtime();
        assert!(b >= a);
    }

    #[test]
    fn test_cycleclock_advances() {
        let a = cycleclock();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = cycleclock();
        assert!(b > a);
    }
}
