//! Process-wide profile sample buffer and its sampling timer.
//!
//! The listener fills the buffer during sampling passes; decoding is the
//! profiler frontend's business. Each per-thread record is
//! `[frames..., tid+1, task, cycles, sleep_state+1, 0, 0]`; thread id and
//! sleep state are shifted by one because 0 terminates a block.

use crate::error::{Result, RtError};
use crate::signal::CapturedContext;
use crate::tls::ThreadState;
use crate::util::time::{cycleclock, hrtime};
use cfg_if::cfg_if;
use lazy_static::lazy_static;
use parking_lot::{Mutex, MutexGuard};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Frame budget per sample; the trailer needs six more words.
const MAX_PROFILE_FRAMES: usize = 256;
const TRAILER_WORDS: usize = 6;

struct ProfileBuffer {
    data: Vec<u64>,
    cur: usize,
    sampling_ns: u64,
}

lazy_static! {
    static ref PROFILE: Mutex<ProfileBuffer> = Mutex::new(ProfileBuffer {
        data: Vec::new(),
        cur: 0,
        sampling_ns: 0,
    });
    static ref PASS_LOCK: Mutex<()> = Mutex::new(());
}

static RUNNING: AtomicBool = AtomicBool::new(false);
static AUTOSTOP_AT: AtomicU64 = AtomicU64::new(0);
static LAST_TIMER_DELETE: AtomicU64 = AtomicU64::new(0);

/// Serializes full sampling passes.
pub(crate) fn pass_lock() -> MutexGuard<'static, ()> {
    PASS_LOCK.lock()
}

/// Allocate (or reallocate) the sample buffer: `maxsize` words, one
/// sample every `sampling_ns` nanoseconds.
pub fn init(maxsize: usize, sampling_ns: u64) -> Result<()> {
    if maxsize == 0 {
        return Err(RtError::Configuration(
            "profile buffer size must be nonzero".to_string(),
        ));
    }
    if sampling_ns == 0 {
        return Err(RtError::Configuration(
            "profile sampling period must be nonzero".to_string(),
        ));
    }
    let mut buf = PROFILE.lock();
    buf.data = vec![0; maxsize];
    buf.cur = 0;
    buf.sampling_ns = sampling_ns;
    Ok(())
}

/// Discard recorded samples, keeping the allocation.
pub fn clear() {
    PROFILE.lock().cur = 0;
}

pub fn buffer_capacity() -> usize {
    PROFILE.lock().data.len()
}

pub fn cursor() -> usize {
    PROFILE.lock().cur
}

/// No room for another full sample record.
pub fn is_buffer_full() -> bool {
    let buf = PROFILE.lock();
    buf.cur + MAX_PROFILE_FRAMES + TRAILER_WORDS > buf.data.len()
}

/// Read access to the recorded words.
pub fn with_samples<R>(f: impl FnOnce(&[u64]) -> R) -> R {
    let buf = PROFILE.lock();
    f(&buf.data[..buf.cur])
}

pub fn is_running() -> bool {
    RUNNING.load(Ordering::Acquire)
}

/// Record one sample for a suspended thread. Caller holds the pass lock
/// and the thread's suspend window.
pub(crate) fn record_sample(ts: &ThreadState, captured: &CapturedContext) {
    let mut buf = PROFILE.lock();
    let cap = buf.data.len();
    let start = buf.cur;
    if start + MAX_PROFILE_FRAMES + TRAILER_WORDS > cap {
        return;
    }
    let end = start + MAX_PROFILE_FRAMES;
    let n = unsafe {
        crate::signal::ctx::record_backtrace_ctx(ts, captured.as_ptr(), &mut buf.data[start..end])
    };
    let mut cur = start + n;
    buf.data[cur] = ts.tid() as u64 + 1;
    cur += 1;
    buf.data[cur] = ts.current_task() as u64;
    cur += 1;
    buf.data[cur] = cycleclock();
    cur += 1;
    buf.data[cur] = ts.sleep_check_state.load(Ordering::Relaxed) as u64 + 1;
    cur += 1;
    buf.data[cur] = 0;
    cur += 1;
    buf.data[cur] = 0;
    cur += 1;
    buf.cur = cur;
}

/// A fresh random visit order for `n` threads.
pub fn get_randperm(n: usize) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..n).collect();
    perm.shuffle(&mut rand::thread_rng());
    perm
}

pub(crate) fn set_autostop(deadline_ns: u64) {
    AUTOSTOP_AT.store(deadline_ns, Ordering::Release);
}

pub(crate) fn check_autostop() {
    let at = AUTOSTOP_AT.load(Ordering::Acquire);
    if at != 0 && hrtime() >= at {
        AUTOSTOP_AT.store(0, Ordering::Release);
        stop_timer();
        log::info!("profile peek finished");
    }
}

/// Whether trailing timer signals from a deleted timer can no longer be
/// in flight. Timers may deliver after deletion; user info signals are
/// ignored for 2 s after a delete so they are not confused for triggers.
pub fn timer_graceperiod_elapsed() -> bool {
    hrtime() > LAST_TIMER_DELETE.load(Ordering::Acquire) + 2_000_000_000
}

cfg_if! {
    if #[cfg(target_os = "linux")] {
        lazy_static! {
            static ref PROF_TIMER: Mutex<Option<usize>> = Mutex::new(None);
        }

        // sigev_value tag distinguishing our timer's signals from
        // user-sent ones.
        static TIMER_TAG_ANCHOR: u8 = 0;

        pub(crate) fn timer_tag() -> usize {
            &TIMER_TAG_ANCHOR as *const u8 as usize
        }

        fn arm_timer(timer: usize, sampling_ns: u64) -> bool {
            let its = libc::itimerspec {
                it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
                it_value: libc::timespec {
                    tv_sec: (sampling_ns / 1_000_000_000) as libc::time_t,
                    tv_nsec: (sampling_ns % 1_000_000_000) as _,
                },
            };
            unsafe { libc::timer_settime(timer as libc::timer_t, 0, &its, std::ptr::null_mut()) == 0 }
        }

        /// Start the one-shot profile timer; the listener re-arms it
        /// after every sampling pass.
        pub fn start_timer() -> Result<()> {
            let sampling_ns = PROFILE.lock().sampling_ns;
            if sampling_ns == 0 {
                return Err(RtError::ProfileUninitialized);
            }
            let mut ev: libc::sigevent = unsafe { std::mem::zeroed() };
            ev.sigev_notify = libc::SIGEV_SIGNAL;
            ev.sigev_signo = libc::SIGUSR1;
            ev.sigev_value = libc::sigval {
                sival_ptr: timer_tag() as *mut libc::c_void,
            };
            // The info signal is dual-purpose: set running before arming
            // so the first timer signal is attributable.
            RUNNING.store(true, Ordering::Release);
            let mut timer: libc::timer_t = std::ptr::null_mut();
            if unsafe { libc::timer_create(libc::CLOCK_REALTIME, &mut ev, &mut timer) } == -1 {
                RUNNING.store(false, Ordering::Release);
                return Err(RtError::Timer(format!(
                    "timer_create failed: errno {}",
                    crate::util::errno()
                )));
            }
            *PROF_TIMER.lock() = Some(timer as usize);
            if !arm_timer(timer as usize, sampling_ns) {
                RUNNING.store(false, Ordering::Release);
                return Err(RtError::Timer(format!(
                    "timer_settime failed: errno {}",
                    crate::util::errno()
                )));
            }
            Ok(())
        }

        pub fn stop_timer() {
            if RUNNING.swap(false, Ordering::AcqRel) {
                if let Some(timer) = PROF_TIMER.lock().take() {
                    unsafe {
                        libc::timer_delete(timer as libc::timer_t);
                    }
                }
                LAST_TIMER_DELETE.store(hrtime(), Ordering::Release);
            }
        }

        pub(crate) fn rearm_timer() {
            let sampling_ns = PROFILE.lock().sampling_ns;
            if let Some(timer) = *PROF_TIMER.lock() {
                arm_timer(timer, sampling_ns);
            }
        }
    } else {
        // BSD-style interval timer delivering SIGPROF.
        fn arm_itimer(sampling_ns: u64) -> bool {
            let it = libc::itimerval {
                it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
                it_value: libc::timeval {
                    tv_sec: (sampling_ns / 1_000_000_000) as libc::time_t,
                    tv_usec: (((sampling_ns % 1_000_000_000) + 999) / 1_000) as libc::suseconds_t,
                },
            };
            unsafe { libc::setitimer(libc::ITIMER_PROF, &it, std::ptr::null_mut()) == 0 }
        }

        pub fn start_timer() -> Result<()> {
            let sampling_ns = PROFILE.lock().sampling_ns;
            if sampling_ns == 0 {
                return Err(RtError::ProfileUninitialized);
            }
            RUNNING.store(true, Ordering::Release);
            if !arm_itimer(sampling_ns) {
                RUNNING.store(false, Ordering::Release);
                return Err(RtError::Timer(format!(
                    "setitimer failed: errno {}",
                    crate::util::errno()
                )));
            }
            Ok(())
        }

        pub fn stop_timer() {
            if RUNNING.swap(false, Ordering::AcqRel) {
                let it: libc::itimerval = unsafe { std::mem::zeroed() };
                unsafe {
                    libc::setitimer(libc::ITIMER_PROF, &it, std::ptr::null_mut());
                }
                LAST_TIMER_DELETE.store(hrtime(), Ordering::Release);
            }
        }

        pub(crate) fn rearm_timer() {
            let sampling_ns = PROFILE.lock().sampling_ns;
            if sampling_ns != 0 {
                arm_itimer(sampling_ns);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        // The buffer is process-global; keep these tests serialized.
        static ref TEST_LOCK: Mutex<()> = Mutex::new(());
    }

    #[test]
    fn test_init_and_clear() {
        let _guard = TEST_LOCK.lock();
        init(4096, 1_000_000).unwrap();
        assert_eq!(buffer_capacity(), 4096);
        assert_eq!(cursor(), 0);
        assert!(!is_buffer_full());
        clear();
        assert_eq!(cursor(), 0);
    }

    #[test]
    fn test_tiny_buffer_is_full() {
        let _guard = TEST_LOCK.lock();
        init(MAX_PROFILE_FRAMES, 1_000_000).unwrap();
        // No room for frames plus trailer.
        assert!(is_buffer_full());
        init(4096, 1_000_000).unwrap();
    }

    #[test]
    fn test_init_rejects_zero() {
        assert!(init(0, 1_000_000).is_err());
        assert!(init(4096, 0).is_err());
    }

    #[test]
    fn test_randperm_is_permutation() {
        for n in [1usize, 2, 7, 64] {
            let mut perm = get_randperm(n);
            perm.sort_unstable();
            let expect: Vec<usize> = (0..n).collect();
            assert_eq!(perm, expect);
        }
    }

    #[test]
    fn test_sample_record_layout() {
        let _guard = TEST_LOCK.lock();
        init(4096, 1_000_000).unwrap();
        let ts = crate::tls::attach_thread();
        record_sample(&ts, &CapturedContext::null_for_tests());
        with_samples(|samples| {
            // No frames from a null context, trailer only.
            assert_eq!(samples.len(), TRAILER_WORDS);
            assert_eq!(samples[0], ts.tid() as u64 + 1);
            assert_eq!(samples[3], 1); // awake, stored shifted by one
            assert_eq!(samples[4], 0);
            assert_eq!(samples[5], 0);
        });
        clear();
        crate::tls::detach_thread();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_stop_timer_starts_grace_period() {
        let _guard = TEST_LOCK.lock();
        // 10 s period: the timer never fires within this test.
        init(4096, 10_000_000_000).unwrap();
        start_timer().unwrap();
        assert!(is_running());
        stop_timer();
        assert!(!is_running());
        assert!(!timer_graceperiod_elapsed());
    }

    #[test]
    fn test_start_timer_requires_init() {
        let _guard = TEST_LOCK.lock();
        let mut buf = PROFILE.lock();
        buf.data = Vec::new();
        buf.sampling_ns = 0;
        drop(buf);
        assert!(matches!(
            start_timer(),
            Err(RtError::ProfileUninitialized)
        ));
        assert!(!is_running());
    }
}
