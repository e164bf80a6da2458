//! Statically-initialized POSIX mutexes and condition variables.
//!
//! The safepoint lock and the in-signal lock are both taken from
//! signal-handler context: `wait_gc` runs inside the fault handler when a
//! poll traps, and the suspend handshake parks inside the USR2 handler.
//! `std::sync` and `parking_lot` primitives may allocate per-thread state
//! on first use, which is off-limits there. A `pthread_mutex_t` with
//! static initialization never allocates after process start.

use std::cell::UnsafeCell;
use std::time::Duration;

pub struct PosixMutex(UnsafeCell<libc::pthread_mutex_t>);

// Safety: pthread mutexes are designed for cross-thread use; the cell is
// only handed to pthread_* calls.
unsafe impl Sync for PosixMutex {}

impl PosixMutex {
    pub const fn new() -> Self {
        Self(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER))
    }

    pub fn lock(&self) {
        let rc = unsafe { libc::pthread_mutex_lock(self.0.get()) };
        debug_assert_eq!(rc, 0);
    }

    /// Caller must hold the lock.
    pub fn unlock(&self) {
        let rc = unsafe { libc::pthread_mutex_unlock(self.0.get()) };
        debug_assert_eq!(rc, 0);
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.0.get()
    }
}

pub struct PosixCondvar(UnsafeCell<libc::pthread_cond_t>);

unsafe impl Sync for PosixCondvar {}

impl PosixCondvar {
    pub const fn new() -> Self {
        Self(UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER))
    }

    /// Caller must hold `mutex`.
    pub fn wait(&self, mutex: &PosixMutex) {
        let rc = unsafe { libc::pthread_cond_wait(self.0.get(), mutex.raw()) };
        debug_assert_eq!(rc, 0);
    }

    /// Caller must hold `mutex`. Returns `false` if the wait timed out.
    pub fn wait_timeout(&self, mutex: &PosixMutex, timeout: Duration) -> bool {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) };
        let mut sec = now.tv_sec + timeout.as_secs() as libc::time_t;
        let mut nsec = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        if nsec >= 1_000_000_000 {
            sec += 1;
            nsec -= 1_000_000_000;
        }
        let deadline = libc::timespec {
            tv_sec: sec,
            tv_nsec: nsec as _,
        };
        let rc = unsafe { libc::pthread_cond_timedwait(self.0.get(), mutex.raw(), &deadline) };
        rc != libc::ETIMEDOUT
    }

    pub fn broadcast(&self) {
        let rc = unsafe { libc::pthread_cond_broadcast(self.0.get()) };
        debug_assert_eq!(rc, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    static LOCK: PosixMutex = PosixMutex::new();
    static COND: PosixCondvar = PosixCondvar::new();
    static FLAG: AtomicBool = AtomicBool::new(false);

    #[test]
    fn test_wait_timeout_expires() {
        LOCK.lock();
        let start = Instant::now();
        let signalled = COND.wait_timeout(&LOCK, Duration::from_millis(50));
        LOCK.unlock();
        assert!(!signalled);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_broadcast_wakes_waiter() {
        let waiter = std::thread::spawn(|| {
            LOCK.lock();
            while !FLAG.load(Ordering::Acquire) {
                COND.wait(&LOCK);
            }
            LOCK.unlock();
        });
        std::thread::sleep(Duration::from_millis(20));
        LOCK.lock();
        FLAG.store(true, Ordering::Release);
        LOCK.unlock();
        COND.broadcast();
        waiter.join().unwrap();
    }
}
