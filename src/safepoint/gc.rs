//! Collector election and the stop-the-world rendezvous.

use super::pages::{self, SLOT_GC_MASTER, SLOT_GC_WORKER};
use super::{SAFEPOINT_COND, SAFEPOINT_LOCK};
use crate::tls::{self, GcState};
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};

static GC_RUNNING: AtomicU32 = AtomicU32::new(0);

/// Whether a collection is currently running (acquire load).
pub fn gc_running() -> bool {
    GC_RUNNING.load(Ordering::Acquire) != 0
}

/// Elect a collector. Returns `true` if the calling thread won the
/// election and may collect; otherwise blocks until the winner finishes
/// and returns `false`.
///
/// With more than one thread attached the caller must already have set
/// its `gc_state` to `Waiting` so the winner knows this thread is
/// paused.
pub fn start_gc() -> bool {
    if tls::n_threads() <= 1 {
        GC_RUNNING.store(1, Ordering::Relaxed);
        return true;
    }
    debug_assert!(tls::current()
        .map(|ts| ts.gc_state.load(Ordering::Relaxed) == GcState::Waiting as i8)
        .unwrap_or(true));
    SAFEPOINT_LOCK.lock();
    // Several threads may request a collection at once; only one runs
    // it. We cannot simply hand the collection to thread 0, which might
    // be off in unmanaged code and arbitrarily far from a safepoint.
    if GC_RUNNING
        .compare_exchange(0, 1, Ordering::SeqCst, Ordering::Relaxed)
        .is_err()
    {
        SAFEPOINT_LOCK.unlock();
        wait_gc();
        return false;
    }
    pages::enable(SLOT_GC_MASTER);
    pages::enable(SLOT_GC_WORKER);
    SAFEPOINT_LOCK.unlock();
    true
}

/// End the collection. Caller must be the elected collector.
pub fn end_gc() {
    debug_assert!(GC_RUNNING.load(Ordering::Relaxed) != 0);
    if tls::n_threads() <= 1 {
        GC_RUNNING.store(0, Ordering::Relaxed);
        return;
    }
    SAFEPOINT_LOCK.lock();
    // Page protection must revert before the flag clears: a thread
    // returning from the fault handler re-executes its poll at once.
    pages::disable(SLOT_GC_WORKER);
    pages::disable(SLOT_GC_MASTER);
    GC_RUNNING.store(0, Ordering::Release);
    SAFEPOINT_LOCK.unlock();
    SAFEPOINT_COND.broadcast();
}

/// Block until the running collection ends.
///
/// Spins briefly on a relaxed load, then parks on the safepoint
/// condition variable. The final acquire load makes the collector's
/// writes visible before returning.
pub fn wait_gc() {
    let backoff = Backoff::new();
    while GC_RUNNING.load(Ordering::Relaxed) != 0 || GC_RUNNING.load(Ordering::Acquire) != 0 {
        if !backoff.is_completed() {
            backoff.snooze();
            continue;
        }
        SAFEPOINT_LOCK.lock();
        if GC_RUNNING.load(Ordering::Relaxed) != 0 {
            SAFEPOINT_COND.wait(&SAFEPOINT_LOCK);
        }
        SAFEPOINT_LOCK.unlock();
    }
}

/// Mark the calling thread as waiting, ride out the collection, then
/// restore its previous state. This is the fault router's entry point
/// for a safepoint poll.
pub fn set_gc_and_wait() {
    let Some(ts) = tls::current() else {
        return wait_gc();
    };
    let prev = ts.gc_state.swap(GcState::Waiting as i8, Ordering::Release);
    wait_gc();
    ts.gc_state.store(prev, Ordering::Release);
}
