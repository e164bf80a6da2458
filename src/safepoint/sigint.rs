//! Pending-interrupt level and its page cascade.
//!
//! Level 0: no interrupt pending. Level 1: pending, only the SIGINT
//! page enabled (delivery deferred). Level 2: pending, SIGINT and
//! master GC pages enabled, so any poll by thread 0 traps.

use super::pages::{self, SLOT_GC_MASTER, SLOT_SIGINT};
use super::SAFEPOINT_LOCK;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

// Guarded by the safepoint lock.
static SIGNAL_PENDING: AtomicU8 = AtomicU8::new(0);

// Latched by the listener when interrupts pile up; a forced delivery
// bypasses defer_signal and io_wait.
static FORCE_SIGINT: AtomicBool = AtomicBool::new(false);

/// Raise the pending level to 2, enabling whichever of the SIGINT and
/// master GC pages the current level still has disabled.
pub fn enable_sigint() {
    SAFEPOINT_LOCK.lock();
    match SIGNAL_PENDING.load(Ordering::Relaxed) {
        0 => {
            pages::enable(SLOT_SIGINT);
            pages::enable(SLOT_GC_MASTER);
        }
        1 => {
            pages::enable(SLOT_GC_MASTER);
        }
        _ => {}
    }
    SIGNAL_PENDING.store(2, Ordering::Relaxed);
    SAFEPOINT_LOCK.unlock();
}

/// Postpone delivery: drop from level 2 to 1 so thread 0's GC polls stop
/// trapping while the interrupt stays pending.
pub fn defer_sigint() {
    SAFEPOINT_LOCK.lock();
    if SIGNAL_PENDING.load(Ordering::Relaxed) == 2 {
        pages::disable(SLOT_GC_MASTER);
        SIGNAL_PENDING.store(1, Ordering::Relaxed);
    }
    SAFEPOINT_LOCK.unlock();
}

/// Consume the pending interrupt, disabling both pages. Returns `true`
/// iff an interrupt was pending.
pub fn consume_sigint() -> bool {
    let mut has_signal = false;
    SAFEPOINT_LOCK.lock();
    match SIGNAL_PENDING.load(Ordering::Relaxed) {
        2 => {
            pages::disable(SLOT_GC_MASTER);
            pages::disable(SLOT_SIGINT);
            has_signal = true;
        }
        1 => {
            pages::disable(SLOT_SIGINT);
            has_signal = true;
        }
        _ => {}
    }
    SIGNAL_PENDING.store(0, Ordering::Relaxed);
    SAFEPOINT_LOCK.unlock();
    has_signal
}

/// Current pending level (diagnostics and tests).
pub fn pending_level() -> u8 {
    SIGNAL_PENDING.load(Ordering::Relaxed)
}

pub(crate) fn set_force_sigint() {
    FORCE_SIGINT.store(true, Ordering::Release);
}

pub(crate) fn check_force_sigint() -> bool {
    FORCE_SIGINT.load(Ordering::Acquire)
}

pub(crate) fn clear_force_sigint() {
    FORCE_SIGINT.store(false, Ordering::Release);
}
