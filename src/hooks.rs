//! Integration hooks supplied by the embedding runtime.
//!
//! The signal core does not own exception raising, the event loop, or
//! process shutdown; the embedder wires those in here. All hooks are
//! plain function pointers stored in atomics so they are safe to consult
//! from signal-handler context.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Raises the thread's pending signal exception. Installed by the
/// runtime; invoked on the signal stack after context injection and must
/// not return.
pub type SigThrowFn = unsafe extern "C" fn() -> !;

/// Wakes the embedder's event loop so a thread parked in I/O re-checks
/// its interrupt state.
pub type WakeFn = fn();

/// Orderly process exit with the given status.
pub type ExitFn = fn(i32) -> !;

static SIG_THROW: AtomicUsize = AtomicUsize::new(0);
static WAKE_EVENT_LOOP: AtomicUsize = AtomicUsize::new(0);
static EXIT: AtomicUsize = AtomicUsize::new(0);

pub fn set_sig_throw(f: SigThrowFn) {
    SIG_THROW.store(f as usize, Ordering::Release);
}

pub fn set_wake_event_loop(f: WakeFn) {
    WAKE_EVENT_LOOP.store(f as usize, Ordering::Release);
}

pub fn set_exit(f: ExitFn) {
    EXIT.store(f as usize, Ordering::Release);
}

pub(crate) fn sig_throw() -> Option<SigThrowFn> {
    let ptr = SIG_THROW.load(Ordering::Acquire);
    if ptr == 0 {
        None
    } else {
        Some(unsafe { std::mem::transmute::<usize, SigThrowFn>(ptr) })
    }
}

pub(crate) fn wake_event_loop() {
    let ptr = WAKE_EVENT_LOOP.load(Ordering::Acquire);
    if ptr != 0 {
        let f = unsafe { std::mem::transmute::<usize, WakeFn>(ptr) };
        f();
    }
}

/// Runs the embedder exit hook, falling back to `std::process::exit`.
pub(crate) fn exit(status: i32) -> ! {
    let ptr = EXIT.load(Ordering::Acquire);
    if ptr != 0 {
        let f = unsafe { std::mem::transmute::<usize, ExitFn>(ptr) };
        f(status);
    }
    std::process::exit(status);
}
