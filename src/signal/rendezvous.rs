//! Per-thread suspend/capture/resume rendezvous.
//!
//! The listener stops one thread at a time: it posts a capture request
//! in the target's `signal_request` word, kicks the target with the
//! dedicated user signal, and waits for the target's handler to publish
//! its register context and park. The whole suspend, capture, and
//! resume sequence happens under the in-signal lock, so sampling is
//! serialized across threads.

use super::ctx;
use super::fault::safe_print;
use crate::config;
use crate::safepoint;
use crate::tls::{self, request, SigException};
use crate::util;
use crate::util::sync::{PosixCondvar, PosixMutex};
use std::sync::atomic::{AtomicUsize, Ordering};

/// The dedicated suspend/sample signal. Never blocked process-wide; its
/// handler runs on every thread's signal stack.
pub(crate) const SUSPEND_SIG: libc::c_int = libc::SIGUSR2;

static IN_SIGNAL_LOCK: PosixMutex = PosixMutex::new();
static EXIT_SIGNAL_COND: PosixCondvar = PosixCondvar::new();
static SIGNAL_CAUGHT_COND: PosixCondvar = PosixCondvar::new();

// Single capture slot: the suspended thread's ucontext pointer. Valid
// only between a successful suspend and the matching resume.
static SIGNAL_CONTEXT: AtomicUsize = AtomicUsize::new(0);

/// Register context of a suspended thread. Valid only until the matching
/// [`resume`].
pub struct CapturedContext(*mut libc::c_void);

impl CapturedContext {
    pub fn as_ptr(&self) -> *mut libc::c_void {
        self.0
    }
}

#[cfg(test)]
impl CapturedContext {
    pub(crate) fn null_for_tests() -> Self {
        CapturedContext(std::ptr::null_mut())
    }
}

/// Suspend thread `tid` and capture its register context.
///
/// On success the in-signal lock is held until [`resume`] releases it;
/// the caller must pair every `Some` result with a `resume` call.
/// Returns `None` if the thread is not attached or did not acknowledge
/// within the configured timeout.
pub fn suspend_and_capture(tid: usize) -> Option<CapturedContext> {
    let ts = tls::get_state(tid)?;
    IN_SIGNAL_LOCK.lock();
    ts.signal_request.store(request::CAPTURE, Ordering::Release);
    unsafe {
        libc::pthread_kill(ts.system_id(), SUSPEND_SIG);
    }
    if !SIGNAL_CAUGHT_COND.wait_timeout(&IN_SIGNAL_LOCK, config::suspend_timeout()) {
        match ts.signal_request.compare_exchange(
            request::CAPTURE,
            request::IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // The target never entered its handler.
                IN_SIGNAL_LOCK.unlock();
                return None;
            }
            Err(observed) => {
                // The request is now 0 (the target already parked on the
                // exit condition) or -1 (the target is inside the
                // handler waiting for this lock; wait once more for it
                // to reach its park point).
                if observed == request::ACK {
                    SIGNAL_CAUGHT_COND.wait(&IN_SIGNAL_LOCK);
                }
            }
        }
    }
    let observed = ts.signal_request.load(Ordering::Acquire);
    debug_assert_eq!(observed, request::IDLE);
    Some(CapturedContext(
        SIGNAL_CONTEXT.load(Ordering::Acquire) as *mut libc::c_void
    ))
}

/// Resume a thread suspended by [`suspend_and_capture`]. `sig == -1`
/// resumes it into the thread-0 exit callback instead of its original
/// context. Releases the in-signal lock.
pub fn resume(tid: usize, sig: i32) {
    if let Some(ts) = tls::get_state(tid) {
        let resume_request = if sig == -1 {
            request::EXIT
        } else {
            request::CAPTURE
        };
        ts.signal_request.store(resume_request, Ordering::Release);
        EXIT_SIGNAL_COND.broadcast();
        // Wait for the target to leave its park point.
        SIGNAL_CAUGHT_COND.wait(&IN_SIGNAL_LOCK);
        let observed = ts.signal_request.load(Ordering::Acquire);
        debug_assert_eq!(observed, request::IDLE);
    }
    IN_SIGNAL_LOCK.unlock();
}

/// Handler for the dedicated user signal. Claims the pending request by
/// exchanging the word with the transient acknowledge value, then:
///
/// - capture: publish the context, park on the exit condition, and
///   acknowledge whichever resume request wakes it
/// - sigint-check: deliver the pending interrupt if due
/// - exit: redirect into the thread-0 exit callback
pub(crate) unsafe extern "C" fn usr2_handler(
    sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let Some(ts) = tls::current() else {
        return;
    };
    let errno_save = *util::errno_location();
    let mut req = ts.signal_request.swap(request::ACK, Ordering::AcqRel);
    if req == request::CAPTURE {
        IN_SIGNAL_LOCK.lock();
        SIGNAL_CONTEXT.store(context as usize, Ordering::Release);
        let prev = ts.signal_request.swap(request::IDLE, Ordering::AcqRel);
        debug_assert_eq!(prev, request::ACK);
        SIGNAL_CAUGHT_COND.broadcast();
        EXIT_SIGNAL_COND.wait(&IN_SIGNAL_LOCK);
        req = ts.signal_request.swap(request::IDLE, Ordering::AcqRel);
        debug_assert!(req == request::CAPTURE || req == request::EXIT);
        SIGNAL_CAUGHT_COND.broadcast();
        IN_SIGNAL_LOCK.unlock();
    } else {
        ts.signal_request.store(request::IDLE, Ordering::Release);
    }
    if req == request::SIGINT_CHECK {
        let force = safepoint::check_force_sigint();
        if force
            || (ts.defer_signal.load(Ordering::Relaxed) == 0 && ts.io_wait.load(Ordering::Relaxed))
        {
            safepoint::consume_sigint();
            if force {
                safe_print("WARNING: force throwing a SIGINT\n");
            }
            safepoint::clear_force_sigint();
            ctx::throw_in_ctx(ts, SigException::Interrupt, sig, context);
        }
    } else if req == request::EXIT {
        ctx::call_in_ctx(Some(ts), super::listener::exit_thread0_cb, sig, context);
    }
    *util::errno_location() = errno_save;
}
