//! Signal handling: handler installation, fault routing, the per-thread
//! suspend rendezvous, and the listener thread.

pub(crate) mod arch;
pub(crate) mod ctx;
pub(crate) mod fault;
mod listener;
mod rendezvous;
mod stack;

use crate::error::{Result, RtError};
use crate::util::errno;
use std::sync::atomic::{AtomicBool, Ordering};

pub use listener::restore_signals;
pub use rendezvous::{resume, suspend_and_capture, CapturedContext};
pub use stack::install_thread_signal_handler;

// Set by the plain SIGINT handler that covers the window before the
// listener owns the signal mask.
static SIGINT_PASSED: AtomicBool = AtomicBool::new(false);

extern "C" fn sigint_flag_handler(_sig: libc::c_int) {
    SIGINT_PASSED.store(true, Ordering::Release);
}

/// Whether a SIGINT arrived through the plain handler.
pub fn sigint_passed() -> bool {
    SIGINT_PASSED.load(Ordering::Acquire)
}

pub fn clear_sigint_passed() {
    SIGINT_PASSED.store(false, Ordering::Release);
}

unsafe fn install_action(sig: libc::c_int, handler: usize, flags: libc::c_int) -> Result<()> {
    let mut act: libc::sigaction = std::mem::zeroed();
    libc::sigemptyset(&mut act.sa_mask);
    act.sa_sigaction = handler;
    act.sa_flags = flags;
    if libc::sigaction(sig, &act, std::ptr::null_mut()) < 0 {
        return Err(RtError::HandlerInstall {
            signal: sig,
            errno: errno(),
        });
    }
    Ok(())
}

unsafe fn ignore_signal(sig: libc::c_int) -> Result<()> {
    if libc::signal(sig, libc::SIG_IGN) == libc::SIG_ERR {
        return Err(RtError::HandlerInstall {
            signal: sig,
            errno: errno(),
        });
    }
    Ok(())
}

/// Install the process-wide handler set: the fault router on the memory
/// and arithmetic signals, the rendezvous handler on the dedicated user
/// signal, one-shot crash handlers on the rest.
pub fn install_default_signal_handlers() -> Result<()> {
    unsafe {
        install_action(
            libc::SIGFPE,
            fault::fpe_handler as usize,
            libc::SA_ONSTACK | libc::SA_SIGINFO,
        )?;
        install_sigint_handler()?;
        ignore_signal(libc::SIGPIPE)?;
        ignore_signal(libc::SIGTRAP)?;
        install_action(
            rendezvous::SUSPEND_SIG,
            rendezvous::usr2_handler as usize,
            libc::SA_ONSTACK | libc::SA_SIGINFO | libc::SA_RESTART,
        )?;
        install_action(
            libc::SIGSEGV,
            fault::segv_handler as usize,
            libc::SA_ONSTACK | libc::SA_SIGINFO,
        )?;
        // On AArch64, stack overflow triggers a SIGBUS.
        install_action(
            libc::SIGBUS,
            fault::segv_handler as usize,
            libc::SA_ONSTACK | libc::SA_SIGINFO,
        )?;
        install_action(
            libc::SIGILL,
            fault::sigdie_handler as usize,
            libc::SA_SIGINFO | libc::SA_RESETHAND,
        )?;
        install_action(
            libc::SIGABRT,
            fault::sigdie_handler as usize,
            libc::SA_SIGINFO | libc::SA_RESETHAND,
        )?;
        install_action(
            libc::SIGSYS,
            fault::sigdie_handler as usize,
            libc::SA_SIGINFO | libc::SA_RESETHAND,
        )?;
        // The listener's signals are blocked everywhere, but must not be
        // left at SIG_IGN.
        #[cfg(target_os = "linux")]
        {
            install_action(
                libc::SIGUSR1,
                fault::sigdie_handler as usize,
                libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_RESETHAND,
            )?;
        }
        #[cfg(not(target_os = "linux"))]
        {
            install_action(
                libc::SIGPROF,
                fault::sigdie_handler as usize,
                libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_RESETHAND,
            )?;
            install_action(
                libc::SIGINFO,
                fault::sigdie_handler as usize,
                libc::SA_SIGINFO | libc::SA_RESTART | libc::SA_RESETHAND,
            )?;
        }
    }
    Ok(())
}

/// Install the plain SIGINT flag handler.
pub fn install_sigint_handler() -> Result<()> {
    unsafe { install_action(libc::SIGINT, sigint_flag_handler as usize, 0) }
}

/// Raise SIGTSTP on behalf of the REPL (job-control suspend).
pub fn repl_raise_sigtstp() -> i32 {
    unsafe { libc::raise(libc::SIGTSTP) }
}
