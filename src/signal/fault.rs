//! The fault router: memory faults are safepoint polls, stack
//! overflows, read-only writes, or genuine crashes.

use super::arch;
use super::ctx;
use crate::safepoint;
use crate::tls::{self, SigException};

/// `si_code` value for an access-permission memory fault (e.g. a write
/// to read-only memory). Defined by the kernel/glibc siginfo.h ABI but
/// not exposed by the `libc` crate on this target.
const SEGV_ACCERR: libc::c_int = 2;

/// Async-signal-safe write to stderr. Handlers must not use the `log`
/// facade or any allocating formatter.
pub(crate) fn safe_print(msg: &str) {
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            msg.as_ptr() as *const libc::c_void,
            msg.len(),
        );
    }
}

pub(crate) fn safe_print_dec(mut value: u64) {
    let mut buf = [0u8; 20];
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            buf[pos..].as_ptr() as *const libc::c_void,
            buf.len() - pos,
        );
    }
}

pub(crate) fn safe_print_hex(value: u64) {
    let mut buf = [0u8; 18];
    buf[0] = b'0';
    buf[1] = b'x';
    for i in 0..16 {
        let nibble = ((value >> ((15 - i) * 4)) & 0xf) as u8;
        buf[2 + i] = if nibble < 10 {
            b'0' + nibble
        } else {
            b'a' + nibble - 10
        };
    }
    unsafe {
        libc::write(libc::STDERR_FILENO, buf.as_ptr() as *const libc::c_void, buf.len());
    }
}

/// Print crash information for `sig`: thread id and, when a context is
/// available, a raw backtrace of the trapped frames.
pub(crate) unsafe fn critical_error(sig: i32, ctx_ptr: *mut libc::c_void) {
    safe_print("\nsignal (");
    safe_print_dec(sig as u64);
    safe_print(")");
    if let Some(ts) = tls::current() {
        safe_print(" thread ");
        safe_print_dec(ts.tid() as u64);
        safe_print("\n");
        if !ctx_ptr.is_null() {
            let buf = ts.bt_data_mut();
            let n = ctx::record_backtrace_ctx(ts, ctx_ptr, buf);
            ts.set_bt_size(n);
            for frame in buf.iter().take(n) {
                safe_print("  ");
                safe_print_hex(*frame);
                safe_print("\n");
            }
        }
    } else {
        safe_print("\n");
    }
}

/// Terminal handler for signals the runtime cannot recover from. Resets
/// the disposition to default and re-raises, so the default action
/// produces the core dump / termination. For memory faults the faulting
/// instruction simply re-executes without this handler installed.
pub(crate) unsafe extern "C" fn sigdie_handler(
    sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    libc::signal(sig, libc::SIG_DFL);
    critical_error(sig, context);
    if sig != libc::SIGSEGV && sig != libc::SIGBUS && sig != libc::SIGILL {
        libc::raise(sig);
    }
}

/// Router for memory faults (SIGSEGV, and SIGBUS where stack overflow
/// arrives as SIGBUS).
pub(crate) unsafe extern "C" fn segv_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    if tls::safe_restore() != 0 {
        // Restarting a guarded region (profiler re-entry, REPL
        // displayer): go straight to the raise trampoline.
        ctx::call_in_ctx(None, ctx::raise_sig_exception, sig, context);
        return;
    }
    let Some(ts) = tls::current() else {
        sigdie_handler(sig, info, context);
        return;
    };
    if ts.current_task().is_null() {
        sigdie_handler(sig, info, context);
        return;
    }
    let addr = (*info).si_addr() as usize;
    if safepoint::addr_is_safepoint(addr) {
        safepoint::set_gc_and_wait();
        // Workers never handle user interrupts.
        if !ts.is_main() {
            return;
        }
        if ts.defer_signal.load(std::sync::atomic::Ordering::Relaxed) != 0 {
            safepoint::defer_sigint();
        } else if safepoint::consume_sigint() {
            safepoint::clear_force_sigint();
            ctx::throw_in_ctx(ts, SigException::Interrupt, sig, context);
        }
        return;
    }
    if ts.task_contains(addr) {
        ctx::throw_in_ctx(ts, SigException::StackOverflow, sig, context);
    } else if ts.on_signal_stack(addr) && ts.on_signal_stack(arch::get_sp(context)) {
        // The signal stack itself overflowed (typically deep recursion
        // in a finalizer). We are already corrupting that stack running
        // this handler; terminate immediately.
        safe_print("ERROR: signal stack overflow, exit\n");
        libc::_exit(sig + 128);
    } else if sig == libc::SIGSEGV
        && (*info).si_code == SEGV_ACCERR
        && arch::is_write_fault(context)
    {
        ctx::throw_in_ctx(ts, SigException::ReadOnlyMemory, sig, context);
    } else if cfg!(feature = "segv-exception") {
        ctx::throw_in_ctx(ts, SigException::Segv, sig, context);
    } else {
        sigdie_handler(sig, info, context);
    }
}

/// Arithmetic faults become a divide-error exception in the faulting
/// task; on a foreign thread they are fatal.
pub(crate) unsafe extern "C" fn fpe_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    if tls::safe_restore() != 0 {
        ctx::call_in_ctx(None, ctx::raise_sig_exception, sig, context);
        return;
    }
    match tls::current() {
        Some(ts) if !ts.current_task().is_null() => {
            ctx::throw_in_ctx(ts, SigException::DivideError, sig, context);
        }
        _ => sigdie_handler(sig, info, context),
    }
}
