//! Context injection: resume a trapped thread inside a runtime routine.

use super::arch;
use super::fault::safe_print;
use crate::hooks;
use crate::tls::{self, SigException, ThreadState};

/// A routine injected into a trapped context. Runs on the signal stack
/// and must not return.
pub(crate) type CtxFn = unsafe extern "C" fn() -> !;

/// Unblock `sig` and call `fptr` directly from the handler. Last resort
/// when the context cannot be rewritten.
unsafe fn call_direct(fptr: CtxFn, sig: i32) -> ! {
    let mut sset: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut sset);
    libc::sigaddset(&mut sset, sig);
    libc::pthread_sigmask(libc::SIG_UNBLOCK, &sset, std::ptr::null_mut());
    fptr();
}

/// Rewrite the trapped context so `fptr` executes on the thread's signal
/// stack when the handler returns. If the trapped stack pointer is
/// already on the signal stack it is kept, minus a redzone, re-aligned
/// to 16 bytes; `call_in_ctx` is itself running on that stack, so the
/// redzone keeps the new frame clear of it.
pub(crate) unsafe fn call_in_ctx(
    ts: Option<&ThreadState>,
    fptr: CtxFn,
    sig: i32,
    ctx: *mut libc::c_void,
) {
    let target = match ts {
        Some(t) if arch::SUPPORTED => {
            let (base, size) = t.signal_stack();
            if base == 0 {
                None
            } else {
                Some((t, base, size))
            }
        }
        _ => None,
    };
    let Some((ts, base, size)) = target else {
        call_direct(fptr, sig);
    };
    let mut sp = arch::get_sp(ctx);
    if ts.on_signal_stack(sp) {
        sp = (sp - 256) & !15usize;
    } else {
        sp = base + size;
    }
    debug_assert!(sp % 16 == 0);
    arch::set_ip_sp_lr(ctx, fptr as usize, sp, 0);
}

/// Record the exception and a backtrace of the trapped context into the
/// thread's TLS block, then arrange for the raise trampoline to run.
pub(crate) unsafe fn throw_in_ctx(
    ts: &ThreadState,
    exc: SigException,
    sig: i32,
    ctx: *mut libc::c_void,
) {
    if tls::safe_restore() == 0 {
        let buf = ts.bt_data_mut();
        let n = record_backtrace_ctx(ts, ctx, buf);
        ts.set_bt_size(n);
        ts.set_sig_exception(exc);
    }
    call_in_ctx(Some(ts), raise_sig_exception, sig, ctx);
}

/// Trampoline injected by `throw_in_ctx`: hands control to the
/// embedder's raise routine, or reports and aborts if none is installed.
pub(crate) unsafe extern "C" fn raise_sig_exception() -> ! {
    if let Some(throw) = hooks::sig_throw() {
        throw();
    }
    safe_print("fatal: unhandled signal exception: ");
    let name = tls::current()
        .and_then(|ts| ts.pending_sig_exception())
        .map(|e| e.name())
        .unwrap_or("unknown");
    safe_print(name);
    safe_print("\n");
    libc::abort();
}

/// Bounded frame-pointer walk over a trapped context.
///
/// Frames are followed only while the frame pointer stays inside the
/// thread's known task or signal stack ranges and strictly increases, so
/// the walk terminates and never touches unmapped memory. Returns the
/// number of words written.
pub(crate) unsafe fn record_backtrace_ctx(
    ts: &ThreadState,
    ctx: *mut libc::c_void,
    out: &mut [u64],
) -> usize {
    if out.is_empty() || ctx.is_null() {
        return 0;
    }
    let word = std::mem::size_of::<usize>();
    let mut n = 0;
    out[n] = arch::get_pc(ctx) as u64;
    n += 1;
    let mut fp = arch::get_fp(ctx);
    while n < out.len() {
        if fp == 0 || fp & (word - 1) != 0 || !ts.addr_in_stacks(fp) || !ts.addr_in_stacks(fp + word)
        {
            break;
        }
        let next = *(fp as *const usize);
        let ret = *((fp + word) as *const usize);
        if ret == 0 {
            break;
        }
        out[n] = ret as u64;
        n += 1;
        if next <= fp {
            break;
        }
        fp = next;
    }
    n
}
