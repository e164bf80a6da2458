//! Per-thread signal stacks.
//!
//! Each attached thread gets a dedicated stack for signal handlers, with
//! one guard page at the low end, registered through `sigaltstack`.

use crate::config;
use crate::error::{Result, RtError};
use crate::tls::ThreadState;
use crate::util::{errno, page::page_size};

/// Map `size` bytes of stack with a guard page below. Returns the usable
/// base (above the guard).
fn alloc_signal_stack(size: usize) -> Result<usize> {
    let guard = page_size();
    let total = size + guard;
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(RtError::StackAlloc {
            size: total,
            errno: errno(),
        });
    }
    let base = ptr as usize + guard;
    let rc = unsafe {
        libc::mprotect(
            base as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        let e = errno();
        unsafe { libc::munmap(ptr, total) };
        return Err(RtError::StackAlloc { size: total, errno: e });
    }
    Ok(base)
}

/// Allocate and register the calling thread's signal stack, recording
/// its bounds in the thread's TLS block. Call once per attached thread,
/// on that thread.
pub fn install_thread_signal_handler(ts: &ThreadState) -> Result<()> {
    let size = config::sig_stack_size();
    let base = alloc_signal_stack(size)?;
    ts.set_signal_stack(base, size);
    let ss = libc::stack_t {
        ss_sp: base as *mut libc::c_void,
        ss_flags: 0,
        ss_size: size - 16,
    };
    if unsafe { libc::sigaltstack(&ss, std::ptr::null_mut()) } != 0 {
        return Err(RtError::SigAltStack { errno: errno() });
    }
    Ok(())
}
