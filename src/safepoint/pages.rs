//! The three safepoint guard pages and their enable counters.

use super::SAFEPOINT_LOCK;
use crate::signal::fault::safe_print;
use crate::tls::ThreadState;
use crate::util::page::page_size;
use std::mem;
use std::sync::atomic::{fence, AtomicU8, AtomicUsize, Ordering};
use std::sync::Once;

pub(crate) const SLOT_SIGINT: usize = 0;
pub(crate) const SLOT_GC_MASTER: usize = 1;
pub(crate) const SLOT_GC_WORKER: usize = 2;

/// Base address of the three-page region; 0 until [`init`] runs.
static PAGES: AtomicUsize = AtomicUsize::new(0);

/// Enable counts per slot, guarded by the safepoint lock. A slot is
/// enabled at most twice: once for the GC, once for SIGINT.
static ENABLE_CNT: [AtomicU8; 3] = [AtomicU8::new(0), AtomicU8::new(0), AtomicU8::new(0)];

/// Allocate the safepoint pages. Must run before any poll; aborts the
/// process if the pages cannot be mapped.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let len = page_size() * 3;
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            safe_print("qrt: could not allocate GC synchronization page\n");
            std::process::abort();
        }
        PAGES.store(addr as usize, Ordering::Release);
    });
}

pub(crate) fn base() -> usize {
    PAGES.load(Ordering::Acquire)
}

fn protect(slot: usize, prot: libc::c_int) {
    let addr = base() + page_size() * slot;
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, page_size(), prot) };
    if rc != 0 {
        safe_print("qrt: mprotect on safepoint page failed\n");
        std::process::abort();
    }
    // A racing poll must not observe stale protection state.
    fence(Ordering::SeqCst);
}

/// Enable `slot`; the 0→1 transition makes the page inaccessible.
/// The safepoint lock must be held.
pub(crate) fn enable(slot: usize) {
    let prev = ENABLE_CNT[slot].fetch_add(1, Ordering::Relaxed);
    assert!(prev < 2, "safepoint slot {} enabled more than twice", slot);
    if prev != 0 {
        return;
    }
    protect(slot, libc::PROT_NONE);
}

/// Disable `slot`; reaching 0 makes the page read-only again. Underflow
/// is a programming error. The safepoint lock must be held.
pub(crate) fn disable(slot: usize) {
    let prev = ENABLE_CNT[slot].fetch_sub(1, Ordering::Relaxed);
    assert!(prev > 0, "safepoint slot {} disabled while at zero", slot);
    if prev != 1 {
        return;
    }
    protect(slot, libc::PROT_READ);
}

/// Whether `addr` falls inside the safepoint page region.
pub fn addr_is_safepoint(addr: usize) -> bool {
    let b = base();
    b != 0 && addr >= b && addr < b + 3 * page_size()
}

/// The address `ts` polls for GC. Thread 0 polls the master GC page;
/// workers poll one word into the worker GC page so the word below the
/// poll address still lands in the same page.
pub fn poll_addr(ts: &ThreadState) -> usize {
    if ts.is_main() {
        base() + page_size()
    } else {
        base() + 2 * page_size() + mem::size_of::<usize>()
    }
}

/// GC poll: a load that faults while a collection is being started.
#[inline]
pub fn gc_poll(ts: &ThreadState) {
    if base() == 0 {
        return;
    }
    unsafe {
        std::ptr::read_volatile(poll_addr(ts) as *const usize);
    }
}

/// Interrupt poll: a load of the word below the GC poll address. For
/// thread 0 this lands in the SIGINT page and faults while an interrupt
/// is pending at any level.
#[inline]
pub fn sigint_poll(ts: &ThreadState) {
    if base() == 0 {
        return;
    }
    unsafe {
        std::ptr::read_volatile((poll_addr(ts) - mem::size_of::<usize>()) as *const usize);
    }
}

/// Snapshot of the per-slot enable counts (diagnostics and tests).
pub fn enable_counts() -> [u8; 3] {
    SAFEPOINT_LOCK.lock();
    let counts = [
        ENABLE_CNT[0].load(Ordering::Relaxed),
        ENABLE_CNT[1].load(Ordering::Relaxed),
        ENABLE_CNT[2].load(Ordering::Relaxed),
    ];
    SAFEPOINT_LOCK.unlock();
    counts
}
