//! Per-thread runtime state shared with the signal layer.
//!
//! Every mutator thread owns a `ThreadState` record. The record is
//! created when the thread attaches, published in a process-wide
//! registry (read by the signal listener) and in a thread-local cell
//! (read by signal handlers, without allocation), and dropped when the
//! thread detaches. Thread 0 is the main thread; it is the only thread
//! that takes user interrupts.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI8, AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Maximum number of backtrace words recorded per thread.
pub const MAX_BT_SIZE: usize = 8192;

/// Where a thread stands relative to a stop-the-world collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum GcState {
    /// Running managed code; must poll before the collector may proceed.
    Running = 0,
    /// Parked waiting for the collector to finish.
    Waiting = 1,
    /// In a region that touches no managed memory (e.g. blocking I/O).
    Safe = 2,
}

impl GcState {
    pub fn from_raw(raw: i8) -> GcState {
        match raw {
            1 => GcState::Waiting,
            2 => GcState::Safe,
            _ => GcState::Running,
        }
    }
}

/// Exceptions the signal core can inject into a trapped thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SigException {
    Interrupt = 1,
    StackOverflow = 2,
    ReadOnlyMemory = 3,
    DivideError = 4,
    Segv = 5,
}

impl SigException {
    pub fn name(self) -> &'static str {
        match self {
            SigException::Interrupt => "interrupt",
            SigException::StackOverflow => "stack-overflow",
            SigException::ReadOnlyMemory => "read-only-memory",
            SigException::DivideError => "divide-by-zero",
            SigException::Segv => "segv",
        }
    }

    fn from_raw(raw: u8) -> Option<SigException> {
        match raw {
            1 => Some(SigException::Interrupt),
            2 => Some(SigException::StackOverflow),
            3 => Some(SigException::ReadOnlyMemory),
            4 => Some(SigException::DivideError),
            5 => Some(SigException::Segv),
            _ => None,
        }
    }
}

/// The slice of the task representation this subsystem consumes: the
/// bounds of the task's execution stack.
#[derive(Debug)]
pub struct Task {
    stack_lo: usize,
    stack_hi: usize,
}

impl Task {
    /// `stack_base` is the high end of the stack; the stack grows down
    /// through `stack_size` bytes.
    pub fn new(stack_base: usize, stack_size: usize) -> Self {
        Self {
            stack_lo: stack_base - stack_size,
            stack_hi: stack_base,
        }
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr > self.stack_lo && addr < self.stack_hi
    }
}

/// Values of the per-thread `signal_request` word:
///
/// - `IDLE`: nothing requested / acknowledged
/// - `CAPTURE`: publish your register context and wait
/// - `SIGINT_CHECK`: evaluate whether to throw an interrupt now
/// - `EXIT`: run the thread-0 exit callback
/// - `ACK`: transient, set by the handler while claiming a request
pub mod request {
    pub const IDLE: i32 = 0;
    pub const CAPTURE: i32 = 1;
    pub const SIGINT_CHECK: i32 = 2;
    pub const EXIT: i32 = 3;
    pub const ACK: i32 = -1;
}

/// Per-thread block shared between the thread, the fault handler running
/// on it, and the signal listener.
pub struct ThreadState {
    tid: usize,
    system_id: libc::pthread_t,
    pub gc_state: AtomicI8,
    /// Rendezvous word; written by both the listener and the owning
    /// thread's USR2 handler. AtomicI32 is lock-free and address-stable
    /// here, which the handler protocol requires.
    pub signal_request: AtomicI32,
    /// Nonzero while the thread has asked for interrupt delivery to be
    /// postponed.
    pub defer_signal: AtomicU32,
    /// Set while the thread is parked in the event loop.
    pub io_wait: AtomicBool,
    pub sleep_check_state: AtomicU8,
    signal_stack: AtomicUsize,
    signal_stack_size: AtomicUsize,
    current_task: AtomicPtr<Task>,
    sig_exception: AtomicU8,
    bt_size: AtomicUsize,
    bt_data: UnsafeCell<Box<[u64]>>,
}

// Safety: `bt_data` is only written by the owning thread inside its own
// signal handler, or by the listener while the thread is parked in the
// suspend rendezvous; the two never overlap (rendezvous invariant).
unsafe impl Sync for ThreadState {}
unsafe impl Send for ThreadState {}

impl ThreadState {
    fn new(tid: usize) -> Self {
        Self {
            tid,
            system_id: unsafe { libc::pthread_self() },
            gc_state: AtomicI8::new(GcState::Running as i8),
            signal_request: AtomicI32::new(request::IDLE),
            defer_signal: AtomicU32::new(0),
            io_wait: AtomicBool::new(false),
            sleep_check_state: AtomicU8::new(0),
            signal_stack: AtomicUsize::new(0),
            signal_stack_size: AtomicUsize::new(0),
            current_task: AtomicPtr::new(std::ptr::null_mut()),
            sig_exception: AtomicU8::new(0),
            bt_size: AtomicUsize::new(0),
            bt_data: UnsafeCell::new(vec![0u64; MAX_BT_SIZE].into_boxed_slice()),
        }
    }

    pub fn tid(&self) -> usize {
        self.tid
    }

    pub fn is_main(&self) -> bool {
        self.tid == 0
    }

    pub(crate) fn system_id(&self) -> libc::pthread_t {
        self.system_id
    }

    /// Publish the task currently executing on this thread. The pointer
    /// must stay valid until replaced.
    pub fn set_current_task(&self, task: *mut Task) {
        self.current_task.store(task, Ordering::Release);
    }

    pub fn current_task(&self) -> *mut Task {
        self.current_task.load(Ordering::Acquire)
    }

    /// Whether `addr` falls within the current task's stack bounds.
    pub fn task_contains(&self, addr: usize) -> bool {
        let task = self.current_task();
        !task.is_null() && unsafe { (*task).contains(addr) }
    }

    pub(crate) fn set_signal_stack(&self, base: usize, size: usize) {
        self.signal_stack.store(base, Ordering::Release);
        self.signal_stack_size.store(size, Ordering::Release);
    }

    /// Usable signal-stack base and size; base 0 means not installed.
    pub(crate) fn signal_stack(&self) -> (usize, usize) {
        (
            self.signal_stack.load(Ordering::Acquire),
            self.signal_stack_size.load(Ordering::Acquire),
        )
    }

    /// Whether `addr` is on this thread's signal stack, including the
    /// guard page below it.
    pub fn on_signal_stack(&self, addr: usize) -> bool {
        let (base, size) = self.signal_stack();
        if base == 0 {
            return false;
        }
        addr >= base - crate::util::page::page_size() && addr <= base + size
    }

    pub(crate) fn addr_in_stacks(&self, addr: usize) -> bool {
        self.on_signal_stack(addr) || self.task_contains(addr)
    }

    pub(crate) fn set_sig_exception(&self, exc: SigException) {
        self.sig_exception.store(exc as u8, Ordering::Release);
    }

    /// The exception recorded for the pending `sig_throw`, if any.
    pub fn pending_sig_exception(&self) -> Option<SigException> {
        SigException::from_raw(self.sig_exception.load(Ordering::Acquire))
    }

    /// Consume the pending exception (called by the embedder's raise
    /// routine).
    pub fn take_sig_exception(&self) -> Option<SigException> {
        SigException::from_raw(self.sig_exception.swap(0, Ordering::AcqRel))
    }

    pub(crate) fn set_bt_size(&self, n: usize) {
        self.bt_size.store(n.min(MAX_BT_SIZE), Ordering::Release);
    }

    pub fn bt_size(&self) -> usize {
        self.bt_size.load(Ordering::Acquire)
    }

    /// Raw access to the backtrace buffer.
    ///
    /// # Safety
    /// Caller must be the owning thread inside its own handler, or the
    /// listener while this thread is suspended in the rendezvous.
    pub(crate) unsafe fn bt_data_mut(&self) -> &mut [u64] {
        &mut *self.bt_data.get()
    }

    /// Copy of the recorded backtrace words (diagnostics).
    pub fn backtrace(&self) -> Vec<u64> {
        let n = self.bt_size();
        unsafe { (&*self.bt_data.get())[..n].to_vec() }
    }
}

lazy_static! {
    static ref ALL_THREADS: RwLock<Vec<Option<Arc<ThreadState>>>> = RwLock::new(Vec::new());
}

thread_local! {
    static CURRENT: Cell<*const ThreadState> = const { Cell::new(std::ptr::null()) };
}

/// Attach the calling thread to the runtime, allocating its per-thread
/// block. The first thread to attach becomes thread 0. Idempotent for an
/// already-attached thread.
pub fn attach_thread() -> Arc<ThreadState> {
    let existing = CURRENT.with(|c| c.get());
    if !existing.is_null() {
        let tid = unsafe { (*existing).tid };
        if let Some(ts) = get_state(tid) {
            return ts;
        }
    }

    let mut threads = ALL_THREADS.write();
    let tid = threads
        .iter()
        .position(|slot| slot.is_none())
        .unwrap_or(threads.len());
    let ts = Arc::new(ThreadState::new(tid));
    if tid == threads.len() {
        threads.push(Some(Arc::clone(&ts)));
    } else {
        threads[tid] = Some(Arc::clone(&ts));
    }
    CURRENT.with(|c| c.set(Arc::as_ptr(&ts)));
    ts
}

/// Detach the calling thread, destroying its registry entry. The TLS
/// reference handed out by [`current`] becomes invalid.
pub fn detach_thread() {
    let ptr = CURRENT.with(|c| c.replace(std::ptr::null()));
    if ptr.is_null() {
        return;
    }
    let tid = unsafe { (*ptr).tid };
    let mut threads = ALL_THREADS.write();
    if let Some(slot) = threads.get_mut(tid) {
        *slot = None;
    }
}

/// The calling thread's state, if attached. The reference is valid until
/// the thread detaches.
pub fn current() -> Option<&'static ThreadState> {
    let ptr = CURRENT.with(|c| c.get());
    if ptr.is_null() {
        None
    } else {
        Some(unsafe { &*ptr })
    }
}

/// Number of attached threads.
pub fn n_threads() -> usize {
    ALL_THREADS.read().iter().filter(|s| s.is_some()).count()
}

/// Number of registry slots (the largest tid ever attached plus one).
pub(crate) fn n_slots() -> usize {
    ALL_THREADS.read().len()
}

pub(crate) fn get_state(tid: usize) -> Option<Arc<ThreadState>> {
    ALL_THREADS.read().get(tid).and_then(|s| s.clone())
}

// Per-thread safe-restore continuation token. Nonzero while an unwind
// escape hatch (profiler re-entry, REPL displayer) is armed; the fault
// router then redirects straight to the raise trampoline.
thread_local! {
    static SAFE_RESTORE: Cell<usize> = const { Cell::new(0) };
}

pub fn set_safe_restore(token: usize) {
    SAFE_RESTORE.with(|c| c.set(token));
}

pub fn safe_restore() -> usize {
    SAFE_RESTORE.with(|c| c.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_stack_bounds() {
        let task = Task::new(0x8000_0000, 0x10_0000);
        assert!(task.contains(0x8000_0000 - 8));
        assert!(task.contains(0x7FF0_0000 + 8));
        assert!(!task.contains(0x8000_0000));
        assert!(!task.contains(0x7FF0_0000));
    }

    #[test]
    fn test_sig_exception_roundtrip() {
        for exc in [
            SigException::Interrupt,
            SigException::StackOverflow,
            SigException::ReadOnlyMemory,
            SigException::DivideError,
            SigException::Segv,
        ] {
            assert_eq!(SigException::from_raw(exc as u8), Some(exc));
        }
        assert_eq!(SigException::from_raw(0), None);
    }

    #[test]
    fn test_gc_state_from_raw() {
        assert_eq!(GcState::from_raw(0), GcState::Running);
        assert_eq!(GcState::from_raw(1), GcState::Waiting);
        assert_eq!(GcState::from_raw(2), GcState::Safe);
    }

    #[test]
    fn test_signal_stack_bounds_include_guard() {
        let ts = ThreadState::new(5);
        assert!(!ts.on_signal_stack(0x7000_0000));

        let page = crate::util::page::page_size();
        let base = 0x7000_0000usize;
        let size = 1 << 20;
        ts.set_signal_stack(base, size);
        assert!(ts.on_signal_stack(base));
        assert!(ts.on_signal_stack(base + size));
        assert!(ts.on_signal_stack(base - page));
        assert!(!ts.on_signal_stack(base - page - 1));
        assert!(!ts.on_signal_stack(base + size + 1));
    }

    #[test]
    fn test_safe_restore_thread_local() {
        assert_eq!(safe_restore(), 0);
        set_safe_restore(0xdead);
        assert_eq!(safe_restore(), 0xdead);
        set_safe_restore(0);
        let other = std::thread::spawn(|| safe_restore()).join().unwrap();
        assert_eq!(other, 0);
    }
}
