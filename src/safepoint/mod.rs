//! Page-protection safepoints and stop-the-world coordination.
//!
//! Three guard pages back the polling scheme:
//!
//! - slot 0: the SIGINT page, used only by thread 0 to gate user
//!   interrupt delivery
//! - slot 1: the GC page polled by thread 0
//! - slot 2: the GC page polled by every other thread
//!
//! A mutator polls by loading from its safepoint address. While a page
//! is readable the load is free; once a counter enables the page the
//! load faults and the fault router takes over. Worker poll addresses
//! sit one word into slot 2 so a single load covers both the GC word and
//! the pending-interrupt word; thread 0's sits at the start of slot 1 so
//! the word below it lands in the SIGINT page.

mod gc;
mod pages;
mod sigint;

use crate::util::sync::{PosixCondvar, PosixMutex};

// Guards the enable counters, `GC_RUNNING`, and the pending-interrupt
// level. `GC_RUNNING` additionally uses acquire/release so waiters do
// not have to fight over this lock.
pub(crate) static SAFEPOINT_LOCK: PosixMutex = PosixMutex::new();
pub(crate) static SAFEPOINT_COND: PosixCondvar = PosixCondvar::new();

pub use gc::{end_gc, gc_running, set_gc_and_wait, start_gc, wait_gc};
pub use pages::{addr_is_safepoint, enable_counts, gc_poll, init, poll_addr, sigint_poll};
pub use sigint::{consume_sigint, defer_sigint, enable_sigint, pending_level};

pub(crate) use sigint::{check_force_sigint, clear_force_sigint, set_force_sigint};
