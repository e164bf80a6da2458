//! # QRT: Safepoint & Signal Coordination for the Quill Runtime
//!
//! QRT is the stop-the-world and asynchronous-signal core of the Quill
//! managed runtime: it halts mutator threads at well-defined points so a
//! garbage collection can proceed, and it delivers user interrupts,
//! profiler samples, and termination requests into a running program
//! while respecting the GC phase and each thread's signal-deferral
//! state.
//!
//! ## Safepoints
//!
//! Three guard pages back the polling scheme. A mutator polls by
//! loading from its safepoint address; while the page is readable the
//! poll costs one load. Starting a collection flips the pages to
//! no-access, so the next poll takes a memory fault that the fault
//! router turns into a GC wait:
//!
//! ```text
//! ┌──────────────┬──────────────────┬──────────────────┐
//! │ slot 0       │ slot 1           │ slot 2           │
//! │ SIGINT page  │ master GC page   │ worker GC page   │
//! │ (thread 0)   │ (thread 0 polls) │ (workers poll)   │
//! └──────────────┴──────────────────┴──────────────────┘
//! ```
//!
//! Each page carries an enable counter (GC and SIGINT may each hold one
//! enable), so interrupt gating and collection compose without stepping
//! on each other.
//!
//! ## Signals
//!
//! A dedicated listener thread owns the process signal mask and fans
//! signals out: `SIGINT` raises the pending-interrupt level so thread
//! 0's polls trap; profile timer ticks suspend each thread in turn and
//! sample its register context; fatal signals collect backtraces and
//! drive an orderly exit through thread 0. Faults are classified by
//! address (safepoint poll, task stack overflow, signal-stack
//! overflow, read-only write) and surface as exceptions injected by
//! rewriting the trapped register context.
//!
//! ## Usage sketch
//!
//! ```no_run
//! use qrt::SignalConfig;
//!
//! fn main() -> qrt::Result<()> {
//!     let ts = qrt::init(&SignalConfig::default())?;
//!
//!     // ... attach worker threads, publish their tasks ...
//!
//!     // A long-running loop polls for pending GC / interrupts:
//!     qrt::safepoint::gc_poll(&ts);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`safepoint`]: guard pages, collector election, interrupt levels
//! - [`signal`]: handler installation, fault routing, thread
//!   suspension, the listener thread
//! - [`profile`]: the sample buffer and the sampling timer
//! - [`tls`]: per-thread state shared with the signal layer
//! - [`config`], [`error`], [`hooks`]: configuration, error types, and
//!   embedder integration points

#[cfg(not(unix))]
compile_error!("qrt requires POSIX signal delivery and user-mode page-fault handling");

pub mod config;
pub mod error;
pub mod hooks;
pub mod profile;
pub mod safepoint;
pub mod signal;
pub mod tls;
mod util;

pub use config::SignalConfig;
pub use error::{Result, RtError};
pub use tls::{GcState, SigException, Task, ThreadState};

/// QRT version string from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bring up the safepoint/signal core on the calling thread, which
/// becomes thread 0: allocate the safepoint pages, attach the thread,
/// install the process handler set and this thread's signal stack, and
/// start the listener.
pub fn init(config: &SignalConfig) -> Result<std::sync::Arc<ThreadState>> {
    safepoint::init();
    let ts = tls::attach_thread();
    signal::install_default_signal_handlers()?;
    signal::install_thread_signal_handler(&ts)?;
    signal::restore_signals(config)?;
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_default_config_validates() {
        assert!(SignalConfig::default().validate().is_ok());
    }
}
