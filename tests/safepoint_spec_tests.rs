//! Specification-based tests for the safepoint core.
//!
//! These tests exercise the published safepoint contract: enable-counter
//! balance, collector election, the pending-interrupt cascade, and the
//! poll address layout. The safepoint state is process-global, so every
//! test serializes through TEST_LOCK and detaches whatever it attached.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use qrt::safepoint;
use qrt::tls::{self, GcState};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::Duration;

lazy_static! {
    static ref TEST_LOCK: Mutex<()> = Mutex::new(());
}

/// Attaches the calling thread and detaches it when dropped.
struct Attached;

impl Attached {
    fn new() -> Self {
        safepoint::init();
        tls::attach_thread();
        Attached
    }
}

impl Drop for Attached {
    fn drop(&mut self) {
        tls::detach_thread();
    }
}

/// Park a helper thread so the GC slow path (more than one attached
/// thread) is taken. Returns a handle that releases the helper.
fn parked_helper() -> (mpsc::Sender<()>, std::thread::JoinHandle<()>) {
    let (release_tx, release_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        tls::attach_thread();
        ready_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        tls::detach_thread();
    });
    ready_rx.recv().unwrap();
    (release_tx, handle)
}

#[test]
fn spec_poll_addresses_lie_in_page_region() {
    let _guard = TEST_LOCK.lock();
    let _main = Attached::new();
    let ts = tls::current().expect("attached");

    // The predicate holds exactly on the three-page region.
    let page = page_size::get();
    let base = safepoint::poll_addr(ts) - page; // thread 0 polls slot 1
    assert!(!safepoint::addr_is_safepoint(base - 1));
    assert!(safepoint::addr_is_safepoint(base));
    assert!(safepoint::addr_is_safepoint(base + 3 * page - 1));
    assert!(!safepoint::addr_is_safepoint(base + 3 * page));

    // With nothing enabled, polls are plain loads.
    safepoint::gc_poll(ts);
    safepoint::sigint_poll(ts);
}

#[test]
fn spec_lone_thread_gc_skips_the_lock() {
    let _guard = TEST_LOCK.lock();
    let _main = Attached::new();

    assert!(!safepoint::gc_running());
    assert!(safepoint::start_gc());
    assert!(safepoint::gc_running());
    // Single-thread fast path must not touch the pages.
    assert_eq!(safepoint::enable_counts(), [0, 0, 0]);
    safepoint::end_gc();
    assert!(!safepoint::gc_running());

    // Election works again immediately.
    assert!(safepoint::start_gc());
    safepoint::end_gc();
}

#[test]
fn spec_contended_gc_elects_exactly_one_collector() {
    let _guard = TEST_LOCK.lock();
    let _main = Attached::new();

    let (results_tx, results_rx) = mpsc::channel();
    let barrier = std::sync::Arc::new(std::sync::Barrier::new(4));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let tx = results_tx.clone();
        let barrier = std::sync::Arc::clone(&barrier);
        handles.push(std::thread::spawn(move || {
            let ts = tls::attach_thread();
            ts.gc_state
                .store(GcState::Waiting as i8, Ordering::Release);
            barrier.wait();
            let elected = safepoint::start_gc();
            if elected {
                // Worker GC page must be inaccessible while we collect.
                assert_eq!(safepoint::enable_counts()[2], 1);
                std::thread::sleep(Duration::from_millis(30));
                safepoint::end_gc();
            } else {
                // Losers return only after the collection has ended.
                assert!(!safepoint::gc_running());
            }
            ts.gc_state
                .store(GcState::Running as i8, Ordering::Release);
            tx.send(elected).unwrap();
            tls::detach_thread();
        }));
    }
    drop(results_tx);

    let elected: Vec<bool> = results_rx.iter().collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(elected.len(), 4);
    assert_eq!(elected.iter().filter(|&&e| e).count(), 1);

    // Balanced start/end leaves every counter at zero and the pages
    // readable again.
    assert_eq!(safepoint::enable_counts(), [0, 0, 0]);
    let ts = tls::current().expect("attached");
    safepoint::gc_poll(ts);
}

#[test]
fn spec_sigint_cascade_restores_page_state() {
    let _guard = TEST_LOCK.lock();
    let _main = Attached::new();
    let (release, helper) = parked_helper();

    // Enable then consume returns the level to 0 and both pages to
    // their prior protection.
    assert_eq!(safepoint::pending_level(), 0);
    safepoint::enable_sigint();
    assert_eq!(safepoint::pending_level(), 2);
    assert_eq!(safepoint::enable_counts(), [1, 1, 0]);
    // Idempotent above level 2.
    safepoint::enable_sigint();
    assert_eq!(safepoint::enable_counts(), [1, 1, 0]);

    assert!(safepoint::consume_sigint());
    assert_eq!(safepoint::pending_level(), 0);
    assert_eq!(safepoint::enable_counts(), [0, 0, 0]);

    // Nothing pending: consume reports false.
    assert!(!safepoint::consume_sigint());

    release.send(()).unwrap();
    helper.join().unwrap();
}

#[test]
fn spec_deferred_sigint_drops_only_the_gc_page() {
    let _guard = TEST_LOCK.lock();
    let _main = Attached::new();
    let (release, helper) = parked_helper();

    safepoint::enable_sigint();
    assert_eq!(safepoint::enable_counts(), [1, 1, 0]);

    // Deferral keeps the interrupt pending but stops GC-page traps.
    safepoint::defer_sigint();
    assert_eq!(safepoint::pending_level(), 1);
    assert_eq!(safepoint::enable_counts(), [1, 0, 0]);

    // Deferring twice is a no-op.
    safepoint::defer_sigint();
    assert_eq!(safepoint::enable_counts(), [1, 0, 0]);

    // Re-raising steps back up to 2; consuming clears everything.
    safepoint::enable_sigint();
    assert_eq!(safepoint::enable_counts(), [1, 1, 0]);
    assert!(safepoint::consume_sigint());
    assert_eq!(safepoint::enable_counts(), [0, 0, 0]);

    release.send(()).unwrap();
    helper.join().unwrap();
}

#[test]
fn spec_sigint_survives_gc_teardown() {
    let _guard = TEST_LOCK.lock();
    let _main = Attached::new();
    let (release, helper) = parked_helper();

    let ts = tls::current().expect("attached");
    ts.gc_state
        .store(GcState::Waiting as i8, Ordering::Release);
    assert!(safepoint::start_gc());
    assert_eq!(safepoint::enable_counts(), [0, 1, 1]);

    // The listener raises an interrupt mid-collection: the master GC
    // page picks up a second enable.
    safepoint::enable_sigint();
    assert_eq!(safepoint::enable_counts(), [1, 2, 1]);

    // Ending the GC must leave slot 1 inaccessible for the pending
    // interrupt even though the GC enable was dropped.
    safepoint::end_gc();
    ts.gc_state
        .store(GcState::Running as i8, Ordering::Release);
    assert_eq!(safepoint::enable_counts(), [1, 1, 0]);
    assert_eq!(safepoint::pending_level(), 2);

    assert!(safepoint::consume_sigint());
    assert_eq!(safepoint::enable_counts(), [0, 0, 0]);

    release.send(()).unwrap();
    helper.join().unwrap();
}

#[test]
fn spec_wait_gc_returns_once_collection_ends() {
    let _guard = TEST_LOCK.lock();
    let _main = Attached::new();
    let (release, helper) = parked_helper();

    let ts = tls::current().expect("attached");
    ts.gc_state
        .store(GcState::Waiting as i8, Ordering::Release);
    assert!(safepoint::start_gc());

    let (done_tx, done_rx) = mpsc::channel();
    let waiter = std::thread::spawn(move || {
        let ts = tls::attach_thread();
        ts.gc_state
            .store(GcState::Waiting as i8, Ordering::Release);
        safepoint::wait_gc();
        assert!(!safepoint::gc_running());
        done_tx.send(()).unwrap();
        tls::detach_thread();
    });

    // The waiter must still be blocked while the collection runs.
    assert!(done_rx
        .recv_timeout(Duration::from_millis(100))
        .is_err());
    safepoint::end_gc();
    ts.gc_state
        .store(GcState::Running as i8, Ordering::Release);
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("waiter should wake after end_gc");
    waiter.join().unwrap();

    release.send(()).unwrap();
    helper.join().unwrap();
}

#[test]
fn spec_attach_detach_balances_registry() {
    let _guard = TEST_LOCK.lock();
    assert_eq!(tls::n_threads(), 0);
    {
        let _main = Attached::new();
        assert_eq!(tls::n_threads(), 1);
        let handle = std::thread::spawn(|| {
            let ts = tls::attach_thread();
            let tid = ts.tid();
            assert!(tid > 0);
            tls::detach_thread();
        });
        handle.join().unwrap();
        assert_eq!(tls::n_threads(), 1);
    }
    assert_eq!(tls::n_threads(), 0);
}
