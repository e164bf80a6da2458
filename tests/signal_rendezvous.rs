//! Tests for the per-thread suspend/capture/resume rendezvous.
//!
//! These run against real signals: the dedicated user signal is
//! delivered to live worker threads, whose handlers park on the
//! in-signal rendezvous exactly as they would under the listener.

#![cfg(target_os = "linux")]

use anyhow::{bail, ensure, Result};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use qrt::signal;
use qrt::tls::{self, request};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

lazy_static! {
    static ref TEST_LOCK: Mutex<()> = Mutex::new(());
}

fn setup() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        qrt::safepoint::init();
        signal::install_default_signal_handlers().expect("handler installation");
    });
}

/// Spin-loop worker that attaches, reports its tid, and counts until
/// told to stop. On shutdown it reports whether its request word ended
/// balanced.
fn spawn_worker(
    counter: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
) -> (usize, mpsc::Receiver<bool>, std::thread::JoinHandle<()>) {
    let (tid_tx, tid_rx) = mpsc::channel();
    let (balanced_tx, balanced_rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let ts = tls::attach_thread();
        signal::install_thread_signal_handler(&ts).expect("signal stack");
        tid_tx.send(ts.tid()).unwrap();
        while !stop.load(Ordering::Acquire) {
            counter.fetch_add(1, Ordering::Relaxed);
            std::hint::spin_loop();
        }
        let balanced = ts.signal_request.load(Ordering::Acquire) == request::IDLE;
        balanced_tx.send(balanced).unwrap();
        tls::detach_thread();
    });
    let tid = tid_rx.recv().unwrap();
    (tid, balanced_rx, handle)
}

fn wait_for_progress(counter: &AtomicU64, from: u64) -> Result<()> {
    for _ in 0..1000 {
        if counter.load(Ordering::Relaxed) > from {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    bail!("worker made no progress")
}

#[test]
fn suspend_capture_resume_round_trip() -> Result<()> {
    let _guard = TEST_LOCK.lock();
    setup();

    let counter = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let (tid, balanced_rx, handle) = spawn_worker(Arc::clone(&counter), Arc::clone(&stop));

    wait_for_progress(&counter, 0)?;

    let captured = signal::suspend_and_capture(tid);
    ensure!(captured.is_some(), "worker did not acknowledge suspension");
    let captured = captured.unwrap();
    ensure!(
        !captured.as_ptr().is_null(),
        "captured context should be the trapped ucontext"
    );
    signal::resume(tid, 0);

    // The worker keeps running after resume.
    let before = counter.load(Ordering::Relaxed);
    wait_for_progress(&counter, before)?;

    stop.store(true, Ordering::Release);
    let balanced = balanced_rx.recv().unwrap();
    handle.join().unwrap();
    ensure!(balanced, "signal_request should be idle after the round trip");
    Ok(())
}

#[test]
fn repeated_round_trips_stay_balanced() -> Result<()> {
    let _guard = TEST_LOCK.lock();
    setup();

    let counter = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    let (tid, balanced_rx, handle) = spawn_worker(Arc::clone(&counter), Arc::clone(&stop));

    wait_for_progress(&counter, 0)?;
    for _ in 0..10 {
        let captured = signal::suspend_and_capture(tid);
        ensure!(captured.is_some(), "suspension should succeed every time");
        signal::resume(tid, 0);
    }

    stop.store(true, Ordering::Release);
    let balanced = balanced_rx.recv().unwrap();
    handle.join().unwrap();
    ensure!(balanced, "request word must return to idle every cycle");
    Ok(())
}

#[test]
fn suspend_of_unattached_thread_fails_fast() {
    let _guard = TEST_LOCK.lock();
    setup();
    assert!(signal::suspend_and_capture(777).is_none());
}

#[test]
fn suspend_times_out_when_target_blocks_the_signal() -> Result<()> {
    let _guard = TEST_LOCK.lock();
    setup();

    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = Arc::clone(&stop);
    let (tid_tx, tid_rx) = mpsc::channel();
    let (balanced_tx, balanced_rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        // A thread that keeps the suspend signal blocked never enters
        // the rendezvous handler.
        unsafe {
            let mut sset: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut sset);
            libc::sigaddset(&mut sset, libc::SIGUSR2);
            libc::pthread_sigmask(libc::SIG_BLOCK, &sset, std::ptr::null_mut());
        }
        let ts = tls::attach_thread();
        tid_tx.send(ts.tid()).unwrap();
        while !stop2.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(5));
        }
        let balanced = ts.signal_request.load(Ordering::Acquire) == request::IDLE;
        balanced_tx.send(balanced).unwrap();
        tls::detach_thread();
    });
    let tid = tid_rx.recv().unwrap();

    let started = std::time::Instant::now();
    let captured = signal::suspend_and_capture(tid);
    ensure!(captured.is_none(), "listener must give up on a deaf target");
    ensure!(
        started.elapsed() >= Duration::from_millis(900),
        "timeout path should wait out the configured window"
    );

    stop.store(true, Ordering::Release);
    let balanced = balanced_rx.recv().unwrap();
    handle.join().unwrap();
    ensure!(
        balanced,
        "a timed-out request must be rolled back to idle"
    );
    Ok(())
}
