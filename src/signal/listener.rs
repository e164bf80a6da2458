//! The signal-listener thread.
//!
//! All monitored signals are blocked process-wide; the listener is the
//! one thread that receives them, synchronously, and dispatches:
//! interrupt delivery to thread 0, profile sampling passes, stack dumps,
//! and orderly process termination.

use super::rendezvous::{self, SUSPEND_SIG};
use super::{ctx, fault};
use crate::config::{self, SignalConfig};
use crate::error::{Result, RtError};
use crate::hooks;
use crate::profile;
use crate::safepoint;
use crate::tls::{self, request, MAX_BT_SIZE};
use crate::util::time::hrtime;
use cfg_if::cfg_if;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::thread::JoinHandle;

lazy_static! {
    static ref LISTENER_HANDLE: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);
}

// Written only by the listener, read by thread 0 in its exit callback.
static THREAD0_EXIT_COUNT: AtomicU32 = AtomicU32::new(0);
static THREAD0_EXIT_STATE: AtomicI32 = AtomicI32::new(0);

/// The signals owned by the listener. Everything else stays
/// handler-driven.
fn listener_sigset() -> libc::sigset_t {
    unsafe {
        let mut sset: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut sset);
        libc::sigaddset(&mut sset, libc::SIGINT);
        libc::sigaddset(&mut sset, libc::SIGTERM);
        libc::sigaddset(&mut sset, libc::SIGABRT);
        libc::sigaddset(&mut sset, libc::SIGQUIT);
        #[cfg(target_os = "linux")]
        {
            libc::sigaddset(&mut sset, libc::SIGUSR1);
        }
        #[cfg(not(target_os = "linux"))]
        {
            libc::sigaddset(&mut sset, libc::SIGINFO);
            libc::sigaddset(&mut sset, libc::SIGPROF);
        }
        sset
    }
}

cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn is_info_sig(sig: i32) -> bool {
            sig == libc::SIGUSR1
        }

        /// Wait for one listener signal. Returns `None` on EINTR.
        /// `true` in the pair means the signal came from the profile
        /// timer (SI_TIMER with our tag), not a user.
        fn wait_for_signal(sset: &libc::sigset_t) -> Option<(i32, bool)> {
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            let sig = unsafe { libc::sigwaitinfo(sset, &mut info) };
            if sig == -1 {
                if crate::util::errno() == libc::EINTR {
                    return None;
                }
                // Only reachable if the sigset was corrupted.
                return Some((libc::SIGABRT, false));
            }
            let mut from_timer = sig == libc::SIGUSR1;
            if from_timer
                && !(info.si_code == libc::SI_TIMER
                    && unsafe { info.si_value().sival_ptr } as usize == profile::timer_tag())
            {
                from_timer = false;
            }
            Some((sig, from_timer))
        }
    } else {
        fn is_info_sig(sig: i32) -> bool {
            sig == libc::SIGINFO
        }

        fn wait_for_signal(sset: &libc::sigset_t) -> Option<(i32, bool)> {
            let mut sig: libc::c_int = 0;
            if unsafe { libc::sigwait(sset, &mut sig) } != 0 {
                return Some((libc::SIGABRT, false));
            }
            Some((sig, sig == libc::SIGPROF))
        }
    }
}

/// Block the listener's signal set for the calling thread (inherited by
/// threads it spawns) and start the listener.
pub fn restore_signals(cfg: &SignalConfig) -> Result<()> {
    cfg.validate()?;
    config::apply(cfg);
    let sset = listener_sigset();
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, &sset, std::ptr::null_mut());
    }
    let mut guard = LISTENER_HANDLE.lock();
    if guard.is_some() {
        return Err(RtError::ListenerSpawn(
            "signal listener already running".to_string(),
        ));
    }
    let handle = std::thread::Builder::new()
        .name("qrt-signal-listener".to_string())
        .spawn(signal_listener)
        .map_err(|e| RtError::ListenerSpawn(e.to_string()))?;
    *guard = Some(handle);
    log::debug!("signal listener started");
    Ok(())
}

fn signal_listener() {
    let mut bt_data = vec![0u64; MAX_BT_SIZE + 1];
    let sset = listener_sigset();
    loop {
        let Some((sig, profile_sig)) = wait_for_signal(&sset) else {
            continue;
        };

        let mut critical;
        if sig == libc::SIGINT {
            if config::ignore_sigint() {
                continue;
            } else if config::exit_on_sigint() {
                critical = true;
            } else {
                try_deliver_sigint();
                continue;
            }
        } else {
            critical = false;
        }

        critical |= sig == libc::SIGTERM;
        critical |= sig == libc::SIGABRT;
        critical |= sig == libc::SIGQUIT;
        critical |= is_info_sig(sig) && !profile_sig;

        let mut doexit = critical;
        if is_info_sig(sig) {
            if !profile_sig && !profile::is_running() && profile::timer_graceperiod_elapsed() {
                trigger_profile_peek();
            }
            doexit = false;
        }

        let mut bt_size = 0usize;
        if critical || profile_sig {
            sample_all_threads(critical, profile_sig, sig, &mut bt_data, &mut bt_size);
        }

        if profile_sig && profile::is_running() {
            profile::check_autostop();
            profile::rearm_timer();
        }

        if critical {
            if doexit {
                THREAD0_EXIT_COUNT.fetch_add(1, Ordering::Relaxed);
                exit_thread_zero(128 + sig, &bt_data[..bt_size]);
            } else {
                print_stack_dump(sig, &bt_data[..bt_size]);
            }
        }
    }
}

/// Stop every thread in turn and collect what the signal asked for:
/// backtraces into `bt_data` for critical signals, samples into the
/// profile buffer for the profiler. Threads are walked in reverse order
/// (thread zero last) or, when profiling, in a fresh random permutation.
fn sample_all_threads(
    critical: bool,
    profile_sig: bool,
    sig: i32,
    bt_data: &mut [u64],
    bt_size: &mut usize,
) {
    let _pass = profile::pass_lock();
    let nslots = tls::n_slots();
    if nslots == 0 {
        return;
    }
    let perm = if profile_sig {
        profile::get_randperm(nslots)
    } else {
        Vec::new()
    };
    for idx in (0..nslots).rev() {
        let tid = if profile_sig { perm[idx] } else { idx };
        let Some(ts) = tls::get_state(tid) else {
            continue;
        };
        let Some(captured) = rendezvous::suspend_and_capture(tid) else {
            continue;
        };

        // This part must stay signal-handler safe on the target's
        // behalf: the suspended thread may sit anywhere.
        if critical {
            let budget = (bt_data.len() / nslots).saturating_sub(1);
            let end = (*bt_size + budget).min(bt_data.len() - 1);
            let n = unsafe {
                ctx::record_backtrace_ctx(&ts, captured.as_ptr(), &mut bt_data[*bt_size..end])
            };
            *bt_size += n;
            bt_data[*bt_size] = 0;
            *bt_size += 1;
        }

        if profile_sig && profile::is_running() {
            if profile::is_buffer_full() {
                profile::stop_timer();
            } else {
                profile::record_sample(&ts, &captured);
            }
        }

        rendezvous::resume(tid, sig);
    }
}

fn print_stack_dump(sig: i32, bt_data: &[u64]) {
    let mut nrunning = 0;
    for tid in 0..tls::n_slots() {
        if let Some(ts) = tls::get_state(tid) {
            if ts.sleep_check_state.load(Ordering::Relaxed) == 0 {
                nrunning += 1;
            }
        }
    }
    eprintln!(
        "\nsignal ({}): pid {}, {} of {} threads running",
        sig,
        std::process::id(),
        nrunning,
        tls::n_threads()
    );
    for &frame in bt_data {
        if frame == 0 {
            eprintln!();
        } else {
            eprintln!("  {frame:#018x}");
        }
    }
}

/// Raise the interrupt flag visible to pollers and nudge thread 0: wake
/// the event loop, then post a sigint-check request so a thread parked
/// in I/O evaluates delivery immediately.
fn try_deliver_sigint() {
    if safepoint::pending_level() > 0 {
        // A second interrupt before the first was consumed: force the
        // next delivery through defer and io-wait.
        safepoint::set_force_sigint();
    }
    safepoint::enable_sigint();
    hooks::wake_event_loop();
    if let Some(ts0) = tls::get_state(0) {
        ts0.signal_request
            .store(request::SIGINT_CHECK, Ordering::Release);
        // This also makes sure an in-progress sleep is aborted.
        unsafe {
            libc::pthread_kill(ts0.system_id(), SUSPEND_SIG);
        }
    }
}

fn trigger_profile_peek() {
    let dur_ns = config::profile_peek_ns();
    eprintln!("\n======================================================================================");
    eprintln!(
        "Information request received. A stacktrace will print followed by a {:.1} second profile",
        dur_ns as f64 / 1e9
    );
    eprintln!("======================================================================================");
    if profile::buffer_capacity() == 0 {
        let nthreads = tls::n_threads().max(1);
        if profile::init(10_000_000 * nthreads, 1_000_000).is_err() {
            eprintln!("ERROR: could not initialize the profile buffer");
            return;
        }
    }
    profile::clear();
    if profile::start_timer().is_err() {
        eprintln!("ERROR: could not start profile timer");
    } else {
        profile::set_autostop(hrtime() + dur_ns);
    }
}

/// Drive thread 0 through an orderly exit. The first request suspends
/// thread 0, plants the collected backtrace in its TLS, and resumes it
/// into the exit callback; a second posts the exit request directly; any
/// further request exits on the spot.
pub(crate) fn exit_thread_zero(state: i32, bt: &[u64]) {
    if THREAD0_EXIT_COUNT.load(Ordering::Relaxed) <= 1 {
        if let Some(_captured) = rendezvous::suspend_and_capture(0) {
            THREAD0_EXIT_STATE.store(state, Ordering::Release);
            if let Some(ts0) = tls::get_state(0) {
                unsafe {
                    let buf = ts0.bt_data_mut();
                    let n = bt.len().min(buf.len());
                    buf[..n].copy_from_slice(&bt[..n]);
                    ts0.set_bt_size(n);
                }
            }
            rendezvous::resume(0, -1);
            return;
        }
    }
    THREAD0_EXIT_STATE.store(state, Ordering::Release);
    if let Some(ts0) = tls::get_state(0) {
        ts0.signal_request.store(request::EXIT, Ordering::Release);
        unsafe {
            libc::pthread_kill(ts0.system_id(), SUSPEND_SIG);
        }
    }
}

/// Runs on thread 0's signal stack after context injection. Exiting can
/// stick at an unfortunate spot, so each repeated request tries harder.
pub(crate) unsafe extern "C" fn exit_thread0_cb() -> ! {
    let count = THREAD0_EXIT_COUNT.load(Ordering::Relaxed);
    let state = THREAD0_EXIT_STATE.load(Ordering::Acquire);
    if count <= 1 {
        fault::critical_error(state - 128, std::ptr::null_mut());
        hooks::exit(state);
    } else if count == 2 {
        std::process::exit(state);
    } else {
        libc::_exit(state);
    }
}
