// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle coordination: the load-constructor body, the deferred reporter
//! start, the exit flush, and the child side of fork.
//!
//! The reporter thread is never created from the constructor. Some targets
//! (Chromium-descended sandboxes, some shell scripts) refuse to run when an
//! extra thread exists before their own initialization, so the constructor
//! arms a one-shot POSIX timer that delivers the startup signal after one
//! reporting interval; the signal handler creates the thread. The `sigaction`
//! interceptor keeps a target-installed handler for that signal from
//! displacing ours: while armed, the target's handler is captured and then
//! installed for real once the reporter exists.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering::SeqCst};

use crate::agent::Agent;
use crate::config::{self, AgentConfig};
use crate::transport::Endpoint;
use crate::{fntable, logging, reporter};

/// The startup signal. Real-time-adjacent and unreserved by the runtimes we
/// load into.
pub const STARTUP_SIGNAL: libc::c_int = libc::SIGUSR2;

static ARMED: AtomicBool = AtomicBool::new(false);
static ONCE_STARTED: AtomicBool = AtomicBool::new(false);
static THREAD_SERIALIZE: AtomicU64 = AtomicU64::new(0);
/// Target-installed SIGUSR2 handler awaiting installation, boxed via
/// `Box::into_raw`.
static SAVED_HANDLER: AtomicPtr<libc::sigaction> = AtomicPtr::new(ptr::null_mut());

type SigactionFn = unsafe extern "C" fn(
    libc::c_int,
    *const libc::sigaction,
    *mut libc::sigaction,
) -> libc::c_int;

/// The module constructor body. Runs before the target's `main`.
pub fn startup() {
    // The constructor's own transport setup is agent work, not target
    // activity; keep it out of the stores.
    let _section = crate::hooks::AgentSection::enter();
    let resolved = fntable::resolve_all();

    logging::init();
    let cfg = AgentConfig::load();
    let control = Endpoint::parse(&cfg.control_dest).unwrap_or(Endpoint::Null);
    let interval = cfg.interval;
    let agent = Agent::initialize(control);
    config::publish(cfg);

    log::info!(
        "loaded into pid {} ({resolved}/{} symbols bound, version {})",
        agent.proc_pid(),
        fntable::SYMBOL_COUNT,
        env!("CARGO_PKG_VERSION"),
    );
    let missing = fntable::mandatory_missing();
    if !missing.is_empty() {
        log::error!("mandatory symbols missing, monitoring degraded: {missing:?}");
    }
    if !agent.clock.tsc_invariant() {
        log::error!("TSC is not invariant; durations use the monotonic clock");
    }

    if let Ok(mut ctl) = agent.ctl.lock() {
        if ctl.needs_connection() {
            ctl.connect().ok();
        }
    }

    reporter::report_process_start(agent);

    // SAFETY: exit_flush is an extern "C" fn with no preconditions.
    if unsafe { libc::atexit(exit_flush) } != 0 {
        log::error!("atexit registration failed; final flush disabled");
    }

    ARMED.store(true, SeqCst);
    install_startup_handler();
    arm_start_timer(interval);
}

extern "C" fn exit_flush() {
    reporter::handle_exit();
}

extern "C" fn startup_signal_handler(_sig: libc::c_int) {
    thread_now();
}

/// Create the reporter thread, at most once per process lifetime. Runs from
/// the startup-signal handler and from the fork-child re-arm.
pub(crate) fn thread_now() {
    if THREAD_SERIALIZE.compare_exchange(0, 1, SeqCst, SeqCst).is_err() {
        return;
    }
    if !ONCE_STARTED.load(SeqCst) {
        match std::thread::Builder::new()
            .name("procsight-reporter".to_string())
            .spawn(reporter::run)
        {
            Ok(_) => {
                ONCE_STARTED.store(true, SeqCst);
                restore_target_handler();
            }
            Err(err) => log::error!("reporter thread creation failed: {err}"),
        }
    }
    THREAD_SERIALIZE.store(0, SeqCst);
}

/// Install our handler for the startup signal through the real `sigaction`.
/// Going through the table matters: a plain libc call from inside this
/// module would bind to our own interposer.
fn install_startup_handler() {
    let Some(real): Option<SigactionFn> = fntable::SIGACTION.typed() else {
        log::error!("sigaction unavailable; deferred start disabled");
        return;
    };
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction =
        startup_signal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
    action.sa_flags = libc::SA_RESTART;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        real(STARTUP_SIGNAL, &action, ptr::null_mut());
    }
}

/// Hand the startup signal back to the target: install whatever handler it
/// tried to register while we were armed.
fn restore_target_handler() {
    let saved = SAVED_HANDLER.swap(ptr::null_mut(), SeqCst);
    if saved.is_null() {
        return;
    }
    if let Some(real) = fntable::SIGACTION.typed::<SigactionFn>() {
        unsafe { real(STARTUP_SIGNAL, saved, ptr::null_mut()) };
    }
    // The box is leaked on purpose: this can run in signal context, where
    // the allocator is off limits, and it happens once per process.
}

/// The `sigaction` interceptor calls this for every target registration.
/// Returns true when the registration was captured (startup signal, armed,
/// reporter not yet running) and must not reach the real `sigaction`.
pub fn observe_sigaction(signum: libc::c_int, act: *const libc::sigaction) -> bool {
    if signum != STARTUP_SIGNAL
        || act.is_null()
        || !ARMED.load(SeqCst)
        || ONCE_STARTED.load(SeqCst)
    {
        return false;
    }
    // Copy out of the caller's storage; the pointer may be to stack memory.
    let boxed = Box::into_raw(Box::new(unsafe { *act }));
    let old = SAVED_HANDLER.swap(boxed, SeqCst);
    if !old.is_null() {
        // Target thread context, not signal context; freeing is fine here.
        drop(unsafe { Box::from_raw(old) });
    }
    true
}

/// One-shot timer delivering the startup signal after `interval_secs`.
fn arm_start_timer(interval_secs: u64) {
    let mut event: libc::sigevent = unsafe { std::mem::zeroed() };
    event.sigev_notify = libc::SIGEV_SIGNAL;
    event.sigev_signo = STARTUP_SIGNAL;

    let mut timer: libc::timer_t = ptr::null_mut();
    // SAFETY: event and timer are valid out-pointers.
    if unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut event, &mut timer) } != 0 {
        log::error!("timer_create failed; starting the reporter immediately");
        thread_now();
        return;
    }
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: interval_secs.max(1) as libc::time_t,
            tv_nsec: 0,
        },
    };
    if unsafe { libc::timer_settime(timer, 0, &spec, ptr::null_mut()) } != 0 {
        log::error!("timer_settime failed; starting the reporter immediately");
        thread_now();
    }
}

/// Full reset on the child side of fork: new identity, zeroed stores, a
/// fresh control connection, and a re-armed deferred start.
pub fn at_fork_child() {
    let Some(agent) = Agent::get() else { return };
    let _section = crate::hooks::AgentSection::enter();

    agent.reset_for_fork();

    ONCE_STARTED.store(false, SeqCst);
    THREAD_SERIALIZE.store(0, SeqCst);

    if let Ok(mut ctl) = agent.ctl.lock() {
        ctl.disconnect();
        ctl.connect().ok();
    }

    reporter::report_process_start(agent);

    // POSIX timers do not survive fork; arm a fresh one.
    install_startup_handler();
    arm_start_timer(reporter::interval_secs());
}

#[cfg(test)]
pub(crate) fn arm_for_test(armed: bool) {
    ARMED.store(armed, SeqCst);
    ONCE_STARTED.store(false, SeqCst);
}

#[cfg(test)]
pub(crate) fn saved_handler_for_test() -> *mut libc::sigaction {
    SAVED_HANDLER.load(SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{test_agent, test_guard};
    use std::sync::atomic::Ordering::SeqCst;

    #[test]
    fn sigaction_capture_only_applies_while_armed() {
        let _guard = test_guard();
        let action: libc::sigaction = unsafe { std::mem::zeroed() };

        arm_for_test(false);
        assert!(!observe_sigaction(STARTUP_SIGNAL, &action));

        arm_for_test(true);
        assert!(!observe_sigaction(libc::SIGTERM, &action));
        assert!(observe_sigaction(STARTUP_SIGNAL, &action));
        assert!(!saved_handler_for_test().is_null());

        // Re-registration replaces the saved handler without leaking the
        // old copy.
        assert!(observe_sigaction(STARTUP_SIGNAL, &action));

        arm_for_test(false);
        let leak = SAVED_HANDLER.swap(std::ptr::null_mut(), SeqCst);
        if !leak.is_null() {
            drop(unsafe { Box::from_raw(leak) });
        }
    }

    #[test]
    fn fork_reset_rebuilds_identity_and_zeroes_stores() {
        let _guard = test_guard();
        let agent = test_agent();
        agent.agg.fs_read_bytes.fetch_add(123, SeqCst);
        agent.fds.open_for(950, crate::state::FdKind::File, Some("/inherited"));

        agent.reset_for_fork();

        assert_eq!(agent.agg.fs_read_bytes.load(SeqCst), 0);
        assert!(agent.fds.get(950).is_none());
        assert_eq!(agent.proc_pid(), std::process::id());
    }
}
