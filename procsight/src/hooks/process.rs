// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-shaped interceptors: fork, prctl, the variadic `syscall`
//! trampoline, sigaction, and the scheduling/wait pass-throughs.

use std::os::raw::{c_int, c_long};

use crate::lifecycle;
use crate::state;
use crate::state::aggregates::ErrorClass;

use super::fs::real_or;
use super::net::{abort_accepted, do_accept};
use super::{agent, set_errno, ErrnoGuard};

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn fork() -> libc::pid_t {
    let real = real_or!(FORK, unsafe extern "C" fn() -> libc::pid_t, -1);
    let rc = real();
    if rc == 0 {
        // Child side: new identity, cleared stores, re-armed reporter.
        let _errno = ErrnoGuard::capture();
        lifecycle::at_fork_child();
    }
    rc
}

/// `PR_SET_SECCOMP` is swallowed: the target keeps running unfiltered so the
/// interposed calls it makes on our behalf stay permitted. Everything else
/// forwards.
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn prctl(
    option: c_int,
    arg2: libc::c_ulong,
    arg3: libc::c_ulong,
    arg4: libc::c_ulong,
    arg5: libc::c_ulong,
) -> c_int {
    let real = real_or!(
        PRCTL,
        unsafe extern "C" fn(
            c_int,
            libc::c_ulong,
            libc::c_ulong,
            libc::c_ulong,
            libc::c_ulong,
        ) -> c_int,
        -1
    );
    if option == libc::PR_SET_SECCOMP {
        return 0;
    }
    real(option, arg2, arg3, arg4, arg5)
}

/// The loader calls `syscall` (for `mmap`, at least) before the constructor
/// body finishes. Nothing on this path may allocate until the agent check
/// passes; the slot itself resolves via a bare `dlsym`.
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn syscall(
    number: c_long,
    a1: c_long,
    a2: c_long,
    a3: c_long,
    a4: c_long,
    a5: c_long,
    a6: c_long,
) -> c_long {
    let real = real_or!(
        SYSCALL,
        unsafe extern "C" fn(
            c_long,
            c_long,
            c_long,
            c_long,
            c_long,
            c_long,
            c_long,
        ) -> c_long,
        -1
    );

    // accept4 arrives here from libuv-based targets; classify it exactly
    // like the accept4 interceptor, block predicate included.
    if number == libc::SYS_accept4 {
        let rc = real(number, a1, a2, a3, a4, 0, 0);
        let listener = a1 as c_int;
        if rc != -1 {
            if let Some(agent) = agent() {
                if agent.listener_blocked(listener) {
                    abort_accepted(rc as c_int);
                    agent.agg.error(ErrorClass::NetConn);
                    set_errno(libc::ECONNABORTED);
                    return -1;
                }
                let _errno = ErrnoGuard::capture();
                let addr = a2 as *mut libc::sockaddr;
                let addrlen = a3 as *mut libc::socklen_t;
                let peer = if addr.is_null() || addrlen.is_null() {
                    None
                } else {
                    state::sockaddr_to_addr(addr, *addrlen)
                };
                do_accept(rc as c_int, listener, peer, "accept4");
            }
        } else if let Some(agent) = agent() {
            let _errno = ErrnoGuard::capture();
            agent.agg.error(ErrorClass::NetConn);
        }
        return rc;
    }

    real(number, a1, a2, a3, a4, a5, a6)
}

/// Keeps the startup signal ours while the deferred start is armed; the
/// captured handler is installed for real once the reporter thread exists.
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn sigaction(
    signum: c_int,
    act: *const libc::sigaction,
    oldact: *mut libc::sigaction,
) -> c_int {
    let real = real_or!(
        SIGACTION,
        unsafe extern "C" fn(c_int, *const libc::sigaction, *mut libc::sigaction) -> c_int,
        -1
    );
    if lifecycle::observe_sigaction(signum, act) {
        return 0;
    }
    real(signum, act, oldact)
}

// Pass-throughs: the binding to the real symbol is recorded, no metric
// update fires.

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn nanosleep(
    req: *const libc::timespec,
    rem: *mut libc::timespec,
) -> c_int {
    let real = real_or!(
        NANOSLEEP,
        unsafe extern "C" fn(*const libc::timespec, *mut libc::timespec) -> c_int,
        -1
    );
    real(req, rem)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn epoll_wait(
    epfd: c_int,
    events: *mut libc::epoll_event,
    maxevents: c_int,
    timeout: c_int,
) -> c_int {
    let real = real_or!(
        EPOLL_WAIT,
        unsafe extern "C" fn(c_int, *mut libc::epoll_event, c_int, c_int) -> c_int,
        -1
    );
    real(epfd, events, maxevents, timeout)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn select(
    nfds: c_int,
    readfds: *mut libc::fd_set,
    writefds: *mut libc::fd_set,
    exceptfds: *mut libc::fd_set,
    timeout: *mut libc::timeval,
) -> c_int {
    let real = real_or!(
        SELECT,
        unsafe extern "C" fn(
            c_int,
            *mut libc::fd_set,
            *mut libc::fd_set,
            *mut libc::fd_set,
            *mut libc::timeval,
        ) -> c_int,
        -1
    );
    real(nfds, readfds, writefds, exceptfds, timeout)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn sigsuspend(mask: *const libc::sigset_t) -> c_int {
    let real = real_or!(
        SIGSUSPEND,
        unsafe extern "C" fn(*const libc::sigset_t) -> c_int,
        -1
    );
    real(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_guard;

    #[test]
    fn prctl_swallows_seccomp() {
        let rc = unsafe { prctl(libc::PR_SET_SECCOMP, 1, 0, 0, 0) };
        assert_eq!(rc, 0);
    }

    #[test]
    fn prctl_forwards_other_options() {
        // PR_GET_DUMPABLE round-trips through the real prctl.
        let rc = unsafe { prctl(libc::PR_GET_DUMPABLE, 0, 0, 0, 0) };
        assert!(rc == 0 || rc == 1 || rc == 2);
    }

    #[test]
    fn syscall_trampoline_forwards_unhandled_numbers() {
        let pid = unsafe { syscall(libc::SYS_getpid, 0, 0, 0, 0, 0, 0) };
        assert_eq!(pid, std::process::id() as c_long);
    }

    #[test]
    fn sigaction_forwards_when_not_armed() {
        let _guard = test_guard();
        crate::lifecycle::arm_for_test(false);
        let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
        // Query-only call (null act) must reach the real sigaction.
        let rc = unsafe { sigaction(libc::SIGUSR1, std::ptr::null(), &mut old) };
        assert_eq!(rc, 0);
    }

    #[test]
    fn sigaction_captures_startup_signal_while_armed() {
        let _guard = test_guard();
        crate::lifecycle::arm_for_test(true);
        let action: libc::sigaction = unsafe { std::mem::zeroed() };
        let rc = unsafe { sigaction(lifecycle::STARTUP_SIGNAL, &action, std::ptr::null_mut()) };
        assert_eq!(rc, 0);
        assert!(!crate::lifecycle::saved_handler_for_test().is_null());
        crate::lifecycle::arm_for_test(false);
    }
}
