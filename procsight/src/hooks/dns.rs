// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! DNS helper interceptors. Always timed: duration is attributed whether the
//! lookup succeeds or fails, so resolver latency is visible even when every
//! query errors out.

use std::os::raw::{c_char, c_int};

use super::fs::real_or;
use super::{do_dns_call, timer_start, ErrnoGuard};

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn gethostbyname(name: *const c_char) -> *mut libc::hostent {
    let real = real_or!(
        GETHOSTBYNAME,
        unsafe extern "C" fn(*const c_char) -> *mut libc::hostent,
        std::ptr::null_mut()
    );
    let t0 = timer_start();
    let rc = real(name);
    let _errno = ErrnoGuard::capture();
    do_dns_call(name, !rc.is_null(), t0, "gethostbyname");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn gethostbyname2(name: *const c_char, af: c_int) -> *mut libc::hostent {
    let real = real_or!(
        GETHOSTBYNAME2,
        unsafe extern "C" fn(*const c_char, c_int) -> *mut libc::hostent,
        std::ptr::null_mut()
    );
    let t0 = timer_start();
    let rc = real(name, af);
    let _errno = ErrnoGuard::capture();
    do_dns_call(name, !rc.is_null(), t0, "gethostbyname2");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn gethostbyname_r(
    name: *const c_char,
    ret: *mut libc::hostent,
    buf: *mut c_char,
    buflen: libc::size_t,
    result: *mut *mut libc::hostent,
    h_errnop: *mut c_int,
) -> c_int {
    let real = real_or!(
        GETHOSTBYNAME_R,
        unsafe extern "C" fn(
            *const c_char,
            *mut libc::hostent,
            *mut c_char,
            libc::size_t,
            *mut *mut libc::hostent,
            *mut c_int,
        ) -> c_int,
        -1
    );
    let t0 = timer_start();
    let rc = real(name, ret, buf, buflen, result, h_errnop);
    let _errno = ErrnoGuard::capture();
    do_dns_call(name, rc == 0 && !result.is_null(), t0, "gethostbyname_r");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn gethostbyname2_r(
    name: *const c_char,
    af: c_int,
    ret: *mut libc::hostent,
    buf: *mut c_char,
    buflen: libc::size_t,
    result: *mut *mut libc::hostent,
    h_errnop: *mut c_int,
) -> c_int {
    let real = real_or!(
        GETHOSTBYNAME2_R,
        unsafe extern "C" fn(
            *const c_char,
            c_int,
            *mut libc::hostent,
            *mut c_char,
            libc::size_t,
            *mut *mut libc::hostent,
            *mut c_int,
        ) -> c_int,
        -1
    );
    let t0 = timer_start();
    let rc = real(name, af, ret, buf, buflen, result, h_errnop);
    let _errno = ErrnoGuard::capture();
    do_dns_call(name, rc == 0 && !result.is_null(), t0, "gethostbyname2_r");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn getaddrinfo(
    node: *const c_char,
    service: *const c_char,
    hints: *const libc::addrinfo,
    res: *mut *mut libc::addrinfo,
) -> c_int {
    let real = real_or!(
        GETADDRINFO,
        unsafe extern "C" fn(
            *const c_char,
            *const c_char,
            *const libc::addrinfo,
            *mut *mut libc::addrinfo,
        ) -> c_int,
        -1
    );
    let t0 = timer_start();
    let rc = real(node, service, hints, res);
    let _errno = ErrnoGuard::capture();
    do_dns_call(node, rc == 0, t0, "getaddrinfo");
    rc
}

#[cfg(test)]
mod tests {
    use crate::agent::{test_agent, test_guard};
    use crate::hooks::do_dns_call;
    use crate::state::aggregates::ErrorClass;
    use std::sync::atomic::Ordering::SeqCst;

    #[test]
    fn success_and_failure_both_accumulate_duration() {
        let _guard = test_guard();
        let agent = test_agent();
        agent.events.drain();
        let ops = agent.agg.dns_ops.load(SeqCst);
        let errors = agent.agg.error_total(ErrorClass::NetDns);
        let duration = agent.agg.dns_duration_ns.load(SeqCst);

        let name = c"example.com";
        let t0 = agent.clock.now();
        do_dns_call(name.as_ptr(), true, t0, "gethostbyname");
        let t0 = agent.clock.now();
        do_dns_call(name.as_ptr(), false, t0, "gethostbyname");

        assert_eq!(agent.agg.dns_ops.load(SeqCst), ops + 1);
        assert_eq!(agent.agg.error_total(ErrorClass::NetDns), errors + 1);
        assert!(agent.agg.dns_duration_ns.load(SeqCst) > duration);

        let events = agent.events.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].body["name"], "example.com");
    }
}
