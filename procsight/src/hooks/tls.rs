// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! TLS interposition, three strategies by library shape:
//!
//! * **OpenSSL**: `SSL_read`/`SSL_write` wrapped as ordinary symbols, with
//!   the underlying descriptor pulled from `SSL_get_fd` when resolvable.
//! * **gnutls**: every record send/recv variant wrapped at symbol level;
//!   the session pointer is the only stable id, no descriptor association.
//! * **NSS**: on a successful `SSL_ImportFD` the returned descriptor's I/O
//!   method table is swapped for a wrapper table; the original is kept as an
//!   owned copy for chaining. The live `methods` pointer on the descriptor
//!   is borrowed and rewritten, never freed.
//!
//! Receive-family calls tag TLSRX, send-family TLSTX, independent of the
//! underlying transport.

#![allow(non_snake_case, non_camel_case_types)]

use std::os::fd::RawFd;
use std::os::raw::{c_int, c_uint, c_void};

use dashmap::DashMap;

use crate::fntable;
use crate::state::aggregates::ErrorClass;
use crate::state::tls::TlsDirection;

use super::fs::real_or;
use super::{agent, do_tls};

// --- OpenSSL ---------------------------------------------------------------

fn ssl_fd(ssl: *mut c_void) -> RawFd {
    match fntable::SSL_GET_FD.typed::<unsafe extern "C" fn(*const c_void) -> c_int>() {
        Some(get_fd) => unsafe { get_fd(ssl) },
        None => -1,
    }
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn SSL_read(ssl: *mut c_void, buf: *mut c_void, num: c_int) -> c_int {
    let real = real_or!(
        SSL_READ,
        unsafe extern "C" fn(*mut c_void, *mut c_void, c_int) -> c_int,
        -1
    );
    let rc = real(ssl, buf, num);
    if rc > 0 {
        do_tls(ssl as u64, ssl_fd(ssl), num.max(0) as u64, TlsDirection::Rx);
    }
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn SSL_write(ssl: *mut c_void, buf: *const c_void, num: c_int) -> c_int {
    let real = real_or!(
        SSL_WRITE,
        unsafe extern "C" fn(*mut c_void, *const c_void, c_int) -> c_int,
        -1
    );
    let rc = real(ssl, buf, num);
    if rc > 0 {
        do_tls(ssl as u64, ssl_fd(ssl), num.max(0) as u64, TlsDirection::Tx);
    }
    rc
}

// --- gnutls ----------------------------------------------------------------

type gnutls_session_t = *mut c_void;

macro_rules! gnutls_recv_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            session: gnutls_session_t,
            data: *mut c_void,
            data_size: libc::size_t,
        ) -> libc::ssize_t {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(gnutls_session_t, *mut c_void, libc::size_t) -> libc::ssize_t,
                -1
            );
            let rc = real(session, data, data_size);
            if rc > 0 {
                // No descriptor: the transport behind a gnutls session is
                // not reliably discoverable.
                do_tls(session as u64, -1, data_size as u64, TlsDirection::Rx);
            }
            rc
        }
    };
}

gnutls_recv_interceptor!(gnutls_record_recv, GNUTLS_RECORD_RECV);
gnutls_recv_interceptor!(gnutls_record_recv_early_data, GNUTLS_RECORD_RECV_EARLY_DATA);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn gnutls_record_recv_packet(
    session: gnutls_session_t,
    packet: *mut c_void,
) -> libc::ssize_t {
    let real = real_or!(
        GNUTLS_RECORD_RECV_PACKET,
        unsafe extern "C" fn(gnutls_session_t, *mut c_void) -> libc::ssize_t,
        -1
    );
    // The payload lives inside the opaque packet; nothing to attribute.
    real(session, packet)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn gnutls_record_recv_seq(
    session: gnutls_session_t,
    data: *mut c_void,
    data_size: libc::size_t,
    seq: *mut libc::c_uchar,
) -> libc::ssize_t {
    let real = real_or!(
        GNUTLS_RECORD_RECV_SEQ,
        unsafe extern "C" fn(
            gnutls_session_t,
            *mut c_void,
            libc::size_t,
            *mut libc::c_uchar,
        ) -> libc::ssize_t,
        -1
    );
    let rc = real(session, data, data_size, seq);
    if rc > 0 {
        do_tls(session as u64, -1, data_size as u64, TlsDirection::Rx);
    }
    rc
}

macro_rules! gnutls_send_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            session: gnutls_session_t,
            data: *const c_void,
            data_size: libc::size_t,
        ) -> libc::ssize_t {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(
                    gnutls_session_t,
                    *const c_void,
                    libc::size_t,
                ) -> libc::ssize_t,
                -1
            );
            let rc = real(session, data, data_size);
            if rc > 0 {
                do_tls(session as u64, -1, data_size as u64, TlsDirection::Tx);
            }
            rc
        }
    };
}

gnutls_send_interceptor!(gnutls_record_send, GNUTLS_RECORD_SEND);
gnutls_send_interceptor!(gnutls_record_send_early_data, GNUTLS_RECORD_SEND_EARLY_DATA);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn gnutls_record_send2(
    session: gnutls_session_t,
    data: *const c_void,
    data_size: libc::size_t,
    pad: libc::size_t,
    flags: c_uint,
) -> libc::ssize_t {
    let real = real_or!(
        GNUTLS_RECORD_SEND2,
        unsafe extern "C" fn(
            gnutls_session_t,
            *const c_void,
            libc::size_t,
            libc::size_t,
            c_uint,
        ) -> libc::ssize_t,
        -1
    );
    let rc = real(session, data, data_size, pad, flags);
    if rc > 0 {
        do_tls(session as u64, -1, data_size as u64, TlsDirection::Tx);
    }
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn gnutls_record_send_range(
    session: gnutls_session_t,
    data: *const c_void,
    data_size: libc::size_t,
    range: *const c_void,
) -> libc::ssize_t {
    let real = real_or!(
        GNUTLS_RECORD_SEND_RANGE,
        unsafe extern "C" fn(
            gnutls_session_t,
            *const c_void,
            libc::size_t,
            *const c_void,
        ) -> libc::ssize_t,
        -1
    );
    let rc = real(session, data, data_size, range);
    if rc > 0 {
        do_tls(session as u64, -1, data_size as u64, TlsDirection::Tx);
    }
    rc
}

// --- NSS -------------------------------------------------------------------

pub type PRStatus = c_int;
pub const PR_SUCCESS: PRStatus = 0;
pub type PRInt32 = i32;
pub type PRInt64 = i64;
pub type PRIntn = c_int;
pub type PRIntervalTime = u32;
pub type PROffset32 = i32;
pub type PROffset64 = i64;
pub type PRDescIdentity = PRIntn;

/// The descriptor layer NSS hands back from `SSL_ImportFD`. Only the fields
/// this module touches are interpreted; the layout matches NSPR's prio.h.
#[repr(C)]
pub struct PRFileDesc {
    pub methods: *const PRIOMethods,
    pub secret: *mut c_void,
    pub lower: *mut PRFileDesc,
    pub higher: *mut PRFileDesc,
    pub dtor: Option<unsafe extern "C" fn(*mut PRFileDesc)>,
    pub identity: PRDescIdentity,
}

pub type PRCloseFn = Option<unsafe extern "C" fn(*mut PRFileDesc) -> PRStatus>;
pub type PRReadFn = Option<unsafe extern "C" fn(*mut PRFileDesc, *mut c_void, PRInt32) -> PRInt32>;
pub type PRWriteFn =
    Option<unsafe extern "C" fn(*mut PRFileDesc, *const c_void, PRInt32) -> PRInt32>;
pub type PRWritevFn = Option<
    unsafe extern "C" fn(*mut PRFileDesc, *const c_void, PRInt32, PRIntervalTime) -> PRInt32,
>;
pub type PRRecvFn = Option<
    unsafe extern "C" fn(*mut PRFileDesc, *mut c_void, PRInt32, PRIntn, PRIntervalTime) -> PRInt32,
>;
pub type PRSendFn = Option<
    unsafe extern "C" fn(
        *mut PRFileDesc,
        *const c_void,
        PRInt32,
        PRIntn,
        PRIntervalTime,
    ) -> PRInt32,
>;
pub type PRRecvfromFn = Option<
    unsafe extern "C" fn(
        *mut PRFileDesc,
        *mut c_void,
        PRInt32,
        PRIntn,
        *mut c_void,
        PRIntervalTime,
    ) -> PRInt32,
>;
pub type PRSendtoFn = Option<
    unsafe extern "C" fn(
        *mut PRFileDesc,
        *const c_void,
        PRInt32,
        PRIntn,
        *const c_void,
        PRIntervalTime,
    ) -> PRInt32,
>;
type PRReservedFn = Option<unsafe extern "C" fn(*mut PRFileDesc) -> PRIntn>;

/// NSPR's I/O method table, declared in full so an owned copy has the exact
/// layout the live descriptor expects.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PRIOMethods {
    pub file_type: PRIntn,
    pub close: PRCloseFn,
    pub read: PRReadFn,
    pub write: PRWriteFn,
    pub available: Option<unsafe extern "C" fn(*mut PRFileDesc) -> PRInt32>,
    pub available64: Option<unsafe extern "C" fn(*mut PRFileDesc) -> PRInt64>,
    pub fsync: Option<unsafe extern "C" fn(*mut PRFileDesc) -> PRStatus>,
    pub seek: Option<unsafe extern "C" fn(*mut PRFileDesc, PROffset32, PRIntn) -> PROffset32>,
    pub seek64: Option<unsafe extern "C" fn(*mut PRFileDesc, PROffset64, PRIntn) -> PROffset64>,
    pub fileinfo: Option<unsafe extern "C" fn(*mut PRFileDesc, *mut c_void) -> PRStatus>,
    pub fileinfo64: Option<unsafe extern "C" fn(*mut PRFileDesc, *mut c_void) -> PRStatus>,
    pub writev: PRWritevFn,
    pub connect:
        Option<unsafe extern "C" fn(*mut PRFileDesc, *const c_void, PRIntervalTime) -> PRStatus>,
    pub accept: Option<
        unsafe extern "C" fn(*mut PRFileDesc, *mut c_void, PRIntervalTime) -> *mut PRFileDesc,
    >,
    pub bind: Option<unsafe extern "C" fn(*mut PRFileDesc, *const c_void) -> PRStatus>,
    pub listen: Option<unsafe extern "C" fn(*mut PRFileDesc, PRIntn) -> PRStatus>,
    pub shutdown: Option<unsafe extern "C" fn(*mut PRFileDesc, PRIntn) -> PRStatus>,
    pub recv: PRRecvFn,
    pub send: PRSendFn,
    pub recvfrom: PRRecvfromFn,
    pub sendto: PRSendtoFn,
    pub poll: Option<unsafe extern "C" fn(*mut PRFileDesc, PRIntn, *mut PRIntn) -> PRIntn>,
    pub acceptread: Option<
        unsafe extern "C" fn(
            *mut PRFileDesc,
            *mut *mut PRFileDesc,
            *mut *mut c_void,
            *mut c_void,
            PRInt32,
            PRIntervalTime,
        ) -> PRInt32,
    >,
    pub transmitfile: Option<
        unsafe extern "C" fn(
            *mut PRFileDesc,
            *mut PRFileDesc,
            *const c_void,
            PRInt32,
            PRIntn,
            PRIntervalTime,
        ) -> PRInt32,
    >,
    pub getsockname: Option<unsafe extern "C" fn(*mut PRFileDesc, *mut c_void) -> PRStatus>,
    pub getpeername: Option<unsafe extern "C" fn(*mut PRFileDesc, *mut c_void) -> PRStatus>,
    pub reserved_fn_6: PRReservedFn,
    pub reserved_fn_5: PRReservedFn,
    pub getsocketoption: Option<unsafe extern "C" fn(*mut PRFileDesc, *mut c_void) -> PRStatus>,
    pub setsocketoption: Option<unsafe extern "C" fn(*mut PRFileDesc, *const c_void) -> PRStatus>,
    pub sendfile: Option<
        unsafe extern "C" fn(*mut PRFileDesc, *mut c_void, PRIntn, PRIntervalTime) -> PRInt32,
    >,
    pub connectcontinue: Option<unsafe extern "C" fn(*mut PRFileDesc, PRIntn) -> PRStatus>,
    pub reserved_fn_3: PRReservedFn,
    pub reserved_fn_2: PRReservedFn,
    pub reserved_fn_1: PRReservedFn,
    pub reserved_fn_0: PRReservedFn,
}

/// One wrapped NSS descriptor: the saved original method table (owned copy,
/// chained to by every wrapper) and the wrapper table the live descriptor
/// now points at. Immutable once inserted, so reads are lock-free copies.
pub struct NssBinding {
    pub native_fd: RawFd,
    saved: Box<PRIOMethods>,
    wrapper: Box<PRIOMethods>,
}

impl NssBinding {
    /// The table the live descriptor's `methods` pointer was rewritten to.
    pub fn wrapper_methods(&self) -> *const PRIOMethods {
        self.wrapper.as_ref()
    }
}

pub struct NssBindings {
    map: DashMap<RawFd, NssBinding>,
}

impl Default for NssBindings {
    fn default() -> Self {
        Self::new()
    }
}

impl NssBindings {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Install a binding. Fails when the native fd is already wrapped; the
    /// existing wrapper stays live on the descriptor in that case.
    pub fn insert(
        &self,
        native_fd: RawFd,
        saved: Box<PRIOMethods>,
        wrapper: Box<PRIOMethods>,
    ) -> Option<*const PRIOMethods> {
        if self.map.contains_key(&native_fd) {
            return None;
        }
        let methods: *const PRIOMethods = wrapper.as_ref();
        self.map.insert(
            native_fd,
            NssBinding {
                native_fd,
                saved,
                wrapper,
            },
        );
        Some(methods)
    }

    /// Copy of the saved original table, so wrappers chain without holding a
    /// map reference across a blocking call.
    pub fn saved(&self, native_fd: RawFd) -> Option<PRIOMethods> {
        self.map.get(&native_fd).map(|b| *b.saved)
    }

    pub fn contains(&self, native_fd: RawFd) -> bool {
        self.map.contains_key(&native_fd)
    }

    pub fn remove(&self, native_fd: RawFd) -> bool {
        self.map.remove(&native_fd).is_some()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

#[cfg(test)]
static TEST_NATIVE_HANDLE: std::sync::Mutex<Option<fn(*mut PRFileDesc) -> RawFd>> =
    std::sync::Mutex::new(None);

#[cfg(test)]
pub(crate) fn set_native_handle_for_test(resolver: Option<fn(*mut PRFileDesc) -> RawFd>) {
    *TEST_NATIVE_HANDLE.lock().unwrap_or_else(|e| e.into_inner()) = resolver;
}

fn native_handle(fd: *mut PRFileDesc) -> Option<RawFd> {
    #[cfg(test)]
    if let Some(resolver) = *TEST_NATIVE_HANDLE.lock().unwrap_or_else(|e| e.into_inner()) {
        return Some(resolver(fd));
    }
    let real = fntable::PR_FILEDESC2NATIVEHANDLE
        .typed::<unsafe extern "C" fn(*mut PRFileDesc) -> PRInt32>()?;
    Some(unsafe { real(fd) })
}

macro_rules! nss_lookup {
    ($fd:expr) => {{
        let Some(agent) = agent() else { return -1 };
        let Some(nfd) = native_handle($fd) else { return -1 };
        let Some(saved) = agent.nss.saved(nfd) else {
            log::error!("nss wrapper called without a binding");
            agent.agg.error(ErrorClass::Internal);
            return -1;
        };
        (nfd, saved)
    }};
}

unsafe extern "C" fn nss_read(fd: *mut PRFileDesc, buf: *mut c_void, amount: PRInt32) -> PRInt32 {
    let (nfd, saved) = nss_lookup!(fd);
    let Some(original) = saved.read else { return -1 };
    let rc = original(fd, buf, amount);
    if rc > 0 {
        do_tls(fd as u64, nfd, amount.max(0) as u64, TlsDirection::Rx);
    }
    rc
}

unsafe extern "C" fn nss_recv(
    fd: *mut PRFileDesc,
    buf: *mut c_void,
    amount: PRInt32,
    flags: PRIntn,
    timeout: PRIntervalTime,
) -> PRInt32 {
    let (nfd, saved) = nss_lookup!(fd);
    let Some(original) = saved.recv else { return -1 };
    let rc = original(fd, buf, amount, flags, timeout);
    if rc > 0 {
        do_tls(fd as u64, nfd, amount.max(0) as u64, TlsDirection::Rx);
    }
    rc
}

unsafe extern "C" fn nss_recvfrom(
    fd: *mut PRFileDesc,
    buf: *mut c_void,
    amount: PRInt32,
    flags: PRIntn,
    addr: *mut c_void,
    timeout: PRIntervalTime,
) -> PRInt32 {
    let (nfd, saved) = nss_lookup!(fd);
    let Some(original) = saved.recvfrom else { return -1 };
    let rc = original(fd, buf, amount, flags, addr, timeout);
    if rc > 0 {
        do_tls(fd as u64, nfd, amount.max(0) as u64, TlsDirection::Rx);
    }
    rc
}

unsafe extern "C" fn nss_write(fd: *mut PRFileDesc, buf: *const c_void, amount: PRInt32) -> PRInt32 {
    let (nfd, saved) = nss_lookup!(fd);
    let Some(original) = saved.write else { return -1 };
    let rc = original(fd, buf, amount);
    if rc > 0 {
        do_tls(fd as u64, nfd, amount.max(0) as u64, TlsDirection::Tx);
    }
    rc
}

unsafe extern "C" fn nss_send(
    fd: *mut PRFileDesc,
    buf: *const c_void,
    amount: PRInt32,
    flags: PRIntn,
    timeout: PRIntervalTime,
) -> PRInt32 {
    let (nfd, saved) = nss_lookup!(fd);
    let Some(original) = saved.send else { return -1 };
    let rc = original(fd, buf, amount, flags, timeout);
    if rc > 0 {
        do_tls(fd as u64, nfd, amount.max(0) as u64, TlsDirection::Tx);
    }
    rc
}

unsafe extern "C" fn nss_sendto(
    fd: *mut PRFileDesc,
    buf: *const c_void,
    amount: PRInt32,
    flags: PRIntn,
    addr: *const c_void,
    timeout: PRIntervalTime,
) -> PRInt32 {
    let (nfd, saved) = nss_lookup!(fd);
    let Some(original) = saved.sendto else { return -1 };
    let rc = original(fd, buf, amount, flags, addr, timeout);
    if rc > 0 {
        do_tls(fd as u64, nfd, amount.max(0) as u64, TlsDirection::Tx);
    }
    rc
}

unsafe extern "C" fn nss_writev(
    fd: *mut PRFileDesc,
    iov: *const c_void,
    iov_size: PRInt32,
    timeout: PRIntervalTime,
) -> PRInt32 {
    let (nfd, saved) = nss_lookup!(fd);
    let Some(original) = saved.writev else { return -1 };
    let rc = original(fd, iov, iov_size, timeout);
    if rc > 0 {
        do_tls(fd as u64, nfd, rc.max(0) as u64, TlsDirection::Tx);
    }
    rc
}

/// Chains the original close first; the binding is removed only when that
/// close reports success.
unsafe extern "C" fn nss_close(fd: *mut PRFileDesc) -> PRStatus {
    let (nfd, saved) = nss_lookup!(fd);
    let Some(original) = saved.close else { return -1 };
    let rc = original(fd);
    if rc == PR_SUCCESS {
        if let Some(agent) = agent() {
            agent.nss.remove(nfd);
        }
    }
    rc
}

/// Wrap a descriptor `SSL_ImportFD` returned: copy its method table twice
/// (verbatim originals, wrapper with the I/O slots replaced) and point the
/// descriptor at the wrapper. The target's original table is never freed.
pub(crate) unsafe fn install_wrapper(result: *mut PRFileDesc) {
    let Some(agent) = agent() else { return };
    if result.is_null() || (*result).methods.is_null() {
        return;
    }
    let Some(nfd) = native_handle(result) else {
        agent.agg.error(ErrorClass::Internal);
        return;
    };

    let saved = Box::new(*(*result).methods);
    let mut wrapper = Box::new(*saved);
    wrapper.read = Some(nss_read);
    wrapper.recv = Some(nss_recv);
    wrapper.recvfrom = Some(nss_recvfrom);
    wrapper.write = Some(nss_write);
    wrapper.send = Some(nss_send);
    wrapper.sendto = Some(nss_sendto);
    wrapper.writev = Some(nss_writev);
    wrapper.close = Some(nss_close);

    match agent.nss.insert(nfd, saved, wrapper) {
        Some(methods) => (*result).methods = methods,
        // Already wrapped; the existing wrapper stays live.
        None => log::debug!("nss descriptor {nfd} already wrapped"),
    }
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn SSL_ImportFD(
    model: *mut PRFileDesc,
    curr_fd: *mut PRFileDesc,
) -> *mut PRFileDesc {
    let real = real_or!(
        SSL_IMPORT_FD,
        unsafe extern "C" fn(*mut PRFileDesc, *mut PRFileDesc) -> *mut PRFileDesc,
        std::ptr::null_mut()
    );
    let result = real(model, curr_fd);
    if !result.is_null() {
        install_wrapper(result);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{test_agent, test_guard};
    use std::sync::atomic::Ordering::SeqCst;

    unsafe extern "C" fn stub_read(
        _fd: *mut PRFileDesc,
        _buf: *mut c_void,
        _amount: PRInt32,
    ) -> PRInt32 {
        77
    }

    unsafe extern "C" fn stub_close(_fd: *mut PRFileDesc) -> PRStatus {
        PR_SUCCESS
    }

    fn stub_methods() -> PRIOMethods {
        let mut methods: PRIOMethods = unsafe { std::mem::zeroed() };
        methods.read = Some(stub_read);
        methods.close = Some(stub_close);
        methods
    }

    fn identity_resolver(fd: *mut PRFileDesc) -> RawFd {
        unsafe { (*fd).identity as RawFd }
    }

    fn descriptor(methods: *const PRIOMethods, nfd: RawFd) -> PRFileDesc {
        PRFileDesc {
            methods,
            secret: std::ptr::null_mut(),
            lower: std::ptr::null_mut(),
            higher: std::ptr::null_mut(),
            dtor: None,
            identity: nfd,
        }
    }

    #[test]
    fn import_wrap_read_close_round_trip() {
        let _guard = test_guard();
        let agent = test_agent();
        set_native_handle_for_test(Some(identity_resolver));

        let original = stub_methods();
        let mut desc = descriptor(&original, 9);

        unsafe { install_wrapper(&mut desc) };
        assert!(agent.nss.contains(9));
        assert!(!std::ptr::eq(desc.methods, &original), "methods not rewritten");

        // A read through the wrapped vtable chains to the original and
        // records TLSRX bytes for (descriptor, native fd).
        let tls_rx = agent.agg.tls_rx_bytes.load(SeqCst);
        let rc = unsafe { ((*desc.methods).read.unwrap())(&mut desc, std::ptr::null_mut(), 100) };
        assert_eq!(rc, 77);
        assert_eq!(agent.agg.tls_rx_bytes.load(SeqCst), tls_rx + 100);
        let session = agent.tls.get(&desc as *const _ as u64).unwrap();
        assert_eq!(session.fd.load(SeqCst), 9);
        assert_eq!(session.rx_bytes.load(SeqCst), 100);

        // Close chains first and removes the binding on success.
        let rc = unsafe { ((*desc.methods).close.unwrap())(&mut desc) };
        assert_eq!(rc, PR_SUCCESS);
        assert!(!agent.nss.contains(9));

        agent.tls.remove(&desc as *const _ as u64);
        set_native_handle_for_test(None);
    }

    #[test]
    fn double_import_keeps_the_first_wrapper() {
        let _guard = test_guard();
        let agent = test_agent();
        set_native_handle_for_test(Some(identity_resolver));

        let original = stub_methods();
        let mut desc = descriptor(&original, 11);
        unsafe { install_wrapper(&mut desc) };
        let first = desc.methods;
        unsafe { install_wrapper(&mut desc) };
        assert!(std::ptr::eq(desc.methods, first));

        agent.nss.remove(11);
        set_native_handle_for_test(None);
    }

    #[test]
    fn wrapper_without_binding_fails_closed() {
        let _guard = test_guard();
        let agent = test_agent();
        set_native_handle_for_test(Some(identity_resolver));
        let internal = agent.agg.error_total(ErrorClass::Internal);

        let original = stub_methods();
        let mut desc = descriptor(&original, 12);
        // No install: calling the wrapper directly must not chain anywhere.
        let rc = unsafe { nss_read(&mut desc, std::ptr::null_mut(), 10) };
        assert_eq!(rc, -1);
        assert_eq!(agent.agg.error_total(ErrorClass::Internal), internal + 1);

        set_native_handle_for_test(None);
    }

    #[test]
    fn method_table_layout_is_pointer_dense() {
        // The wrapper table is installed on a live NSPR descriptor; every
        // slot past file_type must be pointer-sized.
        let fn_slots = (std::mem::size_of::<PRIOMethods>()
            - std::mem::size_of::<usize>())
            / std::mem::size_of::<usize>();
        assert_eq!(fn_slots, 35);
    }
}
