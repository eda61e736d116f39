// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! The process-wide function table: one slot per interposed symbol, holding
//! the real routine resolved from the *next* dynamic-loader search scope so
//! that calling through a slot reaches libc (or libssl / gnutls / NSS) and
//! not this module again.
//!
//! Slots are populated once by [`resolve_all`] from the load constructor.
//! A slot read before the constructor has run re-resolves on the spot; this
//! keeps interceptors that the loader itself can reach (notably `syscall`,
//! used for `mmap`) pure pass-throughs with no allocation.

use std::ffi::CStr;
use std::os::raw::c_void;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering::SeqCst};

pub struct RealFn {
    name: &'static CStr,
    ptr: AtomicPtr<c_void>,
}

impl RealFn {
    pub const fn new(name: &'static CStr) -> Self {
        Self {
            name,
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name.to_str().unwrap_or("?")
    }

    /// Resolve the slot from the next search scope. Returns whether the
    /// symbol was found. Missing optional symbols leave the slot null and
    /// the matching interceptor degrades to its "unavailable" sentinel.
    pub fn resolve(&self) -> bool {
        // SAFETY: `name` is a valid NUL-terminated symbol name.
        let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr()) };
        self.ptr.store(addr, SeqCst);
        !addr.is_null()
    }

    /// Raw slot value, re-resolving lazily when the constructor has not run
    /// yet. `dlsym` does not allocate from this module, which keeps the
    /// pre-constructor path safe for the loader.
    pub fn raw(&self) -> *mut c_void {
        let p = self.ptr.load(SeqCst);
        if !p.is_null() {
            return p;
        }
        let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, self.name.as_ptr()) };
        if !addr.is_null() {
            self.ptr.store(addr, SeqCst);
        }
        addr
    }

    /// The slot as a typed function pointer, or `None` when the real symbol
    /// is unavailable.
    pub fn typed<F: Copy>(&self) -> Option<F> {
        debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*mut c_void>());
        let p = self.raw();
        if p.is_null() {
            None
        } else {
            // SAFETY: the slot was produced by dlsym for this symbol; the
            // caller supplies the symbol's C signature.
            Some(unsafe { std::mem::transmute_copy(&p) })
        }
    }

    pub fn is_resolved(&self) -> bool {
        !self.ptr.load(SeqCst).is_null()
    }
}

macro_rules! real_fns {
    ($($slot:ident => $sym:literal),+ $(,)?) => {
        $( pub static $slot: RealFn = RealFn::new($sym); )+

        /// Populate every slot from the next scope. Returns the number of
        /// symbols that resolved; a miss is tolerated and only degrades the
        /// matching interceptor.
        pub fn resolve_all() -> usize {
            let mut found = 0usize;
            $( if $slot.resolve() { found += 1; } )+
            found
        }

        pub const SYMBOL_COUNT: usize = [$(stringify!($slot)),+].len();
    };
}

real_fns! {
    // open family
    OPEN => c"open",
    OPEN64 => c"open64",
    OPENAT => c"openat",
    OPENAT64 => c"openat64",
    OPEN_2 => c"__open_2",
    OPEN64_2 => c"__open64_2",
    OPENAT_2 => c"__openat_2",
    CREAT => c"creat",
    CREAT64 => c"creat64",
    FOPEN => c"fopen",
    FOPEN64 => c"fopen64",
    FREOPEN => c"freopen",
    FREOPEN64 => c"freopen64",

    // close family
    CLOSE => c"close",
    FCLOSE => c"fclose",
    FCLOSEALL => c"fcloseall",

    // read family
    READ => c"read",
    PREAD => c"pread",
    PREAD64 => c"pread64",
    PREADV => c"preadv",
    PREADV2 => c"preadv2",
    PREADV64V2 => c"preadv64v2",
    READV => c"readv",
    PREAD_CHK => c"__pread_chk",
    READ_CHK => c"__read_chk",
    FREAD => c"fread",
    FREAD_CHK => c"__fread_chk",
    FREAD_UNLOCKED => c"fread_unlocked",
    FREAD_UNLOCKED_CHK => c"__fread_unlocked_chk",
    FGETS => c"fgets",
    FGETS_CHK => c"__fgets_chk",
    FGETS_UNLOCKED => c"fgets_unlocked",
    FGETWS => c"fgetws",
    FGETWS_CHK => c"__fgetws_chk",
    FGETWC => c"fgetwc",
    FGETC => c"fgetc",
    FSCANF => c"fscanf",
    GETLINE => c"getline",
    GETDELIM => c"getdelim",
    GETDELIM_GLIBC => c"__getdelim",

    // write family
    WRITE => c"write",
    PWRITE => c"pwrite",
    PWRITE64 => c"pwrite64",
    PWRITEV => c"pwritev",
    PWRITEV64 => c"pwritev64",
    PWRITEV2 => c"pwritev2",
    PWRITEV64V2 => c"pwritev64v2",
    WRITEV => c"writev",
    FWRITE => c"fwrite",
    FWRITE_UNLOCKED => c"fwrite_unlocked",
    FPUTS => c"fputs",
    FPUTS_UNLOCKED => c"fputs_unlocked",
    FPUTWS => c"fputws",
    FPUTC => c"fputc",
    FPUTC_UNLOCKED => c"fputc_unlocked",
    PUTWC => c"putwc",
    FPUTWC => c"fputwc",
    SENDFILE => c"sendfile",
    SENDFILE64 => c"sendfile64",

    // seek family
    LSEEK => c"lseek",
    LSEEK64 => c"lseek64",
    FSEEK => c"fseek",
    FSEEKO => c"fseeko",
    FSEEKO64 => c"fseeko64",
    FTELL => c"ftell",
    FTELLO => c"ftello",
    FTELLO64 => c"ftello64",
    REWIND => c"rewind",
    FSETPOS => c"fsetpos",
    FSETPOS64 => c"fsetpos64",
    FGETPOS => c"fgetpos",
    FGETPOS64 => c"fgetpos64",

    // stat family
    STATFS => c"statfs",
    STATFS64 => c"statfs64",
    FSTATFS => c"fstatfs",
    FSTATFS64 => c"fstatfs64",
    STATVFS => c"statvfs",
    STATVFS64 => c"statvfs64",
    FSTATVFS => c"fstatvfs",
    FSTATVFS64 => c"fstatvfs64",
    FSTATAT => c"fstatat",
    STATX => c"statx",
    ACCESS => c"access",
    FACCESSAT => c"faccessat",
    XSTAT => c"__xstat",
    XSTAT64 => c"__xstat64",
    LXSTAT => c"__lxstat",
    LXSTAT64 => c"__lxstat64",
    FXSTAT => c"__fxstat",
    FXSTAT64 => c"__fxstat64",
    FXSTATAT => c"__fxstatat",
    FXSTATAT64 => c"__fxstatat64",

    // fcntl / dup family
    FCNTL => c"fcntl",
    FCNTL64 => c"fcntl64",
    DUP => c"dup",
    DUP2 => c"dup2",
    DUP3 => c"dup3",

    // socket family
    SOCKET => c"socket",
    SHUTDOWN => c"shutdown",
    LISTEN => c"listen",
    ACCEPT => c"accept",
    ACCEPT4 => c"accept4",
    BIND => c"bind",
    CONNECT => c"connect",
    SEND => c"send",
    SENDTO => c"sendto",
    SENDMSG => c"sendmsg",
    RECV => c"recv",
    RECVFROM => c"recvfrom",
    RECVMSG => c"recvmsg",

    // DNS family
    GETHOSTBYNAME => c"gethostbyname",
    GETHOSTBYNAME2 => c"gethostbyname2",
    GETHOSTBYNAME_R => c"gethostbyname_r",
    GETHOSTBYNAME2_R => c"gethostbyname2_r",
    GETADDRINFO => c"getaddrinfo",

    // scheduling / wait / signal family
    NANOSLEEP => c"nanosleep",
    EPOLL_WAIT => c"epoll_wait",
    SELECT => c"select",
    SIGSUSPEND => c"sigsuspend",
    SIGACTION => c"sigaction",
    FORK => c"fork",
    PRCTL => c"prctl",
    SYSCALL => c"syscall",
    VSYSLOG => c"vsyslog",

    // TLS: OpenSSL
    SSL_READ => c"SSL_read",
    SSL_WRITE => c"SSL_write",
    SSL_GET_FD => c"SSL_get_fd",

    // TLS: gnutls
    GNUTLS_RECORD_RECV => c"gnutls_record_recv",
    GNUTLS_RECORD_RECV_EARLY_DATA => c"gnutls_record_recv_early_data",
    GNUTLS_RECORD_RECV_PACKET => c"gnutls_record_recv_packet",
    GNUTLS_RECORD_RECV_SEQ => c"gnutls_record_recv_seq",
    GNUTLS_RECORD_SEND => c"gnutls_record_send",
    GNUTLS_RECORD_SEND2 => c"gnutls_record_send2",
    GNUTLS_RECORD_SEND_EARLY_DATA => c"gnutls_record_send_early_data",
    GNUTLS_RECORD_SEND_RANGE => c"gnutls_record_send_range",

    // TLS: NSS
    SSL_IMPORT_FD => c"SSL_ImportFD",
    PR_FILEDESC2NATIVEHANDLE => c"PR_FileDesc2NativeHandle",
}

/// Symbols whose absence leaves monitoring badly degraded. Their loss is
/// logged once at startup; the load itself must still succeed.
pub fn mandatory_missing() -> Vec<&'static str> {
    let mut missing = Vec::new();
    for slot in [&CLOSE, &READ, &WRITE, &OPEN] {
        if !slot.is_resolved() {
            missing.push(slot.name());
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_core_libc_symbols() {
        let found = resolve_all();
        // The test binary links against libc, so the core set must resolve.
        assert!(found > 50, "only {found} of {SYMBOL_COUNT} symbols resolved");
        assert!(OPEN.is_resolved());
        assert!(CLOSE.is_resolved());
        assert!(READ.is_resolved());
        assert!(WRITE.is_resolved());
        assert!(mandatory_missing().is_empty());
    }

    #[test]
    fn unresolved_tls_symbols_are_tolerated() {
        resolve_all();
        // No TLS library is loaded into the test binary; the slots must be
        // absent rather than fatal.
        assert!(SSL_READ.typed::<unsafe extern "C" fn()>().is_none() || SSL_READ.is_resolved());
    }

    #[test]
    fn typed_slot_calls_the_real_function() {
        GETPID_PROBE.resolve();
        let getpid: unsafe extern "C" fn() -> libc::pid_t =
            GETPID_PROBE.typed().expect("getpid resolves");
        let pid = unsafe { getpid() };
        assert_eq!(pid, std::process::id() as libc::pid_t);
    }

    static GETPID_PROBE: RealFn = RealFn::new(c"getpid");
}
