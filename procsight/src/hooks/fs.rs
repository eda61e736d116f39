// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! File-side interceptors: the open/close, read/write, seek, stat and
//! fcntl/dup families, in both their classic and 64-bit/checked-glibc
//! flavors.
//!
//! The variadic C signatures (`open`, `openat`, `fcntl`) are exported as
//! fixed-arity functions that read the optional trailing argument slot; on
//! the supported SysV ABIs the register holds whatever the caller passed,
//! which is the same access `va_arg` performs.

use std::os::fd::RawFd;
use std::os::raw::{c_char, c_int, c_long, c_uint, c_void};

use crate::fntable;
use crate::state::FdKind;

use super::{
    do_close, do_dup, do_dup2, do_io, do_open_error, do_open_raw, do_seek, do_stat,
    getdelim_enter, getdelim_inner_should_skip, timer_start, ErrnoGuard, IoDir,
};

const WEOF: libc::c_uint = !0;

macro_rules! real_or {
    ($slot:ident, $sig:ty, $sentinel:expr) => {
        match crate::fntable::$slot.typed::<$sig>() {
            Some(real) => real,
            None => return $sentinel,
        }
    };
}
pub(crate) use real_or;

unsafe fn stream_fd(stream: *mut libc::FILE) -> RawFd {
    if stream.is_null() {
        -1
    } else {
        libc::fileno(stream)
    }
}

// --- open family -----------------------------------------------------------

macro_rules! open_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            pathname: *const c_char,
            flags: c_int,
            mode: libc::mode_t,
        ) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(*const c_char, c_int, libc::mode_t) -> c_int,
                -1
            );
            let fd = real(pathname, flags, mode);
            let _errno = ErrnoGuard::capture();
            if fd != -1 {
                do_open_raw(fd, pathname, FdKind::File, stringify!($name));
            } else {
                do_open_error(pathname, stringify!($name));
            }
            fd
        }
    };
}

open_interceptor!(open, OPEN);
open_interceptor!(open64, OPEN64);

macro_rules! openat_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            dirfd: c_int,
            pathname: *const c_char,
            flags: c_int,
            mode: libc::mode_t,
        ) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(c_int, *const c_char, c_int, libc::mode_t) -> c_int,
                -1
            );
            let fd = real(dirfd, pathname, flags, mode);
            let _errno = ErrnoGuard::capture();
            if fd != -1 {
                do_open_raw(fd, pathname, FdKind::File, stringify!($name));
            } else {
                do_open_error(pathname, stringify!($name));
            }
            fd
        }
    };
}

openat_interceptor!(openat, OPENAT);
openat_interceptor!(openat64, OPENAT64);

macro_rules! open_2_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(file: *const c_char, oflag: c_int) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(*const c_char, c_int) -> c_int,
                -1
            );
            let fd = real(file, oflag);
            let _errno = ErrnoGuard::capture();
            if fd != -1 {
                do_open_raw(fd, file, FdKind::File, stringify!($name));
            } else {
                do_open_error(file, stringify!($name));
            }
            fd
        }
    };
}

open_2_interceptor!(__open_2, OPEN_2);
open_2_interceptor!(__open64_2, OPEN64_2);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn __openat_2(dirfd: c_int, file: *const c_char, oflag: c_int) -> c_int {
    let real = real_or!(
        OPENAT_2,
        unsafe extern "C" fn(c_int, *const c_char, c_int) -> c_int,
        -1
    );
    let fd = real(dirfd, file, oflag);
    let _errno = ErrnoGuard::capture();
    if fd != -1 {
        do_open_raw(fd, file, FdKind::File, "__openat_2");
    } else {
        do_open_error(file, "__openat_2");
    }
    fd
}

macro_rules! creat_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(pathname: *const c_char, mode: libc::mode_t) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(*const c_char, libc::mode_t) -> c_int,
                -1
            );
            let fd = real(pathname, mode);
            let _errno = ErrnoGuard::capture();
            if fd != -1 {
                do_open_raw(fd, pathname, FdKind::File, stringify!($name));
            } else {
                do_open_error(pathname, stringify!($name));
            }
            fd
        }
    };
}

creat_interceptor!(creat, CREAT);
creat_interceptor!(creat64, CREAT64);

macro_rules! fopen_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            pathname: *const c_char,
            mode: *const c_char,
        ) -> *mut libc::FILE {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(*const c_char, *const c_char) -> *mut libc::FILE,
                std::ptr::null_mut()
            );
            let stream = real(pathname, mode);
            let _errno = ErrnoGuard::capture();
            if !stream.is_null() {
                do_open_raw(stream_fd(stream), pathname, FdKind::Stream, stringify!($name));
            } else {
                do_open_error(pathname, stringify!($name));
            }
            stream
        }
    };
}

fopen_interceptor!(fopen, FOPEN);
fopen_interceptor!(fopen64, FOPEN64);

macro_rules! freopen_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            pathname: *const c_char,
            mode: *const c_char,
            orig_stream: *mut libc::FILE,
        ) -> *mut libc::FILE {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(
                    *const c_char,
                    *const c_char,
                    *mut libc::FILE,
                ) -> *mut libc::FILE,
                std::ptr::null_mut()
            );
            // The original stream's descriptor is gone once the real call
            // succeeds; capture it first.
            let orig_fd = stream_fd(orig_stream);
            let stream = real(pathname, mode, orig_stream);
            let _errno = ErrnoGuard::capture();
            if !stream.is_null() {
                // A null pathname only changes the stream's mode.
                if !pathname.is_null() {
                    do_open_raw(stream_fd(stream), pathname, FdKind::Stream, stringify!($name));
                    do_close(orig_fd, true, stringify!($name));
                }
            } else {
                do_open_error(pathname, stringify!($name));
            }
            stream
        }
    };
}

freopen_interceptor!(freopen, FREOPEN);
freopen_interceptor!(freopen64, FREOPEN64);

// --- close family ----------------------------------------------------------

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    let real = real_or!(CLOSE, unsafe extern "C" fn(c_int) -> c_int, -1);
    let rc = real(fd);
    let _errno = ErrnoGuard::capture();
    do_close(fd, rc != -1, "close");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn fclose(stream: *mut libc::FILE) -> c_int {
    let real = real_or!(FCLOSE, unsafe extern "C" fn(*mut libc::FILE) -> c_int, libc::EOF);
    let fd = stream_fd(stream);
    let rc = real(stream);
    let _errno = ErrnoGuard::capture();
    do_close(fd, rc != libc::EOF, "fclose");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn fcloseall() -> c_int {
    let real = real_or!(FCLOSEALL, unsafe extern "C" fn() -> c_int, libc::EOF);
    let rc = real();
    let _errno = ErrnoGuard::capture();
    if rc != libc::EOF {
        if let Some(agent) = super::agent() {
            let closed = agent.fds.close_streams();
            agent
                .agg
                .close_ops
                .fetch_add(closed as u64, std::sync::atomic::Ordering::SeqCst);
        }
    } else if let Some(agent) = super::agent() {
        agent.agg.error(crate::state::aggregates::ErrorClass::FsOpenClose);
    }
    rc
}

// --- read family -----------------------------------------------------------

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: libc::size_t) -> libc::ssize_t {
    let real = real_or!(
        READ,
        unsafe extern "C" fn(c_int, *mut c_void, libc::size_t) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    let rc = real(fd, buf, count);
    let _errno = ErrnoGuard::capture();
    do_io(fd, t0, rc != -1, rc.max(0) as u64, IoDir::In, false, false, "read");
    rc
}

macro_rules! pread_interceptor {
    ($name:ident, $slot:ident, $off:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            fd: c_int,
            buf: *mut c_void,
            count: libc::size_t,
            offset: $off,
        ) -> libc::ssize_t {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(c_int, *mut c_void, libc::size_t, $off) -> libc::ssize_t,
                -1
            );
            let t0 = timer_start();
            let rc = real(fd, buf, count, offset);
            let _errno = ErrnoGuard::capture();
            do_io(fd, t0, rc != -1, rc.max(0) as u64, IoDir::In, false, false, stringify!($name));
            rc
        }
    };
}

pread_interceptor!(pread, PREAD, libc::off_t);
pread_interceptor!(pread64, PREAD64, libc::off64_t);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> libc::ssize_t {
    let real = real_or!(
        READV,
        unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    // The real call reports the total across iovecs.
    let rc = real(fd, iov, iovcnt);
    let _errno = ErrnoGuard::capture();
    do_io(fd, t0, rc != -1, rc.max(0) as u64, IoDir::In, true, false, "readv");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn preadv(
    fd: c_int,
    iov: *const libc::iovec,
    iovcnt: c_int,
    offset: libc::off_t,
) -> libc::ssize_t {
    let real = real_or!(
        PREADV,
        unsafe extern "C" fn(c_int, *const libc::iovec, c_int, libc::off_t) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    let rc = real(fd, iov, iovcnt, offset);
    let _errno = ErrnoGuard::capture();
    do_io(fd, t0, rc != -1, rc.max(0) as u64, IoDir::In, true, false, "preadv");
    rc
}

macro_rules! preadv2_interceptor {
    ($name:ident, $slot:ident, $off:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            fd: c_int,
            iov: *const libc::iovec,
            iovcnt: c_int,
            offset: $off,
            flags: c_int,
        ) -> libc::ssize_t {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(
                    c_int,
                    *const libc::iovec,
                    c_int,
                    $off,
                    c_int,
                ) -> libc::ssize_t,
                -1
            );
            let t0 = timer_start();
            let rc = real(fd, iov, iovcnt, offset, flags);
            let _errno = ErrnoGuard::capture();
            do_io(fd, t0, rc != -1, rc.max(0) as u64, IoDir::In, true, false, stringify!($name));
            rc
        }
    };
}

preadv2_interceptor!(preadv2, PREADV2, libc::off_t);
preadv2_interceptor!(preadv64v2, PREADV64V2, libc::off64_t);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn __pread_chk(
    fd: c_int,
    buf: *mut c_void,
    nbytes: libc::size_t,
    offset: libc::off_t,
    buflen: libc::size_t,
) -> libc::ssize_t {
    let real = real_or!(
        PREAD_CHK,
        unsafe extern "C" fn(
            c_int,
            *mut c_void,
            libc::size_t,
            libc::off_t,
            libc::size_t,
        ) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    let rc = real(fd, buf, nbytes, offset, buflen);
    let _errno = ErrnoGuard::capture();
    do_io(fd, t0, rc != -1, rc.max(0) as u64, IoDir::In, false, false, "__pread_chk");
    rc
}

/// Pass-through: the binding to the real symbol is recorded, no metric
/// update fires.
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn __read_chk(
    fd: c_int,
    buf: *mut c_void,
    nbytes: libc::size_t,
    buflen: libc::size_t,
) -> libc::ssize_t {
    let real = real_or!(
        READ_CHK,
        unsafe extern "C" fn(c_int, *mut c_void, libc::size_t, libc::size_t) -> libc::ssize_t,
        -1
    );
    real(fd, buf, nbytes, buflen)
}

macro_rules! fread_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            ptr: *mut c_void,
            size: libc::size_t,
            nmemb: libc::size_t,
            stream: *mut libc::FILE,
        ) -> libc::size_t {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(
                    *mut c_void,
                    libc::size_t,
                    libc::size_t,
                    *mut libc::FILE,
                ) -> libc::size_t,
                0
            );
            let t0 = timer_start();
            let rc = real(ptr, size, nmemb, stream);
            let _errno = ErrnoGuard::capture();
            do_io(
                stream_fd(stream),
                t0,
                rc == nmemb,
                (rc as u64).saturating_mul(size as u64),
                IoDir::In,
                false,
                false,
                stringify!($name),
            );
            rc
        }
    };
}

fread_interceptor!(fread, FREAD);
fread_interceptor!(fread_unlocked, FREAD_UNLOCKED);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn __fread_chk(
    ptr: *mut c_void,
    ptrlen: libc::size_t,
    size: libc::size_t,
    nmemb: libc::size_t,
    stream: *mut libc::FILE,
) -> libc::size_t {
    let real = real_or!(
        FREAD_CHK,
        unsafe extern "C" fn(
            *mut c_void,
            libc::size_t,
            libc::size_t,
            libc::size_t,
            *mut libc::FILE,
        ) -> libc::size_t,
        0
    );
    let t0 = timer_start();
    let rc = real(ptr, ptrlen, size, nmemb, stream);
    let _errno = ErrnoGuard::capture();
    do_io(
        stream_fd(stream),
        t0,
        rc == nmemb,
        (rc as u64).saturating_mul(size as u64),
        IoDir::In,
        false,
        false,
        "__fread_chk",
    );
    rc
}

/// Pass-through, like `__read_chk`.
#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn __fread_unlocked_chk(
    ptr: *mut c_void,
    ptrlen: libc::size_t,
    size: libc::size_t,
    nmemb: libc::size_t,
    stream: *mut libc::FILE,
) -> libc::size_t {
    let real = real_or!(
        FREAD_UNLOCKED_CHK,
        unsafe extern "C" fn(
            *mut c_void,
            libc::size_t,
            libc::size_t,
            libc::size_t,
            *mut libc::FILE,
        ) -> libc::size_t,
        0
    );
    real(ptr, ptrlen, size, nmemb, stream)
}

macro_rules! fgets_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            s: *mut c_char,
            n: c_int,
            stream: *mut libc::FILE,
        ) -> *mut c_char {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(*mut c_char, c_int, *mut libc::FILE) -> *mut c_char,
                std::ptr::null_mut()
            );
            let t0 = timer_start();
            let rc = real(s, n, stream);
            let _errno = ErrnoGuard::capture();
            do_io(
                stream_fd(stream),
                t0,
                !rc.is_null(),
                n.max(0) as u64,
                IoDir::In,
                false,
                false,
                stringify!($name),
            );
            rc
        }
    };
}

fgets_interceptor!(fgets, FGETS);
fgets_interceptor!(fgets_unlocked, FGETS_UNLOCKED);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn __fgets_chk(
    s: *mut c_char,
    size: libc::size_t,
    strsize: c_int,
    stream: *mut libc::FILE,
) -> *mut c_char {
    let real = real_or!(
        FGETS_CHK,
        unsafe extern "C" fn(*mut c_char, libc::size_t, c_int, *mut libc::FILE) -> *mut c_char,
        std::ptr::null_mut()
    );
    let t0 = timer_start();
    let rc = real(s, size, strsize, stream);
    let _errno = ErrnoGuard::capture();
    do_io(stream_fd(stream), t0, !rc.is_null(), size as u64, IoDir::In, false, false, "__fgets_chk");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn fgetws(
    ws: *mut libc::wchar_t,
    n: c_int,
    stream: *mut libc::FILE,
) -> *mut libc::wchar_t {
    let real = real_or!(
        FGETWS,
        unsafe extern "C" fn(*mut libc::wchar_t, c_int, *mut libc::FILE) -> *mut libc::wchar_t,
        std::ptr::null_mut()
    );
    let t0 = timer_start();
    let rc = real(ws, n, stream);
    let _errno = ErrnoGuard::capture();
    let bytes = (n.max(0) as u64).saturating_mul(std::mem::size_of::<libc::wchar_t>() as u64);
    do_io(stream_fd(stream), t0, !rc.is_null(), bytes, IoDir::In, false, false, "fgetws");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn __fgetws_chk(
    ws: *mut libc::wchar_t,
    size: libc::size_t,
    strsize: c_int,
    stream: *mut libc::FILE,
) -> *mut libc::wchar_t {
    let real = real_or!(
        FGETWS_CHK,
        unsafe extern "C" fn(
            *mut libc::wchar_t,
            libc::size_t,
            c_int,
            *mut libc::FILE,
        ) -> *mut libc::wchar_t,
        std::ptr::null_mut()
    );
    let t0 = timer_start();
    let rc = real(ws, size, strsize, stream);
    let _errno = ErrnoGuard::capture();
    let bytes = (size as u64).saturating_mul(std::mem::size_of::<libc::wchar_t>() as u64);
    do_io(stream_fd(stream), t0, !rc.is_null(), bytes, IoDir::In, false, false, "__fgetws_chk");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn fgetwc(stream: *mut libc::FILE) -> libc::c_uint {
    let real = real_or!(FGETWC, unsafe extern "C" fn(*mut libc::FILE) -> libc::c_uint, WEOF);
    let t0 = timer_start();
    let rc = real(stream);
    let _errno = ErrnoGuard::capture();
    do_io(
        stream_fd(stream),
        t0,
        rc != WEOF,
        std::mem::size_of::<libc::c_uint>() as u64,
        IoDir::In,
        false,
        false,
        "fgetwc",
    );
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn fgetc(stream: *mut libc::FILE) -> c_int {
    let real = real_or!(FGETC, unsafe extern "C" fn(*mut libc::FILE) -> c_int, libc::EOF);
    let t0 = timer_start();
    let rc = real(stream);
    let _errno = ErrnoGuard::capture();
    do_io(stream_fd(stream), t0, rc != libc::EOF, 1, IoDir::In, false, false, "fgetc");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn getline(
    lineptr: *mut *mut c_char,
    n: *mut libc::size_t,
    stream: *mut libc::FILE,
) -> libc::ssize_t {
    let real = real_or!(
        GETLINE,
        unsafe extern "C" fn(*mut *mut c_char, *mut libc::size_t, *mut libc::FILE) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    let rc = real(lineptr, n, stream);
    let _errno = ErrnoGuard::capture();
    let bytes = if n.is_null() { 0 } else { *n as u64 };
    do_io(stream_fd(stream), t0, rc != -1, bytes, IoDir::In, false, false, "getline");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn getdelim(
    lineptr: *mut *mut c_char,
    n: *mut libc::size_t,
    delimiter: c_int,
    stream: *mut libc::FILE,
) -> libc::ssize_t {
    let real = real_or!(
        GETDELIM,
        unsafe extern "C" fn(
            *mut *mut c_char,
            *mut libc::size_t,
            c_int,
            *mut libc::FILE,
        ) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    // glibc's getdelim calls __getdelim; flag the inner frame so the pair is
    // counted once.
    getdelim_enter();
    let rc = real(lineptr, n, delimiter, stream);
    let _errno = ErrnoGuard::capture();
    let bytes = if n.is_null() { 0 } else { *n as u64 };
    do_io(stream_fd(stream), t0, rc != -1, bytes, IoDir::In, false, false, "getdelim");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn __getdelim(
    lineptr: *mut *mut c_char,
    n: *mut libc::size_t,
    delimiter: c_int,
    stream: *mut libc::FILE,
) -> libc::ssize_t {
    let real = real_or!(
        GETDELIM_GLIBC,
        unsafe extern "C" fn(
            *mut *mut c_char,
            *mut libc::size_t,
            c_int,
            *mut libc::FILE,
        ) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    let rc = real(lineptr, n, delimiter, stream);
    if getdelim_inner_should_skip() {
        return rc;
    }
    let _errno = ErrnoGuard::capture();
    let bytes = if n.is_null() { 0 } else { *n as u64 };
    do_io(stream_fd(stream), t0, rc != -1, bytes, IoDir::In, false, false, "__getdelim");
    rc
}

// --- write family ----------------------------------------------------------

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: libc::size_t) -> libc::ssize_t {
    let real = real_or!(
        WRITE,
        unsafe extern "C" fn(c_int, *const c_void, libc::size_t) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    let rc = real(fd, buf, count);
    let _errno = ErrnoGuard::capture();
    do_io(fd, t0, rc != -1, rc.max(0) as u64, IoDir::Out, false, false, "write");
    rc
}

macro_rules! pwrite_interceptor {
    ($name:ident, $slot:ident, $off:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            fd: c_int,
            buf: *const c_void,
            count: libc::size_t,
            offset: $off,
        ) -> libc::ssize_t {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(c_int, *const c_void, libc::size_t, $off) -> libc::ssize_t,
                -1
            );
            let t0 = timer_start();
            let rc = real(fd, buf, count, offset);
            let _errno = ErrnoGuard::capture();
            do_io(fd, t0, rc != -1, rc.max(0) as u64, IoDir::Out, false, false, stringify!($name));
            rc
        }
    };
}

pwrite_interceptor!(pwrite, PWRITE, libc::off_t);
pwrite_interceptor!(pwrite64, PWRITE64, libc::off64_t);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> libc::ssize_t {
    let real = real_or!(
        WRITEV,
        unsafe extern "C" fn(c_int, *const libc::iovec, c_int) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    let rc = real(fd, iov, iovcnt);
    let _errno = ErrnoGuard::capture();
    do_io(fd, t0, rc != -1, rc.max(0) as u64, IoDir::Out, true, false, "writev");
    rc
}

macro_rules! pwritev_interceptor {
    ($name:ident, $slot:ident, $off:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            fd: c_int,
            iov: *const libc::iovec,
            iovcnt: c_int,
            offset: $off,
        ) -> libc::ssize_t {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(c_int, *const libc::iovec, c_int, $off) -> libc::ssize_t,
                -1
            );
            let t0 = timer_start();
            let rc = real(fd, iov, iovcnt, offset);
            let _errno = ErrnoGuard::capture();
            do_io(fd, t0, rc != -1, rc.max(0) as u64, IoDir::Out, true, false, stringify!($name));
            rc
        }
    };
}

pwritev_interceptor!(pwritev, PWRITEV, libc::off_t);
pwritev_interceptor!(pwritev64, PWRITEV64, libc::off64_t);

macro_rules! pwritev2_interceptor {
    ($name:ident, $slot:ident, $off:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            fd: c_int,
            iov: *const libc::iovec,
            iovcnt: c_int,
            offset: $off,
            flags: c_int,
        ) -> libc::ssize_t {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(
                    c_int,
                    *const libc::iovec,
                    c_int,
                    $off,
                    c_int,
                ) -> libc::ssize_t,
                -1
            );
            let t0 = timer_start();
            let rc = real(fd, iov, iovcnt, offset, flags);
            let _errno = ErrnoGuard::capture();
            do_io(fd, t0, rc != -1, rc.max(0) as u64, IoDir::Out, true, false, stringify!($name));
            rc
        }
    };
}

pwritev2_interceptor!(pwritev2, PWRITEV2, libc::off_t);
pwritev2_interceptor!(pwritev64v2, PWRITEV64V2, libc::off64_t);

macro_rules! fwrite_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            ptr: *const c_void,
            size: libc::size_t,
            nitems: libc::size_t,
            stream: *mut libc::FILE,
        ) -> libc::size_t {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(
                    *const c_void,
                    libc::size_t,
                    libc::size_t,
                    *mut libc::FILE,
                ) -> libc::size_t,
                0
            );
            let t0 = timer_start();
            let rc = real(ptr, size, nitems, stream);
            let _errno = ErrnoGuard::capture();
            do_io(
                stream_fd(stream),
                t0,
                rc == nitems,
                (rc as u64).saturating_mul(size as u64),
                IoDir::Out,
                false,
                false,
                stringify!($name),
            );
            rc
        }
    };
}

fwrite_interceptor!(fwrite, FWRITE);
fwrite_interceptor!(fwrite_unlocked, FWRITE_UNLOCKED);

macro_rules! fputs_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(s: *const c_char, stream: *mut libc::FILE) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(*const c_char, *mut libc::FILE) -> c_int,
                libc::EOF
            );
            let t0 = timer_start();
            let rc = real(s, stream);
            let _errno = ErrnoGuard::capture();
            let bytes = if s.is_null() { 0 } else { libc::strlen(s) as u64 };
            do_io(stream_fd(stream), t0, rc != libc::EOF, bytes, IoDir::Out, false, false, stringify!($name));
            rc
        }
    };
}

fputs_interceptor!(fputs, FPUTS);
fputs_interceptor!(fputs_unlocked, FPUTS_UNLOCKED);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn fputws(ws: *const libc::wchar_t, stream: *mut libc::FILE) -> c_int {
    let real = real_or!(
        FPUTWS,
        unsafe extern "C" fn(*const libc::wchar_t, *mut libc::FILE) -> c_int,
        libc::EOF
    );
    let t0 = timer_start();
    let rc = real(ws, stream);
    let _errno = ErrnoGuard::capture();
    let bytes = if ws.is_null() {
        0
    } else {
        (libc::wcslen(ws) as u64).saturating_mul(std::mem::size_of::<libc::wchar_t>() as u64)
    };
    do_io(stream_fd(stream), t0, rc != libc::EOF, bytes, IoDir::Out, false, false, "fputws");
    rc
}

macro_rules! fputc_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(c: c_int, stream: *mut libc::FILE) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(c_int, *mut libc::FILE) -> c_int,
                libc::EOF
            );
            let t0 = timer_start();
            let rc = real(c, stream);
            let _errno = ErrnoGuard::capture();
            do_io(stream_fd(stream), t0, rc != libc::EOF, 1, IoDir::Out, false, false, stringify!($name));
            rc
        }
    };
}

fputc_interceptor!(fputc, FPUTC);
fputc_interceptor!(fputc_unlocked, FPUTC_UNLOCKED);

macro_rules! putwc_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(wc: libc::wchar_t, stream: *mut libc::FILE) -> libc::c_uint {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(libc::wchar_t, *mut libc::FILE) -> libc::c_uint,
                WEOF
            );
            let t0 = timer_start();
            let rc = real(wc, stream);
            let _errno = ErrnoGuard::capture();
            do_io(
                stream_fd(stream),
                t0,
                rc != WEOF,
                std::mem::size_of::<libc::c_uint>() as u64,
                IoDir::Out,
                false,
                false,
                stringify!($name),
            );
            rc
        }
    };
}

putwc_interceptor!(putwc, PUTWC);
putwc_interceptor!(fputwc, FPUTWC);

// --- sendfile --------------------------------------------------------------

/// The input side is always a file read; the output side is additionally a
/// network send when the output descriptor is a socket. Both use the byte
/// total the real call reported.
pub(crate) fn do_sendfile(out_fd: RawFd, in_fd: RawFd, t0: u64, rc: libc::ssize_t, op: &'static str) {
    let Some(agent) = super::agent() else { return };
    if rc == -1 {
        do_io(in_fd, t0, false, 0, IoDir::In, false, false, op);
        return;
    }
    let bytes = rc as u64;
    do_io(in_fd, t0, true, bytes, IoDir::In, false, false, op);
    let out_is_net = agent
        .fds
        .get(out_fd)
        .map(|r| r.kind().is_net())
        .unwrap_or(false);
    if out_is_net {
        do_io(out_fd, t0, true, bytes, IoDir::Out, false, true, op);
    }
}

macro_rules! sendfile_interceptor {
    ($name:ident, $slot:ident, $off:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            out_fd: c_int,
            in_fd: c_int,
            offset: *mut $off,
            count: libc::size_t,
        ) -> libc::ssize_t {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(c_int, c_int, *mut $off, libc::size_t) -> libc::ssize_t,
                -1
            );
            let t0 = timer_start();
            let rc = real(out_fd, in_fd, offset, count);
            let _errno = ErrnoGuard::capture();
            do_sendfile(out_fd, in_fd, t0, rc, stringify!($name));
            rc
        }
    };
}

sendfile_interceptor!(sendfile, SENDFILE, libc::off_t);
sendfile_interceptor!(sendfile64, SENDFILE64, libc::off64_t);

// --- seek family -----------------------------------------------------------

macro_rules! lseek_interceptor {
    ($name:ident, $slot:ident, $off:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(fd: c_int, offset: $off, whence: c_int) -> $off {
            let real = real_or!($slot, unsafe extern "C" fn(c_int, $off, c_int) -> $off, -1);
            let rc = real(fd, offset, whence);
            let _errno = ErrnoGuard::capture();
            do_seek(fd, rc != -1, stringify!($name));
            rc
        }
    };
}

lseek_interceptor!(lseek, LSEEK, libc::off_t);
lseek_interceptor!(lseek64, LSEEK64, libc::off64_t);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn fseek(stream: *mut libc::FILE, offset: c_long, whence: c_int) -> c_int {
    let real = real_or!(
        FSEEK,
        unsafe extern "C" fn(*mut libc::FILE, c_long, c_int) -> c_int,
        -1
    );
    let rc = real(stream, offset, whence);
    let _errno = ErrnoGuard::capture();
    do_seek(stream_fd(stream), rc != -1, "fseek");
    rc
}

macro_rules! fseeko_interceptor {
    ($name:ident, $slot:ident, $off:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(stream: *mut libc::FILE, offset: $off, whence: c_int) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(*mut libc::FILE, $off, c_int) -> c_int,
                -1
            );
            let rc = real(stream, offset, whence);
            let _errno = ErrnoGuard::capture();
            do_seek(stream_fd(stream), rc != -1, stringify!($name));
            rc
        }
    };
}

fseeko_interceptor!(fseeko, FSEEKO, libc::off_t);
fseeko_interceptor!(fseeko64, FSEEKO64, libc::off64_t);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn ftell(stream: *mut libc::FILE) -> c_long {
    let real = real_or!(FTELL, unsafe extern "C" fn(*mut libc::FILE) -> c_long, -1);
    let rc = real(stream);
    let _errno = ErrnoGuard::capture();
    do_seek(stream_fd(stream), rc != -1, "ftell");
    rc
}

macro_rules! ftello_interceptor {
    ($name:ident, $slot:ident, $off:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(stream: *mut libc::FILE) -> $off {
            let real = real_or!($slot, unsafe extern "C" fn(*mut libc::FILE) -> $off, -1);
            let rc = real(stream);
            let _errno = ErrnoGuard::capture();
            do_seek(stream_fd(stream), rc != -1, stringify!($name));
            rc
        }
    };
}

ftello_interceptor!(ftello, FTELLO, libc::off_t);
ftello_interceptor!(ftello64, FTELLO64, libc::off64_t);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn rewind(stream: *mut libc::FILE) {
    let Some(real) = fntable::REWIND.typed::<unsafe extern "C" fn(*mut libc::FILE)>() else {
        return;
    };
    real(stream);
    let _errno = ErrnoGuard::capture();
    do_seek(stream_fd(stream), true, "rewind");
}

macro_rules! fsetpos_interceptor {
    ($name:ident, $slot:ident, $pos:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(stream: *mut libc::FILE, pos: *const $pos) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(*mut libc::FILE, *const $pos) -> c_int,
                -1
            );
            let rc = real(stream, pos);
            let _errno = ErrnoGuard::capture();
            do_seek(stream_fd(stream), rc == 0, stringify!($name));
            rc
        }
    };
}

fsetpos_interceptor!(fsetpos, FSETPOS, libc::fpos_t);
fsetpos_interceptor!(fsetpos64, FSETPOS64, libc::fpos64_t);

macro_rules! fgetpos_interceptor {
    ($name:ident, $slot:ident, $pos:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(stream: *mut libc::FILE, pos: *mut $pos) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(*mut libc::FILE, *mut $pos) -> c_int,
                -1
            );
            let rc = real(stream, pos);
            let _errno = ErrnoGuard::capture();
            do_seek(stream_fd(stream), rc == 0, stringify!($name));
            rc
        }
    };
}

fgetpos_interceptor!(fgetpos, FGETPOS, libc::fpos_t);
fgetpos_interceptor!(fgetpos64, FGETPOS64, libc::fpos64_t);

// --- stat family -----------------------------------------------------------

macro_rules! stat_path_interceptor {
    ($name:ident, $slot:ident, $buf:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(path: *const c_char, buf: *mut $buf) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(*const c_char, *mut $buf) -> c_int,
                -1
            );
            let rc = real(path, buf);
            let _errno = ErrnoGuard::capture();
            do_stat(rc == 0, stringify!($name));
            rc
        }
    };
}

stat_path_interceptor!(statfs, STATFS, libc::statfs);
stat_path_interceptor!(statfs64, STATFS64, libc::statfs64);
stat_path_interceptor!(statvfs, STATVFS, libc::statvfs);
stat_path_interceptor!(statvfs64, STATVFS64, libc::statvfs64);

macro_rules! stat_fd_interceptor {
    ($name:ident, $slot:ident, $buf:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(fd: c_int, buf: *mut $buf) -> c_int {
            let real = real_or!($slot, unsafe extern "C" fn(c_int, *mut $buf) -> c_int, -1);
            let rc = real(fd, buf);
            let _errno = ErrnoGuard::capture();
            do_stat(rc == 0, stringify!($name));
            rc
        }
    };
}

stat_fd_interceptor!(fstatfs, FSTATFS, libc::statfs);
stat_fd_interceptor!(fstatfs64, FSTATFS64, libc::statfs64);
stat_fd_interceptor!(fstatvfs, FSTATVFS, libc::statvfs);
stat_fd_interceptor!(fstatvfs64, FSTATVFS64, libc::statvfs64);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn fstatat(
    dirfd: c_int,
    path: *const c_char,
    buf: *mut libc::stat,
    flags: c_int,
) -> c_int {
    let real = real_or!(
        FSTATAT,
        unsafe extern "C" fn(c_int, *const c_char, *mut libc::stat, c_int) -> c_int,
        -1
    );
    let rc = real(dirfd, path, buf, flags);
    let _errno = ErrnoGuard::capture();
    do_stat(rc == 0, "fstatat");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn statx(
    dirfd: c_int,
    pathname: *const c_char,
    flags: c_int,
    mask: c_uint,
    statxbuf: *mut libc::statx,
) -> c_int {
    let real = real_or!(
        STATX,
        unsafe extern "C" fn(c_int, *const c_char, c_int, c_uint, *mut libc::statx) -> c_int,
        -1
    );
    let rc = real(dirfd, pathname, flags, mask, statxbuf);
    let _errno = ErrnoGuard::capture();
    do_stat(rc == 0, "statx");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn access(pathname: *const c_char, mode: c_int) -> c_int {
    let real = real_or!(ACCESS, unsafe extern "C" fn(*const c_char, c_int) -> c_int, -1);
    let rc = real(pathname, mode);
    let _errno = ErrnoGuard::capture();
    do_stat(rc == 0, "access");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn faccessat(
    dirfd: c_int,
    pathname: *const c_char,
    mode: c_int,
    flags: c_int,
) -> c_int {
    let real = real_or!(
        FACCESSAT,
        unsafe extern "C" fn(c_int, *const c_char, c_int, c_int) -> c_int,
        -1
    );
    let rc = real(dirfd, pathname, mode, flags);
    let _errno = ErrnoGuard::capture();
    do_stat(rc == 0, "faccessat");
    rc
}

// Versioned glibc stat entry points; each delegates to the common path.

macro_rules! xstat_interceptor {
    ($name:ident, $slot:ident, $buf:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(ver: c_int, path: *const c_char, buf: *mut $buf) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(c_int, *const c_char, *mut $buf) -> c_int,
                -1
            );
            let rc = real(ver, path, buf);
            let _errno = ErrnoGuard::capture();
            do_stat(rc == 0, stringify!($name));
            rc
        }
    };
}

xstat_interceptor!(__xstat, XSTAT, libc::stat);
xstat_interceptor!(__xstat64, XSTAT64, libc::stat64);
xstat_interceptor!(__lxstat, LXSTAT, libc::stat);
xstat_interceptor!(__lxstat64, LXSTAT64, libc::stat64);

macro_rules! fxstat_interceptor {
    ($name:ident, $slot:ident, $buf:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(ver: c_int, fd: c_int, buf: *mut $buf) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(c_int, c_int, *mut $buf) -> c_int,
                -1
            );
            let rc = real(ver, fd, buf);
            let _errno = ErrnoGuard::capture();
            do_stat(rc == 0, stringify!($name));
            rc
        }
    };
}

fxstat_interceptor!(__fxstat, FXSTAT, libc::stat);
fxstat_interceptor!(__fxstat64, FXSTAT64, libc::stat64);

macro_rules! fxstatat_interceptor {
    ($name:ident, $slot:ident, $buf:ty) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(
            ver: c_int,
            dirfd: c_int,
            path: *const c_char,
            buf: *mut $buf,
            flags: c_int,
        ) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(c_int, c_int, *const c_char, *mut $buf, c_int) -> c_int,
                -1
            );
            let rc = real(ver, dirfd, path, buf, flags);
            let _errno = ErrnoGuard::capture();
            do_stat(rc == 0, stringify!($name));
            rc
        }
    };
}

fxstatat_interceptor!(__fxstatat, FXSTATAT, libc::stat);
fxstatat_interceptor!(__fxstatat64, FXSTATAT64, libc::stat64);

// --- fcntl / dup family ----------------------------------------------------

macro_rules! fcntl_interceptor {
    ($name:ident, $slot:ident) => {
        #[cfg_attr(not(test), no_mangle)]
        pub unsafe extern "C" fn $name(fd: c_int, cmd: c_int, arg: c_long) -> c_int {
            let real = real_or!(
                $slot,
                unsafe extern "C" fn(c_int, c_int, c_long) -> c_int,
                -1
            );
            let rc = real(fd, cmd, arg);
            let _errno = ErrnoGuard::capture();
            if cmd == libc::F_DUPFD && rc != -1 {
                do_dup(fd, rc, stringify!($name));
            }
            rc
        }
    };
}

fcntl_interceptor!(fcntl, FCNTL);
fcntl_interceptor!(fcntl64, FCNTL64);

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn dup(fd: c_int) -> c_int {
    let real = real_or!(DUP, unsafe extern "C" fn(c_int) -> c_int, -1);
    let rc = real(fd);
    let _errno = ErrnoGuard::capture();
    if rc != -1 {
        do_dup(fd, rc, "dup");
    }
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn dup2(oldfd: c_int, newfd: c_int) -> c_int {
    let real = real_or!(DUP2, unsafe extern "C" fn(c_int, c_int) -> c_int, -1);
    let rc = real(oldfd, newfd);
    let _errno = ErrnoGuard::capture();
    do_dup2(oldfd, newfd, rc, "dup2");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn dup3(oldfd: c_int, newfd: c_int, flags: c_int) -> c_int {
    let real = real_or!(DUP3, unsafe extern "C" fn(c_int, c_int, c_int) -> c_int, -1);
    let rc = real(oldfd, newfd, flags);
    let _errno = ErrnoGuard::capture();
    do_dup2(oldfd, newfd, rc, "dup3");
    rc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{test_agent, test_guard};
    use std::sync::atomic::Ordering::SeqCst;

    #[test]
    fn sendfile_to_socket_reports_both_sides() {
        let _guard = test_guard();
        let agent = test_agent();
        crate::hooks::do_open(901, Some("/data/payload"), FdKind::File, "open");
        agent.fds.add_socket(902, libc::SOCK_STREAM);
        let fs_read = agent.agg.fs_read_bytes.load(SeqCst);
        let net_tx = agent.agg.net_tx_bytes.load(SeqCst);

        do_sendfile(902, 901, 0, 4096, "sendfile");

        assert_eq!(agent.agg.fs_read_bytes.load(SeqCst), fs_read + 4096);
        assert_eq!(agent.agg.net_tx_bytes.load(SeqCst), net_tx + 4096);
        agent.fds.close(901);
        agent.fds.close(902);
    }

    #[test]
    fn sendfile_between_files_reports_only_the_read() {
        let _guard = test_guard();
        let agent = test_agent();
        crate::hooks::do_open(903, Some("/data/in"), FdKind::File, "open");
        crate::hooks::do_open(904, Some("/data/out"), FdKind::File, "open");
        let fs_read = agent.agg.fs_read_bytes.load(SeqCst);
        let net_tx = agent.agg.net_tx_bytes.load(SeqCst);

        do_sendfile(904, 903, 0, 512, "sendfile");

        assert_eq!(agent.agg.fs_read_bytes.load(SeqCst), fs_read + 512);
        assert_eq!(agent.agg.net_tx_bytes.load(SeqCst), net_tx);
        agent.fds.close(903);
        agent.fds.close(904);
    }
}
