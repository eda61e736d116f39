// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! The descriptor state store: per-descriptor shadow records keyed by OS
//! descriptor, created by the open/socket/accept/connect interceptors and
//! destroyed by close/shutdown.
//!
//! Records live in a concurrency-safe map and carry atomic counters, so
//! cross-thread updates to the same descriptor never take a lock on the
//! interceptor fast path. The rarely-written endpoint and path fields sit
//! behind a small per-record mutex that only the connection-shaped calls and
//! the reporter touch.

pub mod aggregates;
pub mod payload;
pub mod tls;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering::SeqCst};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("descriptor {0} is not tracked")]
    UnknownDescriptor(RawFd),
    #[error("descriptor {0} is not valid")]
    InvalidDescriptor(RawFd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FdKind {
    File = 0,
    Stream = 1,
    Tcp = 2,
    Udp = 3,
    OtherNet = 4,
}

impl FdKind {
    pub fn name(self) -> &'static str {
        match self {
            FdKind::File => "file",
            FdKind::Stream => "stream",
            FdKind::Tcp => "tcp",
            FdKind::Udp => "udp",
            FdKind::OtherNet => "net",
        }
    }

    pub fn is_net(self) -> bool {
        matches!(self, FdKind::Tcp | FdKind::Udp | FdKind::OtherNet)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => FdKind::Stream,
            2 => FdKind::Tcp,
            3 => FdKind::Udp,
            4 => FdKind::OtherNet,
            _ => FdKind::File,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

/// Which instantaneous gauges this record has contributed to; close
/// decrements exactly these.
pub mod gauge {
    pub const OPEN_PORT: u8 = 1;
    pub const TCP_CONN: u8 = 1 << 1;
    pub const UDP_CONN: u8 = 1 << 2;
    pub const OTHER_CONN: u8 = 1 << 3;
}

#[derive(Debug, Default, Clone)]
struct FdInfo {
    path: Option<String>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    /// Last DNS name queried through this descriptor.
    dns_name: Option<String>,
}

pub struct FdRecord {
    pub fd: RawFd,
    kind: AtomicU8,
    info: Mutex<FdInfo>,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub ops: AtomicU64,
    /// Operations whose byte total spanned iovecs (scatter/gather).
    pub iov_ops: AtomicU64,
    pub errors: AtomicU64,
    pub duration_ns: AtomicU64,
    /// Set once a TLS session is attributed to this descriptor.
    pub tls: AtomicBool,
    gauge_flags: AtomicU8,
}

impl FdRecord {
    fn new(fd: RawFd, kind: FdKind) -> Self {
        Self {
            fd,
            kind: AtomicU8::new(kind as u8),
            info: Mutex::new(FdInfo::default()),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            ops: AtomicU64::new(0),
            iov_ops: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            duration_ns: AtomicU64::new(0),
            tls: AtomicBool::new(false),
            gauge_flags: AtomicU8::new(0),
        }
    }

    /// Mark a gauge contribution. Returns whether the flag was newly set,
    /// so each record increments a given gauge at most once.
    pub fn mark_gauge(&self, flag: u8) -> bool {
        self.gauge_flags.fetch_or(flag, SeqCst) & flag == 0
    }

    pub fn gauge_flags(&self) -> u8 {
        self.gauge_flags.load(SeqCst)
    }

    pub fn kind(&self) -> FdKind {
        FdKind::from_u8(self.kind.load(SeqCst))
    }

    fn set_kind(&self, kind: FdKind) {
        self.kind.store(kind as u8, SeqCst);
    }

    pub fn path(&self) -> Option<String> {
        self.info.lock().ok().and_then(|i| i.path.clone())
    }

    pub fn local(&self) -> Option<SocketAddr> {
        self.info.lock().ok().and_then(|i| i.local)
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.info.lock().ok().and_then(|i| i.remote)
    }

    pub fn dns_name(&self) -> Option<String> {
        self.info.lock().ok().and_then(|i| i.dns_name.clone())
    }

    pub fn add_in(&self, bytes: u64) {
        self.bytes_in.fetch_add(bytes, SeqCst);
        self.ops.fetch_add(1, SeqCst);
    }

    pub fn add_out(&self, bytes: u64) {
        self.bytes_out.fetch_add(bytes, SeqCst);
        self.ops.fetch_add(1, SeqCst);
    }

    pub fn add_duration(&self, ns: u64) {
        self.duration_ns.fetch_add(ns, SeqCst);
    }
}

/// Outcome of [`FdTable::open_for`], so the caller can count the lifecycle
/// anomaly when a descriptor reappears without an intervening close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Created,
    /// The process bypassed interception somewhere; the record was updated
    /// in place.
    Reopened,
}

pub struct FdTable {
    map: DashMap<RawFd, Arc<FdRecord>>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FdTable {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Record a successful open. Idempotent per fd: a re-open of a live
    /// record updates kind and path in place and reports `Reopened`.
    pub fn open_for(&self, fd: RawFd, kind: FdKind, path: Option<&str>) -> OpenOutcome {
        if fd < 0 {
            return OpenOutcome::Created;
        }
        if let Some(existing) = self.map.get(&fd) {
            existing.set_kind(kind);
            if let Ok(mut info) = existing.info.lock() {
                info.path = path.map(str::to_string);
                info.local = None;
                info.remote = None;
                info.dns_name = None;
            }
            existing.bytes_in.store(0, SeqCst);
            existing.bytes_out.store(0, SeqCst);
            existing.ops.store(0, SeqCst);
            existing.iov_ops.store(0, SeqCst);
            existing.errors.store(0, SeqCst);
            existing.duration_ns.store(0, SeqCst);
            existing.tls.store(false, SeqCst);
            existing.gauge_flags.store(0, SeqCst);
            return OpenOutcome::Reopened;
        }
        let record = Arc::new(FdRecord::new(fd, kind));
        if let Some(path) = path {
            if let Ok(mut info) = record.info.lock() {
                info.path = Some(path.to_string());
            }
        }
        self.map.insert(fd, record);
        OpenOutcome::Created
    }

    /// Register a fresh socket, classifying by socket type.
    pub fn add_socket(&self, fd: RawFd, sock_type: libc::c_int) -> FdKind {
        let kind = match sock_type & 0xf {
            libc::SOCK_STREAM => FdKind::Tcp,
            libc::SOCK_DGRAM => FdKind::Udp,
            _ => FdKind::OtherNet,
        };
        self.open_for(fd, kind, None);
        kind
    }

    /// Remove the record for a closed descriptor. `None` means the close was
    /// for a descriptor this module never saw open.
    pub fn close(&self, fd: RawFd) -> Option<Arc<FdRecord>> {
        self.map.remove(&fd).map(|(_, record)| record)
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<FdRecord>> {
        self.map.get(&fd).map(|r| Arc::clone(&r))
    }

    /// Duplicate `old` into `new`: same kind and endpoints, zeroed counters,
    /// so bytes are never double-counted on the target descriptor.
    pub fn dup(&self, old: RawFd, new: RawFd) -> Result<(), StoreError> {
        if new < 0 {
            return Err(StoreError::InvalidDescriptor(new));
        }
        let source = self.get(old).ok_or(StoreError::UnknownDescriptor(old))?;
        let copy = FdRecord::new(new, source.kind());
        if let (Ok(mut dst), Ok(src)) = (copy.info.lock(), source.info.lock()) {
            *dst = src.clone();
        }
        self.map.insert(new, Arc::new(copy));
        Ok(())
    }

    /// dup2/dup3: a live target record is closed first; the displaced record
    /// is handed back so the caller can account the implicit close.
    pub fn dup_replace(&self, old: RawFd, new: RawFd) -> (Option<Arc<FdRecord>>, bool) {
        if old == new {
            return (None, false);
        }
        let displaced = self.close(new);
        let duplicated = self.dup(old, new).is_ok();
        (displaced, duplicated)
    }

    pub fn set_connection(&self, fd: RawFd, addr: SocketAddr, side: Side) {
        let Some(record) = self.get(fd) else {
            return;
        };
        if let Ok(mut info) = record.info.lock() {
            match side {
                Side::Local => info.local = Some(addr),
                Side::Remote => info.remote = Some(addr),
            }
        };
    }

    pub fn set_dns_name(&self, fd: RawFd, name: &str) {
        if let Some(record) = self.get(fd) {
            if let Ok(mut info) = record.info.lock() {
                info.dns_name = Some(name.to_string());
            }
        }
    }

    /// DNS-candidate classification for the send-side payload parse.
    pub fn remote_port_is_dns(&self, fd: RawFd) -> bool {
        self.get(fd)
            .and_then(|r| r.remote())
            .is_some_and(|addr| addr.port() == payload::DNS_PORT)
    }

    pub fn local_port(&self, fd: RawFd) -> Option<u16> {
        self.get(fd).and_then(|r| r.local()).map(|a| a.port())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Visit every record; the reporter uses this for per-descriptor line
    /// items.
    pub fn for_each(&self, mut f: impl FnMut(&FdRecord)) {
        for entry in self.map.iter() {
            f(entry.value());
        }
    }

    /// Remove every stream-kind record (`fcloseall`), returning how many.
    pub fn close_streams(&self) -> usize {
        let streams: Vec<RawFd> = self
            .map
            .iter()
            .filter(|e| e.value().kind() == FdKind::Stream)
            .map(|e| *e.key())
            .collect();
        let count = streams.len();
        for fd in streams {
            self.map.remove(&fd);
        }
        count
    }

    /// Fork-child reset: the child inherits descriptors but its metric
    /// identity is new.
    pub fn reset(&self) {
        self.map.clear();
    }
}

/// Decode an `AF_INET`/`AF_INET6` sockaddr the target handed to a socket
/// call. Anything else (unix sockets, netlink) is not an endpoint we track.
///
/// # Safety
/// `addr` must point to at least `len` readable bytes, or be null.
pub unsafe fn sockaddr_to_addr(addr: *const libc::sockaddr, len: libc::socklen_t) -> Option<SocketAddr> {
    if addr.is_null() {
        return None;
    }
    match (*addr).sa_family as libc::c_int {
        libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
            let sin = &*(addr as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
            let sin6 = &*(addr as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn open_write_close_round_trip() {
        let table = FdTable::new();
        assert_eq!(
            table.open_for(7, FdKind::File, Some("/tmp/x")),
            OpenOutcome::Created
        );
        let record = table.get(7).unwrap();
        record.add_out(5);
        assert_eq!(record.bytes_out.load(SeqCst), 5);
        assert_eq!(record.path().as_deref(), Some("/tmp/x"));

        let closed = table.close(7).unwrap();
        assert_eq!(closed.bytes_out.load(SeqCst), 5);
        assert!(table.get(7).is_none());
        assert!(table.close(7).is_none());
    }

    #[test]
    fn reopen_without_close_is_flagged_and_rezeroed() {
        let table = FdTable::new();
        table.open_for(4, FdKind::File, Some("/a"));
        table.get(4).unwrap().add_out(100);
        assert_eq!(
            table.open_for(4, FdKind::Stream, Some("/b")),
            OpenOutcome::Reopened
        );
        let record = table.get(4).unwrap();
        assert_eq!(record.kind(), FdKind::Stream);
        assert_eq!(record.path().as_deref(), Some("/b"));
        assert_eq!(record.bytes_out.load(SeqCst), 0);
    }

    #[test]
    fn sockets_classify_by_type() {
        let table = FdTable::new();
        assert_eq!(table.add_socket(3, libc::SOCK_STREAM), FdKind::Tcp);
        assert_eq!(
            table.add_socket(4, libc::SOCK_DGRAM | libc::SOCK_NONBLOCK),
            FdKind::Udp
        );
        assert_eq!(table.add_socket(5, libc::SOCK_RAW), FdKind::OtherNet);
    }

    #[test]
    fn dup_copies_identity_but_not_counters() {
        let table = FdTable::new();
        table.add_socket(3, libc::SOCK_STREAM);
        table.set_connection(3, addr("127.0.0.1:80"), Side::Remote);
        table.get(3).unwrap().add_out(512);

        table.dup(3, 9).unwrap();
        let copy = table.get(9).unwrap();
        assert_eq!(copy.kind(), FdKind::Tcp);
        assert_eq!(copy.remote(), Some(addr("127.0.0.1:80")));
        assert_eq!(copy.bytes_out.load(SeqCst), 0);

        assert!(matches!(
            table.dup(99, 10),
            Err(StoreError::UnknownDescriptor(99))
        ));
    }

    #[test]
    fn dup_replace_closes_live_target_first() {
        let table = FdTable::new();
        table.open_for(5, FdKind::File, Some("/old"));
        table.open_for(6, FdKind::File, Some("/target"));
        let (displaced, duplicated) = table.dup_replace(5, 6);
        assert_eq!(displaced.unwrap().path().as_deref(), Some("/target"));
        assert!(duplicated);
        assert_eq!(table.get(6).unwrap().path().as_deref(), Some("/old"));

        // Same-fd dup2 is a no-op.
        let (displaced, duplicated) = table.dup_replace(6, 6);
        assert!(displaced.is_none());
        assert!(!duplicated);
    }

    #[test]
    fn dns_candidate_needs_port_53() {
        let table = FdTable::new();
        table.add_socket(8, libc::SOCK_DGRAM);
        assert!(!table.remote_port_is_dns(8));
        table.set_connection(8, addr("8.8.8.8:53"), Side::Remote);
        assert!(table.remote_port_is_dns(8));
        table.set_connection(8, addr("8.8.8.8:443"), Side::Remote);
        assert!(!table.remote_port_is_dns(8));
    }

    #[test]
    fn close_streams_only_touches_streams() {
        let table = FdTable::new();
        table.open_for(3, FdKind::Stream, Some("/a"));
        table.open_for(4, FdKind::File, Some("/b"));
        table.open_for(5, FdKind::Stream, Some("/c"));
        assert_eq!(table.close_streams(), 2);
        assert!(table.get(3).is_none());
        assert!(table.get(4).is_some());
    }

    #[test]
    fn decodes_inet_sockaddrs() {
        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = 8080u16.to_be();
        sin.sin_addr.s_addr = u32::from(Ipv4Addr::new(127, 0, 0, 1)).to_be();
        let decoded = unsafe {
            sockaddr_to_addr(
                &sin as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        assert_eq!(decoded, Some(addr("127.0.0.1:8080")));

        let decoded = unsafe { sockaddr_to_addr(std::ptr::null(), 0) };
        assert_eq!(decoded, None);
    }
}
