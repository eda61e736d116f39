// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! Interceptor glue. Every exported interceptor follows the same contract:
//!
//! 1. resolve the real function from the table, or return the symbol's
//!    "unavailable" sentinel;
//! 2. capture a pre-call timestamp when the call is a timed class;
//! 3. call the real function;
//! 4. update the stores from the result;
//! 5. return the real result verbatim, errno included.
//!
//! The helpers here implement steps 2, 4 and 5. A `None` from [`agent`]
//! means the load constructor has not finished; the interceptor then skips
//! every store update and behaves as a pure pass-through.
//!
//! The exported symbols carry `#[cfg_attr(not(test), no_mangle)]`: under
//! `cfg(test)` they stay mangled so the unit-test binary does not interpose
//! on its own libc calls.

pub mod dns;
pub mod fs;
pub mod net;
pub mod process;
pub mod tls;

use std::cell::Cell;
use std::ffi::CStr;
use std::os::fd::RawFd;
use std::os::raw::{c_char, c_void};
use std::sync::atomic::Ordering::SeqCst;

use serde_json::json;

use crate::agent::Agent;
use crate::events::Event;
use crate::state::aggregates::ErrorClass;
use crate::state::tls::TlsDirection;
use crate::state::{self, payload, FdKind, OpenOutcome, Side};

thread_local! {
    // Set on the reporter thread. Its own transport and procfs traffic
    // flows through the interceptors like anyone else's; this keeps it out
    // of the stores so the module never observes itself.
    static AGENT_THREAD: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn mark_agent_thread() {
    AGENT_THREAD.with(|flag| flag.set(true));
}

/// Scoped variant for agent work on a target thread (the load constructor,
/// the fork-child reset): interception resumes when the guard drops.
pub(crate) struct AgentSection {
    was_marked: bool,
}

impl AgentSection {
    pub fn enter() -> Self {
        let was_marked = AGENT_THREAD.with(|flag| flag.replace(true));
        Self { was_marked }
    }
}

impl Drop for AgentSection {
    fn drop(&mut self) {
        AGENT_THREAD.with(|flag| flag.set(self.was_marked));
    }
}

fn on_agent_thread() -> bool {
    AGENT_THREAD.with(|flag| flag.get())
}

pub(crate) fn agent() -> Option<&'static Agent> {
    if on_agent_thread() {
        return None;
    }
    Agent::get()
}

/// Captures errno around the store updates so the target sees exactly the
/// real function's error channel.
pub(crate) struct ErrnoGuard {
    saved: libc::c_int,
}

impl ErrnoGuard {
    pub fn capture() -> Self {
        // SAFETY: errno_location is always valid on the calling thread.
        Self {
            saved: unsafe { *libc::__errno_location() },
        }
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        unsafe { *libc::__errno_location() = self.saved };
    }
}

pub(crate) fn set_errno(value: libc::c_int) {
    unsafe { *libc::__errno_location() = value };
}

/// Pre-call timestamp for the timed classes; 0 when the agent is not up.
pub(crate) fn timer_start() -> u64 {
    agent().map(|a| a.clock.now()).unwrap_or(0)
}

fn elapsed_ns(agent: &Agent, t0: u64) -> u64 {
    if t0 == 0 {
        0
    } else {
        agent.clock.duration_ns(t0)
    }
}

pub(crate) unsafe fn cstr_opt<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        None
    } else {
        CStr::from_ptr(ptr).to_str().ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoDir {
    In,
    Out,
}

pub(crate) fn do_open(fd: RawFd, path: Option<&str>, kind: FdKind, op: &'static str) {
    let Some(agent) = agent() else { return };
    if fd < 0 {
        return;
    }
    if agent.fds.open_for(fd, kind, path) == OpenOutcome::Reopened {
        agent.agg.reopened_fds.fetch_add(1, SeqCst);
    }
    agent.agg.open_ops.fetch_add(1, SeqCst);
    let _ = op;
}

pub(crate) unsafe fn do_open_raw(fd: RawFd, path: *const c_char, kind: FdKind, op: &'static str) {
    do_open(fd, cstr_opt(path), kind, op);
}

pub(crate) fn do_open_error(path: *const c_char, op: &'static str) {
    let Some(agent) = agent() else { return };
    agent.agg.error(ErrorClass::FsOpenClose);
    let _ = (path, op);
}

/// Successful close: drop the record and roll back its gauge contributions.
/// Failed close: the matching error bucket. Close of an untracked fd is a
/// no-op plus a lifecycle-anomaly count.
pub(crate) fn do_close(fd: RawFd, success: bool, op: &'static str) {
    let Some(agent) = agent() else { return };
    if !success {
        let class = match agent.fds.get(fd).map(|r| r.kind()) {
            Some(kind) if kind.is_net() => ErrorClass::NetConn,
            _ => ErrorClass::FsOpenClose,
        };
        agent.agg.error(class);
        return;
    }
    match agent.fds.close(fd) {
        Some(record) => {
            let flags = record.gauge_flags();
            if flags & state::gauge::OPEN_PORT != 0 {
                agent.agg.open_ports.fetch_sub(1, SeqCst);
            }
            if flags & state::gauge::TCP_CONN != 0 {
                agent.agg.tcp_conns.fetch_sub(1, SeqCst);
            }
            if flags & state::gauge::UDP_CONN != 0 {
                agent.agg.udp_conns.fetch_sub(1, SeqCst);
            }
            if flags & state::gauge::OTHER_CONN != 0 {
                agent.agg.other_conns.fetch_sub(1, SeqCst);
            }
            agent.agg.close_ops.fetch_add(1, SeqCst);
        }
        None => {
            agent.agg.untracked_closes.fetch_add(1, SeqCst);
        }
    }
    let _ = op;
}

/// Byte accounting shared by every read/write/send/recv interceptor.
/// `iov` marks scatter/gather payloads (the byte total spans iovecs), so
/// downstream aggregation can tell them from scalar transfers. `default_net`
/// classifies descriptors the store has never seen (the socket-family
/// interceptors pass true).
pub(crate) fn do_io(
    fd: RawFd,
    t0: u64,
    ok: bool,
    bytes: u64,
    dir: IoDir,
    iov: bool,
    default_net: bool,
    op: &'static str,
) {
    let Some(agent) = agent() else { return };
    let record = agent.fds.get(fd);
    let is_net = record
        .as_ref()
        .map(|r| r.kind().is_net())
        .unwrap_or(default_net);

    if !ok {
        if let Some(record) = &record {
            record.errors.fetch_add(1, SeqCst);
        }
        agent.agg.error(if is_net {
            ErrorClass::NetRxTx
        } else {
            ErrorClass::FsReadWrite
        });
        return;
    }

    let ns = elapsed_ns(agent, t0);
    if let Some(record) = &record {
        match dir {
            IoDir::In => record.add_in(bytes),
            IoDir::Out => record.add_out(bytes),
        }
        if iov {
            record.iov_ops.fetch_add(1, SeqCst);
        }
        record.add_duration(ns);
    }
    match (is_net, dir) {
        (false, IoDir::In) => {
            agent.agg.read_ops.fetch_add(1, SeqCst);
            agent.agg.fs_read_bytes.fetch_add(bytes, SeqCst)
        }
        (false, IoDir::Out) => {
            agent.agg.write_ops.fetch_add(1, SeqCst);
            agent.agg.fs_write_bytes.fetch_add(bytes, SeqCst)
        }
        (true, IoDir::In) => {
            agent.agg.rx_ops.fetch_add(1, SeqCst);
            agent.agg.net_rx_bytes.fetch_add(bytes, SeqCst)
        }
        (true, IoDir::Out) => {
            agent.agg.tx_ops.fetch_add(1, SeqCst);
            agent.agg.net_tx_bytes.fetch_add(bytes, SeqCst)
        }
    };
    if iov {
        agent.agg.iov_ops.fetch_add(1, SeqCst);
    }
    if is_net {
        agent.agg.net_duration_ns.fetch_add(ns, SeqCst);
    } else {
        agent.agg.fs_duration_ns.fetch_add(ns, SeqCst);
    }
    let _ = op;
}

pub(crate) fn do_seek(fd: RawFd, ok: bool, op: &'static str) {
    let Some(agent) = agent() else { return };
    if ok {
        agent.agg.seek_ops.fetch_add(1, SeqCst);
    } else {
        if let Some(record) = agent.fds.get(fd) {
            record.errors.fetch_add(1, SeqCst);
        }
        agent.agg.error(ErrorClass::FsReadWrite);
    }
    let _ = op;
}

pub(crate) fn do_stat(ok: bool, op: &'static str) {
    let Some(agent) = agent() else { return };
    if ok {
        agent.agg.stat_ops.fetch_add(1, SeqCst);
    } else {
        agent.agg.error(ErrorClass::FsStat);
    }
    let _ = op;
}

/// DNS helper accounting: duration is always added, success and failure
/// split between the count and the error bucket.
pub(crate) fn do_dns_call(name: *const c_char, ok: bool, t0: u64, op: &'static str) {
    let Some(agent) = agent() else { return };
    let ns = elapsed_ns(agent, t0);
    agent.agg.dns_duration_ns.fetch_add(ns, SeqCst);
    let name = unsafe { cstr_opt(name) };
    if ok {
        agent.agg.dns_ops.fetch_add(1, SeqCst);
        if let Some(name) = name {
            agent.events.push(Event::new(
                "dns",
                json!({ "name": name, "duration_ns": ns, "op": op }),
            ));
        }
    } else {
        agent.agg.error(ErrorClass::NetDns);
    }
}

/// `dup`-style duplication; the fcntl F_DUPFD path lands here too.
pub(crate) fn do_dup(old: RawFd, new: RawFd, op: &'static str) {
    let Some(agent) = agent() else { return };
    if new < 0 {
        return;
    }
    if agent.fds.dup(old, new).is_ok() {
        agent.agg.open_ops.fetch_add(1, SeqCst);
    }
    let _ = op;
}

/// `dup2`/`dup3`: a tracked target fd is closed first.
pub(crate) fn do_dup2(old: RawFd, new: RawFd, rc: RawFd, op: &'static str) {
    let Some(agent) = agent() else { return };
    if rc < 0 {
        return;
    }
    let (displaced, duplicated) = agent.fds.dup_replace(old, new);
    if displaced.is_some() {
        agent.agg.close_ops.fetch_add(1, SeqCst);
    }
    if duplicated {
        agent.agg.open_ops.fetch_add(1, SeqCst);
    }
    let _ = op;
}

/// Send/recv-side URL sniff. Emits an event when URL capture is switched on
/// and the buffer opens with an HTTP request line.
pub(crate) unsafe fn capture_url(fd: RawFd, buf: *const c_void, len: usize, dir: &'static str) {
    let Some(agent) = agent() else { return };
    if !agent.url_capture() || buf.is_null() || len == 0 {
        return;
    }
    let window = std::slice::from_raw_parts(buf.cast::<u8>(), len);
    if let Some(url) = payload::extract_url(window) {
        agent
            .events
            .push(Event::new("url", json!({ "url": url, "fd": fd, "dir": dir })));
    }
}

/// UDP sends whose remote port is the DNS port additionally parse the
/// datagram as a query and record the name.
pub(crate) unsafe fn check_dns_send(fd: RawFd, buf: *const c_void, len: usize, duration_ns: u64) {
    let Some(agent) = agent() else { return };
    if buf.is_null() || len == 0 || !agent.fds.remote_port_is_dns(fd) {
        return;
    }
    let datagram = std::slice::from_raw_parts(buf.cast::<u8>(), len);
    if let Some(name) = payload::dns_query_name(datagram) {
        agent.fds.set_dns_name(fd, &name);
        agent.agg.dns_ops.fetch_add(1, SeqCst);
        agent.agg.dns_duration_ns.fetch_add(duration_ns, SeqCst);
        agent.events.push(Event::new(
            "dns",
            json!({ "name": name, "fd": fd, "duration_ns": duration_ns }),
        ));
    }
}

/// TLS byte attribution shared by all three interposition strategies.
pub(crate) fn do_tls(session: u64, fd: RawFd, bytes: u64, dir: TlsDirection) {
    let Some(agent) = agent() else { return };
    let fd = if fd >= 0 { Some(fd) } else { None };
    agent.tls.record(session, fd, dir, bytes);
    match dir {
        TlsDirection::Rx => agent.agg.tls_rx_bytes.fetch_add(bytes, SeqCst),
        TlsDirection::Tx => agent.agg.tls_tx_bytes.fetch_add(bytes, SeqCst),
    };
    if let Some(fd) = fd {
        if let Some(record) = agent.fds.get(fd) {
            record.tls.store(true, SeqCst);
        }
    }
}

pub(crate) fn set_connection_raw(
    fd: RawFd,
    addr: *const libc::sockaddr,
    len: libc::socklen_t,
    side: Side,
) {
    let Some(agent) = agent() else { return };
    if let Some(parsed) = unsafe { state::sockaddr_to_addr(addr, len) } {
        agent.fds.set_connection(fd, parsed, side);
    }
}

// getdelim calls __getdelim inside glibc; the outer interceptor sets this
// flag so the inner one reports nothing.
thread_local! {
    static IN_GETDELIM: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn getdelim_enter() {
    IN_GETDELIM.with(|flag| flag.set(true));
}

/// Returns whether the outer `getdelim` frame is active, clearing the flag.
pub(crate) fn getdelim_inner_should_skip() -> bool {
    IN_GETDELIM.with(|flag| flag.replace(false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{test_agent, test_guard};
    use std::net::SocketAddr;

    fn bytes_out_total(agent: &Agent) -> u64 {
        agent.agg.fs_write_bytes.load(SeqCst)
    }

    #[test]
    fn file_round_trip_counts_once() {
        let _guard = test_guard();
        let agent = test_agent();
        let opens = agent.agg.open_ops.load(SeqCst);
        let closes = agent.agg.close_ops.load(SeqCst);
        let written = bytes_out_total(agent);

        // open("/tmp/x") -> 7; write(7, "hello", 5) -> 5; close(7) -> 0
        do_open(7, Some("/tmp/x"), FdKind::File, "open");
        do_io(7, 0, true, 5, IoDir::Out, false, false, "write");
        do_close(7, true, "close");

        assert_eq!(agent.agg.open_ops.load(SeqCst), opens + 1);
        assert_eq!(agent.agg.close_ops.load(SeqCst), closes + 1);
        assert_eq!(bytes_out_total(agent), written + 5);
        assert!(agent.fds.get(7).is_none());
    }

    #[test]
    fn untracked_close_is_an_anomaly_not_an_error() {
        let _guard = test_guard();
        let agent = test_agent();
        let anomalies = agent.agg.untracked_closes.load(SeqCst);
        let errors = agent.agg.error_total(ErrorClass::FsOpenClose);

        do_close(7777, true, "close");

        assert_eq!(agent.agg.untracked_closes.load(SeqCst), anomalies + 1);
        assert_eq!(agent.agg.error_total(ErrorClass::FsOpenClose), errors);
    }

    #[test]
    fn failed_close_lands_in_the_fs_bucket() {
        let _guard = test_guard();
        let agent = test_agent();
        let errors = agent.agg.error_total(ErrorClass::FsOpenClose);
        do_close(7778, false, "close");
        assert_eq!(agent.agg.error_total(ErrorClass::FsOpenClose), errors + 1);
    }

    #[test]
    fn io_errors_classify_by_descriptor_kind() {
        let _guard = test_guard();
        let agent = test_agent();
        agent.fds.add_socket(810, libc::SOCK_STREAM);
        let net_errors = agent.agg.error_total(ErrorClass::NetRxTx);
        let fs_errors = agent.agg.error_total(ErrorClass::FsReadWrite);

        do_io(810, 0, false, 0, IoDir::In, false, false, "read");
        do_io(811, 0, false, 0, IoDir::In, false, false, "read");

        assert_eq!(agent.agg.error_total(ErrorClass::NetRxTx), net_errors + 1);
        assert_eq!(agent.agg.error_total(ErrorClass::FsReadWrite), fs_errors + 1);
        agent.fds.close(810);
    }

    #[test]
    fn io_counts_operations_and_flags_vectored_payloads() {
        let _guard = test_guard();
        let agent = test_agent();
        do_open(812, Some("/data/vec"), FdKind::File, "open");
        let reads = agent.agg.read_ops.load(SeqCst);
        let writes = agent.agg.write_ops.load(SeqCst);
        let iov = agent.agg.iov_ops.load(SeqCst);

        // readv reporting a 96-byte total across iovecs, then a scalar write
        do_io(812, 0, true, 96, IoDir::In, true, false, "readv");
        do_io(812, 0, true, 16, IoDir::Out, false, false, "write");

        assert_eq!(agent.agg.read_ops.load(SeqCst), reads + 1);
        assert_eq!(agent.agg.write_ops.load(SeqCst), writes + 1);
        assert_eq!(agent.agg.iov_ops.load(SeqCst), iov + 1);
        let record = agent.fds.get(812).unwrap();
        assert_eq!(record.iov_ops.load(SeqCst), 1);
        assert_eq!(record.bytes_in.load(SeqCst), 96);
        agent.fds.close(812);
    }

    #[test]
    fn net_io_counts_rx_and_tx_operations() {
        let _guard = test_guard();
        let agent = test_agent();
        agent.fds.add_socket(813, libc::SOCK_STREAM);
        let rx = agent.agg.rx_ops.load(SeqCst);
        let tx = agent.agg.tx_ops.load(SeqCst);

        do_io(813, 0, true, 100, IoDir::In, false, true, "recv");
        do_io(813, 0, true, 50, IoDir::Out, true, true, "sendmsg");

        assert_eq!(agent.agg.rx_ops.load(SeqCst), rx + 1);
        assert_eq!(agent.agg.tx_ops.load(SeqCst), tx + 1);
        agent.fds.close(813);
    }

    #[test]
    fn dup2_closes_live_target_and_zeroes_counters() {
        let _guard = test_guard();
        let agent = test_agent();
        do_open(820, Some("/src"), FdKind::File, "open");
        do_open(821, Some("/dst"), FdKind::File, "open");
        agent.fds.get(820).unwrap().add_out(64);
        let closes = agent.agg.close_ops.load(SeqCst);

        do_dup2(820, 821, 821, "dup2");

        assert_eq!(agent.agg.close_ops.load(SeqCst), closes + 1);
        let target = agent.fds.get(821).unwrap();
        assert_eq!(target.path().as_deref(), Some("/src"));
        assert_eq!(target.bytes_out.load(SeqCst), 0);
        agent.fds.close(820);
        agent.fds.close(821);
    }

    #[test]
    fn udp_dns_send_emits_an_event_with_duration() {
        let _guard = test_guard();
        let agent = test_agent();
        agent.events.drain();
        agent.fds.add_socket(830, libc::SOCK_DGRAM);
        let server: SocketAddr = "8.8.8.8:53".parse().unwrap();
        agent.fds.set_connection(830, server, Side::Remote);

        let query = {
            let mut buf = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
            for label in ["example", "com"] {
                buf.push(label.len() as u8);
                buf.extend_from_slice(label.as_bytes());
            }
            buf.push(0);
            buf.extend_from_slice(&[0, 1, 0, 1]);
            buf
        };
        unsafe { check_dns_send(830, query.as_ptr().cast(), query.len(), 1500) };

        let events = agent.events.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "dns");
        assert_eq!(events[0].body["name"], "example.com");
        assert!(events[0].body["duration_ns"].as_u64().unwrap() > 0);
        assert_eq!(agent.fds.get(830).unwrap().dns_name().as_deref(), Some("example.com"));
        agent.fds.close(830);
    }

    #[test]
    fn url_capture_obeys_the_switch() {
        let _guard = test_guard();
        let agent = test_agent();
        agent.events.drain();
        agent.fds.add_socket(840, libc::SOCK_STREAM);
        let request = b"GET /probe HTTP/1.1\r\nHost: example.net\r\n\r\n";

        agent.set_url_capture(false);
        unsafe { capture_url(840, request.as_ptr().cast(), request.len(), "NETTX") };
        assert!(agent.events.drain().is_empty());

        agent.set_url_capture(true);
        unsafe { capture_url(840, request.as_ptr().cast(), request.len(), "NETTX") };
        let events = agent.events.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].body["url"], "GET http://example.net/probe");

        agent.set_url_capture(false);
        agent.fds.close(840);
    }

    #[test]
    fn getdelim_inner_skips_exactly_once() {
        getdelim_enter();
        assert!(getdelim_inner_should_skip());
        assert!(!getdelim_inner_should_skip());
    }

    #[test]
    fn tls_bytes_tag_the_descriptor() {
        let _guard = test_guard();
        let agent = test_agent();
        agent.fds.add_socket(850, libc::SOCK_STREAM);
        let tls_rx = agent.agg.tls_rx_bytes.load(SeqCst);

        do_tls(0xabcd, 850, 100, TlsDirection::Rx);

        assert_eq!(agent.agg.tls_rx_bytes.load(SeqCst), tls_rx + 100);
        assert!(agent.fds.get(850).unwrap().tls.load(SeqCst));
        assert_eq!(agent.tls.get(0xabcd).unwrap().fd.load(SeqCst), 850);
        agent.tls.remove(0xabcd);
        agent.fds.close(850);
    }
}
