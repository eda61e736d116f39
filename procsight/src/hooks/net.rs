// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! Socket-side interceptors. Besides the byte accounting these carry the two
//! places where the module deliberately perturbs the target: `connect` to a
//! blocked port fails with ECONNREFUSED before the real call, and an accept
//! on a blocked listener closes the just-accepted descriptor and fails with
//! ECONNABORTED.

use std::os::fd::RawFd;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::Ordering::SeqCst;

use crate::fntable;
use crate::state::aggregates::ErrorClass;
use crate::state::{self, FdKind, Side};

use super::fs::real_or;
use super::{
    agent, capture_url, check_dns_send, do_close, do_io, set_connection_raw, set_errno,
    timer_start, ErrnoGuard, IoDir,
};

fn net_error(class: ErrorClass) {
    if let Some(agent) = agent() {
        agent.agg.error(class);
    }
}

/// Register the descriptor a successful `accept` produced: a TCP peer whose
/// local address is inherited from the listener.
pub(crate) fn do_accept(
    new_fd: RawFd,
    listener: RawFd,
    peer: Option<std::net::SocketAddr>,
    op: &'static str,
) {
    let Some(agent) = agent() else { return };
    agent.fds.add_socket(new_fd, libc::SOCK_STREAM);
    if let Some(local) = agent.fds.get(listener).and_then(|r| r.local()) {
        agent.fds.set_connection(new_fd, local, Side::Local);
    }
    if let Some(peer) = peer {
        agent.fds.set_connection(new_fd, peer, Side::Remote);
    }
    if let Some(record) = agent.fds.get(new_fd) {
        if record.mark_gauge(state::gauge::TCP_CONN) {
            agent.agg.tcp_conns.fetch_add(1, SeqCst);
        }
    }
    let _ = op;
}

/// Close a just-accepted descriptor on the block path, through the real
/// close so the interposition layer does not see it as target activity.
pub(crate) unsafe fn abort_accepted(fd: RawFd) {
    if let Some(real_close) = fntable::CLOSE.typed::<unsafe extern "C" fn(c_int) -> c_int>() {
        real_close(fd);
    }
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn socket(family: c_int, sock_type: c_int, protocol: c_int) -> c_int {
    let real = real_or!(SOCKET, unsafe extern "C" fn(c_int, c_int, c_int) -> c_int, -1);
    let sd = real(family, sock_type, protocol);
    let _errno = ErrnoGuard::capture();
    if sd != -1 {
        if let Some(agent) = agent() {
            let kind = agent.fds.add_socket(sd, sock_type);
            // A UDP socket represents an open port from creation until the
            // socket closes; stream sockets are counted at listen().
            if kind == FdKind::Udp && (family == libc::AF_INET || family == libc::AF_INET6) {
                if let Some(record) = agent.fds.get(sd) {
                    if record.mark_gauge(state::gauge::OPEN_PORT) {
                        agent.agg.open_ports.fetch_add(1, SeqCst);
                    }
                }
            }
        }
    } else {
        net_error(ErrorClass::NetConn);
    }
    sd
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn shutdown(sockfd: c_int, how: c_int) -> c_int {
    let real = real_or!(SHUTDOWN, unsafe extern "C" fn(c_int, c_int) -> c_int, -1);
    let rc = real(sockfd, how);
    let _errno = ErrnoGuard::capture();
    if rc != -1 {
        do_close(sockfd, true, "shutdown");
    } else {
        net_error(ErrorClass::NetConn);
    }
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn listen(sockfd: c_int, backlog: c_int) -> c_int {
    let real = real_or!(LISTEN, unsafe extern "C" fn(c_int, c_int) -> c_int, -1);
    let rc = real(sockfd, backlog);
    let _errno = ErrnoGuard::capture();
    if rc != -1 {
        if let Some(agent) = agent() {
            if agent.fds.get(sockfd).is_none() {
                agent.fds.add_socket(sockfd, libc::SOCK_STREAM);
            }
            if let Some(record) = agent.fds.get(sockfd) {
                if record.mark_gauge(state::gauge::OPEN_PORT) {
                    agent.agg.open_ports.fetch_add(1, SeqCst);
                }
                if record.mark_gauge(state::gauge::TCP_CONN) {
                    agent.agg.tcp_conns.fetch_add(1, SeqCst);
                }
            }
        }
    } else {
        net_error(ErrorClass::NetConn);
    }
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn bind(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> c_int {
    let real = real_or!(
        BIND,
        unsafe extern "C" fn(c_int, *const libc::sockaddr, libc::socklen_t) -> c_int,
        -1
    );
    let rc = real(sockfd, addr, addrlen);
    let _errno = ErrnoGuard::capture();
    if rc != -1 {
        set_connection_raw(sockfd, addr, addrlen, Side::Local);
    } else {
        net_error(ErrorClass::NetConn);
    }
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn connect(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> c_int {
    let real = real_or!(
        CONNECT,
        unsafe extern "C" fn(c_int, *const libc::sockaddr, libc::socklen_t) -> c_int,
        -1
    );
    // The block check precedes the real call; a blocked port never sees a
    // SYN from this process.
    let target = state::sockaddr_to_addr(addr, addrlen);
    if let (Some(agent), Some(target)) = (agent(), target) {
        if agent.port_blocked(target.port()) {
            log::debug!("connect to blocked port {} refused", target.port());
            set_errno(libc::ECONNREFUSED);
            return -1;
        }
    }

    let rc = real(sockfd, addr, addrlen);
    let _errno = ErrnoGuard::capture();
    if rc != -1 {
        set_connection_raw(sockfd, addr, addrlen, Side::Remote);
        if let Some(agent) = agent() {
            if let Some(record) = agent.fds.get(sockfd) {
                let (flag, kind) = match record.kind() {
                    FdKind::Tcp => (state::gauge::TCP_CONN, state::aggregates::ConnKind::Tcp),
                    FdKind::Udp => (state::gauge::UDP_CONN, state::aggregates::ConnKind::Udp),
                    _ => (state::gauge::OTHER_CONN, state::aggregates::ConnKind::Other),
                };
                if record.mark_gauge(flag) {
                    agent.agg.conn_delta(kind, 1);
                }
            }
        }
    } else {
        net_error(ErrorClass::NetConn);
    }
    rc
}

macro_rules! accept_body {
    ($name:ident, $sockfd:ident, $addr:ident, $addrlen:ident, $sd:ident) => {{
        if $sd != -1 {
            if let Some(agent) = agent() {
                if agent.listener_blocked($sockfd) {
                    abort_accepted($sd);
                    net_error(ErrorClass::NetConn);
                    set_errno(libc::ECONNABORTED);
                    return -1;
                }
            }
        }
        if $sd != -1 {
            let _errno = ErrnoGuard::capture();
            let peer = if $addr.is_null() || $addrlen.is_null() {
                None
            } else {
                state::sockaddr_to_addr($addr, *$addrlen)
            };
            do_accept($sd, $sockfd, peer, stringify!($name));
        } else {
            let _errno = ErrnoGuard::capture();
            net_error(ErrorClass::NetConn);
        }
        $sd
    }};
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn accept(
    sockfd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> c_int {
    let real = real_or!(
        ACCEPT,
        unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> c_int,
        -1
    );
    let sd = real(sockfd, addr, addrlen);
    accept_body!(accept, sockfd, addr, addrlen, sd)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn accept4(
    sockfd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
    flags: c_int,
) -> c_int {
    let real = real_or!(
        ACCEPT4,
        unsafe extern "C" fn(c_int, *mut libc::sockaddr, *mut libc::socklen_t, c_int) -> c_int,
        -1
    );
    let sd = real(sockfd, addr, addrlen, flags);
    accept_body!(accept4, sockfd, addr, addrlen, sd)
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn send(
    sockfd: c_int,
    buf: *const c_void,
    len: libc::size_t,
    flags: c_int,
) -> libc::ssize_t {
    let real = real_or!(
        SEND,
        unsafe extern "C" fn(c_int, *const c_void, libc::size_t, c_int) -> libc::ssize_t,
        -1
    );
    capture_url(sockfd, buf, len, "NETTX");
    let t0 = timer_start();
    let rc = real(sockfd, buf, len, flags);
    let _errno = ErrnoGuard::capture();
    if rc != -1 {
        if let Some(agent) = agent() {
            let ns = agent.clock.duration_ns(t0);
            check_dns_send(sockfd, buf, len, ns);
        }
    }
    do_io(sockfd, t0, rc != -1, rc.max(0) as u64, IoDir::Out, false, true, "send");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn sendto(
    sockfd: c_int,
    buf: *const c_void,
    len: libc::size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> libc::ssize_t {
    let real = real_or!(
        SENDTO,
        unsafe extern "C" fn(
            c_int,
            *const c_void,
            libc::size_t,
            c_int,
            *const libc::sockaddr,
            libc::socklen_t,
        ) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    let rc = real(sockfd, buf, len, flags, dest_addr, addrlen);
    let _errno = ErrnoGuard::capture();
    if rc != -1 {
        set_connection_raw(sockfd, dest_addr, addrlen, Side::Remote);
        if let Some(agent) = agent() {
            let ns = agent.clock.duration_ns(t0);
            check_dns_send(sockfd, buf, len, ns);
        }
    }
    do_io(sockfd, t0, rc != -1, rc.max(0) as u64, IoDir::Out, false, true, "sendto");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn sendmsg(
    sockfd: c_int,
    msg: *const libc::msghdr,
    flags: c_int,
) -> libc::ssize_t {
    let real = real_or!(
        SENDMSG,
        unsafe extern "C" fn(c_int, *const libc::msghdr, c_int) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    let rc = real(sockfd, msg, flags);
    let _errno = ErrnoGuard::capture();
    if rc != -1 && !msg.is_null() {
        record_msg_peer(sockfd, msg);
        if let Some(agent) = agent() {
            // The queried name rides in the first iovec for DNS datagrams.
            let iov = (*msg).msg_iov;
            if !iov.is_null() && (*msg).msg_iovlen > 0 {
                let ns = agent.clock.duration_ns(t0);
                check_dns_send(sockfd, (*iov).iov_base, (*iov).iov_len, ns);
            }
        }
    }
    do_io(sockfd, t0, rc != -1, rc.max(0) as u64, IoDir::Out, true, true, "sendmsg");
    rc
}

/// For datagram sockets the msghdr names the remote peer.
unsafe fn record_msg_peer(sockfd: c_int, msg: *const libc::msghdr) {
    let Some(agent) = agent() else { return };
    let is_tcp = agent
        .fds
        .get(sockfd)
        .map(|r| r.kind() == FdKind::Tcp)
        .unwrap_or(false);
    if is_tcp || (*msg).msg_name.is_null() {
        return;
    }
    set_connection_raw(
        sockfd,
        (*msg).msg_name as *const libc::sockaddr,
        (*msg).msg_namelen,
        Side::Remote,
    );
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn recv(
    sockfd: c_int,
    buf: *mut c_void,
    len: libc::size_t,
    flags: c_int,
) -> libc::ssize_t {
    let real = real_or!(
        RECV,
        unsafe extern "C" fn(c_int, *mut c_void, libc::size_t, c_int) -> libc::ssize_t,
        -1
    );
    // The buffer is inspected before forwarding, like the send side.
    capture_url(sockfd, buf, len, "NETRX");
    let t0 = timer_start();
    let rc = real(sockfd, buf, len, flags);
    let _errno = ErrnoGuard::capture();
    do_io(sockfd, t0, rc != -1, rc.max(0) as u64, IoDir::In, false, true, "recv");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn recvfrom(
    sockfd: c_int,
    buf: *mut c_void,
    len: libc::size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> libc::ssize_t {
    let real = real_or!(
        RECVFROM,
        unsafe extern "C" fn(
            c_int,
            *mut c_void,
            libc::size_t,
            c_int,
            *mut libc::sockaddr,
            *mut libc::socklen_t,
        ) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    let rc = real(sockfd, buf, len, flags, src_addr, addrlen);
    let _errno = ErrnoGuard::capture();
    do_io(sockfd, t0, rc != -1, rc.max(0) as u64, IoDir::In, false, true, "recvfrom");
    rc
}

#[cfg_attr(not(test), no_mangle)]
pub unsafe extern "C" fn recvmsg(
    sockfd: c_int,
    msg: *mut libc::msghdr,
    flags: c_int,
) -> libc::ssize_t {
    let real = real_or!(
        RECVMSG,
        unsafe extern "C" fn(c_int, *mut libc::msghdr, c_int) -> libc::ssize_t,
        -1
    );
    let t0 = timer_start();
    let rc = real(sockfd, msg, flags);
    let _errno = ErrnoGuard::capture();
    if rc != -1 && !msg.is_null() {
        record_msg_peer(sockfd, msg);
        scan_access_rights(msg);
    }
    do_io(sockfd, t0, rc != -1, rc.max(0) as u64, IoDir::In, true, true, "recvmsg");
    rc
}

/// Walk ancillary data for SCM_RIGHTS: every descriptor passed in gets a
/// record, classified socket-vs-file by fstat.
unsafe fn scan_access_rights(msg: *const libc::msghdr) {
    let Some(agent) = agent() else { return };
    let mut cmsg = libc::CMSG_FIRSTHDR(msg);
    while !cmsg.is_null() {
        if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
            let header = libc::CMSG_LEN(0) as usize;
            let payload = ((*cmsg).cmsg_len as usize).saturating_sub(header);
            let count = payload / std::mem::size_of::<c_int>();
            let fds = libc::CMSG_DATA(cmsg) as *const c_int;
            for i in 0..count {
                register_received_fd(agent, *fds.add(i));
            }
        }
        cmsg = libc::CMSG_NXTHDR(msg as *mut libc::msghdr, cmsg);
    }
}

unsafe fn register_received_fd(agent: &crate::agent::Agent, fd: RawFd) {
    let mut sb: libc::stat = std::mem::zeroed();
    if libc::fstat(fd, &mut sb) == -1 {
        agent.agg.error(ErrorClass::Internal);
        return;
    }
    if sb.st_mode & libc::S_IFMT == libc::S_IFSOCK {
        let mut sock_type: c_int = 0;
        let mut len = std::mem::size_of::<c_int>() as libc::socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            (&mut sock_type as *mut c_int).cast(),
            &mut len,
        ) != 0
        {
            sock_type = 0;
        }
        agent.fds.add_socket(fd, sock_type);
    } else {
        super::do_open(fd, Some("Received_File_Descriptor"), FdKind::File, "recvmsg");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{test_agent, test_guard};
    use std::net::SocketAddr;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn accept_loop_counts_ports_and_connections_once() {
        let _guard = test_guard();
        let agent = test_agent();
        let ports = agent.agg.open_ports.load(SeqCst);
        let conns = agent.agg.tcp_conns.load(SeqCst);

        // socket -> bind -> listen
        agent.fds.add_socket(913, libc::SOCK_STREAM);
        agent.fds.set_connection(913, addr("0.0.0.0:8081"), Side::Local);
        let record = agent.fds.get(913).unwrap();
        if record.mark_gauge(state::gauge::OPEN_PORT) {
            agent.agg.open_ports.fetch_add(1, SeqCst);
        }
        if record.mark_gauge(state::gauge::TCP_CONN) {
            agent.agg.tcp_conns.fetch_add(1, SeqCst);
        }
        // A second listen on the same descriptor must not double-count.
        if record.mark_gauge(state::gauge::OPEN_PORT) {
            agent.agg.open_ports.fetch_add(1, SeqCst);
        }
        assert_eq!(agent.agg.open_ports.load(SeqCst), ports + 1);
        assert_eq!(agent.agg.tcp_conns.load(SeqCst), conns + 1);

        // accept -> one new descriptor record inheriting the local address
        do_accept(914, 913, Some(addr("10.0.0.9:51000")), "accept");
        let peer = agent.fds.get(914).unwrap();
        assert_eq!(peer.local(), Some(addr("0.0.0.0:8081")));
        assert_eq!(peer.remote(), Some(addr("10.0.0.9:51000")));
        assert_eq!(agent.agg.tcp_conns.load(SeqCst), conns + 2);

        // close rolls the gauges back
        super::super::do_close(914, true, "close");
        super::super::do_close(913, true, "close");
        assert_eq!(agent.agg.open_ports.load(SeqCst), ports);
        assert_eq!(agent.agg.tcp_conns.load(SeqCst), conns);
    }

    #[test]
    fn blocked_listener_is_detected_by_local_port() {
        let _guard = test_guard();
        let agent = test_agent();
        agent.fds.add_socket(915, libc::SOCK_STREAM);
        agent.fds.set_connection(915, addr("0.0.0.0:8080"), Side::Local);

        agent.set_blocked_ports(&[8080]);
        assert!(agent.listener_blocked(915));
        assert!(agent.port_blocked(8080));

        agent.set_blocked_ports(&[]);
        assert!(!agent.listener_blocked(915));
        agent.fds.close(915);
    }

    #[test]
    fn msg_peer_is_recorded_for_datagram_sockets() {
        let _guard = test_guard();
        let agent = test_agent();
        agent.fds.add_socket(916, libc::SOCK_DGRAM);

        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = 53u16.to_be();
        sin.sin_addr.s_addr = u32::from(std::net::Ipv4Addr::new(9, 9, 9, 9)).to_be();
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = (&mut sin as *mut libc::sockaddr_in).cast();
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        unsafe { record_msg_peer(916, &msg) };
        assert_eq!(agent.fds.get(916).unwrap().remote(), Some(addr("9.9.9.9:53")));
        assert!(agent.fds.remote_port_is_dns(916));
        agent.fds.close(916);
    }
}
