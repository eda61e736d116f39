// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide totals. Counters are monotonically increasing u64s; the
//! instantaneous measurements (open ports, active connections) are signed
//! deltas applied by interceptors. The reporter emits current values with
//! scope "summary" and never resets anything; only the fork-child reset
//! zeroes the store.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering::SeqCst};

/// Error buckets; every error observed in an interceptor falls into exactly
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    FsOpenClose,
    FsReadWrite,
    FsStat,
    NetConn,
    NetRxTx,
    NetDns,
    Internal,
}

impl ErrorClass {
    pub fn name(self) -> &'static str {
        match self {
            ErrorClass::FsOpenClose => "fs.error.open_close",
            ErrorClass::FsReadWrite => "fs.error.read_write",
            ErrorClass::FsStat => "fs.error.stat",
            ErrorClass::NetConn => "net.error.conn",
            ErrorClass::NetRxTx => "net.error.rx_tx",
            ErrorClass::NetDns => "net.error.dns",
            ErrorClass::Internal => "internal.error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Tcp,
    Udp,
    Other,
}

#[derive(Default)]
pub struct Aggregates {
    // byte totals
    pub fs_read_bytes: AtomicU64,
    pub fs_write_bytes: AtomicU64,
    pub net_rx_bytes: AtomicU64,
    pub net_tx_bytes: AtomicU64,
    pub tls_rx_bytes: AtomicU64,
    pub tls_tx_bytes: AtomicU64,

    // operation counts
    pub read_ops: AtomicU64,
    pub write_ops: AtomicU64,
    pub rx_ops: AtomicU64,
    pub tx_ops: AtomicU64,
    pub seek_ops: AtomicU64,
    pub stat_ops: AtomicU64,
    pub open_ops: AtomicU64,
    pub close_ops: AtomicU64,
    pub dns_ops: AtomicU64,
    /// Operations whose byte total spanned iovecs (scatter/gather).
    pub iov_ops: AtomicU64,

    // instantaneous measurements
    pub open_ports: AtomicI64,
    pub tcp_conns: AtomicI64,
    pub udp_conns: AtomicI64,
    pub other_conns: AtomicI64,

    // duration totals, nanoseconds
    pub fs_duration_ns: AtomicU64,
    pub net_duration_ns: AtomicU64,
    pub dns_duration_ns: AtomicU64,

    // error buckets
    pub fs_open_close_errors: AtomicU64,
    pub fs_read_write_errors: AtomicU64,
    pub fs_stat_errors: AtomicU64,
    pub net_conn_errors: AtomicU64,
    pub net_rx_tx_errors: AtomicU64,
    pub net_dns_errors: AtomicU64,
    pub internal_errors: AtomicU64,

    // lifecycle anomalies: descriptor traffic the interposition layer missed
    pub untracked_closes: AtomicU64,
    pub reopened_fds: AtomicU64,
}

macro_rules! zero_all {
    ($self:ident, $($field:ident),+ $(,)?) => {
        $( $self.$field.store(0, SeqCst); )+
    };
}

impl Aggregates {
    pub const fn new() -> Self {
        Self {
            fs_read_bytes: AtomicU64::new(0),
            fs_write_bytes: AtomicU64::new(0),
            net_rx_bytes: AtomicU64::new(0),
            net_tx_bytes: AtomicU64::new(0),
            tls_rx_bytes: AtomicU64::new(0),
            tls_tx_bytes: AtomicU64::new(0),
            read_ops: AtomicU64::new(0),
            write_ops: AtomicU64::new(0),
            rx_ops: AtomicU64::new(0),
            tx_ops: AtomicU64::new(0),
            seek_ops: AtomicU64::new(0),
            stat_ops: AtomicU64::new(0),
            open_ops: AtomicU64::new(0),
            close_ops: AtomicU64::new(0),
            dns_ops: AtomicU64::new(0),
            iov_ops: AtomicU64::new(0),
            open_ports: AtomicI64::new(0),
            tcp_conns: AtomicI64::new(0),
            udp_conns: AtomicI64::new(0),
            other_conns: AtomicI64::new(0),
            fs_duration_ns: AtomicU64::new(0),
            net_duration_ns: AtomicU64::new(0),
            dns_duration_ns: AtomicU64::new(0),
            fs_open_close_errors: AtomicU64::new(0),
            fs_read_write_errors: AtomicU64::new(0),
            fs_stat_errors: AtomicU64::new(0),
            net_conn_errors: AtomicU64::new(0),
            net_rx_tx_errors: AtomicU64::new(0),
            net_dns_errors: AtomicU64::new(0),
            internal_errors: AtomicU64::new(0),
            untracked_closes: AtomicU64::new(0),
            reopened_fds: AtomicU64::new(0),
        }
    }

    pub fn error(&self, class: ErrorClass) {
        let counter = match class {
            ErrorClass::FsOpenClose => &self.fs_open_close_errors,
            ErrorClass::FsReadWrite => &self.fs_read_write_errors,
            ErrorClass::FsStat => &self.fs_stat_errors,
            ErrorClass::NetConn => &self.net_conn_errors,
            ErrorClass::NetRxTx => &self.net_rx_tx_errors,
            ErrorClass::NetDns => &self.net_dns_errors,
            ErrorClass::Internal => &self.internal_errors,
        };
        counter.fetch_add(1, SeqCst);
    }

    pub fn error_total(&self, class: ErrorClass) -> u64 {
        match class {
            ErrorClass::FsOpenClose => self.fs_open_close_errors.load(SeqCst),
            ErrorClass::FsReadWrite => self.fs_read_write_errors.load(SeqCst),
            ErrorClass::FsStat => self.fs_stat_errors.load(SeqCst),
            ErrorClass::NetConn => self.net_conn_errors.load(SeqCst),
            ErrorClass::NetRxTx => self.net_rx_tx_errors.load(SeqCst),
            ErrorClass::NetDns => self.net_dns_errors.load(SeqCst),
            ErrorClass::Internal => self.internal_errors.load(SeqCst),
        }
    }

    pub fn conn_delta(&self, kind: ConnKind, delta: i64) {
        let gauge = match kind {
            ConnKind::Tcp => &self.tcp_conns,
            ConnKind::Udp => &self.udp_conns,
            ConnKind::Other => &self.other_conns,
        };
        gauge.fetch_add(delta, SeqCst);
    }

    /// Zero everything. Used on the child side of fork, before the child's
    /// own activity starts; the walk itself is not atomic.
    pub fn reset(&self) {
        zero_all!(
            self,
            fs_read_bytes,
            fs_write_bytes,
            net_rx_bytes,
            net_tx_bytes,
            tls_rx_bytes,
            tls_tx_bytes,
            read_ops,
            write_ops,
            rx_ops,
            tx_ops,
            seek_ops,
            stat_ops,
            open_ops,
            close_ops,
            dns_ops,
            iov_ops,
            open_ports,
            tcp_conns,
            udp_conns,
            other_conns,
            fs_duration_ns,
            net_duration_ns,
            dns_duration_ns,
            fs_open_close_errors,
            fs_read_write_errors,
            fs_stat_errors,
            net_conn_errors,
            net_rx_tx_errors,
            net_dns_errors,
            internal_errors,
            untracked_closes,
            reopened_fds,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_land_in_their_bucket() {
        let agg = Aggregates::new();
        agg.error(ErrorClass::NetDns);
        agg.error(ErrorClass::NetDns);
        agg.error(ErrorClass::FsStat);
        assert_eq!(agg.error_total(ErrorClass::NetDns), 2);
        assert_eq!(agg.error_total(ErrorClass::FsStat), 1);
        assert_eq!(agg.error_total(ErrorClass::NetConn), 0);
    }

    #[test]
    fn gauges_take_signed_deltas() {
        let agg = Aggregates::new();
        agg.open_ports.fetch_add(1, SeqCst);
        agg.conn_delta(ConnKind::Tcp, 1);
        agg.conn_delta(ConnKind::Tcp, -1);
        assert_eq!(agg.open_ports.load(SeqCst), 1);
        assert_eq!(agg.tcp_conns.load(SeqCst), 0);
    }

    #[test]
    fn reset_zeroes_every_counter() {
        let agg = Aggregates::new();
        agg.fs_read_bytes.fetch_add(77, SeqCst);
        agg.open_ports.fetch_add(3, SeqCst);
        agg.error(ErrorClass::Internal);
        agg.reset();
        assert_eq!(agg.fs_read_bytes.load(SeqCst), 0);
        assert_eq!(agg.open_ports.load(SeqCst), 0);
        assert_eq!(agg.error_total(ErrorClass::Internal), 0);
    }
}
