// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! TLS session accounting shared by the three interposition strategies.
//!
//! A session is keyed by its only stable identifier: the pointer value of
//! the OpenSSL `SSL`, the gnutls session, or the NSS descriptor. Direction
//! tags (TLSRX / TLSTX) are what downstream uses to tell wrapped traffic
//! from plaintext; they are independent of the underlying transport.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering::SeqCst};
use std::sync::Arc;

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsDirection {
    Rx,
    Tx,
}

impl TlsDirection {
    pub fn tag(self) -> &'static str {
        match self {
            TlsDirection::Rx => "TLSRX",
            TlsDirection::Tx => "TLSTX",
        }
    }
}

pub struct TlsSession {
    pub id: u64,
    /// Associated descriptor when the library exposes one; -1 otherwise.
    pub fd: AtomicI32,
    pub rx_bytes: AtomicU64,
    pub tx_bytes: AtomicU64,
}

pub struct TlsSessions {
    map: DashMap<u64, Arc<TlsSession>>,
}

impl Default for TlsSessions {
    fn default() -> Self {
        Self::new()
    }
}

impl TlsSessions {
    pub fn new() -> Self {
        Self { map: DashMap::new() }
    }

    /// Attribute `bytes` in `direction` to the session, creating it on first
    /// I/O. A known descriptor refines an earlier unknown one.
    pub fn record(
        &self,
        id: u64,
        fd: Option<RawFd>,
        direction: TlsDirection,
        bytes: u64,
    ) -> Arc<TlsSession> {
        let session = self
            .map
            .entry(id)
            .or_insert_with(|| {
                Arc::new(TlsSession {
                    id,
                    fd: AtomicI32::new(-1),
                    rx_bytes: AtomicU64::new(0),
                    tx_bytes: AtomicU64::new(0),
                })
            })
            .clone();
        if let Some(fd) = fd {
            if fd >= 0 {
                session.fd.store(fd, SeqCst);
            }
        }
        match direction {
            TlsDirection::Rx => session.rx_bytes.fetch_add(bytes, SeqCst),
            TlsDirection::Tx => session.tx_bytes.fetch_add(bytes, SeqCst),
        };
        session
    }

    pub fn get(&self, id: u64) -> Option<Arc<TlsSession>> {
        self.map.get(&id).map(|s| Arc::clone(&s))
    }

    pub fn remove(&self, id: u64) -> Option<Arc<TlsSession>> {
        self.map.remove(&id).map(|(_, s)| s)
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

    pub fn for_each(&self, mut f: impl FnMut(&TlsSession)) {
        for entry in self.map.iter() {
            f(entry.value());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_accumulate_by_direction() {
        let sessions = TlsSessions::new();
        sessions.record(0xdead, None, TlsDirection::Rx, 77);
        sessions.record(0xdead, Some(9), TlsDirection::Tx, 33);
        sessions.record(0xdead, None, TlsDirection::Rx, 1);

        let session = sessions.get(0xdead).unwrap();
        assert_eq!(session.rx_bytes.load(SeqCst), 78);
        assert_eq!(session.tx_bytes.load(SeqCst), 33);
        assert_eq!(session.fd.load(SeqCst), 9);
        assert_eq!(sessions.len(), 1);

        sessions.remove(0xdead).unwrap();
        assert!(sessions.is_empty());
    }

    #[test]
    fn direction_tags_are_stable() {
        assert_eq!(TlsDirection::Rx.tag(), "TLSRX");
        assert_eq!(TlsDirection::Tx.tag(), "TLSTX");
    }
}
