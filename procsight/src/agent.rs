// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! The single process-scoped context. Everything module-global (descriptor
//! and aggregate stores, TLS tables, the event queue, the control channel)
//! hangs off one `Agent` initialized by the load constructor. Interceptors
//! reach it through [`Agent::get`]; a `None` there means the constructor has
//! not finished and the interceptor must behave as a pure pass-through.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::{Mutex, OnceLock, RwLock};

use dashmap::DashSet;

use crate::clock::Clock;
use crate::events::EventQueue;
use crate::hooks::tls::NssBindings;
use crate::proc_id::ProcIdentity;
use crate::state::aggregates::Aggregates;
use crate::state::tls::TlsSessions;
use crate::state::FdTable;
use crate::transport::{Endpoint, Transport};

pub struct Agent {
    pub clock: Clock,
    pub proc: RwLock<ProcIdentity>,
    pub fds: FdTable,
    pub agg: Aggregates,
    pub tls: TlsSessions,
    pub nss: NssBindings,
    pub events: EventQueue,
    /// Control channel; owned by the reporter after startup, and by the
    /// fork-child reset.
    pub ctl: Mutex<Transport>,
    blocked_ports: DashSet<u16>,
    url_capture: AtomicBool,
}

static AGENT: OnceLock<Agent> = OnceLock::new();

impl Agent {
    /// The context, or `None` before the load constructor has finished.
    /// This is a plain load; it never allocates and is safe on the paths
    /// the dynamic loader can re-enter.
    pub fn get() -> Option<&'static Agent> {
        AGENT.get()
    }

    /// Build the context. Called exactly once by the load constructor.
    pub fn initialize(control: Endpoint) -> &'static Agent {
        AGENT.get_or_init(|| Agent::build(control))
    }

    fn build(control: Endpoint) -> Agent {
        Agent {
            clock: Clock::init(),
            proc: RwLock::new(ProcIdentity::build()),
            fds: FdTable::new(),
            agg: Aggregates::new(),
            tls: TlsSessions::new(),
            nss: NssBindings::new(),
            events: EventQueue::new(),
            ctl: Mutex::new(Transport::new(control)),
            blocked_ports: DashSet::new(),
            url_capture: AtomicBool::new(false),
        }
    }

    pub fn proc_pid(&self) -> u32 {
        self.proc.read().map(|p| p.pid).unwrap_or(0)
    }

    pub fn proc_id_string(&self) -> String {
        self.proc.read().map(|p| p.id.clone()).unwrap_or_default()
    }

    pub fn set_blocked_ports(&self, ports: &[u16]) {
        self.blocked_ports.clear();
        for &port in ports {
            self.blocked_ports.insert(port);
        }
    }

    /// Mutate the block set from a `block-port` control request. Port 0
    /// clears the set.
    pub fn block_port(&self, port: u16) {
        if port == 0 {
            self.blocked_ports.clear();
        } else {
            self.blocked_ports.insert(port);
        }
    }

    pub fn port_blocked(&self, port: u16) -> bool {
        self.blocked_ports.contains(&port)
    }

    pub fn blocked_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.blocked_ports.iter().map(|p| *p).collect();
        ports.sort_unstable();
        ports
    }

    /// Per-listener block predicate used by the accept interceptors.
    pub fn listener_blocked(&self, listener: RawFd) -> bool {
        self.fds
            .local_port(listener)
            .is_some_and(|port| self.port_blocked(port))
    }

    pub fn set_url_capture(&self, enabled: bool) {
        self.url_capture.store(enabled, SeqCst);
    }

    pub fn url_capture(&self) -> bool {
        self.url_capture.load(SeqCst)
    }

    /// Fork-child reset of the runtime stores. The identity rebuild and
    /// reporter re-arm live in `lifecycle`; this clears what the child must
    /// not inherit.
    pub fn reset_for_fork(&self) {
        if let Ok(mut proc) = self.proc.write() {
            *proc = ProcIdentity::build();
        }
        self.fds.reset();
        self.agg.reset();
        self.tls.clear();
        self.nss.clear();
        self.events.clear();
    }
}

#[cfg(test)]
pub(crate) fn test_agent() -> &'static Agent {
    AGENT.get_or_init(|| Agent::build(Endpoint::Null))
}

/// Serializes tests that mutate the shared agent context; the unit-test
/// harness runs tests on parallel threads against the one global `Agent`.
#[cfg(test)]
pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_set_is_a_set() {
        let _guard = super::test_guard();
        let agent = test_agent();
        agent.set_blocked_ports(&[8080, 8080, 443]);
        assert!(agent.port_blocked(8080));
        assert!(agent.port_blocked(443));
        assert!(!agent.port_blocked(80));
        assert_eq!(agent.blocked_ports(), vec![443, 8080]);

        agent.block_port(0);
        assert!(!agent.port_blocked(8080));
    }

    #[test]
    fn url_capture_toggles() {
        let _guard = super::test_guard();
        let agent = test_agent();
        agent.set_url_capture(true);
        assert!(agent.url_capture());
        agent.set_url_capture(false);
        assert!(!agent.url_capture());
    }
}
