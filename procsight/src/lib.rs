// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! procsight is a function-interposition observability agent: a shared module
//! that is preloaded into arbitrary processes, binds every monitored libc /
//! libssl / gnutls / NSS symbol at load, and reports file, network, DNS and
//! TLS activity to a remote collector without any cooperation from the
//! target process.
//!
//! The crate builds as a `cdylib` whose exported symbols shadow the real C
//! routines; each interceptor forwards to the real function resolved from the
//! next dynamic-loader scope and updates the in-process stores on the way
//! out. A single reporter thread, started only after the target's own `main`
//! has begun, periodically emits summaries and polls the control channel for
//! live reconfiguration.

pub mod agent;
pub mod clock;
pub mod config;
pub mod control;
pub mod events;
pub mod fntable;
pub mod hooks;
pub mod lifecycle;
pub mod logging;
pub mod metrics;
pub mod os;
pub mod proc_id;
pub mod reporter;
pub mod state;
pub mod transport;

/// Module load constructor. The dynamic loader runs this before the target's
/// `main`; everything it does must tolerate a partially initialized process.
#[cfg(not(test))]
#[used]
#[link_section = ".init_array"]
static PROCSIGHT_CTOR: extern "C" fn() = {
    extern "C" fn ctor() {
        lifecycle::startup();
    }
    ctor
};
