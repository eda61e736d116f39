// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! Backing for the `log` facade: a single logger writing newline-framed
//! lines through the configured log transport.
//!
//! The transport sits behind its own lock, separate from the published
//! config instance, because any thread may log; the lock also serializes the
//! transport replacement that happens on a config swap. Nothing on an
//! interceptor fast path logs.

use std::sync::atomic::{AtomicU8, Ordering::SeqCst};
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::transport::{Endpoint, Transport};

static LEVEL: AtomicU8 = AtomicU8::new(2); // warn
static DESTINATION: Mutex<Option<Transport>> = Mutex::new(None);

fn level_to_u8(level: LevelFilter) -> u8 {
    match level {
        LevelFilter::Off => 0,
        LevelFilter::Error => 1,
        LevelFilter::Warn => 2,
        LevelFilter::Info => 3,
        LevelFilter::Debug => 4,
        LevelFilter::Trace => 5,
    }
}

pub fn parse_level(name: &str) -> LevelFilter {
    match name {
        "off" | "none" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Warn,
    }
}

pub fn set_level(name: &str) {
    let filter = parse_level(name);
    LEVEL.store(level_to_u8(filter), SeqCst);
    log::set_max_level(filter);
}

/// Swap the log destination; the displaced transport is dropped under the
/// lock, after the last writer through it has finished.
pub fn set_destination(endpoint: Endpoint) {
    let mut transport = Transport::new(endpoint);
    transport.connect().ok();
    if let Ok(mut dest) = DESTINATION.lock() {
        *dest = Some(transport);
    }
}

/// Reporter-tick reconnect for stream log destinations.
pub fn reconnect_if_needed() {
    if let Ok(mut dest) = DESTINATION.lock() {
        if let Some(transport) = dest.as_mut() {
            if transport.needs_connection() {
                transport.connect().ok();
            }
        }
    }
}

struct AgentLogger;

impl Log for AgentLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        (metadata.level() as u8) <= LEVEL.load(SeqCst)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} [{}] procsight: {}\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            record.level(),
            record.args()
        );
        if let Ok(mut dest) = DESTINATION.lock() {
            if let Some(transport) = dest.as_mut() {
                transport.send(line.as_bytes()).ok();
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut dest) = DESTINATION.lock() {
            if let Some(transport) = dest.as_mut() {
                transport.flush();
            }
        }
    }
}

static LOGGER: AgentLogger = AgentLogger;

/// Install the logger. Called once from the load constructor; a second call
/// (possible only in tests) is harmless.
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Warn);
}

pub fn flush() {
    LOGGER.flush();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_reach_the_destination_at_or_above_level() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.log");
        set_destination(Endpoint::File(path.clone()));
        set_level("info");

        log::info!("visible {}", 1);
        log::debug!("invisible");
        flush();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("visible 1"), "got: {written}");
        assert!(!written.contains("invisible"));
        assert!(written.contains("[INFO] procsight:"));
    }

    #[test]
    fn level_names_parse() {
        assert_eq!(parse_level("trace"), LevelFilter::Trace);
        assert_eq!(parse_level("warning"), LevelFilter::Warn);
        assert_eq!(parse_level("unknown"), LevelFilter::Warn);
        assert_eq!(parse_level("off"), LevelFilter::Off);
    }
}
