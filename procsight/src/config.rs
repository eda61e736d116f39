// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration: load-time construction from file plus environment,
//! and live replacement from the control channel or the dynamic command
//! file.
//!
//! The active configuration and its metric/event sinks are published through
//! an atomic pointer swap. A displaced instance is parked, tagged with the
//! publication generation, and freed only once a later reporter tick
//! observes the swap; every publish after startup happens on the reporter
//! thread itself, which keeps the single-consumer reclamation sound.
//!
//! Interceptors never dereference the published pointer. The handful of
//! values they consult (URL capture, port-block set, interval) are mirrored
//! into atomics and the agent's runtime tables at publish time.

use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering::SeqCst};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::events::EventSink;
use crate::metrics::MetricSink;
use crate::transport::{Endpoint, Transport};
use crate::{agent, logging, reporter};

pub const ENV_PREFIX: &str = "PROCSIGHT_";
/// Dynamic command files are `<cmd-dir>/<DYN_CONFIG_PREFIX>.<pid>`.
pub const DYN_CONFIG_PREFIX: &str = "procsight";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Metric verbosity, 0..=9. Per-descriptor line items are emitted at
    /// [`AgentConfig::PER_FD_VERBOSITY`] and above.
    pub verbosity: u8,
    /// Reporting interval in seconds; also the control-poll timeout.
    pub interval: u64,
    pub metric_dest: String,
    pub event_dest: String,
    pub log_dest: String,
    pub control_dest: String,
    /// Directory watched for dynamic command files.
    pub command_dir: PathBuf,
    pub block_ports: Vec<u16>,
    pub capture_urls: bool,
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            verbosity: 4,
            interval: 10,
            metric_dest: "udp://127.0.0.1:8125".to_string(),
            event_dest: "tcp://127.0.0.1:9109".to_string(),
            log_dest: "file:///tmp/procsight.log".to_string(),
            control_dest: "tcp://127.0.0.1:9109".to_string(),
            command_dir: PathBuf::from("/tmp"),
            block_ports: Vec::new(),
            capture_urls: false,
            log_level: "warn".to_string(),
        }
    }
}

pub mod parse_env {
    use std::{env, str::FromStr};

    pub fn int<T: FromStr>(name: &str) -> Option<T> {
        env::var(name).ok()?.parse::<T>().ok()
    }

    pub fn bool(name: &str) -> Option<bool> {
        let var = env::var(name).ok()?;
        Some(var == "true" || var == "1")
    }

    pub fn str_not_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.is_empty())
    }
}

impl AgentConfig {
    pub const PER_FD_VERBOSITY: u8 = 5;

    /// Build the load-time configuration: defaults, then the config file
    /// named by `PROCSIGHT_CONF` (if any), then individual environment
    /// overrides.
    pub fn load() -> Self {
        let mut cfg = Self::default();
        if let Some(path) = parse_env::str_not_empty("PROCSIGHT_CONF") {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                cfg.apply_commands(&contents);
            }
        }
        cfg.apply_environment();
        cfg
    }

    fn apply_environment(&mut self) {
        for key in [
            "VERBOSITY",
            "INTERVAL",
            "METRIC_DEST",
            "EVENT_DEST",
            "LOG_DEST",
            "CONTROL_DEST",
            "CMD_DIR",
            "BLOCK_PORTS",
            "CAPTURE_URLS",
            "LOG_LEVEL",
        ] {
            if let Some(value) = parse_env::str_not_empty(&format!("{ENV_PREFIX}{key}")) {
                let _ = self.apply_kv(key, &value);
            }
        }
    }

    /// Apply one `KEY=VALUE` command. Keys accept an optional `PROCSIGHT_`
    /// prefix so command files can reuse the environment spelling.
    pub fn apply_command(&mut self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("malformed command {line:?}"))?;
        let key = key.trim();
        let key = key.strip_prefix(ENV_PREFIX).unwrap_or(key);
        self.apply_kv(key, value.trim())
    }

    /// Apply a whole command file; individually malformed lines are skipped.
    pub fn apply_commands(&mut self, contents: &str) {
        for line in contents.lines() {
            let _ = self.apply_command(line);
        }
    }

    fn apply_kv(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "VERBOSITY" => self.verbosity = value.parse::<u8>().context("verbosity")?.min(9),
            "INTERVAL" => self.interval = value.parse::<u64>().context("interval")?.max(1),
            "METRIC_DEST" => {
                Endpoint::parse(value)?;
                self.metric_dest = value.to_string();
            }
            "EVENT_DEST" => {
                Endpoint::parse(value)?;
                self.event_dest = value.to_string();
            }
            "LOG_DEST" => {
                Endpoint::parse(value)?;
                self.log_dest = value.to_string();
            }
            "CONTROL_DEST" => {
                Endpoint::parse(value)?;
                self.control_dest = value.to_string();
            }
            "CMD_DIR" => self.command_dir = PathBuf::from(value),
            "BLOCK_PORTS" => {
                let mut ports = Vec::new();
                for part in value.split(',').filter(|p| !p.trim().is_empty()) {
                    ports.push(part.trim().parse::<u16>().context("block port")?);
                }
                self.block_ports = ports;
            }
            "CAPTURE_URLS" => self.capture_urls = value == "true" || value == "1",
            "LOG_LEVEL" => self.log_level = value.to_string(),
            other => anyhow::bail!("unknown config key {other:?}"),
        }
        Ok(())
    }

    /// Fold a `set-config` request body into this configuration. Field names
    /// match the serialized form returned by `get-config`.
    pub fn apply_json(&mut self, body: &serde_json::Value) -> Result<()> {
        let map = body.as_object().context("set-config body is not an object")?;
        for (key, value) in map {
            match value {
                serde_json::Value::Bool(b) => {
                    self.apply_kv(&key.to_uppercase(), if *b { "true" } else { "false" })?
                }
                serde_json::Value::Number(n) => {
                    self.apply_kv(&key.to_uppercase(), &n.to_string())?
                }
                serde_json::Value::String(s) => self.apply_kv(&key.to_uppercase(), s)?,
                serde_json::Value::Array(ports) if key == "block_ports" => {
                    let joined = ports
                        .iter()
                        .filter_map(|p| p.as_u64())
                        .map(|p| p.to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                    self.apply_kv("BLOCK_PORTS", &joined)?;
                }
                other => anyhow::bail!("unsupported value for {key}: {other}"),
            }
        }
        Ok(())
    }

    pub fn dyn_config_path(&self, pid: u32) -> PathBuf {
        self.command_dir.join(format!("{DYN_CONFIG_PREFIX}.{pid}"))
    }
}

/// One published configuration instance: the config itself plus the metric
/// and event sinks built from it. The log transport lives in [`logging`]
/// behind its own lock because any thread may log.
pub struct Published {
    pub cfg: AgentConfig,
    pub metrics: Mutex<MetricSink>,
    pub events: Mutex<EventSink>,
}

impl Published {
    fn build(cfg: AgentConfig) -> Self {
        let metric_ep = Endpoint::parse(&cfg.metric_dest).unwrap_or(Endpoint::Null);
        let event_ep = Endpoint::parse(&cfg.event_dest).unwrap_or(Endpoint::Null);
        let mut metric_transport = Transport::new(metric_ep);
        metric_transport.connect().ok();
        let mut event_transport = Transport::new(event_ep);
        event_transport.connect().ok();
        Self {
            cfg,
            metrics: Mutex::new(MetricSink::new(metric_transport)),
            events: Mutex::new(EventSink::new(event_transport)),
        }
    }
}

static CURRENT: AtomicPtr<Published> = AtomicPtr::new(ptr::null_mut());
static GENERATION: AtomicU64 = AtomicU64::new(0);

struct Parked {
    generation: u64,
    instance: *mut Published,
}
// The raw pointer is only touched under the PARKED lock.
unsafe impl Send for Parked {}

static PARKED: Mutex<Vec<Parked>> = Mutex::new(Vec::new());

/// Publish a new configuration: build sinks, swap the active instance, park
/// the displaced one, and refresh the mirrors interceptors read.
///
/// After startup this runs only on the reporter thread (control channel and
/// dynamic-config pickup are both reporter work), which is what makes the
/// parked-instance reclamation in [`reclaim_parked`] safe.
pub fn publish(cfg: AgentConfig) {
    logging::set_level(&cfg.log_level);
    logging::set_destination(Endpoint::parse(&cfg.log_dest).unwrap_or(Endpoint::Stderr));
    reporter::set_interval_secs(cfg.interval);
    if let Some(agent) = agent::Agent::get() {
        agent.set_blocked_ports(&cfg.block_ports);
        agent.set_url_capture(cfg.capture_urls);
    }

    let fresh = Box::into_raw(Box::new(Published::build(cfg)));
    let displaced = CURRENT.swap(fresh, SeqCst);
    let generation = GENERATION.fetch_add(1, SeqCst) + 1;
    if !displaced.is_null() {
        if let Ok(mut parked) = PARKED.lock() {
            parked.push(Parked {
                generation,
                instance: displaced,
            });
        }
    }
}

/// Current publication generation.
pub fn generation() -> u64 {
    GENERATION.load(SeqCst)
}

/// Number of displaced instances still awaiting reclamation.
pub fn parked_len() -> usize {
    PARKED.lock().map(|p| p.len()).unwrap_or(0)
}

/// Free displaced instances whose publication the reporter has now observed.
/// Called at the top of each reporter tick, before the tick takes any
/// reference into the current instance.
pub fn reclaim_parked(observed_generation: u64) {
    let Ok(mut parked) = PARKED.lock() else {
        return;
    };
    parked.retain(|entry| {
        if entry.generation <= observed_generation {
            // SAFETY: the instance came from Box::into_raw in publish() and
            // nothing holds a reference across ticks.
            drop(unsafe { Box::from_raw(entry.instance) });
            false
        } else {
            true
        }
    });
}

/// Run `f` against the active instance.
///
/// Only the reporter thread (or the load constructor, before the reporter
/// exists) may call this; interceptors use the mirrored values instead.
pub fn with_current<R>(f: impl FnOnce(&Published) -> R) -> Option<R> {
    let current = CURRENT.load(SeqCst);
    if current.is_null() {
        None
    } else {
        // SAFETY: the instance stays reachable until a later tick of the
        // same thread reclaims it.
        Some(f(unsafe { &*current }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null_cfg() -> AgentConfig {
        AgentConfig {
            metric_dest: "none".to_string(),
            event_dest: "none".to_string(),
            log_dest: "none".to_string(),
            control_dest: "none".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn commands_update_fields() {
        let mut cfg = AgentConfig::default();
        cfg.apply_command("PROCSIGHT_INTERVAL=2").unwrap();
        cfg.apply_command("VERBOSITY=7").unwrap();
        cfg.apply_command("BLOCK_PORTS=8080,9090").unwrap();
        cfg.apply_command("CAPTURE_URLS=true").unwrap();
        assert_eq!(cfg.interval, 2);
        assert_eq!(cfg.verbosity, 7);
        assert_eq!(cfg.block_ports, vec![8080, 9090]);
        assert!(cfg.capture_urls);
    }

    #[test]
    fn malformed_commands_are_rejected() {
        let mut cfg = AgentConfig::default();
        assert!(cfg.apply_command("INTERVAL").is_err());
        assert!(cfg.apply_command("NO_SUCH_KEY=1").is_err());
        assert!(cfg.apply_command("METRIC_DEST=carrier-pigeon://x").is_err());
        // Comments and blanks pass through.
        cfg.apply_command("# comment").unwrap();
        cfg.apply_command("").unwrap();
    }

    #[test]
    fn json_body_folds_into_config() {
        let mut cfg = AgentConfig::default();
        let body = serde_json::json!({
            "interval": 2,
            "capture_urls": true,
            "block_ports": [443, 8443],
        });
        cfg.apply_json(&body).unwrap();
        assert_eq!(cfg.interval, 2);
        assert!(cfg.capture_urls);
        assert_eq!(cfg.block_ports, vec![443, 8443]);
    }

    #[test]
    fn publish_parks_until_generation_observed() {
        let _guard = crate::agent::test_guard();
        publish(null_cfg());
        let before = generation();
        publish(AgentConfig {
            interval: 3,
            ..null_cfg()
        });
        assert_eq!(generation(), before + 1);
        assert!(parked_len() >= 1);

        // The displaced instance survives until the swap is observed.
        reclaim_parked(before.saturating_sub(1));
        assert!(parked_len() >= 1);

        reclaim_parked(generation());
        assert_eq!(parked_len(), 0);

        with_current(|p| assert_eq!(p.cfg.interval, 3)).unwrap();
    }

    #[test]
    fn dyn_config_path_is_per_pid() {
        let cfg = AgentConfig::default();
        assert_eq!(
            cfg.dyn_config_path(1234),
            PathBuf::from("/tmp/procsight.1234")
        );
    }
}
