// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! The reporter thread: one worker that loops until process exit. Each tick
//! reclaims any displaced config instances, emits the periodic report,
//! picks up dynamic command files, reconnects dropped transports, and polls
//! the control channel with the reporting interval as the timeout.
//!
//! `report_periodic` is guarded by a CAS so the periodic path and the
//! `atexit` flush can never run concurrently.

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::BorrowedFd;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering::SeqCst};
use std::sync::Mutex;
use std::time::SystemTime;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serde_json::json;

use crate::agent::Agent;
use crate::config::{self, AgentConfig};
use crate::events::Event;
use crate::state::aggregates::ErrorClass;
use crate::{control, fntable, logging, os};

/// Mirror of the active reporting interval, readable from interceptor-side
/// code without touching the published config instance.
static INTERVAL_SECS: AtomicU64 = AtomicU64::new(10);

/// CAS reentrancy guard shared by the periodic tick and the exit flush.
static REPORT_GUARD: AtomicU64 = AtomicU64::new(0);

/// CPU total at the previous tick, for the per-period delta.
static CPU_STATE: AtomicI64 = AtomicI64::new(0);

static DYN_CONFIG_MODTIME: Mutex<Option<SystemTime>> = Mutex::new(None);

/// Drain attempts per control message before the channel is closed.
const MAX_DRAIN_TRIES: usize = 10;

pub fn set_interval_secs(secs: u64) {
    INTERVAL_SECS.store(secs.max(1), SeqCst);
}

pub fn interval_secs() -> u64 {
    INTERVAL_SECS.load(SeqCst)
}

/// Thread body; never returns.
pub fn run() {
    crate::hooks::mark_agent_thread();
    log::debug!("reporter thread running");
    loop {
        config::reclaim_parked(config::generation());
        report_periodic();
        dynamic_config_pickup();
        reconnect_transports();
        remote_config();
    }
}

/// One periodic report. Returns false when the guard was already held, i.e.
/// the other path (tick vs. exit flush) is mid-report.
pub fn report_periodic() -> bool {
    if REPORT_GUARD
        .compare_exchange(0, 1, SeqCst, SeqCst)
        .is_err()
    {
        return false;
    }
    if let Some(agent) = Agent::get() {
        emit_report(agent);
    }
    REPORT_GUARD.store(0, SeqCst);
    true
}

fn emit_report(agent: &Agent) {
    let pid = agent.proc_pid();
    let proc_id = agent.proc_id_string();
    let procname = agent
        .proc
        .read()
        .map(|p| p.procname.clone())
        .unwrap_or_default();
    let pid_str = pid.to_string();
    let tags: [(&str, &str); 2] = [("proc", &procname), ("pid", &pid_str)];

    config::with_current(|published| {
        let Ok(mut metrics) = published.metrics.lock() else {
            return;
        };

        // Per-period process measurements.
        let cpu = os::proc_cpu_micros();
        let cpu_delta = cpu - CPU_STATE.swap(cpu, SeqCst);
        metrics.gauge("procsight.proc.cpu", cpu_delta, &tags);
        metrics.gauge("procsight.proc.mem", os::proc_memory_kb(pid), &tags);
        metrics.gauge("procsight.proc.thread", os::num_threads(pid), &tags);
        metrics.gauge("procsight.proc.fd", os::num_fds(pid), &tags);
        metrics.gauge("procsight.proc.child", os::num_child_procs(pid), &tags);

        // Totals; scope "summary", the downstream diffs.
        let agg = &agent.agg;
        metrics.count("procsight.fs.read", agg.fs_read_bytes.load(SeqCst) as i64, &tags);
        metrics.count("procsight.fs.write", agg.fs_write_bytes.load(SeqCst) as i64, &tags);
        metrics.count("procsight.net.rx", agg.net_rx_bytes.load(SeqCst) as i64, &tags);
        metrics.count("procsight.net.tx", agg.net_tx_bytes.load(SeqCst) as i64, &tags);
        metrics.count("procsight.tls.rx", agg.tls_rx_bytes.load(SeqCst) as i64, &tags);
        metrics.count("procsight.tls.tx", agg.tls_tx_bytes.load(SeqCst) as i64, &tags);
        metrics.count("procsight.fs.read_ops", agg.read_ops.load(SeqCst) as i64, &tags);
        metrics.count("procsight.fs.write_ops", agg.write_ops.load(SeqCst) as i64, &tags);
        metrics.count("procsight.net.rx_ops", agg.rx_ops.load(SeqCst) as i64, &tags);
        metrics.count("procsight.net.tx_ops", agg.tx_ops.load(SeqCst) as i64, &tags);
        metrics.count("procsight.fs.seek", agg.seek_ops.load(SeqCst) as i64, &tags);
        metrics.count("procsight.fs.stat", agg.stat_ops.load(SeqCst) as i64, &tags);
        metrics.count("procsight.fs.open", agg.open_ops.load(SeqCst) as i64, &tags);
        metrics.count("procsight.fs.close", agg.close_ops.load(SeqCst) as i64, &tags);
        metrics.count("procsight.net.dns", agg.dns_ops.load(SeqCst) as i64, &tags);
        metrics.count("procsight.io.iov", agg.iov_ops.load(SeqCst) as i64, &tags);

        metrics.gauge("procsight.net.port", agg.open_ports.load(SeqCst), &tags);
        metrics.gauge("procsight.net.tcp", agg.tcp_conns.load(SeqCst), &tags);
        metrics.gauge("procsight.net.udp", agg.udp_conns.load(SeqCst), &tags);
        metrics.gauge("procsight.net.other", agg.other_conns.load(SeqCst), &tags);

        metrics.timer_ms(
            "procsight.fs.duration",
            (agg.fs_duration_ns.load(SeqCst) / 1_000_000) as i64,
            &tags,
        );
        metrics.timer_ms(
            "procsight.net.duration",
            (agg.net_duration_ns.load(SeqCst) / 1_000_000) as i64,
            &tags,
        );
        metrics.timer_ms(
            "procsight.dns.duration",
            (agg.dns_duration_ns.load(SeqCst) / 1_000_000) as i64,
            &tags,
        );

        // Error summaries.
        let summary_tags: [(&str, &str); 3] =
            [("proc", &procname), ("pid", &pid_str), ("scope", "summary")];
        for class in [
            ErrorClass::NetConn,
            ErrorClass::NetRxTx,
            ErrorClass::NetDns,
            ErrorClass::FsOpenClose,
            ErrorClass::FsReadWrite,
            ErrorClass::FsStat,
            ErrorClass::Internal,
        ] {
            metrics.count(
                &format!("procsight.{}", class.name()),
                agg.error_total(class) as i64,
                &summary_tags,
            );
        }
        metrics.count(
            "procsight.lifecycle.untracked_close",
            agg.untracked_closes.load(SeqCst) as i64,
            &summary_tags,
        );
        metrics.count(
            "procsight.lifecycle.reopened_fd",
            agg.reopened_fds.load(SeqCst) as i64,
            &summary_tags,
        );

        // Per-descriptor line items, above the verbosity threshold.
        if published.cfg.verbosity >= AgentConfig::PER_FD_VERBOSITY {
            agent.fds.for_each(|record| {
                let fd_str = record.fd.to_string();
                let kind = record.kind().name();
                let detail = record
                    .path()
                    .or_else(|| record.remote().map(|a| a.to_string()))
                    .unwrap_or_default();
                let fd_tags: [(&str, &str); 4] = [
                    ("proc", &procname),
                    ("fd", &fd_str),
                    ("kind", kind),
                    ("detail", &detail),
                ];
                metrics.count(
                    "procsight.fd.bytes_in",
                    record.bytes_in.load(SeqCst) as i64,
                    &fd_tags,
                );
                metrics.count(
                    "procsight.fd.bytes_out",
                    record.bytes_out.load(SeqCst) as i64,
                    &fd_tags,
                );
                metrics.count("procsight.fd.ops", record.ops.load(SeqCst) as i64, &fd_tags);
                metrics.count(
                    "procsight.fd.iov_ops",
                    record.iov_ops.load(SeqCst) as i64,
                    &fd_tags,
                );
                metrics.count(
                    "procsight.fd.errors",
                    record.errors.load(SeqCst) as i64,
                    &fd_tags,
                );
            });
        }

        // Drain the event queue into the event sink.
        if let Ok(mut events) = published.events.lock() {
            for event in agent.events.drain() {
                events.send(&proc_id, &event);
            }
            events.flush();
        }

        metrics.flush();
    });
}

/// Pick up `<cmd-dir>/<prefix>.<pid>` when its modification time advances,
/// apply its contents as config commands, then unlink it.
pub fn dynamic_config_pickup() {
    let Some(agent) = Agent::get() else { return };
    let Some((path, mut cfg)) = config::with_current(|published| {
        (
            published.cfg.dyn_config_path(agent.proc_pid()),
            published.cfg.clone(),
        )
    }) else {
        return;
    };

    let Some(modtime) = os::file_mod_time(&path) else {
        return;
    };
    {
        let Ok(mut last) = DYN_CONFIG_MODTIME.lock() else { return };
        if *last == Some(modtime) {
            std::fs::remove_file(&path).ok();
            return;
        }
        *last = Some(modtime);
    }

    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            cfg.apply_commands(&contents);
            config::publish(cfg);
            log::info!("dynamic config applied from {}", path.display());
        }
        Err(err) => {
            log::error!("dynamic config read failed: {err}");
            if let Some(agent) = Agent::get() {
                agent.agg.error(ErrorClass::Internal);
            }
        }
    }
    std::fs::remove_file(&path).ok();
}

/// Some targets close every descriptor they did not open during their own
/// init; dropped transports are re-established here each tick.
fn reconnect_transports() {
    let Some(agent) = Agent::get() else { return };

    config::with_current(|published| {
        if let Ok(mut metrics) = published.metrics.lock() {
            let transport = metrics.transport_mut();
            if transport.needs_connection() {
                transport.connect().ok();
            }
        }
        if let Ok(mut events) = published.events.lock() {
            let transport = events.transport_mut();
            if transport.needs_connection() {
                transport.connect().ok();
            }
        }
    });
    logging::reconnect_if_needed();

    let reconnected = {
        let Ok(mut ctl) = agent.ctl.lock() else { return };
        ctl.needs_connection() && ctl.connect().is_ok()
    };
    if reconnected {
        // A fresh control connection gets our identity first.
        send_identity_on_control(agent);
    }
}

fn send_identity_on_control(agent: &Agent) {
    let identity = agent
        .proc
        .read()
        .map(|p| serde_json::to_value(&*p).unwrap_or_default())
        .unwrap_or_default();
    let mut line = json!({ "type": "process-identity", "body": identity }).to_string();
    line.push('\n');
    if let Ok(mut ctl) = agent.ctl.lock() {
        ctl.send(line.as_bytes()).ok();
    }
}

fn scratch_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/cfg.{pid}"))
}

/// Poll the control descriptor for one reporting interval; when readable,
/// drain one newline-framed message through the scratch file and dispatch
/// it.
pub fn remote_config() {
    let Some(agent) = Agent::get() else { return };
    let timeout_ms = (interval_secs() * 1000).min(i32::MAX as u64) as i32;

    let Some(fd) = agent.ctl.lock().ok().and_then(|ctl| ctl.raw_fd()) else {
        // No control connection; sleep the interval to keep the tick pace.
        std::thread::sleep(std::time::Duration::from_secs(interval_secs()));
        return;
    };

    // SAFETY: the control descriptor outlives the poll; the reporter owns
    // reconnection and teardown.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
    let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);
    let ready = match poll(&mut fds, timeout) {
        Ok(n) => n,
        Err(_) => return,
    };
    if ready == 0 {
        return;
    }
    let Some(revents) = fds[0].revents() else { return };
    if !revents.contains(PollFlags::POLLIN)
        || revents.contains(PollFlags::POLLHUP)
        || revents.contains(PollFlags::POLLNVAL)
    {
        return;
    }

    match drain_control_message(agent, fd) {
        Some(message) => {
            let request = control::parse(&message);
            let response = control::dispatch(request, agent);
            if let Ok(mut ctl) = agent.ctl.lock() {
                ctl.send(response.to_line().as_bytes()).ok();
            }
        }
        None => {
            log::error!("control message drain failed");
        }
    }
}

/// Drain until a newline (end-of-message) through the per-pid scratch file,
/// with a hard retry cap. The scratch file is always unlinked, fclose
/// failures included.
fn drain_control_message(agent: &Agent, fd: RawFd) -> Option<String> {
    let Some(real_recv) = fntable::RECV.typed::<unsafe extern "C" fn(
        libc::c_int,
        *mut libc::c_void,
        libc::size_t,
        libc::c_int,
    ) -> libc::ssize_t>() else {
        return None;
    };

    let path = scratch_path(agent.proc_pid());
    let mut scratch = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) => {
            log::error!("scratch file open failed: {err}");
            agent.agg.error(ErrorClass::Internal);
            return None;
        }
    };

    let mut success = false;
    let mut buf = [0u8; 1024];
    for _ in 0..MAX_DRAIN_TRIES {
        let rc = unsafe {
            real_recv(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if rc <= 0 {
            // The connection went away under us.
            if let Ok(mut ctl) = agent.ctl.lock() {
                ctl.disconnect();
            }
            break;
        }
        let chunk = &buf[..rc as usize];
        if scratch.write_all(chunk).is_err() {
            agent.agg.error(ErrorClass::Internal);
            break;
        }
        if chunk.contains(&b'\n') {
            success = true;
            break;
        }
    }

    if !success {
        // Retries exhausted or the peer vanished; close rather than risk
        // blocking on a half-delivered message forever.
        if let Ok(mut ctl) = agent.ctl.lock() {
            ctl.disconnect();
        }
    }

    let message = if success {
        scratch.flush().ok();
        scratch.seek(SeekFrom::Start(0)).ok();
        let mut contents = String::new();
        match scratch.read_to_string(&mut contents) {
            Ok(_) => {
                // One newline-framed message per drain.
                let end = contents.find('\n').map(|i| i + 1).unwrap_or(contents.len());
                Some(contents[..end].to_string())
            }
            Err(err) => {
                log::error!("scratch file read failed: {err}");
                agent.agg.error(ErrorClass::Internal);
                None
            }
        }
    } else {
        None
    };

    drop(scratch);
    std::fs::remove_file(&path).ok();
    message
}

/// Final flush, registered with `atexit`. Runs on whichever target thread
/// called exit; the flush itself must not be observed.
pub fn handle_exit() {
    crate::hooks::mark_agent_thread();
    report_periodic();
    config::with_current(|published| {
        if let Ok(mut metrics) = published.metrics.lock() {
            metrics.flush();
        }
        if let Ok(mut events) = published.events.lock() {
            events.flush();
        }
    });
    logging::flush();
    if let Some(agent) = Agent::get() {
        if let Ok(mut ctl) = agent.ctl.lock() {
            ctl.flush();
        }
    }
}

/// Process-start metric, event and log line; emitted at load, on fork-child
/// reset, and when a control connection is re-established.
pub fn report_process_start(agent: &Agent) {
    let proc_id = agent.proc_id_string();
    log::info!("process start: {proc_id}");
    let identity = agent
        .proc
        .read()
        .map(|p| serde_json::to_value(&*p).unwrap_or_default())
        .unwrap_or_default();
    config::with_current(|published| {
        if let Ok(mut metrics) = published.metrics.lock() {
            metrics.count("procsight.proc.start", 1, &[("proc", proc_id.as_str())]);
            metrics.flush();
        }
        if let Ok(mut events) = published.events.lock() {
            events.send(&proc_id, &Event::new("process-start", identity.clone()));
            events.flush();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{test_agent, test_guard};
    use crate::transport::{Endpoint, Transport};
    use std::io::{BufRead, BufReader};

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
    fn reentrancy_guard_excludes_concurrent_reports() {
        let _guard = test_guard();
        test_agent();
        config::publish(null_cfg());

        assert!(REPORT_GUARD.compare_exchange(0, 1, SeqCst, SeqCst).is_ok());
        // The exit-flush path finds the periodic path mid-report.
        assert!(!report_periodic());
        REPORT_GUARD.store(0, SeqCst);
        assert!(report_periodic());
    }

    #[test]
    fn interval_mirror_clamps_to_one_second() {
        let _guard = test_guard();
        set_interval_secs(0);
        assert_eq!(interval_secs(), 1);
        set_interval_secs(10);
        assert_eq!(interval_secs(), 10);
    }

    #[test]
    fn periodic_report_emits_summaries_and_line_items() {
        let _guard = test_guard();
        let agent = test_agent();
        let dir = tempfile::tempdir().unwrap();
        let metrics_path = dir.path().join("metrics.out");
        config::publish(AgentConfig {
            metric_dest: format!("file://{}", metrics_path.display()),
            verbosity: AgentConfig::PER_FD_VERBOSITY,
            ..null_cfg()
        });

        agent.fds.open_for(970, crate::state::FdKind::File, Some("/tmp/widget"));
        agent.fds.get(970).unwrap().add_out(4242);

        assert!(report_periodic());

        let written = std::fs::read_to_string(&metrics_path).unwrap();
        assert!(written.contains("procsight.fs.write:"), "got: {written}");
        assert!(written.contains("scope:summary"));
        assert!(written.contains("procsight.fd.bytes_out:4242"));
        assert!(written.contains("fd:970"));

        agent.fds.close(970);
    }

    #[test]
    fn dynamic_config_file_is_applied_and_unlinked() {
        let _guard = test_guard();
        let agent = test_agent();
        let dir = tempfile::tempdir().unwrap();
        config::publish(AgentConfig {
            command_dir: dir.path().to_path_buf(),
            ..null_cfg()
        });

        let path = dir
            .path()
            .join(format!("procsight.{}", agent.proc_pid()));
        std::fs::write(&path, "PROCSIGHT_INTERVAL=7\nVERBOSITY=2\n").unwrap();
        *DYN_CONFIG_MODTIME.lock().unwrap() = None;

        dynamic_config_pickup();

        assert!(!path.exists(), "command file must be unlinked");
        config::with_current(|p| {
            assert_eq!(p.cfg.interval, 7);
            assert_eq!(p.cfg.verbosity, 2);
        })
        .unwrap();
        assert_eq!(interval_secs(), 7);
        set_interval_secs(10);
    }

    #[test]
    fn control_round_trip_applies_set_config() {
        let _guard = test_guard();
        let agent = test_agent();
        config::publish(null_cfg());
        set_interval_secs(1);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let mut ctl = agent.ctl.lock().unwrap();
            *ctl = Transport::new(Endpoint::Tcp(addr.to_string()));
            ctl.connect().unwrap();
        }
        let (controller, _) = listener.accept().unwrap();

        // The controller sends one newline-framed set-config message.
        let mut sender = controller.try_clone().unwrap();
        sender
            .write_all(b"{\"type\":\"set-config\",\"body\":{\"interval\":2}}\n")
            .unwrap();

        remote_config();

        config::with_current(|p| assert_eq!(p.cfg.interval, 2)).unwrap();
        assert_eq!(interval_secs(), 2);

        // And receives the framed response.
        let mut reader = BufReader::new(controller);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let response: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(response["status"], 200);

        {
            let mut ctl = agent.ctl.lock().unwrap();
            *ctl = Transport::new(Endpoint::Null);
        }
        set_interval_secs(10);
    }
}
