// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! Small procfs shims used by the periodic report: CPU, memory, thread and
//! descriptor counts for this process. Failures return -1 and are reported
//! as-is; the reporter never trips over a missing /proc entry.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

/// Process CPU usage (user + system) in microseconds.
pub fn proc_cpu_micros() -> i64 {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    // SAFETY: usage is a valid out-pointer.
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
        return -1;
    }
    (usage.ru_utime.tv_sec + usage.ru_stime.tv_sec) * 1_000_000
        + (usage.ru_utime.tv_usec + usage.ru_stime.tv_usec)
}

/// Resident set size in kilobytes, from /proc/<pid>/statm.
pub fn proc_memory_kb(pid: u32) -> i64 {
    let Ok(statm) = fs::read_to_string(format!("/proc/{pid}/statm")) else {
        return -1;
    };
    let Some(resident_pages) = statm
        .split_whitespace()
        .nth(1)
        .and_then(|f| f.parse::<i64>().ok())
    else {
        return -1;
    };
    let page_kb = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } / 1024;
    resident_pages * page_kb.max(1)
}

/// Thread count, from the Threads: line of /proc/<pid>/status.
pub fn num_threads(pid: u32) -> i64 {
    let Ok(status) = fs::read_to_string(format!("/proc/{pid}/status")) else {
        return -1;
    };
    status
        .lines()
        .find_map(|l| l.strip_prefix("Threads:"))
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(-1)
}

/// Open descriptor count, from /proc/<pid>/fd.
pub fn num_fds(pid: u32) -> i64 {
    match fs::read_dir(format!("/proc/{pid}/fd")) {
        Ok(entries) => entries.count() as i64,
        Err(_) => -1,
    }
}

/// Direct child count, from the per-task children lists.
pub fn num_child_procs(pid: u32) -> i64 {
    let Ok(tasks) = fs::read_dir(format!("/proc/{pid}/task")) else {
        return -1;
    };
    let mut children = 0i64;
    for task in tasks.flatten() {
        if let Ok(list) = fs::read_to_string(task.path().join("children")) {
            children += list.split_whitespace().count() as i64;
        }
    }
    children
}

/// Short process name, from /proc/<pid>/comm.
pub fn proc_name(pid: u32) -> String {
    fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| s.trim_end().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Full command line with NULs flattened to spaces.
pub fn proc_cmdline(pid: u32) -> String {
    match fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(raw) if !raw.is_empty() => {
            let mut cmd = String::with_capacity(raw.len());
            for &b in raw.trim_ascii_end() {
                cmd.push(if b == 0 { ' ' } else { b as char });
            }
            cmd.trim_end().to_string()
        }
        _ => proc_name(pid),
    }
}

pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is a valid out-buffer; gethostname NUL-terminates on success.
    if unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) } != 0 {
        return "unknown".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub fn file_mod_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_metrics_are_sane() {
        let pid = std::process::id();
        assert!(proc_cpu_micros() >= 0);
        assert!(proc_memory_kb(pid) > 0);
        assert!(num_threads(pid) >= 1);
        assert!(num_fds(pid) >= 3);
        assert!(num_child_procs(pid) >= 0);
    }

    #[test]
    fn identity_strings_are_nonempty() {
        let pid = std::process::id();
        assert!(!proc_name(pid).is_empty());
        assert!(!proc_cmdline(pid).is_empty());
        assert!(!hostname().is_empty());
    }

    #[test]
    fn mod_time_tracks_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe");
        assert!(file_mod_time(&path).is_none());
        std::fs::write(&path, b"x").unwrap();
        assert!(file_mod_time(&path).is_some());
    }
}
