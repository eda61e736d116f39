// Copyright 2024-Present the procsight contributors
// SPDX-License-Identifier: Apache-2.0

//! The identity this process reports under. Built at load and rebuilt on the
//! child side of fork, where the pid (and therefore the derived id) changes.

use serde::Serialize;

use crate::os;

/// Longest command-line tail folded into the derived id.
const CMD_TAIL_LEN: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct ProcIdentity {
    pub pid: u32,
    pub ppid: u32,
    pub hostname: String,
    pub procname: String,
    pub cmdline: String,
    /// `host-proc-cmdtail`, the stable identity the collector keys on.
    pub id: String,
}

impl ProcIdentity {
    pub fn build() -> Self {
        let pid = std::process::id();
        let ppid = unsafe { libc::getppid() } as u32;
        let hostname = os::hostname();
        let procname = os::proc_name(pid);
        let cmdline = os::proc_cmdline(pid);

        let tail_start = cmdline.len().saturating_sub(CMD_TAIL_LEN);
        // Stay on a char boundary when the cmdline is not pure ASCII.
        let tail_start = (tail_start..cmdline.len())
            .find(|&i| cmdline.is_char_boundary(i))
            .unwrap_or(cmdline.len());
        let id = format!("{hostname}-{procname}-{}", &cmdline[tail_start..]);

        Self {
            pid,
            ppid,
            hostname,
            procname,
            cmdline,
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_matches_this_process() {
        let identity = ProcIdentity::build();
        assert_eq!(identity.pid, std::process::id());
        assert!(identity.id.starts_with(&identity.hostname));
        assert!(identity.id.contains(&identity.procname));
    }

    #[test]
    fn cmd_tail_is_bounded() {
        let identity = ProcIdentity::build();
        let tail = identity
            .id
            .rsplit('-')
            .next()
            .expect("id has dash separators");
        assert!(tail.len() <= CMD_TAIL_LEN + identity.procname.len());
    }
}
