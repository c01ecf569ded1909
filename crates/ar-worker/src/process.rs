// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! PID-level process helpers: liveness probes and group termination
//! with forced-kill escalation. These work on bare PIDs so they also
//! reach orphaned workers left behind by a previous server run.

use std::time::Duration;
use tracing::{debug, warn};

/// Signal-0 existence check.
pub fn is_pid_alive(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    // kill(pid, 0) probes without delivering a signal. EPERM still
    // means the process exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Send `signal` to the process group of `pid`, falling back to the
/// single process when the group signal fails.
pub fn signal_group(pid: i64, signal: i32) {
    if pid <= 0 {
        return;
    }
    let group_rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if group_rc != 0 {
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc != 0 {
            debug!(pid, signal, "signal delivery failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// SIGTERM the process group now; SIGKILL it after `grace` if the
/// leader is still alive. The escalation runs on a detached task so
/// callers never wait on it.
pub fn terminate_group_with_escalation(pid: i64, grace: Duration) {
    if pid <= 0 {
        return;
    }
    signal_group(pid, libc::SIGTERM);
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if is_pid_alive(pid) {
            warn!(pid, "worker ignored SIGTERM, escalating to SIGKILL");
            signal_group(pid, libc::SIGKILL);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(is_pid_alive(std::process::id() as i64));
    }

    #[test]
    fn nonsense_pids_are_dead() {
        assert!(!is_pid_alive(0));
        assert!(!is_pid_alive(-5));
        // PID far beyond pid_max on any default configuration.
        assert!(!is_pid_alive(9_999_999));
    }

    #[tokio::test]
    async fn terminate_reaps_a_spawned_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("pid") as i64;
        assert!(is_pid_alive(pid));

        terminate_group_with_escalation(pid, Duration::from_secs(5));
        let status = child.wait().await.expect("wait");
        assert!(!status.success());
    }
}
