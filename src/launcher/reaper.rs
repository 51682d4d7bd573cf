//! Process-tree reaping.
//!
//! After a batch abort no ssh, rsync or remote-shell subprocess may outlive
//! the controller. The reaper walks the process tree below a pid with
//! timeout-bounded `ps` queries and terminates what it finds.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::process::launch;

/// `ps` exits with 1 when no process matched the selection.
const PS_NO_MATCH: i32 = 1;

/// Sends `signal` to every process in group `pgid`.
///
/// Returns `false` if the group no longer exists or the signal could not be
/// delivered.
pub fn signal_group(pgid: i32, signal: i32) -> bool {
    if pgid <= 1 {
        return false;
    }
    // SAFETY: killpg only delivers a signal and touches no memory.
    let rc = unsafe { libc::killpg(pgid, signal) };
    rc == 0
}

fn signal_pid(pid: i32, signal: i32) -> bool {
    if pid <= 1 {
        return false;
    }
    // SAFETY: kill only delivers a signal and touches no memory.
    let rc = unsafe { libc::kill(pid, signal) };
    rc == 0
}

/// Terminates every descendant of the current process.
///
/// Returns the number of processes a signal was delivered to.
pub async fn kill_descendants(timeout: Duration) -> usize {
    kill_descendants_of(std::process::id() as i32, timeout).await
}

/// Terminates every descendant of `root`.
///
/// Children are listed with `ps`, each call bounded by `timeout`. Leaves and
/// processes whose query failed receive SIGTERM, unless they no longer exist
/// by then. That skips short-lived helpers such as the `ps` listing itself,
/// whose pid may already belong to an unrelated process. `root` itself is
/// never signalled.
pub async fn kill_descendants_of(root: i32, timeout: Duration) -> usize {
    let mut pending = vec![root];
    let mut seen = HashSet::from([root]);
    let mut leaves = Vec::new();

    while let Some(pid) = pending.pop() {
        match list_children(pid, timeout).await {
            Some(children) if !children.is_empty() => {
                for child in children {
                    if seen.insert(child) {
                        pending.push(child);
                    }
                }
            }
            _ if pid != root => leaves.push(pid),
            _ => {}
        }
    }

    let mut killed = 0;
    for pid in leaves {
        if !is_alive(pid) {
            debug!(pid, "Descendant already gone");
            continue;
        }
        if signal_pid(pid, libc::SIGTERM) {
            debug!(pid, "Sent SIGTERM to descendant");
            killed += 1;
        }
    }
    if killed > 0 {
        info!(root, killed, "Terminated descendant processes");
    }
    killed
}

fn is_alive(pid: i32) -> bool {
    signal_pid(pid, 0)
}

/// Lists the direct children of `pid`, `None` if the query failed.
async fn list_children(pid: i32, timeout: Duration) -> Option<Vec<i32>> {
    let command = format!("ps -o pid= --ppid {pid}");
    match launch(&command, timeout, None, &[PS_NO_MATCH]).await {
        Ok(result) if result.exit_code == 0 => Some(parse_pids(&result.stdout)),
        Ok(result) if result.exit_code == PS_NO_MATCH && result.stderr.is_empty() => {
            Some(Vec::new())
        }
        Ok(result) => {
            debug!(pid, code = result.exit_code, "Child listing failed");
            None
        }
        Err(e) => {
            warn!(pid, error = %e, "Could not list child processes");
            None
        }
    }
}

fn parse_pids(output: &str) -> Vec<i32> {
    output
        .split_whitespace()
        .filter_map(|token| token.parse::<i32>().ok())
        .filter(|pid| *pid > 0)
        .collect()
}
