//! The command launcher.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, error, info, warn};

use super::reaper::signal_group;
use super::result::ExecutionResult;
use crate::error::LaunchError;

/// How long a process group gets to exit after SIGTERM before SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Target label used when the launcher is called directly.
const LOCAL_TARGET: &str = "localhost";

/// Tears the process group down when dropped while armed.
///
/// Covers the case where the launch future is dropped mid-flight, e.g. when
/// the batch scheduler aborts a worker. The group gets SIGTERM first so that
/// a wrapper shell can forward it to payloads running in their own group
/// (`timeout` moves itself into a new one), then SIGKILL after [`KILL_GRACE`].
struct GroupGuard {
    pgid: i32,
    armed: bool,
}

impl GroupGuard {
    fn new(pgid: i32) -> Self {
        Self { pgid, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(pgid = self.pgid, "Launch dropped, terminating process group");
        if !signal_group(self.pgid, libc::SIGTERM) {
            return;
        }
        let pgid = self.pgid;
        // Drop cannot await; escalate from a detached thread.
        std::thread::spawn(move || {
            std::thread::sleep(KILL_GRACE);
            if signal_group(pgid, libc::SIGKILL) {
                debug!(pgid, "Process group outlived SIGTERM, killed");
            }
        });
    }
}

struct Collected {
    stdin: io::Result<()>,
    stdout: (Vec<u8>, Option<io::Error>),
    stderr: (Vec<u8>, Option<io::Error>),
    status: io::Result<ExitStatus>,
}

/// Runs `command` through `sh -c` with a hard timeout.
///
/// The child leads a new process group. When `timeout` expires the group
/// receives SIGTERM, then SIGKILL after [`KILL_GRACE`]. Output produced
/// before the kill is still returned. Stdin is written concurrently with
/// draining stdout and stderr.
///
/// Non-zero exit codes are returned as data and logged as warnings unless
/// listed in `ok_codes`.
///
/// # Errors
///
/// Returns `LaunchError` only if the process cannot be spawned.
pub async fn launch(
    command: &str,
    timeout: Duration,
    input: Option<&[u8]>,
    ok_codes: &[i32],
) -> Result<ExecutionResult, LaunchError> {
    info!(command = %command, "launch_cmd");
    let start = Instant::now();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            command: command.to_string(),
            source,
        })?;

    let pgid = child
        .id()
        .ok_or_else(|| LaunchError::MissingPid(command.to_string()))? as i32;
    let mut guard = GroupGuard::new(pgid);

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let collect = async {
        let (stdin, stdout, stderr) = tokio::join!(
            feed_stdin(stdin, input, pgid),
            drain(stdout, pgid),
            drain(stderr, pgid)
        );
        let status = child.wait().await;
        Collected {
            stdin,
            stdout,
            stderr,
            status,
        }
    };
    tokio::pin!(collect);

    let mut timed_out = false;
    let collected = match tokio::time::timeout(timeout, &mut collect).await {
        Ok(collected) => Some(collected),
        Err(_) => {
            timed_out = true;
            error!(
                pgid,
                timeout_secs = timeout.as_secs_f64(),
                "launch_cmd: process group killed by timeout"
            );
            signal_group(pgid, libc::SIGTERM);
            match tokio::time::timeout(KILL_GRACE, &mut collect).await {
                Ok(collected) => Some(collected),
                Err(_) => {
                    signal_group(pgid, libc::SIGKILL);
                    tokio::time::timeout(KILL_GRACE, &mut collect).await.ok()
                }
            }
        }
    };

    let Some(collected) = collected else {
        // Something outside the group still holds our pipes open.
        error!(command = %command, "launch_cmd: output pipes never closed, giving up");
        let mut result = ExecutionResult::new(LOCAL_TARGET, 128 + libc::SIGKILL);
        result.timed_out = timed_out;
        result.duration = start.elapsed();
        return Ok(result);
    };
    guard.disarm();

    let (stdout, stdout_err) = collected.stdout;
    let (stderr, stderr_err) = collected.stderr;
    let faults: Vec<io::Error> = [collected.stdin.err(), stdout_err, stderr_err]
        .into_iter()
        .flatten()
        .collect();
    for fault in &faults {
        error!(command = %command, error = %fault, "launch_cmd: I/O fault, process group killed");
    }

    let exit_code = match collected.status {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            error!(command = %command, error = %e, "launch_cmd: failed to wait for child");
            -1
        }
    };

    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    let stderr = String::from_utf8_lossy(&stderr)
        .trim_end_matches('\n')
        .to_string();

    info!(command = %command, code = exit_code, stderr = %stderr, "launch_cmd finished");
    debug!(
        command = %command,
        code = exit_code,
        stdin = %input.map(String::from_utf8_lossy).unwrap_or_default(),
        stdout = %stdout,
        "launch_cmd output"
    );
    if exit_code != 0 && !ok_codes.contains(&exit_code) {
        warn!(command = %command, code = exit_code, stderr = %stderr, "launch_cmd: non-zero exit");
    }

    Ok(ExecutionResult {
        target: LOCAL_TARGET.to_string(),
        stdout,
        stderr,
        exit_code,
        timed_out,
        duration: start.elapsed(),
    })
}

/// Exit code of a finished child, `128 + signal` when it was killed.
fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

/// Writes the payload and closes stdin. No payload closes stdin right away.
///
/// A write fault other than a broken pipe kills group `pgid` on the spot.
async fn feed_stdin(stdin: Option<ChildStdin>, input: Option<&[u8]>, pgid: i32) -> io::Result<()> {
    let (Some(mut stdin), Some(input)) = (stdin, input) else {
        return Ok(());
    };
    let written = match stdin.write_all(input).await {
        Ok(()) => stdin.shutdown().await,
        Err(e) => Err(e),
    };
    match written {
        // The child is free to stop reading early.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => {
            signal_group(pgid, libc::SIGKILL);
            Err(e)
        }
        Ok(()) => Ok(()),
    }
}

/// Reads a pipe to EOF, keeping whatever arrived before an error.
///
/// A read fault kills group `pgid` right away rather than after the child
/// has been waited for.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>, pgid: i32) -> (Vec<u8>, Option<io::Error>) {
    let mut buf = Vec::new();
    let Some(mut pipe) = pipe else {
        return (buf, None);
    };
    match pipe.read_to_end(&mut buf).await {
        Ok(_) => (buf, None),
        Err(e) => {
            signal_group(pgid, libc::SIGKILL);
            (buf, Some(e))
        }
    }
}
