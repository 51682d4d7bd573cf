//! File transfer command lines (rsync pulls, scp get/put).

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use super::command::DEFAULT_COMMAND_TIMEOUT;
use super::quote;
use super::target::Target;
use crate::error::{LaunchError, TimmyError, NOOP_TRANSFER_EXIT_CODE};
use crate::launcher::{launch, ExecutionResult};
use crate::utils::ensure_dir;

/// Default timeout for scp transfers.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(600);

/// Mirrors a list of files from a node into a local directory with rsync.
///
/// The file list is fed through stdin (`--files-from=-`), the destination
/// is cleaned of stale files before the transfer (`--delete-before`) and
/// interrupted transfers can resume (`--partial`). Remote pulls disable ssh
/// compression since rsync already compresses.
#[derive(Debug, Clone)]
pub struct RsyncPull {
    target: Target,
    dest_dir: PathBuf,
    ssh_options: Vec<String>,
    timeout: Duration,
    noop_exit_code: i32,
}

impl RsyncPull {
    /// Creates a pull from `target` into `dest_dir`.
    pub fn new(target: Target, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            target,
            dest_dir: dest_dir.into(),
            ssh_options: Vec::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            noop_exit_code: NOOP_TRANSFER_EXIT_CODE,
        }
    }

    /// Sets extra ssh options for the rsync transport.
    pub fn with_ssh_options(mut self, options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ssh_options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the transfer timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the exit code reported when the file list is empty.
    pub fn with_noop_exit_code(mut self, code: i32) -> Self {
        self.noop_exit_code = code;
        self
    }

    /// Builds the rsync command line.
    pub fn build(&self) -> String {
        let timeout = self.timeout.as_secs_f64();
        let dest = quote(self.dest_dir.to_string_lossy());
        match &self.target {
            Target::Local(_) => format!(
                "timeout '{timeout}' rsync -avzr --files-from=- / {dest} \
                 --progress --partial --delete-before"
            ),
            Target::Remote(address) => {
                let mut ssh = vec!["ssh".to_string()];
                ssh.extend(self.ssh_options.iter().cloned());
                ssh.push("-oCompression=no".to_string());
                format!(
                    "timeout '{timeout}' rsync -avzr -e {} --files-from=- {}:/ {dest} \
                     --progress --partial --delete-before",
                    quote(ssh.join(" ")),
                    quote(address)
                )
            }
        }
    }

    /// Pulls `files` (absolute paths on the node).
    ///
    /// An empty list never runs rsync and reports the no-op exit code.
    ///
    /// # Errors
    ///
    /// Returns `LaunchError` if rsync cannot be spawned.
    pub async fn run(&self, files: &[String]) -> Result<ExecutionResult, LaunchError> {
        let list: Vec<&str> = files
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .collect();
        let command = self.build();
        debug!(command = %command, files = list.len(), "rsync pull");

        if list.is_empty() {
            info!(node = %self.target, "Empty file list, skipping rsync");
            return Ok(ExecutionResult::new(
                self.target.address(),
                self.noop_exit_code,
            ));
        }

        let mut data = list.join("\n");
        data.push('\n');
        let result = launch(&command, self.timeout, Some(data.as_bytes()), &[]).await?;
        Ok(result.with_target(self.target.address()))
    }
}

/// Builds the rsync line pulling from `target` into `dest_dir`.
pub fn rsync_pull_command(
    target: &Target,
    ssh_options: &[String],
    dest_dir: &Path,
    timeout: Duration,
) -> String {
    RsyncPull::new(target.clone(), dest_dir)
        .with_ssh_options(ssh_options.iter().cloned())
        .with_timeout(timeout)
        .build()
}

/// Pulls `files` from `target` into `dest_dir` with rsync.
///
/// # Errors
///
/// Returns `LaunchError` if rsync cannot be spawned.
pub async fn rsync_pull(
    target: &Target,
    files: &[String],
    ssh_options: &[String],
    dest_dir: &Path,
    timeout: Duration,
) -> Result<ExecutionResult, LaunchError> {
    RsyncPull::new(target.clone(), dest_dir)
        .with_ssh_options(ssh_options.iter().cloned())
        .with_timeout(timeout)
        .run(files)
        .await
}

/// Builds the scp line copying `file` from `target` into `local_dir`.
pub fn scp_get_command(
    target: &Target,
    file: &str,
    local_dir: &Path,
    timeout: Duration,
    recursive: bool,
) -> String {
    let r = if recursive { "-r " } else { "" };
    format!(
        "timeout '{}' scp {r}{}:{} {}",
        timeout.as_secs_f64(),
        quote(target.address()),
        quote(file),
        quote(local_dir.to_string_lossy())
    )
}

/// Builds the scp line copying local `file` to `dest` on `target`.
pub fn scp_put_command(
    target: &Target,
    file: &Path,
    dest: &str,
    timeout: Duration,
    recursive: bool,
) -> String {
    let r = if recursive { "-r " } else { "" };
    format!(
        "timeout '{}' scp {r}{} {}:{}",
        timeout.as_secs_f64(),
        quote(file.to_string_lossy()),
        quote(target.address()),
        quote(dest)
    )
}

/// Copies `file` from `target` into `dest_dir`, recreating the file's
/// parent directories under it (`/var/log/x` lands in `dest_dir/var/log/`).
///
/// # Errors
///
/// Returns `ResourceError::CreateDir` if the local directory cannot be
/// created, `LaunchError` if scp cannot be spawned.
pub async fn scp_get(
    target: &Target,
    file: &str,
    dest_dir: &Path,
    timeout: Duration,
    recursive: bool,
) -> Result<ExecutionResult, TimmyError> {
    let local_dir = mirror_dir(dest_dir, file);
    ensure_dir(&local_dir)?;
    let command = scp_get_command(target, file, &local_dir, timeout, recursive);
    let result = launch(&command, timeout, None, &[]).await?;
    Ok(result.with_target(target.address()))
}

/// Copies local `file` to `dest` on `target`.
///
/// # Errors
///
/// Returns `LaunchError` if scp cannot be spawned.
pub async fn scp_put(
    target: &Target,
    file: &Path,
    dest: &str,
    timeout: Duration,
    recursive: bool,
) -> Result<ExecutionResult, LaunchError> {
    let command = scp_put_command(target, file, dest, timeout, recursive);
    let result = launch(&command, timeout, None, &[]).await?;
    Ok(result.with_target(target.address()))
}

/// Local directory mirroring the parent of a remote path.
fn mirror_dir(dest_dir: &Path, remote_file: &str) -> PathBuf {
    let parent = Path::new(remote_file).parent().unwrap_or(Path::new(""));
    let mut parts = Vec::new();
    for component in parent.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    parts
        .into_iter()
        .fold(dest_dir.to_path_buf(), |dir, part| dir.join(part))
}
