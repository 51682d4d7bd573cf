//! Remote command construction.
//!
//! Builds the exact shell line that runs a command on a node, either locally
//! through `bash -c` or over ssh, and wraps it so that:
//!
//! - stdin travels hex-encoded through the wrapper shell and is decoded with
//!   `xxd -r -p` right before the transport, so NUL bytes and other binary
//!   content survive intact;
//! - the payload pipeline runs in the background and SIGTERM/SIGINT delivered
//!   to the wrapper are forwarded to it, so killing the wrapper also stops
//!   `timeout`/`ssh` and, through them, the remote command.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use super::quote;
use super::target::Target;
use crate::error::LaunchError;
use crate::launcher::{launch, ExecutionResult};

/// Default timeout for commands run on nodes.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// Builder for a command run on one node.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    target: Target,
    command: String,
    ssh_options: Vec<String>,
    env_vars: Vec<String>,
    timeout: Duration,
    prefix: String,
    script: Option<PathBuf>,
    input_file: Option<PathBuf>,
    output_file: Option<PathBuf>,
    ok_codes: Vec<i32>,
}

impl RemoteCommand {
    /// Creates a command for `target` with the default timeout.
    pub fn new(target: Target, command: impl Into<String>) -> Self {
        Self {
            target,
            command: command.into(),
            ssh_options: Vec::new(),
            env_vars: Vec::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            prefix: String::new(),
            script: None,
            input_file: None,
            output_file: None,
            ok_codes: Vec::new(),
        }
    }

    /// Sets extra ssh options, passed through verbatim.
    pub fn with_ssh_options(mut self, options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ssh_options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Sets `NAME=value` assignments exported to the command.
    pub fn with_env_vars(mut self, vars: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env_vars = vars.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the timeout enforced both by `timeout` and by the launcher.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets a prefix placed before the command (e.g. `nice -n 19`).
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Runs a local script file on the target through `bash -s` instead of
    /// the command string.
    pub fn with_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.script = Some(path.into());
        self
    }

    /// Feeds the command from a local file. Takes priority over stdin input.
    pub fn with_input_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_file = Some(path.into());
        self
    }

    /// Redirects the command's stdout to a local file.
    pub fn with_output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    /// Exit codes that should not be logged as failures.
    pub fn with_ok_codes(mut self, codes: impl Into<Vec<i32>>) -> Self {
        self.ok_codes = codes.into();
        self
    }

    /// The target this command runs on.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Builds the full shell line, including the stdin-forwarding wrapper.
    pub fn build(&self) -> String {
        let mut cmd = if let Some(script) = &self.script {
            format!(
                "{} {} < {}",
                self.transport(),
                quote(join_words(&self.prefix, "bash -s")),
                quote_path(script)
            )
        } else {
            let mut cmd = format!(
                "{} {}",
                self.transport(),
                quote(join_words(&self.prefix, &self.command))
            );
            if let Some(input_file) = &self.input_file {
                cmd = format!("{cmd} < {}", quote_path(input_file));
            }
            cmd
        };
        if let Some(output_file) = &self.output_file {
            cmd = format!("{cmd} > {}", quote_path(output_file));
        }

        format!(
            "input=\"$(cat)\"; trap 'kill $pid' TERM; trap 'kill $pid' INT; \
             printf '%s' \"$input\" | xxd -r -p | {cmd} & pid=$!; wait $pid"
        )
    }

    /// The part that reaches the node: `bash -c` locally, ssh otherwise.
    fn transport(&self) -> String {
        let timeout = self.timeout.as_secs_f64();
        let env = self.env_vars.join(" ");
        match &self.target {
            Target::Local(_) => join_words(&env, &format!("timeout '{timeout}' bash -c")),
            Target::Remote(address) => {
                let mut words = vec![format!("timeout '{timeout}' ssh -t -T")];
                words.extend(self.ssh_options.iter().cloned());
                words.push(quote(address));
                if !env.is_empty() {
                    words.push(quote(&env));
                }
                words.join(" ")
            }
        }
    }

    /// Runs the command, sending `input` as its stdin.
    ///
    /// `input` is ignored when a script or input file is configured.
    ///
    /// # Errors
    ///
    /// Returns `LaunchError` if the wrapper shell cannot be spawned. Failures
    /// of the command itself are reported through the exit code.
    pub async fn run(&self, input: Option<&[u8]>) -> Result<ExecutionResult, LaunchError> {
        if self.target.is_local() {
            info!(node = %self.target, "skip ssh");
        } else {
            info!(node = %self.target, "exec ssh");
        }

        let payload = if self.script.is_some() || self.input_file.is_some() {
            None
        } else {
            input
        };
        let encoded = hex::encode(payload.unwrap_or_default());

        let result = launch(
            &self.build(),
            self.timeout,
            Some(encoded.as_bytes()),
            &self.ok_codes,
        )
        .await?;
        Ok(result.with_target(self.target.address()))
    }
}

fn join_words(first: &str, second: &str) -> String {
    match (first.trim(), second.trim()) {
        ("", second) => second.to_string(),
        (first, "") => first.to_string(),
        (first, second) => format!("{first} {second}"),
    }
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}
