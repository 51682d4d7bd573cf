//! Built-in operations: remote execution and file transfer.
//!
//! Each operation carries the configured defaults and reads everything
//! item-specific from its [`Args`]. Any argument present in the mapping
//! overrides the default.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::job::{Args, Operation, WorkItem};
use crate::config::Config;
use crate::error::ArgsError;
use crate::launcher::ExecutionResult;
use crate::remote::{scp_get, scp_put, RemoteCommand, RsyncPull, Target};

/// Settings shared by all built-in operations.
#[derive(Debug, Clone)]
struct Defaults {
    ssh_options: Vec<String>,
    env_vars: Vec<String>,
    prefix: String,
    timeout: Duration,
    transfer_timeout: Duration,
    noop_exit_code: i32,
}

impl Defaults {
    fn from_config(config: &Config) -> Self {
        Self {
            ssh_options: config.ssh_options.clone(),
            env_vars: config.env_vars.clone(),
            prefix: config.prefix.clone(),
            timeout: config.command_timeout(),
            transfer_timeout: config.transfer_timeout(),
            noop_exit_code: config.noop_transfer_exit_code,
        }
    }
}

/// A list argument, or `default` when the argument is absent.
fn list_or(args: &Args, name: &str, default: &[String]) -> Result<Vec<String>, ArgsError> {
    if args.contains(name) {
        args.string_list(name)
    } else {
        Ok(default.to_vec())
    }
}

fn target(args: &Args) -> Result<Target, ArgsError> {
    Ok(Target::parse(args.str("address")?))
}

/// Runs a command on a node (`RemoteCommand`).
///
/// Arguments: `address`, `command` (or `script`), and optionally
/// `ssh_options`, `env_vars`, `timeout`, `prefix`, `input_file`,
/// `output_file`, `input`, `ok_codes`.
#[derive(Debug, Clone)]
pub struct ExecOperation {
    defaults: Defaults,
}

impl ExecOperation {
    /// Operation name.
    pub const NAME: &'static str = "remote_exec";

    /// Creates the operation with defaults from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            defaults: Defaults::from_config(config),
        }
    }

    /// Builds the command described by `args`.
    pub fn command(&self, args: &Args) -> Result<RemoteCommand, ArgsError> {
        let script = args.opt_str("script")?;
        let command = match (args.opt_str("command")?, script) {
            (Some(command), _) => command,
            (None, Some(_)) => "",
            (None, None) => return Err(ArgsError::Missing("command".to_string())),
        };

        let mut cmd = RemoteCommand::new(target(args)?, command)
            .with_ssh_options(list_or(args, "ssh_options", &self.defaults.ssh_options)?)
            .with_env_vars(list_or(args, "env_vars", &self.defaults.env_vars)?)
            .with_timeout(args.opt_seconds("timeout")?.unwrap_or(self.defaults.timeout))
            .with_prefix(args.opt_str("prefix")?.unwrap_or(self.defaults.prefix.as_str()))
            .with_ok_codes(args.code_list("ok_codes")?);
        if let Some(script) = script {
            cmd = cmd.with_script(script);
        }
        if let Some(input_file) = args.opt_str("input_file")? {
            cmd = cmd.with_input_file(input_file);
        }
        if let Some(output_file) = args.opt_str("output_file")? {
            cmd = cmd.with_output_file(output_file);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl Operation for ExecOperation {
    type Output = ExecutionResult;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn call(&self, args: &Args) -> anyhow::Result<ExecutionResult> {
        let cmd = self.command(args)?;
        let input = args.opt_str("input")?;
        Ok(cmd.run(input.map(str::as_bytes)).await?)
    }
}

/// Mirrors files from a node with rsync.
///
/// Arguments: `address`, `files`, `dest_dir`, and optionally `ssh_options`
/// and `timeout`.
#[derive(Debug, Clone)]
pub struct PullOperation {
    defaults: Defaults,
}

impl PullOperation {
    /// Operation name.
    pub const NAME: &'static str = "rsync_pull";

    /// Creates the operation with defaults from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            defaults: Defaults::from_config(config),
        }
    }
}

#[async_trait]
impl Operation for PullOperation {
    type Output = ExecutionResult;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn call(&self, args: &Args) -> anyhow::Result<ExecutionResult> {
        let files = args.string_list("files")?;
        let pull = RsyncPull::new(target(args)?, PathBuf::from(args.str("dest_dir")?))
            .with_ssh_options(list_or(args, "ssh_options", &self.defaults.ssh_options)?)
            .with_timeout(args.opt_seconds("timeout")?.unwrap_or(self.defaults.timeout))
            .with_noop_exit_code(self.defaults.noop_exit_code);
        Ok(pull.run(&files).await?)
    }
}

/// Copies a file from a node with scp.
///
/// Arguments: `address`, `file`, `dest_dir`, and optionally `timeout` and
/// `recursive` (default `false`).
#[derive(Debug, Clone)]
pub struct GetOperation {
    defaults: Defaults,
}

impl GetOperation {
    /// Operation name.
    pub const NAME: &'static str = "scp_get";

    /// Creates the operation with defaults from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            defaults: Defaults::from_config(config),
        }
    }
}

#[async_trait]
impl Operation for GetOperation {
    type Output = ExecutionResult;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn call(&self, args: &Args) -> anyhow::Result<ExecutionResult> {
        let target = target(args)?;
        let dest_dir = PathBuf::from(args.str("dest_dir")?);
        let timeout = args.opt_seconds("timeout")?.unwrap_or(self.defaults.transfer_timeout);
        let recursive = args.opt_bool("recursive")?.unwrap_or(false);
        Ok(scp_get(&target, args.str("file")?, &dest_dir, timeout, recursive).await?)
    }
}

/// Copies a local file to a node with scp.
///
/// Arguments: `address`, `file`, `dest`, and optionally `timeout` and
/// `recursive` (default `true`).
#[derive(Debug, Clone)]
pub struct PutOperation {
    defaults: Defaults,
}

impl PutOperation {
    /// Operation name.
    pub const NAME: &'static str = "scp_put";

    /// Creates the operation with defaults from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            defaults: Defaults::from_config(config),
        }
    }
}

#[async_trait]
impl Operation for PutOperation {
    type Output = ExecutionResult;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn call(&self, args: &Args) -> anyhow::Result<ExecutionResult> {
        let target = target(args)?;
        let file = PathBuf::from(args.str("file")?);
        let timeout = args.opt_seconds("timeout")?.unwrap_or(self.defaults.transfer_timeout);
        let recursive = args.opt_bool("recursive")?.unwrap_or(true);
        Ok(scp_put(&target, &file, args.str("dest")?, timeout, recursive).await?)
    }
}

/// One work item per node, keyed by address, sharing `base` arguments.
pub fn node_items<T>(
    operation: Arc<dyn Operation<Output = T>>,
    nodes: &[String],
    base: &Args,
) -> Vec<WorkItem<T>> {
    nodes
        .iter()
        .map(|node| {
            let args = base.clone().with("address", Value::String(node.clone()));
            WorkItem::new(Arc::clone(&operation), args).with_key(node.clone())
        })
        .collect()
}
