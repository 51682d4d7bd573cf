//! CLI command definitions for timmy.
//!
//! Every batch subcommand builds one work item per node, runs them through
//! the scheduler and prints the results as JSON keyed by node.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::TimmyError;
use crate::launcher::ExecutionResult;
use crate::scheduler::{
    node_items, run_batch, Args, BatchOutput, ExecOperation, GetOperation, Operation,
    PullOperation, PutOperation,
};
use crate::utils::{dir_structure, ensure_dir};

/// Bounded-concurrency remote execution over ssh.
#[derive(Parser, Debug)]
#[command(name = "timmy")]
#[command(about = "Run commands and transfer files across many nodes at once")]
#[command(version)]
#[command(
    long_about = "timmy runs a command or a transfer on every listed node, at most --max-concurrency at a time.\n\nThe first failing operation aborts the whole batch (exit code 42 by default).\n\nExample usage:\n  timmy exec --nodes 10.0.0.1,10.0.0.2 --command uptime"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// YAML configuration file.
    #[arg(short, long, global = true, env = "TIMMY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run a command on every node.
    Exec(ExecArgs),

    /// Mirror files from every node with rsync.
    Pull(PullArgs),

    /// Copy a file from every node with scp.
    Get(GetArgs),

    /// Copy a local file to every node with scp.
    Put(PutArgs),

    /// Print the directory tree under DIR as JSON.
    Tree(TreeArgs),
}

/// Options shared by all batch subcommands.
#[derive(clap::Args, Debug, Clone)]
pub struct BatchArgs {
    /// Comma-separated node addresses.
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub nodes: Vec<String>,

    /// Maximum number of nodes handled at once.
    #[arg(short = 'j', long)]
    pub max_concurrency: Option<usize>,

    /// Per-node timeout in seconds.
    #[arg(short, long)]
    pub timeout: Option<f64>,

    /// Skip the run if another invocation of this subcommand holds the lock.
    #[arg(long)]
    pub lock: bool,
}

/// Arguments for `timmy exec`.
#[derive(Parser, Debug)]
pub struct ExecArgs {
    #[command(flatten)]
    pub batch: BatchArgs,

    /// Command to run.
    #[arg(long, required_unless_present = "script")]
    pub command: Option<String>,

    /// Local script streamed to `bash -s` on each node.
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Local file fed to the command's stdin.
    #[arg(long)]
    pub input_file: Option<PathBuf>,

    /// Exit codes that are not logged as failures.
    #[arg(long, value_delimiter = ',')]
    pub ok_codes: Vec<i32>,
}

/// Arguments for `timmy pull`.
#[derive(Parser, Debug)]
pub struct PullArgs {
    #[command(flatten)]
    pub batch: BatchArgs,

    /// Comma-separated absolute paths on the nodes.
    #[arg(short, long, value_delimiter = ',')]
    pub files: Vec<String>,

    /// Local directory; each node gets a subdirectory named after it.
    #[arg(short, long)]
    pub dest: PathBuf,
}

/// Arguments for `timmy get`.
#[derive(Parser, Debug)]
pub struct GetArgs {
    #[command(flatten)]
    pub batch: BatchArgs,

    /// Path on the nodes.
    #[arg(short, long)]
    pub file: String,

    /// Local directory; each node gets a subdirectory named after it.
    #[arg(short, long)]
    pub dest: PathBuf,

    /// Copy directories recursively.
    #[arg(short, long)]
    pub recursive: bool,
}

/// Arguments for `timmy put`.
#[derive(Parser, Debug)]
pub struct PutArgs {
    #[command(flatten)]
    pub batch: BatchArgs,

    /// Local file or directory.
    #[arg(short, long)]
    pub file: PathBuf,

    /// Destination path on the nodes.
    #[arg(short, long)]
    pub dest: String,

    /// Do not copy directories recursively.
    #[arg(long)]
    pub no_recursive: bool,
}

/// Arguments for `timmy tree`.
#[derive(Parser, Debug)]
pub struct TreeArgs {
    /// Root directory.
    pub dir: PathBuf,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> Result<(), TimmyError> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// # Errors
///
/// Returns the `TimmyError` whose `exit_code()` the process should exit
/// with.
pub async fn run_with_cli(cli: Cli) -> Result<(), TimmyError> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Exec(args) => run_exec_command(&config, args).await,
        Commands::Pull(args) => run_pull_command(&config, args).await,
        Commands::Get(args) => run_get_command(&config, args).await,
        Commands::Put(args) => run_put_command(&config, args).await,
        Commands::Tree(args) => {
            let tree = dir_structure(&args.dir)?;
            println!("{}", serde_json::to_string_pretty(&tree)?);
            Ok(())
        }
    }
}

/// Configuration file (if any), then environment overrides.
fn load_config(path: Option<&std::path::Path>) -> Result<Config, TimmyError> {
    let config = match path {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            Config::load(path)?
        }
        None => Config::default(),
    };
    Ok(config.apply_env()?)
}

// ============================================================================
// Batch Command Implementations
// ============================================================================

async fn run_exec_command(config: &Config, args: ExecArgs) -> Result<(), TimmyError> {
    let mut base = Args::new().with("ok_codes", args.ok_codes.clone());
    if let Some(command) = &args.command {
        base.insert("command", command.as_str());
    }
    if let Some(script) = &args.script {
        base.insert("script", script.to_string_lossy().into_owned());
    }
    if let Some(input_file) = &args.input_file {
        base.insert("input_file", input_file.to_string_lossy().into_owned());
    }
    let op = Arc::new(ExecOperation::from_config(config));
    run_on_nodes(config, &args.batch, "exec", op, base).await
}

async fn run_pull_command(config: &Config, args: PullArgs) -> Result<(), TimmyError> {
    for node in &args.batch.nodes {
        ensure_dir(args.dest.join(node))?;
    }
    let base = Args::new().with("files", args.files.clone());
    let op = Arc::new(PullOperation::from_config(config));
    let dest = args.dest.clone();
    run_on_nodes_with(config, &args.batch, "pull", op, base, |node, item_args| {
        item_args.insert("dest_dir", dest.join(node).to_string_lossy().into_owned());
    })
    .await
}

async fn run_get_command(config: &Config, args: GetArgs) -> Result<(), TimmyError> {
    let base = Args::new()
        .with("file", args.file.as_str())
        .with("recursive", args.recursive);
    let op = Arc::new(GetOperation::from_config(config));
    let dest = args.dest.clone();
    run_on_nodes_with(config, &args.batch, "get", op, base, |node, item_args| {
        item_args.insert("dest_dir", dest.join(node).to_string_lossy().into_owned());
    })
    .await
}

async fn run_put_command(config: &Config, args: PutArgs) -> Result<(), TimmyError> {
    let base = Args::new()
        .with("file", args.file.to_string_lossy().into_owned())
        .with("dest", args.dest.as_str())
        .with("recursive", !args.no_recursive);
    let op = Arc::new(PutOperation::from_config(config));
    run_on_nodes(config, &args.batch, "put", op, base).await
}

async fn run_on_nodes(
    config: &Config,
    batch: &BatchArgs,
    name: &str,
    op: Arc<dyn Operation<Output = ExecutionResult>>,
    base: Args,
) -> Result<(), TimmyError> {
    run_on_nodes_with(config, batch, name, op, base, |_, _| {}).await
}

/// Runs `op` on every node, optionally under the single-instance lock
/// named `name`, and prints the results.
async fn run_on_nodes_with(
    config: &Config,
    batch: &BatchArgs,
    name: &str,
    op: Arc<dyn Operation<Output = ExecutionResult>>,
    mut base: Args,
    per_node: impl Fn(&str, &mut Args),
) -> Result<(), TimmyError> {
    if let Some(timeout) = batch.timeout {
        base.insert("timeout", timeout);
    }
    let mut items = node_items(op, &batch.nodes, &base);
    for item in &mut items {
        if let Some(node) = item.key.clone() {
            per_node(&node, &mut item.args);
        }
    }

    let mut options = config.batch_options().keyed();
    if let Some(max_concurrency) = batch.max_concurrency {
        options.max_concurrency = max_concurrency;
    }

    let work = async move {
        let output = run_batch(items, &options).await?;
        report(&output)
    };

    if !batch.lock {
        return work.await;
    }
    let lock = config.instance_lock();
    match lock
        .with_lock_async(name, |guard| async move {
            let _guard = guard;
            work.await
        })
        .await?
    {
        Some(result) => result,
        None => Ok(()),
    }
}

fn report(output: &BatchOutput<ExecutionResult>) -> Result<(), TimmyError> {
    if let BatchOutput::Keyed(results) = output {
        let failed: Vec<&str> = results
            .iter()
            .filter(|(_, result)| !result.is_success())
            .map(|(node, _)| node.as_str())
            .collect();
        if failed.is_empty() {
            info!(nodes = results.len(), "All nodes succeeded");
        } else {
            warn!(failed = ?failed, "Some nodes returned a non-zero exit code");
        }
    }
    println!("{}", serde_json::to_string_pretty(output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_exec() {
        let cli = Cli::try_parse_from([
            "timmy", "exec", "--nodes", "n1,n2", "--command", "uptime", "-j", "4", "--lock",
        ])
        .unwrap();
        match cli.command {
            Commands::Exec(args) => {
                assert_eq!(args.batch.nodes, vec!["n1", "n2"]);
                assert_eq!(args.batch.max_concurrency, Some(4));
                assert!(args.batch.lock);
                assert_eq!(args.command.as_deref(), Some("uptime"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_exec_requires_command_or_script() {
        assert!(Cli::try_parse_from(["timmy", "exec", "--nodes", "n1"]).is_err());
        assert!(Cli::try_parse_from(["timmy", "exec", "--nodes", "n1", "--script", "x.sh"]).is_ok());
    }

    #[test]
    fn test_parse_put_defaults_to_recursive() {
        let cli = Cli::try_parse_from([
            "timmy", "put", "--nodes", "n1", "--file", "./tool", "--dest", "/opt",
        ])
        .unwrap();
        match cli.command {
            Commands::Put(args) => assert!(!args.no_recursive),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tree_missing_dir_exit_code() {
        let temp = tempfile::TempDir::new().unwrap();
        let cli = Cli::try_parse_from([
            "timmy".to_string(),
            "tree".to_string(),
            temp.path().join("absent").display().to_string(),
        ])
        .unwrap();
        let err = run_with_cli(cli).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_missing_config_file_exit_code() {
        let cli = Cli::try_parse_from(["timmy", "--config", "/nonexistent/timmy.yml", "tree", "."]).unwrap();
        let err = run_with_cli(cli).await.unwrap_err();
        assert!(matches!(err, TimmyError::Resource(_)));
        assert_eq!(err.exit_code(), 1);
    }
}
