//! Configuration for timmy.
//!
//! Settings come from an optional YAML file, then `TIMMY_*` environment
//! variables, then command-line flags. Every field has a default so an empty
//! file (or none at all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::{ResourceError, ABORT_EXIT_CODE, NOOP_TRANSFER_EXIT_CODE};
use crate::lock::{InstanceLock, DEFAULT_TOOL_NAME};
use crate::scheduler::BatchOptions;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Scheduling
    /// Maximum number of work items running at once.
    pub max_concurrency: usize,
    /// Exit code of a batch aborted by a worker fault.
    pub abort_exit_code: i32,
    /// Kill leftover descendant processes after an abort.
    pub reap_descendants: bool,

    // Remote execution
    /// Command timeout in seconds.
    pub timeout: f64,
    /// Transfer (rsync/scp) timeout in seconds.
    pub transfer_timeout: f64,
    /// Extra ssh options, e.g. `-oConnectTimeout=5`.
    pub ssh_options: Vec<String>,
    /// `NAME=value` assignments exported to every command.
    pub env_vars: Vec<String>,
    /// Prefix placed before every command.
    pub prefix: String,
    /// Exit code reported for an empty transfer file list.
    pub noop_transfer_exit_code: i32,

    // Locking
    /// Directory holding single-instance lock files.
    pub lock_dir: PathBuf,
    /// Tool name used in lock file names.
    pub tool_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // Scheduling defaults
            max_concurrency: 100,
            abort_exit_code: ABORT_EXIT_CODE,
            reap_descendants: true,

            // Remote execution defaults
            timeout: 15.0,
            transfer_timeout: 600.0,
            ssh_options: Vec::new(),
            env_vars: Vec::new(),
            prefix: String::new(),
            noop_transfer_exit_code: NOOP_TRANSFER_EXIT_CODE,

            // Locking defaults
            lock_dir: std::env::temp_dir(),
            tool_name: DEFAULT_TOOL_NAME.to_string(),
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a YAML configuration file.
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::ConfigIo` if the file cannot be read,
    /// `ResourceError::ConfigParse` if it is not valid YAML for this
    /// structure and `ResourceError::InvalidConfig` if a value is out of
    /// range.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ResourceError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ResourceError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content).map_err(|source| ResourceError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses YAML content. An empty document yields the defaults.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Applies `TIMMY_*` environment variable overrides.
    ///
    /// # Environment Variables
    ///
    /// - `TIMMY_MAX_CONCURRENCY`: concurrency cap
    /// - `TIMMY_TIMEOUT`: command timeout in seconds
    /// - `TIMMY_TRANSFER_TIMEOUT`: transfer timeout in seconds
    /// - `TIMMY_SSH_OPTIONS`: space-separated ssh options
    /// - `TIMMY_PREFIX`: command prefix
    /// - `TIMMY_LOCK_DIR`: lock directory
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::InvalidConfig` if a value cannot be parsed.
    pub fn apply_env(mut self) -> Result<Self, ResourceError> {
        if let Ok(val) = std::env::var("TIMMY_MAX_CONCURRENCY") {
            self.max_concurrency = parse_env_value(&val, "TIMMY_MAX_CONCURRENCY")?;
        }
        if let Ok(val) = std::env::var("TIMMY_TIMEOUT") {
            self.timeout = parse_env_value(&val, "TIMMY_TIMEOUT")?;
        }
        if let Ok(val) = std::env::var("TIMMY_TRANSFER_TIMEOUT") {
            self.transfer_timeout = parse_env_value(&val, "TIMMY_TRANSFER_TIMEOUT")?;
        }
        if let Ok(val) = std::env::var("TIMMY_SSH_OPTIONS") {
            self.ssh_options = val.split_whitespace().map(str::to_string).collect();
        }
        if let Ok(val) = std::env::var("TIMMY_PREFIX") {
            self.prefix = val;
        }
        if let Ok(val) = std::env::var("TIMMY_LOCK_DIR") {
            self.lock_dir = PathBuf::from(val);
        }
        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ResourceError::InvalidConfig` on the first invalid value.
    pub fn validate(&self) -> Result<(), ResourceError> {
        if self.max_concurrency == 0 || self.max_concurrency > Semaphore::MAX_PERMITS {
            return Err(ResourceError::InvalidConfig(format!(
                "max_concurrency must be between 1 and {}",
                Semaphore::MAX_PERMITS
            )));
        }
        for (name, secs) in [("timeout", self.timeout), ("transfer_timeout", self.transfer_timeout)] {
            if secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                return Err(ResourceError::InvalidConfig(format!(
                    "{name} must be a positive number of seconds that fits a duration"
                )));
            }
        }
        if self.tool_name.is_empty() {
            return Err(ResourceError::InvalidConfig(
                "tool_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Command timeout.
    ///
    /// Values `validate` would reject saturate instead of panicking.
    pub fn command_timeout(&self) -> Duration {
        saturating_seconds(self.timeout)
    }

    /// Transfer timeout.
    pub fn transfer_timeout(&self) -> Duration {
        saturating_seconds(self.transfer_timeout)
    }

    /// Batch options derived from this configuration.
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions::new(self.max_concurrency)
            .with_abort_exit_code(self.abort_exit_code)
            .with_reap_descendants(self.reap_descendants)
    }

    /// Lock factory derived from this configuration.
    pub fn instance_lock(&self) -> InstanceLock {
        InstanceLock::new(&self.lock_dir, &self.tool_name)
    }

    /// Sets the concurrency cap.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.as_secs_f64();
        self
    }

    /// Sets the transfer timeout.
    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout.as_secs_f64();
        self
    }

    /// Sets the ssh options.
    pub fn with_ssh_options(mut self, options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ssh_options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the lock directory.
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    /// Enables or disables reaping after an abort.
    pub fn with_reap_descendants(mut self, reap: bool) -> Self {
        self.reap_descendants = reap;
        self
    }
}

fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ResourceError> {
    value
        .trim()
        .parse()
        .map_err(|_| ResourceError::InvalidConfig(format!("Invalid value for {key}: {value}")))
}

fn saturating_seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 { Duration::MAX } else { Duration::ZERO })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_concurrency, 100);
        assert_eq!(config.command_timeout(), Duration::from_secs(15));
        assert_eq!(config.transfer_timeout(), Duration::from_secs(600));
        assert_eq!(config.abort_exit_code, 42);
        assert_eq!(config.noop_transfer_exit_code, 127);
        assert_eq!(config.tool_name, "timmy");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            "max_concurrency: 8\nssh_options: [\"-oConnectTimeout=2\"]\ntimeout: 2.5\n",
        )
        .unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.ssh_options, vec!["-oConnectTimeout=2"]);
        assert_eq!(config.command_timeout(), Duration::from_millis(2500));
        assert_eq!(config.abort_exit_code, ABORT_EXIT_CODE);
        assert_eq!(Config::from_yaml("  \n").unwrap(), Config::default());
    }

    #[test]
    fn test_load_errors() {
        let temp = TempDir::new().unwrap();

        let err = Config::load(temp.path().join("missing.yml")).unwrap_err();
        assert!(matches!(err, ResourceError::ConfigIo { .. }));
        assert_eq!(err.exit_code(), 1);

        let bad = temp.path().join("bad.yml");
        std::fs::write(&bad, "max_concurrency: [oops").unwrap();
        assert!(matches!(Config::load(&bad), Err(ResourceError::ConfigParse { .. })));

        let zero = temp.path().join("zero.yml");
        std::fs::write(&zero, "max_concurrency: 0\n").unwrap();
        assert!(matches!(Config::load(&zero), Err(ResourceError::InvalidConfig(_))));
    }

    #[test]
    fn test_load_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("timmy.yml");
        std::fs::write(&path, "prefix: nice -n 19\nabort_exit_code: 9\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.prefix, "nice -n 19");
        assert_eq!(config.batch_options().abort_exit_code, 9);
    }

    #[test]
    fn test_builder() {
        let config = Config::new()
            .with_max_concurrency(3)
            .with_timeout(Duration::from_secs(4))
            .with_transfer_timeout(Duration::from_secs(40))
            .with_ssh_options(["-q"])
            .with_lock_dir("/run/lock")
            .with_reap_descendants(false);

        assert_eq!(config.command_timeout(), Duration::from_secs(4));
        assert_eq!(config.transfer_timeout(), Duration::from_secs(40));
        assert_eq!(config.ssh_options, vec!["-q"]);
        let options = config.batch_options();
        assert_eq!(options.max_concurrency, 3);
        assert!(!options.reap_descendants);
        assert_eq!(
            config.instance_lock().lock_path("exec"),
            PathBuf::from("/run/lock/timmy_exec.lock")
        );
    }

    #[test]
    fn test_rejects_values_that_cannot_be_used() {
        let config = Config::from_yaml(&format!("max_concurrency: {}", usize::MAX)).unwrap();
        assert!(matches!(config.validate(), Err(ResourceError::InvalidConfig(_))));

        let config = Config::from_yaml("timeout: 1e300").unwrap();
        assert!(matches!(config.validate(), Err(ResourceError::InvalidConfig(_))));
        assert_eq!(config.command_timeout(), Duration::MAX);

        let config = Config::from_yaml("transfer_timeout: -5").unwrap();
        assert!(config.validate().is_err());
        assert_eq!(config.transfer_timeout(), Duration::ZERO);

        let config = Config::from_yaml(&format!("max_concurrency: {}", Semaphore::MAX_PERMITS)).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_env_value() {
        assert_eq!(parse_env_value::<usize>(" 12 ", "X").unwrap(), 12);
        assert!(parse_env_value::<usize>("many", "X").is_err());
    }
}
