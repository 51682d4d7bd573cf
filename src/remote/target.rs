//! Node addressing.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::command::RemoteCommand;
use crate::error::LaunchError;
use crate::launcher::ExecutionResult;

/// A node a command can run on.
///
/// Loopback addresses resolve to [`Target::Local`], which runs commands on
/// the controller itself without an ssh hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "address", rename_all = "snake_case")]
pub enum Target {
    /// The controller host.
    Local(String),
    /// A node reached over ssh.
    Remote(String),
}

impl Target {
    /// Classifies an address as local or remote.
    pub fn parse(address: impl Into<String>) -> Self {
        let address = address.into();
        if is_loopback(&address) {
            Target::Local(address)
        } else {
            Target::Remote(address)
        }
    }

    /// The address this target was created from.
    pub fn address(&self) -> &str {
        match self {
            Target::Local(address) | Target::Remote(address) => address,
        }
    }

    /// Whether commands run without an ssh hop.
    pub fn is_local(&self) -> bool {
        matches!(self, Target::Local(_))
    }

    /// Runs `command` on this target with default options.
    pub async fn run(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult, LaunchError> {
        RemoteCommand::new(self.clone(), command)
            .with_timeout(timeout)
            .run(None)
            .await
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.address())
    }
}

fn is_loopback(address: &str) -> bool {
    address == "localhost" || address == "::1" || address.starts_with("127.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_addresses_are_local() {
        assert!(Target::parse("localhost").is_local());
        assert!(Target::parse("127.0.0.1").is_local());
        assert!(Target::parse("127.1.2.3").is_local());
        assert!(Target::parse("::1").is_local());
    }

    #[test]
    fn test_other_addresses_are_remote() {
        assert!(!Target::parse("10.20.0.3").is_local());
        assert!(!Target::parse("node-1.example.com").is_local());
        assert!(!Target::parse("localhost.example.com").is_local());
        assert_eq!(Target::parse("10.20.0.3").address(), "10.20.0.3");
        assert_eq!(Target::parse("node-7").to_string(), "node-7");
    }
}
