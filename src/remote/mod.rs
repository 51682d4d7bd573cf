//! Command lines for nodes: remote execution and file transfer.
//!
//! - **Target**: local/remote addressing with a uniform `run` capability
//! - **RemoteCommand**: the ssh (or local `bash -c`) invocation builder
//! - **transfer**: rsync pulls and scp get/put
//!
//! All builders return plain shell strings that are executed through
//! [`crate::launcher::launch`].

pub mod command;
pub mod target;
pub mod transfer;

use std::borrow::Cow;

pub use command::{RemoteCommand, DEFAULT_COMMAND_TIMEOUT};
pub use target::Target;
pub use transfer::{
    rsync_pull, rsync_pull_command, scp_get, scp_get_command, scp_put, scp_put_command, RsyncPull,
    DEFAULT_TRANSFER_TIMEOUT,
};

/// Quotes a word for POSIX shells. Safe words are returned unchanged.
pub(crate) fn quote(word: impl AsRef<str>) -> String {
    shell_escape::escape(Cow::Borrowed(word.as_ref())).into_owned()
}
