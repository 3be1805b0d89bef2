//! Child-process transport.
//!
//! The parent spawns the child with piped stdin/stdout and wraps the pipes
//! in a [`StreamChannel`]. The child side uses [`StreamChannel::stdio`].
//!
//! # Example
//!
//! ```ignore
//! use event_invoke::transport::fork;
//! use tokio::process::Command;
//!
//! let (channel, child) = fork(&mut Command::new("./worker"))?;
//! ```

use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};

use super::StreamChannel;
use crate::error::{Result, RpcError};

/// Spawn `command` and return a channel over its stdin/stdout.
///
/// The child is killed when the returned [`Child`] is dropped. Its stderr is
/// inherited so its logs stay visible.
pub fn fork(command: &mut Command) -> Result<(Arc<StreamChannel>, Child)> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| RpcError::Protocol("child stdin was not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RpcError::Protocol("child stdout was not captured".into()))?;

    tracing::debug!(pid = ?child.id(), "forked child process");

    Ok((StreamChannel::new(stdout, stdin), child))
}
