//! Remote session contract.
//!
//! The backup cycle only needs three capabilities from a router connection:
//! run a command to completion, open a file-transfer channel, and close. The
//! SSH implementation lives in `adapters::ssh`; `adapters::simulated` provides
//! an in-memory fleet for tests and dry runs.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::models::DeviceDescriptor;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("authentication rejected for {username}@{address}")]
    AuthRejected { username: String, address: String },

    #[error("host key rejected for {address}: {reason}")]
    HostKeyRejected { address: String, reason: String },

    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },

    #[error("channel error: {0}")]
    Channel(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("remote file {0} not found")]
    NotFound(String),

    #[error("transfer of {path} failed: {reason}")]
    Transport { path: String, reason: String },
}

/// Output of a remote command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Opens authenticated sessions to devices.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Connect and authenticate within `timeout`.
    async fn connect(
        &self,
        device: &DeviceDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, SessionError>;
}

/// One open, authenticated connection to a device.
#[async_trait]
pub trait RemoteSession: Send {
    /// Run `command` and wait for the remote side to report its exit status.
    async fn execute(&mut self, command: &str) -> Result<CommandOutput, SessionError>;

    /// Open a file-transfer sub-channel scoped to the caller.
    async fn open_transfer_channel(&mut self) -> Result<Box<dyn TransferChannel>, SessionError>;

    /// Release the connection. Safe to call more than once.
    async fn close(&mut self);
}

#[async_trait]
pub trait TransferChannel: Send {
    async fn exists(&mut self, remote_path: &str) -> Result<bool, FetchError>;

    /// Copy `remote_path` into `local_path`, returning the number of bytes written.
    async fn fetch(&mut self, remote_path: &str, local_path: &Path) -> Result<u64, FetchError>;

    async fn close(&mut self);
}
