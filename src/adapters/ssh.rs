//! SSH/SFTP implementation of the session contract using `russh`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{HashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::models::DeviceDescriptor;
use crate::core::session::{
    CommandOutput, FetchError, RemoteSession, SessionConnector, SessionError, TransferChannel,
};

/// Connects to routers over SSH with password authentication.
pub struct SshConnector {
    command_timeout: Duration,
}

impl SshConnector {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(
        &self,
        device: &DeviceDescriptor,
        connect_timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, SessionError> {
        let address = device.address();
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(self.command_timeout),
            ..Default::default()
        });
        let handler = HostKeyCheck {
            address: address.clone(),
            pinned: device.host_key_fingerprint.clone(),
        };

        // Connect and authenticate share the one timeout budget.
        let handle = timeout(connect_timeout, async {
            let mut handle = client::connect(config, (device.host.as_str(), device.port), handler)
                .await
                .map_err(|e| match e {
                    russh::Error::UnknownKey => SessionError::HostKeyRejected {
                        address: address.clone(),
                        reason: "fingerprint does not match pinned key".to_string(),
                    },
                    other => SessionError::Connect {
                        address: address.clone(),
                        reason: other.to_string(),
                    },
                })?;

            let auth = handle
                .authenticate_password(device.username.clone(), device.password.clone())
                .await
                .map_err(|e| SessionError::Connect {
                    address: address.clone(),
                    reason: e.to_string(),
                })?;

            if !auth.success() {
                return Err(SessionError::AuthRejected {
                    username: device.username.clone(),
                    address: address.clone(),
                });
            }

            Ok::<_, SessionError>(handle)
        })
        .await
        .map_err(|_| SessionError::Timeout {
            address: address.clone(),
            timeout: connect_timeout,
        })??;

        info!(address = %address, "SSH session established");

        Ok(Box::new(SshSession {
            handle: Some(handle),
            address,
            command_timeout: self.command_timeout,
        }))
    }
}

struct HostKeyCheck {
    address: String,
    pinned: Option<String>,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();

        match &self.pinned {
            Some(expected) if *expected == fingerprint => {
                debug!(address = %self.address, "Host key matches pinned fingerprint");
                Ok(true)
            }
            Some(expected) => {
                warn!(
                    address = %self.address,
                    expected = %expected,
                    actual = %fingerprint,
                    "Host key mismatch, rejecting connection"
                );
                Ok(false)
            }
            None => {
                debug!(
                    address = %self.address,
                    fingerprint = %fingerprint,
                    "Accepting unpinned host key"
                );
                Ok(true)
            }
        }
    }
}

struct SshSession {
    handle: Option<Handle<HostKeyCheck>>,
    address: String,
    command_timeout: Duration,
}

impl SshSession {
    fn handle(&self) -> Result<&Handle<HostKeyCheck>, SessionError> {
        self.handle
            .as_ref()
            .ok_or_else(|| SessionError::Channel("session already closed".to_string()))
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn execute(&mut self, command: &str) -> Result<CommandOutput, SessionError> {
        let command_error = |reason: String| SessionError::Command {
            command: command.to_string(),
            reason,
        };

        let mut channel = self
            .handle()?
            .channel_open_session()
            .await
            .map_err(|e| command_error(format!("failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| command_error(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        // Drain until the server closes the channel; the exit status may
        // arrive before trailing output.
        loop {
            match timeout(self.command_timeout, channel.wait()).await {
                Ok(Some(ChannelMsg::Data { ref data })) => stdout.extend_from_slice(data),
                Ok(Some(ChannelMsg::ExtendedData { ref data, ext })) if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                Ok(Some(ChannelMsg::ExitStatus { exit_status: status })) => {
                    exit_status = Some(status)
                }
                Ok(Some(ChannelMsg::Close)) | Ok(None) => break,
                Ok(Some(_)) => {}
                Err(_) => {
                    let _ = channel.close().await;
                    return Err(command_error(format!(
                        "no completion within {:?}",
                        self.command_timeout
                    )));
                }
            }
        }

        let exit_status = exit_status
            .ok_or_else(|| command_error("channel closed before exit status".to_string()))?;

        debug!(
            address = %self.address,
            command = %command,
            exit_status,
            stdout_len = stdout.len(),
            "Command completed"
        );

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    async fn open_transfer_channel(&mut self) -> Result<Box<dyn TransferChannel>, SessionError> {
        let channel = self
            .handle()?
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Channel(format!("failed to open SFTP channel: {}", e)))?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SessionError::Channel(format!("SFTP subsystem refused: {}", e)))?;

        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SessionError::Channel(format!("SFTP handshake failed: {}", e)))?;

        Ok(Box::new(SftpChannel { sftp: Some(sftp) }))
    }

    async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
            {
                debug!(address = %self.address, error = %e, "Disconnect failed");
            }
        }
    }
}

struct SftpChannel {
    sftp: Option<SftpSession>,
}

impl SftpChannel {
    fn session(&self, path: &str) -> Result<&SftpSession, FetchError> {
        self.sftp.as_ref().ok_or_else(|| FetchError::Transport {
            path: path.to_string(),
            reason: "SFTP channel already closed".to_string(),
        })
    }
}

fn classify(path: &str, err: SftpError) -> FetchError {
    match err {
        SftpError::Status(status) if matches!(status.status_code, StatusCode::NoSuchFile) => {
            FetchError::NotFound(path.to_string())
        }
        other => FetchError::Transport {
            path: path.to_string(),
            reason: other.to_string(),
        },
    }
}

#[async_trait]
impl TransferChannel for SftpChannel {
    async fn exists(&mut self, remote_path: &str) -> Result<bool, FetchError> {
        self.session(remote_path)?
            .try_exists(remote_path)
            .await
            .map_err(|e| classify(remote_path, e))
    }

    async fn fetch(&mut self, remote_path: &str, local_path: &Path) -> Result<u64, FetchError> {
        let transport = |reason: String| FetchError::Transport {
            path: remote_path.to_string(),
            reason,
        };

        let mut remote = self
            .session(remote_path)?
            .open(remote_path)
            .await
            .map_err(|e| classify(remote_path, e))?;

        let mut local = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| transport(format!("cannot create {}: {}", local_path.display(), e)))?;

        let bytes = tokio::io::copy(&mut remote, &mut local)
            .await
            .map_err(|e| transport(e.to_string()))?;
        local.flush().await.map_err(|e| transport(e.to_string()))?;
        local.sync_all().await.map_err(|e| transport(e.to_string()))?;

        Ok(bytes)
    }

    async fn close(&mut self) {
        if let Some(sftp) = self.sftp.take() {
            if let Err(e) = sftp.close().await {
                debug!(error = %e, "SFTP close failed");
            }
        }
    }
}
