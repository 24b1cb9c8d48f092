use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Date format used in backup file names (`DD-MM-YYYY`).
pub const BACKUP_DATE_FORMAT: &str = "%d-%m-%Y";

fn default_ssh_port() -> u16 {
    22
}

/// A router to back up, as supplied by the inventory.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: String,
    /// Optional friendly name used in reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Pinned SHA-256 host key fingerprint (`SHA256:...`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            name: None,
            host_key_fingerprint: None,
        }
    }

    /// `host:port`, used as the log/report key for the device.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.host)
    }
}

impl fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("name", &self.name)
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .finish()
    }
}

/// Name of the on-device export, reused as the local file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupName(String);

impl BackupName {
    /// `{identity}_{DD-MM-YYYY}.backup`
    pub fn new(identity: &str, date: NaiveDate) -> Self {
        Self(format!(
            "{}_{}.backup",
            identity,
            date.format(BACKUP_DATE_FORMAT)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the artifact in the device's root file namespace.
    pub fn remote_path(&self) -> String {
        format!("/{}", self.0)
    }
}

impl fmt::Display for BackupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Failure categories a device cycle can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Connection,
    IdentityParse,
    Command,
    TransferNotFound,
    TransferTransport,
    LocalIo,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::IdentityParse => "identity_parse",
            Self::Command => "command",
            Self::TransferNotFound => "transfer_not_found",
            Self::TransferTransport => "transfer_transport",
            Self::LocalIo => "local_io",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FaultKind,
    pub message: String,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind.as_str(), self.message)
    }
}

/// What happened to the remote copy after the transfer step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "snake_case")]
pub enum CleanupStatus {
    /// Transfer was never confirmed, so the remote file was left alone.
    Skipped,
    Removed,
    /// Remove command failed after a confirmed transfer. The local copy stands.
    Failed(String),
}

/// Result of one device cycle. Built once, never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub device: DeviceDescriptor,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_name: Option<BackupName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_transferred: Option<u64>,
    pub cleanup: CleanupStatus,
}

impl CycleOutcome {
    pub fn succeeded(
        device: DeviceDescriptor,
        backup_name: BackupName,
        bytes_transferred: u64,
        cleanup: CleanupStatus,
    ) -> Self {
        Self {
            device,
            succeeded: true,
            failure: None,
            backup_name: Some(backup_name),
            bytes_transferred: Some(bytes_transferred),
            cleanup,
        }
    }

    pub fn failed(
        device: DeviceDescriptor,
        kind: FaultKind,
        message: impl Into<String>,
        backup_name: Option<BackupName>,
    ) -> Self {
        Self {
            device,
            succeeded: false,
            failure: Some(FailureReason {
                kind,
                message: message.into(),
            }),
            backup_name,
            bytes_transferred: None,
            cleanup: CleanupStatus::Skipped,
        }
    }

    pub fn fault_kind(&self) -> Option<FaultKind> {
        self.failure.as_ref().map(|f| f.kind)
    }
}

/// Aggregated outcome of one pass over the inventory, in input order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub success_count: usize,
    pub failure_count: usize,
    pub details: Vec<CycleOutcome>,
}

impl BatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: CycleOutcome) {
        if outcome.succeeded {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        self.details.push(outcome);
    }

    pub fn total(&self) -> usize {
        self.details.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &CycleOutcome> {
        self.details.iter().filter(|o| !o.succeeded)
    }
}
