//! One backup pass against one already-connected device.
//!
//! ```text
//! Connected -> IdentityResolved -> BackedUp -> TransferAttempted -+-> CleanedUp ------+-> Done
//!                                                                  +-> SkippedCleanup -+
//! ```
//!
//! Any fault ends the pass early and is folded into the returned
//! `CycleOutcome`; nothing escapes to the batch.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::models::{BackupName, CleanupStatus, CycleOutcome, DeviceDescriptor, FaultKind};
use super::session::{FetchError, RemoteSession, SessionError};
use super::steps::{self, ReadinessPolicy};

#[derive(Debug, Error)]
pub enum CycleFault {
    #[error("malformed identity: {0}")]
    IdentityParse(String),

    #[error(transparent)]
    Command(SessionError),

    #[error(transparent)]
    Transfer(FetchError),

    #[error("local destination error: {0}")]
    LocalIo(String),
}

impl CycleFault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::IdentityParse(_) => FaultKind::IdentityParse,
            Self::Command(_) => FaultKind::Command,
            Self::Transfer(FetchError::NotFound(_)) => FaultKind::TransferNotFound,
            Self::Transfer(FetchError::Transport { .. }) => FaultKind::TransferTransport,
            Self::LocalIo(_) => FaultKind::LocalIo,
        }
    }
}

/// Source of "today" for backup names.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Wall-clock date in the local timezone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStage {
    Connected,
    IdentityResolved,
    BackedUp,
    TransferAttempted,
    CleanedUp,
    SkippedCleanup,
    Done,
}

impl fmt::Display for CycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connected => "connected",
            Self::IdentityResolved => "identity_resolved",
            Self::BackedUp => "backed_up",
            Self::TransferAttempted => "transfer_attempted",
            Self::CleanedUp => "cleaned_up",
            Self::SkippedCleanup => "skipped_cleanup",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Clone)]
pub struct DeviceCycle {
    destination: PathBuf,
    readiness: ReadinessPolicy,
    clock: Arc<dyn Clock>,
}

impl DeviceCycle {
    pub fn new(destination: impl Into<PathBuf>, readiness: ReadinessPolicy) -> Self {
        Self::with_clock(destination, readiness, Arc::new(SystemClock))
    }

    pub fn with_clock(
        destination: impl Into<PathBuf>,
        readiness: ReadinessPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            destination: destination.into(),
            readiness,
            clock,
        }
    }

    pub fn destination(&self) -> &std::path::Path {
        &self.destination
    }

    /// Run the cycle to a terminal state. Always yields exactly one outcome.
    pub async fn run(
        &self,
        session: &mut dyn RemoteSession,
        device: &DeviceDescriptor,
    ) -> CycleOutcome {
        let mut backup_name = None;
        let mut stage = CycleStage::Connected;

        let result = self
            .drive(session, &mut stage, &mut backup_name)
            .await;

        let outcome = match result {
            Ok((name, bytes, cleanup)) => {
                CycleOutcome::succeeded(device.clone(), name, bytes, cleanup)
            }
            Err(fault) => {
                warn!(
                    stage = %stage,
                    kind = fault.kind().as_str(),
                    error = %fault,
                    "Device cycle failed"
                );
                CycleOutcome::failed(device.clone(), fault.kind(), fault.to_string(), backup_name)
            }
        };

        debug!(stage = %CycleStage::Done, succeeded = outcome.succeeded, "Device cycle done");
        outcome
    }

    async fn drive(
        &self,
        session: &mut dyn RemoteSession,
        stage: &mut CycleStage,
        backup_name: &mut Option<BackupName>,
    ) -> Result<(BackupName, u64, CleanupStatus), CycleFault> {
        let identity = steps::resolve_identity(session).await?;
        let name = BackupName::new(&identity, self.clock.today());
        info!(identity = %identity, backup = %name, "Router identity resolved");
        *backup_name = Some(name.clone());
        *stage = CycleStage::IdentityResolved;

        steps::create_backup(session, &name).await?;
        *stage = CycleStage::BackedUp;

        let transferred =
            steps::transfer_backup(session, &name, &self.destination, self.readiness).await;
        *stage = CycleStage::TransferAttempted;

        let bytes = match transferred {
            Ok(bytes) => bytes,
            Err(fault) => {
                *stage = CycleStage::SkippedCleanup;
                info!(backup = %name, "Transfer not confirmed, leaving remote backup in place");
                return Err(fault);
            }
        };

        let cleanup = match steps::delete_backup(session, &name).await {
            Ok(()) => CleanupStatus::Removed,
            Err(e) => {
                warn!(backup = %name, error = %e, "Failed to delete remote backup");
                CleanupStatus::Failed(e.to_string())
            }
        };
        *stage = CycleStage::CleanedUp;

        Ok((name, bytes, cleanup))
    }
}
