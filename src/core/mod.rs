pub mod batch;
pub mod cycle;
pub mod models;
pub mod notifications;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod steps;

pub use batch::{BatchError, BatchRunner};
pub use cycle::{Clock, CycleFault, DeviceCycle, SystemClock};
pub use models::{
    BackupName, BatchResult, CleanupStatus, CycleOutcome, DeviceDescriptor, FailureReason,
    FaultKind,
};
pub use scheduler::Scheduler;
pub use session::{
    CommandOutput, FetchError, RemoteSession, SessionConnector, SessionError, TransferChannel,
};
pub use steps::ReadinessPolicy;
