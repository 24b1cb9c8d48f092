//! In-memory router fleet implementing the session contract.
//!
//! Each simulated router keeps a tiny file namespace and a scripted set of
//! failure modes. Every interaction is appended to a shared journal so callers
//! can assert on exactly which remote operations happened and in what order.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::core::models::DeviceDescriptor;
use crate::core::session::{
    CommandOutput, FetchError, RemoteSession, SessionConnector, SessionError, TransferChannel,
};
use crate::core::steps::IDENTITY_COMMAND;

const BACKUP_PREFIX: &str = "/system backup save name=";
const REMOVE_PREFIX: &str = "/file remove ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Timeout,
    AuthRejected,
    Refused,
}

/// Behaviour script for one simulated router.
#[derive(Debug, Clone)]
pub struct SimulatedRouter {
    pub identity_output: String,
    pub connect_failure: Option<ConnectFailure>,
    /// Existence checks that miss before a fresh export becomes visible.
    pub export_delay_polls: u32,
    pub export_never_appears: bool,
    pub drop_during_backup: bool,
    pub fetch_failure: Option<String>,
    pub remove_failure: Option<String>,
    pub payload: Vec<u8>,
}

impl SimulatedRouter {
    pub fn new(identity: &str) -> Self {
        Self {
            identity_output: format!("  name: {}\r\n", identity),
            connect_failure: None,
            export_delay_polls: 0,
            export_never_appears: false,
            drop_during_backup: false,
            fetch_failure: None,
            remove_failure: None,
            payload: format!("# simulated RouterOS backup of {}\n", identity).into_bytes(),
        }
    }

    pub fn with_identity_output(mut self, output: impl Into<String>) -> Self {
        self.identity_output = output.into();
        self
    }

    pub fn with_connect_failure(mut self, failure: ConnectFailure) -> Self {
        self.connect_failure = Some(failure);
        self
    }

    pub fn with_export_delay(mut self, polls: u32) -> Self {
        self.export_delay_polls = polls;
        self
    }

    pub fn with_missing_export(mut self) -> Self {
        self.export_never_appears = true;
        self
    }

    pub fn with_drop_during_backup(mut self) -> Self {
        self.drop_during_backup = true;
        self
    }

    pub fn with_fetch_failure(mut self, reason: impl Into<String>) -> Self {
        self.fetch_failure = Some(reason.into());
        self
    }

    pub fn with_remove_failure(mut self, reason: impl Into<String>) -> Self {
        self.remove_failure = Some(reason.into());
        self
    }
}

/// Something that happened on the simulated fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    ConnectAttempt { address: String },
    Connected { address: String },
    Executed { address: String, command: String },
    TransferOpened { address: String },
    ExistsChecked { address: String, path: String },
    Fetched { address: String, path: String },
    TransferClosed { address: String },
    Closed { address: String },
}

struct RouterState {
    script: SimulatedRouter,
    files: HashMap<String, Vec<u8>>,
    pending_export: Option<(String, u32)>,
}

impl RouterState {
    /// Advance a pending export by one observation.
    fn observe_pending(&mut self) {
        if self.script.export_never_appears {
            return;
        }
        if let Some((path, remaining)) = self.pending_export.take() {
            if remaining == 0 {
                self.files.insert(path, self.script.payload.clone());
            } else {
                self.pending_export = Some((path, remaining - 1));
            }
        }
    }
}

#[derive(Default)]
struct FleetState {
    routers: HashMap<String, RouterState>,
    journal: Vec<SimEvent>,
}

/// Simulated fleet; clones share the same state.
#[derive(Clone, Default)]
pub struct SimulatedConnector {
    inner: Arc<Mutex<FleetState>>,
}

impl SimulatedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A well-behaved router for every device, named after the device.
    pub fn from_devices(devices: &[DeviceDescriptor]) -> Self {
        let connector = Self::new();
        for device in devices {
            let identity = device.display_name().replace(['/', '\\', ':'], "-");
            connector.add_router(device, SimulatedRouter::new(&identity));
        }
        connector
    }

    pub fn add_router(&self, device: &DeviceDescriptor, script: SimulatedRouter) {
        self.state().routers.insert(
            device.address(),
            RouterState {
                script,
                files: HashMap::new(),
                pending_export: None,
            },
        );
    }

    pub fn journal(&self) -> Vec<SimEvent> {
        self.state().journal.clone()
    }

    /// Commands executed against `device`, in order.
    pub fn commands_for(&self, device: &DeviceDescriptor) -> Vec<String> {
        let address = device.address();
        self.state()
            .journal
            .iter()
            .filter_map(|e| match e {
                SimEvent::Executed { address: a, command } if *a == address => {
                    Some(command.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Files currently present on the router's file namespace.
    pub fn remote_files(&self, device: &DeviceDescriptor) -> Vec<String> {
        let mut files: Vec<String> = self
            .state()
            .routers
            .get(&device.address())
            .map(|r| r.files.keys().cloned().collect())
            .unwrap_or_default();
        files.sort();
        files
    }

    /// Sessions opened but not yet closed.
    pub fn open_sessions(&self) -> usize {
        let state = self.state();
        let opened = count(&state.journal, |e| matches!(e, SimEvent::Connected { .. }));
        let closed = count(&state.journal, |e| matches!(e, SimEvent::Closed { .. }));
        opened - closed
    }

    fn state(&self) -> MutexGuard<'_, FleetState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn count(journal: &[SimEvent], pred: impl Fn(&SimEvent) -> bool) -> usize {
    journal.iter().filter(|e| pred(e)).count()
}

#[async_trait]
impl SessionConnector for SimulatedConnector {
    async fn connect(
        &self,
        device: &DeviceDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, SessionError> {
        let address = device.address();
        let mut state = self.state();
        state.journal.push(SimEvent::ConnectAttempt {
            address: address.clone(),
        });

        let failure = match state.routers.get(&address) {
            Some(router) => router.script.connect_failure,
            None => Some(ConnectFailure::Refused),
        };

        match failure {
            Some(ConnectFailure::Timeout) => Err(SessionError::Timeout { address, timeout }),
            Some(ConnectFailure::AuthRejected) => Err(SessionError::AuthRejected {
                username: device.username.clone(),
                address,
            }),
            Some(ConnectFailure::Refused) => Err(SessionError::Connect {
                address,
                reason: "connection refused".to_string(),
            }),
            None => {
                state.journal.push(SimEvent::Connected {
                    address: address.clone(),
                });
                debug!(address = %address, "(Simulator) Session opened");
                Ok(Box::new(SimulatedSession {
                    fleet: self.clone(),
                    address,
                    closed: false,
                }))
            }
        }
    }
}

struct SimulatedSession {
    fleet: SimulatedConnector,
    address: String,
    closed: bool,
}

impl SimulatedSession {
    fn run_command(&self, command: &str) -> Result<CommandOutput, SessionError> {
        let mut state = self.fleet.state();
        state.journal.push(SimEvent::Executed {
            address: self.address.clone(),
            command: command.to_string(),
        });

        let router = state
            .routers
            .get_mut(&self.address)
            .ok_or_else(|| SessionError::Channel("router vanished".to_string()))?;

        if command == IDENTITY_COMMAND {
            return Ok(CommandOutput {
                stdout: router.script.identity_output.clone(),
                ..Default::default()
            });
        }

        if let Some(name) = command.strip_prefix(BACKUP_PREFIX) {
            if router.script.drop_during_backup {
                return Err(SessionError::Command {
                    command: command.to_string(),
                    reason: "connection dropped before exit status".to_string(),
                });
            }
            router.pending_export = Some((format!("/{}", name), router.script.export_delay_polls));
            router.observe_pending();
            return Ok(CommandOutput::default());
        }

        if let Some(name) = command.strip_prefix(REMOVE_PREFIX) {
            if let Some(reason) = &router.script.remove_failure {
                return Err(SessionError::Command {
                    command: command.to_string(),
                    reason: reason.clone(),
                });
            }
            router.files.remove(&format!("/{}", name));
            return Ok(CommandOutput::default());
        }

        Ok(CommandOutput {
            stderr: "bad command name".to_string(),
            exit_status: 1,
            ..Default::default()
        })
    }
}

#[async_trait]
impl RemoteSession for SimulatedSession {
    async fn execute(&mut self, command: &str) -> Result<CommandOutput, SessionError> {
        if self.closed {
            return Err(SessionError::Channel("session closed".to_string()));
        }
        self.run_command(command)
    }

    async fn open_transfer_channel(&mut self) -> Result<Box<dyn TransferChannel>, SessionError> {
        if self.closed {
            return Err(SessionError::Channel("session closed".to_string()));
        }
        self.fleet.state().journal.push(SimEvent::TransferOpened {
            address: self.address.clone(),
        });
        Ok(Box::new(SimulatedChannel {
            fleet: self.fleet.clone(),
            address: self.address.clone(),
        }))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.fleet.state().journal.push(SimEvent::Closed {
            address: self.address.clone(),
        });
    }
}

struct SimulatedChannel {
    fleet: SimulatedConnector,
    address: String,
}

#[async_trait]
impl TransferChannel for SimulatedChannel {
    async fn exists(&mut self, remote_path: &str) -> Result<bool, FetchError> {
        let mut state = self.fleet.state();
        state.journal.push(SimEvent::ExistsChecked {
            address: self.address.clone(),
            path: remote_path.to_string(),
        });
        let router = state
            .routers
            .get_mut(&self.address)
            .ok_or_else(|| FetchError::Transport {
                path: remote_path.to_string(),
                reason: "router vanished".to_string(),
            })?;
        let present = router.files.contains_key(remote_path);
        if !present {
            router.observe_pending();
        }
        Ok(present)
    }

    async fn fetch(&mut self, remote_path: &str, local_path: &Path) -> Result<u64, FetchError> {
        let payload = {
            let mut state = self.fleet.state();
            state.journal.push(SimEvent::Fetched {
                address: self.address.clone(),
                path: remote_path.to_string(),
            });
            let router = state
                .routers
                .get(&self.address)
                .ok_or_else(|| FetchError::NotFound(remote_path.to_string()))?;

            if let Some(reason) = &router.script.fetch_failure {
                return Err(FetchError::Transport {
                    path: remote_path.to_string(),
                    reason: reason.clone(),
                });
            }
            router
                .files
                .get(remote_path)
                .cloned()
                .ok_or_else(|| FetchError::NotFound(remote_path.to_string()))?
        };

        tokio::fs::write(local_path, &payload)
            .await
            .map_err(|e| FetchError::Transport {
                path: remote_path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(payload.len() as u64)
    }

    async fn close(&mut self) {
        self.fleet.state().journal.push(SimEvent::TransferClosed {
            address: self.address.clone(),
        });
    }
}
