use std::sync::Arc;
use std::time::Duration;

use crate::core::models::DeviceDescriptor;
use crate::core::session::SessionConnector;

pub mod simulated;
mod ssh;

pub use simulated::{ConnectFailure, SimEvent, SimulatedConnector, SimulatedRouter};
pub use ssh::SshConnector;

/// Pick the session backend: the SSH connector, or a simulated fleet mirroring
/// the inventory when running in simulation mode.
pub fn get_connector(
    simulation: bool,
    devices: &[DeviceDescriptor],
    command_timeout: Duration,
) -> Arc<dyn SessionConnector> {
    if simulation {
        tracing::warn!("Simulation mode: no routers will be contacted");
        return Arc::new(SimulatedConnector::from_devices(devices));
    }

    Arc::new(SshConnector::new(command_timeout))
}
