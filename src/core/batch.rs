use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{Instrument, error, info, info_span};

use super::cycle::DeviceCycle;
use super::models::{BatchResult, CycleOutcome, DeviceDescriptor, FaultKind};
use super::session::SessionConnector;

/// Faults that stop a batch before any device is touched.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("device #{index} is invalid: {reason}")]
    InvalidDevice { index: usize, reason: String },

    #[error("backup destination {0} does not exist or is not a directory")]
    MissingDestination(String),
}

/// Runs one sequential pass over the inventory.
pub struct BatchRunner {
    connector: Arc<dyn SessionConnector>,
    cycle: DeviceCycle,
    connect_timeout: Duration,
}

impl BatchRunner {
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        cycle: DeviceCycle,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            cycle,
            connect_timeout,
        }
    }

    /// Back up every device in order. One device's failure never stops the rest.
    pub async fn run(&self, devices: &[DeviceDescriptor]) -> Result<BatchResult, BatchError> {
        validate_inventory(devices)?;

        let destination = self.cycle.destination();
        if !tokio::fs::metadata(destination)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(BatchError::MissingDestination(
                destination.display().to_string(),
            ));
        }

        info!(devices = devices.len(), "Starting backup batch");

        let mut result = BatchResult::new();
        for device in devices {
            let span = info_span!("device", host = %device.address());
            let outcome = self.process_device(device).instrument(span).await;
            result.record(outcome);
        }

        info!(
            succeeded = result.success_count,
            failed = result.failure_count,
            "Backup batch finished"
        );
        Ok(result)
    }

    async fn process_device(&self, device: &DeviceDescriptor) -> CycleOutcome {
        info!(username = %device.username, "Connecting");

        let mut session = match self.connector.connect(device, self.connect_timeout).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Connection error, skipping device");
                return CycleOutcome::failed(
                    device.clone(),
                    FaultKind::Connection,
                    e.to_string(),
                    None,
                );
            }
        };

        let outcome = self.cycle.run(session.as_mut(), device).await;
        session.close().await;
        info!("Session closed");

        outcome
    }
}

fn validate_inventory(devices: &[DeviceDescriptor]) -> Result<(), BatchError> {
    for (index, device) in devices.iter().enumerate() {
        let reason = if device.host.trim().is_empty() {
            Some("host is empty")
        } else if device.port == 0 {
            Some("port must be non-zero")
        } else if device.username.trim().is_empty() {
            Some("username is empty")
        } else {
            None
        };

        if let Some(reason) = reason {
            return Err(BatchError::InvalidDevice {
                index,
                reason: reason.to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_inventory_is_valid() {
        assert!(validate_inventory(&[]).is_ok());
    }

    #[test]
    fn reports_index_of_invalid_device() {
        let devices = vec![
            DeviceDescriptor::new("10.0.0.1", 22, "admin", "x"),
            DeviceDescriptor::new("10.0.0.2", 0, "admin", "x"),
        ];
        match validate_inventory(&devices) {
            Err(BatchError::InvalidDevice { index, reason }) => {
                assert_eq!(index, 1);
                assert!(reason.contains("port"));
            }
            other => panic!("expected InvalidDevice, got {:?}", other),
        }
    }

    #[test]
    fn blank_host_and_username_are_invalid() {
        let devices = vec![DeviceDescriptor::new("  ", 22, "admin", "x")];
        assert!(validate_inventory(&devices).is_err());

        let devices = vec![DeviceDescriptor::new("10.0.0.1", 22, "", "x")];
        assert!(validate_inventory(&devices).is_err());
    }
}
