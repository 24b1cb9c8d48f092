use std::sync::Arc;

use crate::adapters;
use crate::config::AppConfig;
use crate::core::notifications::{self, NotificationChannel};
use crate::core::{BatchRunner, DeviceCycle, Scheduler, SessionConnector};

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub connector: Arc<dyn SessionConnector>,
    pub notifier: Option<Arc<dyn NotificationChannel>>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let connector = adapters::get_connector(
            config.simulation,
            &config.devices,
            config.command_timeout(),
        );
        let notifier = notifications::create_notifier(&config.notifications);
        Self {
            config: Arc::new(config),
            connector,
            notifier,
        }
    }

    pub fn with_connector(config: AppConfig, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            notifier: None,
        }
    }

    pub fn batch_runner(&self) -> BatchRunner {
        let cycle = DeviceCycle::new(&self.config.backup_directory, self.config.readiness());
        BatchRunner::new(
            self.connector.clone(),
            cycle,
            self.config.connect_timeout(),
        )
    }

    pub fn scheduler(&self) -> Scheduler {
        let scheduler = Scheduler::new(
            Arc::new(self.batch_runner()),
            self.config.devices.clone(),
            self.config.interval(),
        );
        match &self.notifier {
            Some(notifier) => scheduler.with_notifier(notifier.clone()),
            None => scheduler,
        }
    }
}
