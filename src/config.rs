//! Layered configuration: defaults, TOML file, `RBKSD_*` environment, CLI flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::models::DeviceDescriptor;
use crate::core::steps::ReadinessPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rbksd/config.toml";
const ENV_PREFIX: &str = "RBKSD_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),

    #[error("backup_directory must not be empty")]
    EmptyBackupDirectory,

    #[error("notifications.channel is slack but notifications.slack_webhook is not set")]
    MissingWebhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backup_directory: PathBuf,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// Daemon period between batches.
    pub interval_secs: u64,
    pub simulation: bool,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
    pub notifications: NotificationConfig,
    pub devices: Vec<DeviceDescriptor>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backup_directory: PathBuf::from("/var/lib/rbksd/backups"),
            connect_timeout_secs: 10,
            command_timeout_secs: 120,
            interval_secs: 24 * 60 * 60,
            simulation: false,
            transfer: TransferConfig::default(),
            logging: LoggingConfig::default(),
            notifications: NotificationConfig::default(),
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessMode {
    /// Poll the device until the export exists (bounded by the grace delay)
    Poll,
    /// Sleep the full grace delay before fetching
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub readiness: ReadinessMode,
    pub grace_delay_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            readiness: ReadinessMode::Poll,
            grace_delay_secs: 10,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    pub verbose: bool,
    /// Optional log file; `{date}` expands to the start-up date.
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Slack,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub channel: NotificationChannelType,
    pub slack_webhook: Option<String>,
}

impl AppConfig {
    /// Load configuration, with `overrides` (usually CLI flags) taking precedence.
    ///
    /// A missing file at the default path is fine; an explicitly requested file
    /// that does not exist is an error.
    pub fn load<T: Serialize>(config_path: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let path = match config_path {
            Some(path) => {
                if !path.exists() {
                    bail!("Config file {} does not exist", path.display());
                }
                path.to_path_buf()
            }
            None => PathBuf::from(DEFAULT_CONFIG_PATH),
        };

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backup_directory.as_os_str().is_empty() {
            return Err(ConfigError::EmptyBackupDirectory);
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("connect_timeout_secs"));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::ZeroValue("command_timeout_secs"));
        }
        if self.interval_secs == 0 {
            return Err(ConfigError::ZeroValue("interval_secs"));
        }
        if self.transfer.readiness == ReadinessMode::Poll && self.transfer.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("transfer.poll_interval_ms"));
        }
        if self.notifications.channel == NotificationChannelType::Slack
            && self
                .notifications
                .slack_webhook
                .as_deref()
                .is_none_or(str::is_empty)
        {
            return Err(ConfigError::MissingWebhook);
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn readiness(&self) -> ReadinessPolicy {
        let grace = Duration::from_secs(self.transfer.grace_delay_secs);
        match self.transfer.readiness {
            ReadinessMode::Fixed => ReadinessPolicy::FixedDelay(grace),
            ReadinessMode::Poll => ReadinessPolicy::Poll {
                interval: Duration::from_millis(self.transfer.poll_interval_ms),
                timeout: grace,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
backup_directory = "/srv/router-backups"
connect_timeout_secs = 5

[transfer]
readiness = "fixed"
grace_delay_secs = 15

[[devices]]
host = "10.0.0.1"
username = "admin"
password = "secret"

[[devices]]
host = "10.0.0.2"
port = 2222
username = "backup"
password = "other"
name = "branch-office"
"#;

    #[test]
    fn defaults_match_reference_timings() {
        let config = AppConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.interval(), Duration::from_secs(86_400));
        assert_eq!(
            config.readiness(),
            ReadinessPolicy::Poll {
                interval: Duration::from_secs(1),
                timeout: Duration::from_secs(10),
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_devices_from_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = AppConfig::load(Some(&path), None::<&()>).unwrap();

        assert_eq!(config.backup_directory, PathBuf::from("/srv/router-backups"));
        assert_eq!(config.connect_timeout_secs, 5);
        assert_eq!(config.command_timeout_secs, 120);
        assert_eq!(
            config.readiness(),
            ReadinessPolicy::FixedDelay(Duration::from_secs(15))
        );
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].port, 22);
        assert_eq!(config.devices[0].password, "secret");
        assert_eq!(config.devices[1].port, 2222);
        assert_eq!(config.devices[1].display_name(), "branch-office");
    }

    #[test]
    fn overrides_take_precedence() {
        #[derive(Serialize)]
        struct Overrides {
            backup_directory: String,
            simulation: bool,
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let overrides = Overrides {
            backup_directory: "/tmp/elsewhere".into(),
            simulation: true,
        };
        let config = AppConfig::load(Some(&path), Some(&overrides)).unwrap();

        assert_eq!(config.backup_directory, PathBuf::from("/tmp/elsewhere"));
        assert!(config.simulation);
        assert_eq!(config.devices.len(), 2);
    }

    #[test]
    fn nested_overrides_are_validated() {
        #[derive(Serialize)]
        struct Transfer {
            readiness: ReadinessMode,
        }
        #[derive(Serialize)]
        struct Overrides {
            transfer: Transfer,
        }

        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[transfer]\nreadiness = \"fixed\"\ngrace_delay_secs = 15\npoll_interval_ms = 0\n",
        )
        .unwrap();

        let fixed = AppConfig::load(Some(&path), None::<&()>).unwrap();
        assert_eq!(fixed.transfer.readiness, ReadinessMode::Fixed);

        let overrides = Overrides {
            transfer: Transfer {
                readiness: ReadinessMode::Poll,
            },
        };
        let err = AppConfig::load(Some(&path), Some(&overrides)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::ZeroValue("transfer.poll_interval_ms"))
        );

        std::fs::write(
            &path,
            "[transfer]\nreadiness = \"fixed\"\ngrace_delay_secs = 15\n",
        )
        .unwrap();
        let config = AppConfig::load(Some(&path), Some(&overrides)).unwrap();
        assert_eq!(config.transfer.readiness, ReadinessMode::Poll);
        assert_eq!(config.transfer.grace_delay_secs, 15);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        let result = AppConfig::load(Some(&dir.path().join("nope.toml")), None::<&()>);
        assert!(result.is_err());
    }

    #[test]
    fn validation_rejects_zero_values() {
        let config = AppConfig {
            connect_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue("connect_timeout_secs"))
        );

        let config = AppConfig {
            interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroValue("interval_secs")));
    }

    #[test]
    fn slack_channel_needs_a_webhook() {
        let mut config = AppConfig::default();
        config.notifications.channel = NotificationChannelType::Slack;
        assert_eq!(config.validate(), Err(ConfigError::MissingWebhook));

        config.notifications.slack_webhook = Some("https://hooks.slack.com/services/x".into());
        assert!(config.validate().is_ok());
    }
}
