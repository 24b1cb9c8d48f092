//! systemd registration for daemon mode.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

const SERVICE_NAME: &str = "rbksd";
const SERVICE_PATH: &str = "/etc/systemd/system/rbksd.service";

const SERVICE_TEMPLATE: &str = r#"[Unit]
Description=Router Backup Sentinel Daemon
Wants=network-online.target
After=network-online.target

[Service]
Type=simple
ExecStart={binary_path} --config {config_path} daemon
Restart=on-failure
RestartSec=30
KillSignal=SIGTERM
TimeoutStopSec=300

ProtectSystem=strict
PrivateTmp=true
ReadWritePaths={backup_dir} /var/log/rbksd

[Install]
WantedBy=multi-user.target
"#;

pub struct ServiceManager {
    service_path: PathBuf,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        Self {
            service_path: PathBuf::from(SERVICE_PATH),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.service_path.exists()
    }

    pub fn is_running(&self) -> Result<bool> {
        let output = Command::new("systemctl")
            .args(["is-active", SERVICE_NAME])
            .output()
            .context("Failed to check service status")?;

        Ok(output.status.success())
    }

    pub fn install(&self, config_path: &Path, backup_dir: &Path) -> Result<()> {
        let binary_path = std::env::current_exe().context("Failed to determine binary path")?;
        let unit = render_unit(&binary_path, config_path, backup_dir);

        std::fs::write(&self.service_path, unit).context("Failed to write service file")?;
        systemctl(&["daemon-reload"])?;
        systemctl(&["enable", SERVICE_NAME])?;
        systemctl(&["start", SERVICE_NAME])?;
        Ok(())
    }

    pub fn uninstall(&self) -> Result<()> {
        if self.is_running().unwrap_or(false) {
            systemctl(&["stop", SERVICE_NAME])?;
        }
        if self.is_installed() {
            systemctl(&["disable", SERVICE_NAME])?;
            std::fs::remove_file(&self.service_path).context("Failed to remove service file")?;
            systemctl(&["daemon-reload"])?;
        }
        Ok(())
    }
}

fn systemctl(args: &[&str]) -> Result<()> {
    let status = Command::new("systemctl")
        .args(args)
        .status()
        .with_context(|| format!("Failed to run systemctl {}", args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("systemctl {} failed", args.join(" "));
    }
    Ok(())
}

pub fn render_unit(binary_path: &Path, config_path: &Path, backup_dir: &Path) -> String {
    SERVICE_TEMPLATE
        .replace("{binary_path}", &binary_path.display().to_string())
        .replace("{config_path}", &config_path.display().to_string())
        .replace("{backup_dir}", &backup_dir.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_runs_daemon_with_config() {
        let unit = render_unit(
            Path::new("/usr/local/bin/rbksd"),
            Path::new("/etc/rbksd/config.toml"),
            Path::new("/srv/backups"),
        );
        assert!(unit.contains("ExecStart=/usr/local/bin/rbksd --config /etc/rbksd/config.toml daemon"));
        assert!(unit.contains("ReadWritePaths=/srv/backups /var/log/rbksd"));
        assert!(!unit.contains('{'));
    }
}
