//! The individual remote operations of a device cycle.
//!
//! Commands are RouterOS CLI syntax. Each step blocks until the device has
//! reported completion of the command it issued.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use super::cycle::CycleFault;
use super::models::BackupName;
use super::session::{FetchError, RemoteSession, SessionError, TransferChannel};

pub const IDENTITY_COMMAND: &str = "/system identity print";

pub fn backup_command(name: &BackupName) -> String {
    format!("/system backup save name={}", name)
}

pub fn remove_command(name: &BackupName) -> String {
    format!("/file remove {}", name)
}

/// How the transfer step waits for the exported file to show up on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessPolicy {
    /// Sleep a fixed amount, then fetch regardless.
    FixedDelay(Duration),
    /// Check for the remote file every `interval` until it exists or `timeout` elapses.
    Poll { interval: Duration, timeout: Duration },
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::Poll {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Extract the identity from `/system identity print` output (`name: RouterA`).
///
/// Only the first line is considered and the value is whatever sits between the
/// first and second colon. Anything else is an identity parse fault.
pub fn parse_identity(output: &str) -> Result<String, CycleFault> {
    let first_line = output.trim().lines().next().unwrap_or_default();

    let identity = first_line
        .split(':')
        .nth(1)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            CycleFault::IdentityParse(format!("unexpected identity output {:?}", first_line))
        })?;

    if identity.contains(['/', '\\']) {
        return Err(CycleFault::IdentityParse(format!(
            "identity {:?} contains a path separator",
            identity
        )));
    }

    Ok(identity.to_string())
}

pub async fn resolve_identity(session: &mut dyn RemoteSession) -> Result<String, CycleFault> {
    let output = session
        .execute(IDENTITY_COMMAND)
        .await
        .map_err(CycleFault::Command)?;
    parse_identity(&output.stdout)
}

/// Issue the backup export and wait for the command to finish.
pub async fn create_backup(
    session: &mut dyn RemoteSession,
    name: &BackupName,
) -> Result<(), CycleFault> {
    info!(backup = %name, "Creating backup");

    let output = session
        .execute(&backup_command(name))
        .await
        .map_err(CycleFault::Command)?;

    // Completion is the signal; a non-zero status is only worth a warning here.
    if !output.success() {
        warn!(
            backup = %name,
            exit_status = output.exit_status,
            stderr = %output.stderr.trim(),
            "Backup command reported a non-zero exit status"
        );
    }

    info!(backup = %name, "Configuration backup saved");
    Ok(())
}

/// Fetch `/<name>` into `destination/<name>`, returning the bytes written.
///
/// The file is written under a `.part` name and renamed once complete, so the
/// final path only exists after a confirmed transfer.
pub async fn transfer_backup(
    session: &mut dyn RemoteSession,
    name: &BackupName,
    destination: &Path,
    readiness: ReadinessPolicy,
) -> Result<u64, CycleFault> {
    let remote_path = name.remote_path();
    let local_path = destination.join(name.as_str());
    let partial_path = partial_path_for(&local_path);

    info!(
        backup = %name,
        destination = %local_path.display(),
        "Downloading backup"
    );

    let mut channel = session.open_transfer_channel().await.map_err(|e| {
        CycleFault::Transfer(FetchError::Transport {
            path: remote_path.clone(),
            reason: e.to_string(),
        })
    })?;

    let fetched = fetch_when_ready(channel.as_mut(), &remote_path, &partial_path, readiness).await;
    channel.close().await;

    let bytes = match fetched {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial_path).await;
            return Err(CycleFault::Transfer(e));
        }
    };

    if let Err(e) = tokio::fs::rename(&partial_path, &local_path).await {
        let _ = tokio::fs::remove_file(&partial_path).await;
        return Err(CycleFault::LocalIo(format!(
            "failed to move {} into place: {}",
            partial_path.display(),
            e
        )));
    }

    tokio::fs::metadata(&local_path).await.map_err(|e| {
        CycleFault::LocalIo(format!("{} missing after transfer: {}", local_path.display(), e))
    })?;

    info!(
        backup = %name,
        bytes,
        destination = %local_path.display(),
        "Backup transferred"
    );
    Ok(bytes)
}

/// Remove the remote copy. Only called after a confirmed transfer.
pub async fn delete_backup(
    session: &mut dyn RemoteSession,
    name: &BackupName,
) -> Result<(), SessionError> {
    info!(backup = %name, "Deleting backup from the router");

    let output = session.execute(&remove_command(name)).await?;
    if !output.success() {
        warn!(
            backup = %name,
            exit_status = output.exit_status,
            "Remove command reported a non-zero exit status"
        );
    }

    info!(backup = %name, "Backup deleted from the router");
    Ok(())
}

fn partial_path_for(local_path: &Path) -> PathBuf {
    let mut name = local_path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn fetch_when_ready(
    channel: &mut dyn TransferChannel,
    remote_path: &str,
    local_path: &Path,
    readiness: ReadinessPolicy,
) -> Result<u64, FetchError> {
    wait_for_artifact(channel, remote_path, readiness).await?;
    debug!(remote = %remote_path, local = %local_path.display(), "Fetching remote file");
    channel.fetch(remote_path, local_path).await
}

async fn wait_for_artifact(
    channel: &mut dyn TransferChannel,
    remote_path: &str,
    readiness: ReadinessPolicy,
) -> Result<(), FetchError> {
    match readiness {
        ReadinessPolicy::FixedDelay(delay) => {
            debug!(delay_ms = delay.as_millis() as u64, "Waiting for export to settle");
            sleep(delay).await;
            Ok(())
        }
        ReadinessPolicy::Poll { interval, timeout } => {
            let deadline = Instant::now() + timeout;
            let mut attempts = 0u32;

            loop {
                attempts += 1;
                if channel.exists(remote_path).await? {
                    debug!(remote = %remote_path, attempts, "Remote backup is available");
                    return Ok(());
                }

                let now = Instant::now();
                if now >= deadline {
                    warn!(
                        remote = %remote_path,
                        attempts,
                        timeout_ms = timeout.as_millis() as u64,
                        "Remote backup did not appear in time"
                    );
                    return Err(FetchError::NotFound(remote_path.to_string()));
                }

                sleep(interval.min(deadline - now)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_routeros_identity_output() {
        assert_eq!(parse_identity("  name: RouterA\r\n").unwrap(), "RouterA");
        assert_eq!(parse_identity("name: core rtr 1\n").unwrap(), "core rtr 1");
    }

    #[test]
    fn only_the_first_line_counts() {
        let out = "name: edge-01\nsomething: else\n";
        assert_eq!(parse_identity(out).unwrap(), "edge-01");
    }

    #[test]
    fn rejects_output_without_colon() {
        let err = parse_identity("RouterA").unwrap_err();
        assert!(matches!(err, CycleFault::IdentityParse(_)));
    }

    #[test]
    fn rejects_empty_output_and_blank_value() {
        assert!(matches!(
            parse_identity(""),
            Err(CycleFault::IdentityParse(_))
        ));
        assert!(matches!(
            parse_identity("name:   \n"),
            Err(CycleFault::IdentityParse(_))
        ));
    }

    #[test]
    fn rejects_identity_with_path_separator() {
        assert!(matches!(
            parse_identity("name: ../etc"),
            Err(CycleFault::IdentityParse(_))
        ));
    }

    #[test]
    fn commands_embed_the_backup_name() {
        let name = BackupName::new(
            "RouterA",
            chrono::NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
        );
        assert_eq!(
            backup_command(&name),
            "/system backup save name=RouterA_01-01-2030.backup"
        );
        assert_eq!(remove_command(&name), "/file remove RouterA_01-01-2030.backup");
    }

    #[test]
    fn partial_path_appends_suffix() {
        let p = partial_path_for(Path::new("/backups/a_01-01-2030.backup"));
        assert_eq!(p, PathBuf::from("/backups/a_01-01-2030.backup.part"));
    }
}
