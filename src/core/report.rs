//! Rendering of batch results for humans and machines.

use std::fmt::Write;

use tracing::{info, warn};

use super::models::{BatchResult, CleanupStatus};

/// Plain-text report: one line per device, then the summary counts.
pub fn render_text(result: &BatchResult) -> String {
    let mut out = String::new();

    for outcome in &result.details {
        let device = outcome.device.display_name();
        let address = outcome.device.address();

        if outcome.succeeded {
            let name = outcome
                .backup_name
                .as_ref()
                .map(|n| n.to_string())
                .unwrap_or_default();
            let _ = write!(out, "  OK    {} ({}) -> {}", device, address, name);
            if let CleanupStatus::Failed(err) = &outcome.cleanup {
                let _ = write!(out, " [remote copy not removed: {}]", err);
            }
            out.push('\n');
        } else {
            let reason = outcome
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_default();
            let _ = writeln!(out, "  FAIL  {} ({}): {}", device, address, reason);
        }
    }

    let _ = writeln!(
        out,
        "{} routers were successfully backed up.",
        result.success_count
    );
    let _ = writeln!(
        out,
        "{} routers failed to be backed up.",
        result.failure_count
    );
    out
}

pub fn render_json(result: &BatchResult) -> serde_json::Result<String> {
    serde_json::to_string_pretty(result)
}

/// Emit the batch summary and each failure reason through tracing.
pub fn log_summary(result: &BatchResult) {
    for outcome in result.failures() {
        if let Some(failure) = &outcome.failure {
            warn!(
                host = %outcome.device.address(),
                kind = failure.kind.as_str(),
                reason = %failure.message,
                "Router backup failed"
            );
        }
    }

    info!(
        succeeded = result.success_count,
        failed = result.failure_count,
        "{} routers were successfully backed up, {} failed",
        result.success_count,
        result.failure_count
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{BackupName, CycleOutcome, DeviceDescriptor, FaultKind};
    use chrono::NaiveDate;

    fn sample() -> BatchResult {
        let mut result = BatchResult::new();
        result.record(CycleOutcome::succeeded(
            DeviceDescriptor::new("10.0.0.1", 22, "admin", "secret"),
            BackupName::new("RouterA", NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()),
            512,
            CleanupStatus::Failed("channel closed".into()),
        ));
        result.record(CycleOutcome::failed(
            DeviceDescriptor::new("10.0.0.2", 22, "admin", "secret"),
            FaultKind::TransferNotFound,
            "remote file /RouterB_01-01-2030.backup not found",
            None,
        ));
        result
    }

    #[test]
    fn text_report_has_counts_and_reasons() {
        let text = render_text(&sample());
        assert!(text.contains("OK    10.0.0.1 (10.0.0.1:22) -> RouterA_01-01-2030.backup"));
        assert!(text.contains("remote copy not removed: channel closed"));
        assert!(text.contains("FAIL  10.0.0.2 (10.0.0.2:22): [transfer_not_found]"));
        assert!(text.contains("1 routers were successfully backed up."));
        assert!(text.contains("1 routers failed to be backed up."));
    }

    #[test]
    fn json_report_is_machine_readable_and_has_no_passwords() {
        let json = render_json(&sample()).unwrap();
        assert!(!json.contains("secret"));

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["success_count"], 1);
        assert_eq!(value["failure_count"], 1);
        assert_eq!(value["details"][1]["failure"]["kind"], "transfer_not_found");
        assert_eq!(value["details"][0]["cleanup"]["state"], "failed");
    }
}
