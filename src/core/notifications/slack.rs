use super::{BackupEvent, NotificationChannel};
use crate::core::models::BatchResult;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

/// Per-device failure lines shown in a message before truncating.
const MAX_FAILURE_LINES: usize = 10;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, event: &BackupEvent) -> serde_json::Value {
        match event {
            BackupEvent::BatchCompleted { iteration, result } => {
                let title = if result.all_succeeded() {
                    "Router Backup Complete"
                } else {
                    "Router Backup Finished With Failures"
                };

                let mut blocks = vec![
                    json!({
                        "type": "header",
                        "text": {
                            "type": "plain_text",
                            "text": title,
                            "emoji": true
                        }
                    }),
                    json!({
                        "type": "section",
                        "fields": [
                            {
                                "type": "mrkdwn",
                                "text": format!("*Succeeded:*\n{}", result.success_count)
                            },
                            {
                                "type": "mrkdwn",
                                "text": format!("*Failed:*\n{}", result.failure_count)
                            },
                            {
                                "type": "mrkdwn",
                                "text": format!("*Run:*\n#{}", iteration)
                            }
                        ]
                    }),
                ];

                if !result.all_succeeded() {
                    blocks.push(json!({
                        "type": "section",
                        "text": {
                            "type": "mrkdwn",
                            "text": format!("*Failures:*\n```{}```", failure_lines(result))
                        }
                    }));
                }

                json!({ "blocks": blocks })
            }
            BackupEvent::BatchAborted { iteration, error } => json!({
                "blocks": [
                    {
                        "type": "header",
                        "text": {
                            "type": "plain_text",
                            "text": "Router Backup Aborted",
                            "emoji": true
                        }
                    },
                    {
                        "type": "section",
                        "text": {
                            "type": "mrkdwn",
                            "text": format!("*Run #{}:*\n```{}```", iteration, error)
                        }
                    }
                ]
            }),
        }
    }
}

fn failure_lines(result: &BatchResult) -> String {
    let mut lines: Vec<String> = result
        .failures()
        .take(MAX_FAILURE_LINES)
        .map(|o| {
            let reason = o
                .failure
                .as_ref()
                .map(|f| f.to_string())
                .unwrap_or_default();
            format!("{}: {}", o.device.display_name(), reason)
        })
        .collect();

    if result.failure_count > MAX_FAILURE_LINES {
        lines.push(format!(
            "... and {} more",
            result.failure_count - MAX_FAILURE_LINES
        ));
    }

    lines.join("\n")
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, event: BackupEvent) -> Result<()> {
        let payload = self.format_message(&event);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
