// panelbackup/src/notify/mod.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

use crate::report::{OverallOutcome, RunReport};

/// Consumer of the terminal run report.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, report: &RunReport) -> Result<()>;
}

/// Writes the report summary to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, report: &RunReport) -> Result<()> {
        let summary = report.summary();
        match (report.overall_outcome, &report.fatal) {
            (_, Some(_)) | (OverallOutcome::AllFailed, _) => error!(run_id = %report.run_id, "{}", summary),
            (OverallOutcome::PartialSuccess, _) => warn!(run_id = %report.run_id, "{}", summary),
            (OverallOutcome::AllSucceeded, _) => info!(run_id = %report.run_id, "{}", summary),
        }
        for failed in report.failed_destinations() {
            warn!(destination = %failed.destination, attempts = failed.attempts, outcome = ?failed.outcome, "Destination failed");
        }
        if let Some(warning) = &report.retention_warning {
            warn!(%warning, "Local cleanup incomplete");
        }
        Ok(())
    }
}

/// POSTs the report as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Url,
}

impl WebhookNotifier {
    pub fn new(url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client for webhook notifications")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, report: &RunReport) -> Result<()> {
        self.client
            .post(self.url.clone())
            .json(report)
            .send()
            .await
            .with_context(|| format!("Failed to reach webhook {}", self.url))?
            .error_for_status()
            .with_context(|| format!("Webhook {} rejected the report", self.url))?;
        info!(url = %self.url, "Run report delivered to webhook");
        Ok(())
    }
}

/// Hands the report to every notifier. Failures are logged and otherwise ignored.
pub async fn notify_all(notifiers: &[Box<dyn Notifier>], report: &RunReport) {
    for notifier in notifiers {
        if let Err(err) = notifier.notify(report).await {
            warn!(notifier = notifier.name(), error = %format!("{:#}", err), "Notification failed");
        }
    }
}
