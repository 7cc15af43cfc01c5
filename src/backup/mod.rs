pub(crate) mod locator;
mod logic;
pub(crate) mod poller;
pub(crate) mod requester;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{AppConfig, CpanelConfig};
use crate::errors::LocateError;
use crate::report::RunReport;
use crate::transfer::build_adapters;
use crate::utils::clock::{to_chrono, Clock, SystemClock};
use locator::{ArtifactLocator, LocateCriteria};
use requester::{ControlPanel, CpanelClient, UnavailablePanel};

pub use logic::Orchestrator;

/// How a requested job is identified on later status checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum JobRef {
    /// Id handed out by the control panel.
    Id(String),
    /// Fire-and-forget request; the request time is all there is.
    Anchor(DateTime<Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Requested,
    InProgress,
    Completed,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct BackupJob {
    pub reference: JobRef,
    pub requested_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Reason for `Failed` / `TimedOut`.
    pub failure: Option<String>,
}

impl BackupJob {
    /// Earliest time the job's output file can carry.
    pub fn anchor(&self) -> DateTime<Utc> {
        match self.reference {
            JobRef::Anchor(at) => at,
            JobRef::Id(_) => self.requested_at,
        }
    }
}

/// The backup file a completed job left in the search directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// SHA-256 hex, when checksumming is enabled.
    pub checksum: Option<String>,
}

impl Artifact {
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

pub fn locate_criteria(config: &AppConfig) -> LocateCriteria {
    LocateCriteria {
        search_dir: config.backup.search_dir.clone(),
        name_pattern: config.backup.artifact_pattern.clone(),
        clock_skew: config.backup.clock_skew,
    }
}

/// Public entry point for one full backup run against the configured cPanel account.
///
/// Only an unknown `--target` name is an error here. Setup problems of the panel client or
/// of single destinations end up in the returned report.
pub async fn run_backup_flow(config: &AppConfig, targets: &[String], cancel: &CancellationToken) -> Result<RunReport> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let adapters = build_adapters(config, targets, clock.clone())
        .await
        .context("Failed to set up destinations")?;

    let orchestrator = Orchestrator::new(config, control_panel(&config.cpanel), adapters, clock);
    Ok(orchestrator.run(cancel).await)
}

fn control_panel(config: &CpanelConfig) -> Arc<dyn ControlPanel> {
    match CpanelClient::new(config) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            warn!(error = %err, "Failed to set up the cPanel API client");
            Arc::new(UnavailablePanel::new(err.to_string()))
        }
    }
}

/// Runs only the locator, anchored one poll timeout in the past.
pub async fn locate_only(config: &AppConfig, cancel: &CancellationToken) -> Result<Artifact, LocateError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let anchor = clock.now() - to_chrono(config.backup.poll_timeout);
    let locator = ArtifactLocator::new(
        locate_criteria(config),
        std::time::Duration::ZERO,
        config.backup.poll_interval,
        clock,
    );
    locator.locate(anchor, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn anchor_prefers_explicit_anchor() {
        let requested = Utc.with_ymd_and_hms(2024, 8, 17, 17, 40, 0).unwrap();
        let earlier = requested - chrono::Duration::seconds(5);
        let mut job = BackupJob {
            reference: JobRef::Anchor(earlier),
            requested_at: requested,
            status: JobStatus::Requested,
            failure: None,
        };
        assert_eq!(job.anchor(), earlier);

        job.reference = JobRef::Id("123".into());
        assert_eq!(job.anchor(), requested);
    }

    #[test]
    fn artifact_file_name() {
        let artifact = Artifact {
            path: PathBuf::from("/home/acme/backup-8.17.2024_17-46-55_acme.tar.gz"),
            size_bytes: 1,
            created_at: Utc::now(),
            checksum: None,
        };
        assert_eq!(artifact.file_name(), Some("backup-8.17.2024_17-46-55_acme.tar.gz"));
    }
}
