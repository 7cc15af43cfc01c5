// panelbackup/src/report.rs
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::backup::{Artifact, JobStatus};
use crate::transfer::{TransferOutcome, TransferResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallOutcome {
    AllSucceeded,
    PartialSuccess,
    AllFailed,
}

impl OverallOutcome {
    /// `AllSucceeded` iff every result succeeded, `AllFailed` iff every result failed.
    ///
    /// An empty result set means nothing reached a destination and counts as `AllFailed`.
    pub fn aggregate(results: &[TransferResult]) -> Self {
        if results.is_empty() {
            return OverallOutcome::AllFailed;
        }
        if results.iter().all(TransferResult::succeeded) {
            OverallOutcome::AllSucceeded
        } else if results.iter().all(TransferResult::is_failed) {
            OverallOutcome::AllFailed
        } else {
            OverallOutcome::PartialSuccess
        }
    }

    pub fn exit_code(self) -> u8 {
        match self {
            OverallOutcome::AllSucceeded => 0,
            OverallOutcome::PartialSuccess => 2,
            OverallOutcome::AllFailed => 1,
        }
    }
}

/// Orchestrator states. `Fatal` absorbs every unrecoverable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Requesting,
    Polling,
    Locating,
    Transferring,
    Finalizing,
    Done,
    Fatal,
}

/// Why the run never reached (or never finished) the transfer stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatalError {
    pub stage: RunState,
    pub message: String,
}

/// The one terminal value of a run, handed to the notifiers.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_state: RunState,
    pub job_status: Option<JobStatus>,
    pub artifact: Option<Artifact>,
    pub transfers: Vec<TransferResult>,
    pub overall_outcome: OverallOutcome,
    pub artifact_retained: bool,
    pub fatal: Option<FatalError>,
    pub retention_warning: Option<String>,
}

impl RunReport {
    pub fn succeeded_destinations(&self) -> impl Iterator<Item = &str> {
        self.transfers
            .iter()
            .filter(|t| t.succeeded())
            .map(|t| t.destination.as_str())
    }

    pub fn failed_destinations(&self) -> impl Iterator<Item = &TransferResult> {
        self.transfers
            .iter()
            .filter(|t| matches!(t.outcome, TransferOutcome::Failed { .. }))
    }

    /// One-line human summary for logs and notifications.
    pub fn summary(&self) -> String {
        if let Some(fatal) = &self.fatal {
            return format!("Backup run failed during {:?}: {}", fatal.stage, fatal.message);
        }
        let succeeded: Vec<&str> = self.succeeded_destinations().collect();
        let failed: Vec<&str> = self.failed_destinations().map(|t| t.destination.as_str()).collect();
        format!(
            "Backup run {:?}: {} succeeded [{}], {} failed [{}], local copy {}",
            self.overall_outcome,
            succeeded.len(),
            succeeded.join(", "),
            failed.len(),
            failed.join(", "),
            if self.artifact_retained { "kept" } else { "deleted" }
        )
    }
}
