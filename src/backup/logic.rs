use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::locator::ArtifactLocator;
use super::poller::{BackupPoller, PollSettings, SettleProbe};
use super::requester::{BackupRequester, ControlPanel};
use super::{locate_criteria, Artifact, BackupJob, JobStatus};
use crate::config::AppConfig;
use crate::errors::{RequestError, RunError};
use crate::report::{FatalError, OverallOutcome, RunReport, RunState};
use crate::retention::RetentionManager;
use crate::transfer::dispatcher::UploadDispatcher;
use crate::transfer::{TransferAdapter, TransferResult};
use crate::utils::clock::Clock;
use crate::utils::digest::sha256_file;
use crate::utils::retry::RetryPolicy;

/// Everything recorded while a run progresses; turned into the report at the end.
struct RunTracker {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    state: RunState,
    job: Option<BackupJob>,
    artifact: Option<Artifact>,
    transfers: Vec<TransferResult>,
    retained: bool,
    retention_warning: Option<String>,
}

impl RunTracker {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            state: RunState::Idle,
            job: None,
            artifact: None,
            transfers: Vec::new(),
            retained: true,
            retention_warning: None,
        }
    }

    fn enter(&mut self, state: RunState) {
        info!(run_id = %self.run_id, from = ?self.state, to = ?state, "Run state change");
        self.state = state;
    }

    fn finish(self, finished_at: DateTime<Utc>) -> RunReport {
        let overall_outcome = OverallOutcome::aggregate(&self.transfers);
        RunReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at,
            final_state: RunState::Done,
            job_status: self.job.map(|j| j.status),
            artifact: self.artifact,
            transfers: self.transfers,
            overall_outcome,
            artifact_retained: self.retained,
            fatal: None,
            retention_warning: self.retention_warning,
        }
    }

    fn fail(self, err: RunError, finished_at: DateTime<Utc>) -> RunReport {
        warn!(run_id = %self.run_id, stage = ?self.state, error = %err, "Backup run aborted");
        RunReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at,
            final_state: RunState::Fatal,
            job_status: self.job.map(|j| j.status),
            artifact_retained: self.artifact.is_some(),
            artifact: self.artifact,
            transfers: self.transfers,
            overall_outcome: OverallOutcome::AllFailed,
            fatal: Some(FatalError {
                stage: self.state,
                message: err.to_string(),
            }),
            retention_warning: self.retention_warning,
        }
    }
}

/// Sequences request → poll → locate → transfer → retention for one run.
pub struct Orchestrator {
    requester: BackupRequester,
    request_policy: RetryPolicy,
    poller: BackupPoller,
    poll_settings: PollSettings,
    locator: ArtifactLocator,
    compute_checksum: bool,
    dispatcher: UploadDispatcher,
    adapters: Vec<Arc<dyn TransferAdapter>>,
    retention: RetentionManager,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        panel: Arc<dyn ControlPanel>,
        adapters: Vec<Arc<dyn TransferAdapter>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let criteria = locate_criteria(config);
        let probe = Arc::new(SettleProbe::new(criteria.clone()));
        Self {
            requester: BackupRequester::new(panel.clone(), clock.clone()),
            request_policy: RetryPolicy::new(
                config.backup.request_attempts,
                config.transfer.retry_base_delay,
                config.transfer.retry_ceiling,
            ),
            poller: BackupPoller::new(panel, probe, clock.clone()),
            poll_settings: PollSettings {
                timeout: config.backup.poll_timeout,
                interval: config.backup.poll_interval,
                ceiling: config.backup.poll_interval_ceiling,
            },
            locator: ArtifactLocator::new(
                criteria,
                config.backup.locate_wait,
                config.backup.poll_interval,
                clock.clone(),
            ),
            compute_checksum: config.backup.compute_checksum,
            dispatcher: UploadDispatcher::new(config.transfer.max_concurrency),
            adapters,
            retention: RetentionManager::new(config.retention, config.backup.search_dir.clone()),
            clock,
        }
    }

    /// Runs to completion. Every failure ends up in the returned report.
    pub async fn run(&self, cancel: &CancellationToken) -> RunReport {
        let mut tracker = RunTracker::new(self.clock.now());
        info!(run_id = %tracker.run_id, destinations = self.adapters.len(), "Starting backup run");

        let outcome = self.drive(&mut tracker, cancel).await;
        let finished_at = self.clock.now();
        let report = match outcome {
            Ok(()) => {
                tracker.enter(RunState::Done);
                tracker.finish(finished_at)
            }
            Err(err) => tracker.fail(err, finished_at),
        };
        info!(run_id = %report.run_id, outcome = ?report.overall_outcome, retained = report.artifact_retained, "Backup run finished");
        report
    }

    async fn drive(&self, tracker: &mut RunTracker, cancel: &CancellationToken) -> Result<(), RunError> {
        tracker.enter(RunState::Requesting);
        let job = self.request(cancel).await?;
        tracker.job = Some(job.clone());

        tracker.enter(RunState::Polling);
        let job = self.poller.await_completion(job, &self.poll_settings, cancel).await;
        tracker.job = Some(job.clone());
        match job.status {
            JobStatus::Completed => {}
            JobStatus::TimedOut if cancel.is_cancelled() => return Err(RunError::Cancelled),
            JobStatus::TimedOut => return Err(RunError::JobTimedOut(self.poll_settings.timeout)),
            JobStatus::Failed | JobStatus::Requested | JobStatus::InProgress => {
                return Err(RunError::JobFailed(
                    job.failure.clone().unwrap_or_else(|| format!("job ended as {:?}", job.status)),
                ));
            }
        }

        tracker.enter(RunState::Locating);
        let mut artifact = self.locator.locate(job.anchor(), cancel).await?;
        if self.compute_checksum {
            match sha256_file(&artifact.path).await {
                Ok(sum) => {
                    info!(sha256 = %sum, "Computed backup checksum");
                    artifact.checksum = Some(sum);
                }
                Err(err) => warn!(error = %err, "Could not checksum backup file, continuing without"),
            }
        }
        tracker.artifact = Some(artifact.clone());

        tracker.enter(RunState::Transferring);
        tracker.transfers = self
            .dispatcher
            .dispatch(Arc::new(artifact.clone()), &self.adapters, cancel)
            .await;

        // Every result is terminal here; the dispatcher joins all tasks first.
        tracker.enter(RunState::Finalizing);
        let decision = self.retention.apply(&artifact, &tracker.transfers).await;
        tracker.retained = decision.retained;
        tracker.retention_warning = decision.warning;
        Ok(())
    }

    async fn request(&self, cancel: &CancellationToken) -> Result<BackupJob, RunError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.requester.request().await {
                Ok(job) => return Ok(job),
                Err(err) if worth_retrying(&err) && self.request_policy.allows_another(attempts) => {
                    let delay = self.request_policy.next_delay(attempts);
                    warn!(attempt = attempts, error = %err, ?delay, "Backup request failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RunError::Cancelled),
                        _ = self.clock.sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// An explicit rejection or a malformed URL will not change on retry.
fn worth_retrying(err: &RequestError) -> bool {
    match err {
        RequestError::Http(_) | RequestError::InvalidResponse(_) => true,
        RequestError::UnexpectedStatus { status } => *status == 429 || *status >= 500,
        RequestError::Rejected(_) | RequestError::UrlParse(_) | RequestError::Setup(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::requester::tests::FakePanel;
    use crate::backup::requester::{RemoteJobStatus, UnavailablePanel};
    use crate::transfer::{FailureKind, UnavailableDestination};
    use crate::retention::RetentionPolicy;
    use crate::transfer::dispatcher::tests::ScriptedAdapter;
    use crate::config::DestinationKind;
    use crate::transfer::TransferOutcome;
    use std::time::SystemTime;
    use crate::utils::clock::ManualClock;
    use std::fs::File;
    use std::path::{Path, PathBuf};

    const NAME: &str = "backup-8.17.2024_17-46-55_acme.tar.gz";
    const FIVE_GB: u64 = 5 * 1024 * 1024 * 1024;

    /// Sparse file of the given size with a fresh modification time.
    fn backup_file(dir: &Path, size: u64) -> PathBuf {
        let path = dir.join(NAME);
        File::create(&path).unwrap().set_len(size).unwrap();
        path
    }

    fn adapters(outcomes: &[(&str, bool)]) -> Vec<Arc<dyn TransferAdapter>> {
        outcomes
            .iter()
            .map(|(name, ok)| Arc::new(ScriptedAdapter::new(name, *ok)) as Arc<dyn TransferAdapter>)
            .collect()
    }

    fn two_poll_panel() -> Arc<FakePanel> {
        Arc::new(FakePanel::new(
            vec![Ok(Some("4242".into()))],
            vec![Ok(Some(RemoteJobStatus::Running)), Ok(Some(RemoteJobStatus::Completed))],
        ))
    }

    fn orchestrator(
        dir: &Path,
        policy: RetentionPolicy,
        panel: Arc<dyn ControlPanel>,
        adapters: Vec<Arc<dyn TransferAdapter>>,
    ) -> Orchestrator {
        let mut config = crate::config::tests::sample_config(dir);
        config.retention = policy;
        Orchestrator::new(&config, panel, adapters, Arc::new(ManualClock::new(Utc::now())))
    }

    #[tokio::test]
    async fn end_to_end_all_destinations_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let path = backup_file(dir.path(), FIVE_GB);

        let report = orchestrator(
            dir.path(),
            RetentionPolicy::RequireAll,
            two_poll_panel(),
            adapters(&[("s3", true), ("gdrive", true)]),
        )
        .run(&CancellationToken::new())
        .await;

        assert_eq!(report.final_state, RunState::Done);
        assert_eq!(report.job_status, Some(JobStatus::Completed));
        assert_eq!(report.artifact.as_ref().map(|a| a.size_bytes), Some(FIVE_GB));
        assert_eq!(report.transfers.len(), 2);
        assert_eq!(report.overall_outcome, OverallOutcome::AllSucceeded);
        assert!(!report.artifact_retained);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn partial_failure_keeps_file_under_require_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = backup_file(dir.path(), 1024);

        let report = orchestrator(
            dir.path(),
            RetentionPolicy::RequireAll,
            two_poll_panel(),
            adapters(&[("s3", true), ("gdrive", false)]),
        )
        .run(&CancellationToken::new())
        .await;

        assert_eq!(report.overall_outcome, OverallOutcome::PartialSuccess);
        assert!(report.artifact_retained);
        assert!(path.exists());
        assert!(matches!(report.transfers[1].outcome, TransferOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn partial_failure_deletes_file_under_require_any() {
        let dir = tempfile::tempdir().unwrap();
        let path = backup_file(dir.path(), 1024);

        let report = orchestrator(
            dir.path(),
            RetentionPolicy::RequireAny,
            two_poll_panel(),
            adapters(&[("s3", true), ("gdrive", false)]),
        )
        .run(&CancellationToken::new())
        .await;

        assert_eq!(report.overall_outcome, OverallOutcome::PartialSuccess);
        assert!(!report.artifact_retained);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn rerun_after_deletion_fails_cleanly_at_locator() {
        let dir = tempfile::tempdir().unwrap();
        backup_file(dir.path(), 1024);

        let first = orchestrator(
            dir.path(),
            RetentionPolicy::RequireAny,
            two_poll_panel(),
            adapters(&[("s3", true), ("gdrive", true)]),
        )
        .run(&CancellationToken::new())
        .await;
        assert_eq!(first.overall_outcome, OverallOutcome::AllSucceeded);

        let second = orchestrator(
            dir.path(),
            RetentionPolicy::RequireAny,
            two_poll_panel(),
            adapters(&[("s3", true), ("gdrive", true)]),
        )
        .run(&CancellationToken::new())
        .await;

        assert_eq!(second.final_state, RunState::Fatal);
        assert_eq!(second.overall_outcome, OverallOutcome::AllFailed);
        let fatal = second.fatal.unwrap();
        assert_eq!(fatal.stage, RunState::Locating);
        assert!(fatal.message.starts_with("No backup file"));
        assert!(second.transfers.is_empty());
    }

    #[tokio::test]
    async fn request_failure_yields_fatal_report() {
        let dir = tempfile::tempdir().unwrap();
        let panel = Arc::new(FakePanel::new(
            vec![Err(RequestError::Rejected("You do not have the feature backup.".into()))],
            vec![],
        ));

        let report = orchestrator(dir.path(), RetentionPolicy::RequireAll, panel.clone(), adapters(&[("s3", true)]))
            .run(&CancellationToken::new())
            .await;

        assert_eq!(report.final_state, RunState::Fatal);
        assert_eq!(report.fatal.as_ref().map(|f| f.stage), Some(RunState::Requesting));
        assert!(report.job_status.is_none());
        assert!(!report.artifact_retained);
        assert_eq!(*panel.start_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_job_aborts_before_locating() {
        let dir = tempfile::tempdir().unwrap();
        let path = backup_file(dir.path(), 1024);
        let panel = Arc::new(FakePanel::new(
            vec![Ok(Some("1".into()))],
            vec![Ok(Some(RemoteJobStatus::Failed("disk quota exceeded".into())))],
        ));

        let report = orchestrator(dir.path(), RetentionPolicy::RequireAny, panel, adapters(&[("s3", true)]))
            .run(&CancellationToken::new())
            .await;

        assert_eq!(report.job_status, Some(JobStatus::Failed));
        let fatal = report.fatal.unwrap();
        assert_eq!(fatal.stage, RunState::Polling);
        assert!(fatal.message.contains("disk quota"));
        assert!(report.artifact.is_none());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn timed_out_job_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        // Status stays Running forever.
        let panel = Arc::new(FakePanel::new(vec![Ok(Some("1".into()))], vec![]));

        let report = orchestrator(dir.path(), RetentionPolicy::RequireAll, panel, adapters(&[("s3", true)]))
            .run(&CancellationToken::new())
            .await;

        assert_eq!(report.job_status, Some(JobStatus::TimedOut));
        assert_eq!(report.fatal.map(|f| f.stage), Some(RunState::Polling));
    }

    #[test]
    fn retry_classification() {
        assert!(worth_retrying(&RequestError::UnexpectedStatus { status: 502 }));
        assert!(!worth_retrying(&RequestError::UnexpectedStatus { status: 401 }));
        assert!(!worth_retrying(&RequestError::Rejected("no".into())));
        assert!(!worth_retrying(&RequestError::Setup("no TLS backend".into())));
    }

    #[tokio::test]
    async fn unusable_destination_fails_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = backup_file(dir.path(), 1024);
        let adapters: Vec<Arc<dyn TransferAdapter>> = vec![
            Arc::new(ScriptedAdapter::new("s3", true)),
            Arc::new(UnavailableDestination::new(
                "gdrive",
                DestinationKind::FolderStore,
                "Access token environment variable DRIVE_TOKEN is not set",
            )),
        ];

        let report = orchestrator(dir.path(), RetentionPolicy::RequireAll, two_poll_panel(), adapters)
            .run(&CancellationToken::new())
            .await;

        assert_eq!(report.final_state, RunState::Done);
        assert_eq!(report.overall_outcome, OverallOutcome::PartialSuccess);
        assert!(report.transfers[0].succeeded());
        match &report.transfers[1].outcome {
            TransferOutcome::Failed { reason } => {
                assert_eq!(reason.kind, FailureKind::Rejected);
                assert!(reason.message.contains("credentials: Access token environment variable DRIVE_TOKEN"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(report.artifact_retained);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn unusable_panel_client_is_fatal_at_requesting() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::tests::sample_config(dir.path());
        config.backup.request_attempts = 3;
        let panel = Arc::new(UnavailablePanel::new("builder error: no TLS backend"));
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let report = Orchestrator::new(&config, panel, adapters(&[("s3", true)]), clock.clone())
            .run(&CancellationToken::new())
            .await;

        assert_eq!(report.final_state, RunState::Fatal);
        let fatal = report.fatal.unwrap();
        assert_eq!(fatal.stage, RunState::Requesting);
        assert!(fatal.message.contains("no TLS backend"));
        assert!(clock.sleeps().is_empty());
        assert!(report.transfers.is_empty());
    }

    #[tokio::test]
    async fn stable_tie_fails_at_locating_before_the_poll_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let modified = SystemTime::now();
        for name in [NAME, "backup-8.17.2024_17-46-56_acme.tar.gz"] {
            let file = File::create(dir.path().join(name)).unwrap();
            file.set_len(1024).unwrap();
            file.set_modified(modified).unwrap();
        }
        let panel = Arc::new(FakePanel::new(
            vec![Ok(Some("7".into()))],
            vec![Ok(None), Ok(None), Ok(None)],
        ));

        let report = orchestrator(dir.path(), RetentionPolicy::RequireAny, panel, adapters(&[("s3", true)]))
            .run(&CancellationToken::new())
            .await;

        assert_eq!(report.job_status, Some(JobStatus::Completed));
        let fatal = report.fatal.unwrap();
        assert_eq!(fatal.stage, RunState::Locating);
        assert!(fatal.message.starts_with("2 equally recent"));
        assert!(report.transfers.is_empty());
        assert!(dir.path().join(NAME).exists());
    }
}
