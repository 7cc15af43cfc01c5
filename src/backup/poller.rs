// panelbackup/src/backup/poller.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::locator::{find_once, LocateCriteria};
use super::requester::{ControlPanel, RemoteJobStatus};
use super::{BackupJob, JobStatus};
use crate::errors::LocateError;
use crate::utils::clock::{remaining_until, to_chrono, Clock};
use crate::utils::retry::Backoff;

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub timeout: Duration,
    /// First wait between polls; doubles after every poll.
    pub interval: Duration,
    pub ceiling: Duration,
}

/// Completion check used when the control panel has no status for the job.
#[async_trait]
pub trait CompletionProbe: Send + Sync {
    /// `Ok(true)` once the job's output is known to be complete.
    async fn is_complete(&self, job: &BackupJob) -> Result<bool, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Observation {
    Newest {
        path: PathBuf,
        size_bytes: u64,
        modified: DateTime<Utc>,
    },
    /// Several files share the newest modification time.
    Tie(Vec<PathBuf>),
}

impl Observation {
    fn settled_since(&self, before: &Observation) -> bool {
        match self {
            Observation::Newest { size_bytes, .. } => *size_bytes > 0 && self == before,
            Observation::Tie(_) => self == before,
        }
    }
}

/// Treats the job as finished once the matching backup file stops changing.
///
/// The newest matching file must be non-empty and show the same size and modification
/// time on two consecutive polls. cPanel writes the tarball in place, so a file that is
/// still growing fails this check.
///
/// A tie between equally recent files that is unchanged on the next poll also counts as
/// settled: a growing archive would have moved ahead of the others by then. The locator
/// then reports the ambiguity instead of the poller waiting out its timeout.
pub struct SettleProbe {
    criteria: LocateCriteria,
    last_seen: Mutex<Option<Observation>>,
}

impl SettleProbe {
    pub fn new(criteria: LocateCriteria) -> Self {
        Self {
            criteria,
            last_seen: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CompletionProbe for SettleProbe {
    async fn is_complete(&self, job: &BackupJob) -> Result<bool, String> {
        let current = match find_once(&self.criteria, job.anchor()).await {
            Ok(candidate) => Some(Observation::Newest {
                path: candidate.path,
                size_bytes: candidate.size_bytes,
                modified: candidate.modified,
            }),
            Err(LocateError::Ambiguous { candidates }) => Some(Observation::Tie(candidates)),
            Err(LocateError::NotFound { .. }) => None,
            Err(err) => return Err(err.to_string()),
        };

        let mut last_seen = self.last_seen.lock().map_err(|_| "settle probe state poisoned".to_string())?;
        let settled = match (&current, last_seen.as_ref()) {
            (Some(now), Some(before)) => now.settled_since(before),
            _ => false,
        };
        debug!(?current, settled, "Settle probe observation");
        *last_seen = current;
        Ok(settled)
    }
}

enum PollVerdict {
    Done(JobStatus, Option<String>),
    Pending,
}

/// Waits for a requested backup job to finish, with bounded exponential backoff.
pub struct BackupPoller {
    panel: Arc<dyn ControlPanel>,
    fallback: Arc<dyn CompletionProbe>,
    clock: Arc<dyn Clock>,
}

impl BackupPoller {
    pub fn new(panel: Arc<dyn ControlPanel>, fallback: Arc<dyn CompletionProbe>, clock: Arc<dyn Clock>) -> Self {
        Self { panel, fallback, clock }
    }

    /// Polls until the job completes, fails, or `settings.timeout` elapses.
    ///
    /// Transient status errors are logged and retried on the next interval; a remote
    /// report of failure ends the wait immediately with `Failed`. Cancellation and the
    /// timeout both end with `TimedOut`. Sleeps are clamped to the deadline, so the
    /// overrun is bounded by the latency of the final status call.
    pub async fn await_completion(
        &self,
        mut job: BackupJob,
        settings: &PollSettings,
        cancel: &CancellationToken,
    ) -> BackupJob {
        let deadline = self.clock.now() + to_chrono(settings.timeout);
        let backoff = Backoff::new(settings.interval, settings.ceiling);
        job.status = JobStatus::InProgress;

        let mut polls: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return timed_out(job, "cancelled while waiting for the backup");
            }

            polls += 1;
            match self.check(&job).await {
                PollVerdict::Done(status, failure) => {
                    info!(polls, ?status, "Backup job finished");
                    job.status = status;
                    job.failure = failure;
                    return job;
                }
                PollVerdict::Pending => {}
            }

            let remaining = remaining_until(self.clock.as_ref(), deadline);
            if remaining.is_zero() {
                warn!(polls, timeout = ?settings.timeout, "Backup job did not complete in time");
                return timed_out(job, "poll timeout exceeded");
            }

            let nap = backoff.delay(polls).min(remaining);
            debug!(polls, ?nap, "Backup still running");
            tokio::select! {
                _ = cancel.cancelled() => return timed_out(job, "cancelled while waiting for the backup"),
                _ = self.clock.sleep(nap) => {}
            }
        }
    }

    async fn check(&self, job: &BackupJob) -> PollVerdict {
        match self.panel.job_status(&job.reference).await {
            Ok(Some(RemoteJobStatus::Completed)) => PollVerdict::Done(JobStatus::Completed, None),
            Ok(Some(RemoteJobStatus::Failed(reason))) => {
                warn!(%reason, "Control panel reports the backup job failed");
                PollVerdict::Done(JobStatus::Failed, Some(reason))
            }
            Ok(Some(RemoteJobStatus::Running)) => PollVerdict::Pending,
            Ok(None) => match self.fallback.is_complete(job).await {
                Ok(true) => PollVerdict::Done(JobStatus::Completed, None),
                Ok(false) => PollVerdict::Pending,
                Err(reason) => {
                    warn!(%reason, "Completion probe failed, retrying on next poll");
                    PollVerdict::Pending
                }
            },
            Err(err) => {
                warn!(error = %err, "Status check failed, retrying on next poll");
                PollVerdict::Pending
            }
        }
    }
}

fn timed_out(mut job: BackupJob, reason: &str) -> BackupJob {
    job.status = JobStatus::TimedOut;
    job.failure = Some(reason.to_string());
    job
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::requester::tests::FakePanel;
    use crate::backup::JobRef;
    use crate::errors::RequestError;
    use crate::utils::clock::ManualClock;
    use chrono::TimeZone;
    use std::fs::{File, OpenOptions};
    use std::io::Write;
    use std::time::SystemTime;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 17, 17, 40, 0).unwrap()
    }

    fn job() -> BackupJob {
        BackupJob {
            reference: JobRef::Id("42".into()),
            requested_at: start(),
            status: JobStatus::Requested,
            failure: None,
        }
    }

    fn settings() -> PollSettings {
        PollSettings {
            timeout: Duration::from_secs(600),
            interval: Duration::from_secs(10),
            ceiling: Duration::from_secs(40),
        }
    }

    struct NeverComplete;

    #[async_trait]
    impl CompletionProbe for NeverComplete {
        async fn is_complete(&self, _job: &BackupJob) -> Result<bool, String> {
            Ok(false)
        }
    }

    fn poller(panel: FakePanel, clock: Arc<ManualClock>) -> BackupPoller {
        BackupPoller::new(Arc::new(panel), Arc::new(NeverComplete), clock)
    }

    #[tokio::test]
    async fn completes_on_second_poll() {
        let clock = Arc::new(ManualClock::new(start()));
        let panel = FakePanel::new(
            vec![],
            vec![Ok(Some(RemoteJobStatus::Running)), Ok(Some(RemoteJobStatus::Completed))],
        );

        let done = poller(panel, clock.clone()).await_completion(job(), &settings(), &CancellationToken::new()).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(10)]);
    }

    #[tokio::test]
    async fn soft_errors_are_retried_and_hard_failure_is_terminal() {
        let clock = Arc::new(ManualClock::new(start()));
        let panel = FakePanel::new(
            vec![],
            vec![
                Err(RequestError::UnexpectedStatus { status: 502 }),
                Ok(Some(RemoteJobStatus::Running)),
                Ok(Some(RemoteJobStatus::Failed("disk quota exceeded".into()))),
                Ok(Some(RemoteJobStatus::Completed)),
            ],
        );

        let done = poller(panel, clock.clone()).await_completion(job(), &settings(), &CancellationToken::new()).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.failure.as_deref(), Some("disk quota exceeded"));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(10), Duration::from_secs(20)]);
    }

    #[tokio::test]
    async fn timeout_is_never_overshot() {
        let clock = Arc::new(ManualClock::new(start()));
        let settings = PollSettings {
            timeout: Duration::from_secs(95),
            interval: Duration::from_secs(10),
            ceiling: Duration::from_secs(40),
        };

        let done = poller(FakePanel::new(vec![], vec![]), clock.clone())
            .await_completion(job(), &settings, &CancellationToken::new())
            .await;

        assert_eq!(done.status, JobStatus::TimedOut);
        // 10 + 20 + 40 + 25 (clamped to the deadline).
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(40),
                Duration::from_secs(25)
            ]
        );
        assert!(clock.now() - start() <= chrono::Duration::seconds(95));
    }

    #[tokio::test]
    async fn cancellation_ends_wait_as_timed_out() {
        let clock = Arc::new(ManualClock::new(start()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let done = poller(FakePanel::new(vec![], vec![]), clock.clone())
            .await_completion(job(), &settings(), &cancel)
            .await;
        assert_eq!(done.status, JobStatus::TimedOut);
        assert!(clock.sleeps().is_empty());
    }

    fn criteria(dir: &std::path::Path) -> LocateCriteria {
        LocateCriteria {
            search_dir: dir.to_path_buf(),
            name_pattern: crate::config::build_artifact_pattern(r"backup-.*_{username}\.tar\.gz", "acme").unwrap(),
            clock_skew: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn settle_probe_requires_two_identical_observations() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let probe = SettleProbe::new(criteria(dir.path()));
        let job = BackupJob {
            reference: JobRef::Anchor(start()),
            ..job()
        };

        assert!(!probe.is_complete(&job).await.map_err(anyhow::Error::msg)?);

        let path = dir.path().join("backup-8.17.2024_17-46-55_acme.tar.gz");
        let mut file = File::create(&path)?;
        file.write_all(b"partial")?;
        file.set_modified(SystemTime::from(start() + chrono::Duration::minutes(1)))?;
        assert!(!probe.is_complete(&job).await.map_err(anyhow::Error::msg)?);

        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(b" and the rest")?;
        file.set_modified(SystemTime::from(start() + chrono::Duration::minutes(2)))?;
        assert!(!probe.is_complete(&job).await.map_err(anyhow::Error::msg)?);

        assert!(probe.is_complete(&job).await.map_err(anyhow::Error::msg)?);
        Ok(())
    }

    #[tokio::test]
    async fn anchor_jobs_fall_back_to_probe() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("backup-8.17.2024_17-46-55_acme.tar.gz");
        let file = File::create(&path)?;
        file.set_len(4096)?;
        file.set_modified(SystemTime::from(start() + chrono::Duration::minutes(1)))?;

        let clock = Arc::new(ManualClock::new(start()));
        let poller = BackupPoller::new(
            Arc::new(FakePanel::new(vec![], vec![Ok(None), Ok(None), Ok(None)])),
            Arc::new(SettleProbe::new(criteria(dir.path()))),
            clock.clone(),
        );
        let job = BackupJob {
            reference: JobRef::Anchor(start()),
            ..job()
        };

        let done = poller.await_completion(job, &settings(), &CancellationToken::new()).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(clock.sleeps().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn stable_tie_ends_the_wait_early() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let modified = SystemTime::from(start() + chrono::Duration::minutes(1));
        for name in ["backup-8.17.2024_17-46-55_acme.tar.gz", "backup-8.17.2024_17-46-56_acme.tar.gz"] {
            let file = File::create(dir.path().join(name))?;
            file.set_len(4096)?;
            file.set_modified(modified)?;
        }

        let clock = Arc::new(ManualClock::new(start()));
        let poller = BackupPoller::new(
            Arc::new(FakePanel::new(vec![], vec![Ok(None), Ok(None), Ok(None)])),
            Arc::new(SettleProbe::new(criteria(dir.path()))),
            clock.clone(),
        );
        let job = BackupJob {
            reference: JobRef::Anchor(start()),
            ..job()
        };

        let done = poller.await_completion(job, &settings(), &CancellationToken::new()).await;
        assert_eq!(done.status, JobStatus::Completed);
        // One nap between the two identical observations, far below the 600s timeout.
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(10)]);
        Ok(())
    }
}
