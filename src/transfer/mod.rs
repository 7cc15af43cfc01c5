pub(crate) mod dispatcher;
pub(crate) mod engine;
pub(crate) mod gdrive_upload;
pub(crate) mod s3_upload;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backup::Artifact;
use crate::config::{AppConfig, DestinationKind, DestinationTarget};
use crate::errors::TransferError;
use crate::utils::clock::Clock;
use crate::utils::retry::RetryPolicy;
use engine::StoreAdapter;
use gdrive_upload::DriveStore;
use s3_upload::S3Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Rejected,
    VerificationMismatch,
    Cancelled,
    LocalIo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&TransferError> for FailureReason {
    fn from(err: &TransferError) -> Self {
        let kind = match err {
            TransferError::Transport(_) => FailureKind::Transport,
            TransferError::Http { .. } if err.is_transient() => FailureKind::Transport,
            TransferError::Http { .. } | TransferError::Rejected(_) => FailureKind::Rejected,
            TransferError::VerificationMismatch(_) => FailureKind::VerificationMismatch,
            TransferError::Cancelled => FailureKind::Cancelled,
            TransferError::Io(_) => FailureKind::LocalIo,
        };
        FailureReason {
            kind,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferOutcome {
    Succeeded,
    Failed { reason: FailureReason },
    Skipped,
}

/// Terminal record of one artifact transfer to one destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferResult {
    pub destination: String,
    pub kind: DestinationKind,
    pub outcome: TransferOutcome,
    pub bytes_transferred: u64,
    pub attempts: u32,
    /// Object key or file id the artifact ended up under.
    pub remote_name: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    /// Older backups removed by `keep_latest`.
    pub purged: Vec<String>,
    pub purge_error: Option<String>,
}

impl TransferResult {
    pub fn skipped(destination: &str, kind: DestinationKind) -> Self {
        Self::failed_or_skipped(destination, kind, TransferOutcome::Skipped, 0)
    }

    pub fn failed(destination: &str, kind: DestinationKind, reason: FailureReason, attempts: u32) -> Self {
        Self::failed_or_skipped(destination, kind, TransferOutcome::Failed { reason }, attempts)
    }

    fn failed_or_skipped(destination: &str, kind: DestinationKind, outcome: TransferOutcome, attempts: u32) -> Self {
        Self {
            destination: destination.to_string(),
            kind,
            outcome,
            bytes_transferred: 0,
            attempts,
            remote_name: None,
            verified_at: None,
            purged: Vec::new(),
            purge_error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, TransferOutcome::Succeeded)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, TransferOutcome::Failed { .. })
    }
}

/// One configured cloud destination. `upload` never fails: every problem ends up in the result.
#[async_trait]
pub trait TransferAdapter: Send + Sync {
    fn destination(&self) -> &str;

    fn kind(&self) -> DestinationKind;

    async fn upload(&self, artifact: &Artifact, cancel: &CancellationToken) -> TransferResult;
}

/// Stand-in for a destination excluded from this run with `--target`.
pub struct SkippedDestination {
    name: String,
    kind: DestinationKind,
}

impl SkippedDestination {
    pub fn new(name: impl Into<String>, kind: DestinationKind) -> Self {
        Self { name: name.into(), kind }
    }
}

#[async_trait]
impl TransferAdapter for SkippedDestination {
    fn destination(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DestinationKind {
        self.kind
    }

    async fn upload(&self, _artifact: &Artifact, _cancel: &CancellationToken) -> TransferResult {
        TransferResult::skipped(&self.name, self.kind)
    }
}

/// Stand-in for a destination that could not be set up. Every upload fails as `Rejected`.
pub struct UnavailableDestination {
    name: String,
    kind: DestinationKind,
    reason: String,
}

impl UnavailableDestination {
    pub fn new(name: impl Into<String>, kind: DestinationKind, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl TransferAdapter for UnavailableDestination {
    fn destination(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DestinationKind {
        self.kind
    }

    async fn upload(&self, _artifact: &Artifact, _cancel: &CancellationToken) -> TransferResult {
        let reason = FailureReason {
            kind: FailureKind::Rejected,
            message: format!("credentials: {}", self.reason),
        };
        TransferResult::failed(&self.name, self.kind, reason, 0)
    }
}

/// Builds one adapter per configured destination, in configuration order.
///
/// When `targets` is non-empty, destinations not named there are replaced by
/// [`SkippedDestination`]. Unknown target names are an error. A destination whose client
/// cannot be built becomes an [`UnavailableDestination`]; the others are unaffected.
pub async fn build_adapters(
    config: &AppConfig,
    targets: &[String],
    clock: Arc<dyn Clock>,
) -> Result<Vec<Arc<dyn TransferAdapter>>> {
    let known: HashSet<&str> = config.destinations.iter().map(|d| d.name.as_str()).collect();
    if let Some(unknown) = targets.iter().find(|t| !known.contains(t.as_str())) {
        anyhow::bail!(
            "Unknown target '{}'; configured destinations: {}",
            unknown,
            config.destinations.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", ")
        );
    }

    let policy = RetryPolicy::new(
        config.transfer.max_attempts,
        config.transfer.retry_base_delay,
        config.transfer.retry_ceiling,
    );

    let mut adapters: Vec<Arc<dyn TransferAdapter>> = Vec::with_capacity(config.destinations.len());
    for destination in &config.destinations {
        if !targets.is_empty() && !targets.iter().any(|t| t == &destination.name) {
            tracing::info!(destination = %destination.name, "Destination not selected for this run");
            adapters.push(Arc::new(SkippedDestination::new(&destination.name, destination.kind())));
            continue;
        }

        let adapter: Arc<dyn TransferAdapter> = match &destination.target {
            DestinationTarget::ObjectStore(s3) => {
                let store = S3Store::connect(s3, config.transfer.chunk_size, policy.clone(), clock.clone()).await;
                Arc::new(StoreAdapter::new(destination, store, policy.clone(), clock.clone()))
            }
            DestinationTarget::FolderStore(drive) => {
                match DriveStore::new(drive, config.transfer.chunk_size, policy.clone(), clock.clone()) {
                    Ok(store) => Arc::new(StoreAdapter::new(destination, store, policy.clone(), clock.clone())),
                    Err(err) => {
                        tracing::warn!(destination = %destination.name, error = %format!("{:#}", err), "Destination unavailable for this run");
                        Arc::new(UnavailableDestination::new(&destination.name, destination.kind(), format!("{:#}", err)))
                    }
                }
            }
        };
        adapters.push(adapter);
    }
    Ok(adapters)
}
