// panelbackup/src/transfer/engine.rs
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{FailureReason, TransferAdapter, TransferOutcome, TransferResult};
use crate::backup::Artifact;
use crate::config::{DestinationConfig, DestinationKind};
use crate::errors::TransferError;
use crate::utils::clock::Clock;
use crate::utils::retry::RetryPolicy;

/// Upper bound on `_N` suffixes tried before giving up on finding a free name.
const MAX_NAME_SUFFIX: u32 = 100;

/// What a completed protocol-level upload left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uploaded {
    /// Object key or file id used for the verification read.
    pub handle: String,
    pub bytes: u64,
    /// Checksum the destination should report if the bytes arrived intact.
    pub expected_checksum: Option<String>,
}

/// Size and checksum as the destination reports them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub checksum: Option<String>,
}

/// Native operations of one destination; retries and verification live in [`StoreAdapter`].
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Whether an object/file with this bare name already exists at the destination.
    async fn exists(&self, name: &str) -> Result<bool, TransferError>;

    /// Streams the artifact under `name`. Chunked protocols retry failed chunks internally;
    /// on error or cancellation nothing partial may become visible under `name`.
    async fn put(&self, artifact: &Artifact, name: &str, cancel: &CancellationToken) -> Result<Uploaded, TransferError>;

    /// `Ok(None)` when the uploaded object cannot be found.
    async fn stat(&self, uploaded: &Uploaded) -> Result<Option<RemoteStat>, TransferError>;

    /// Deletes all but the `keep` newest backups, returning what was removed.
    async fn purge(&self, keep: usize) -> Result<Vec<String>, TransferError>;
}

/// Inserts `_n` before the archive extension: `backup_x.tar.gz` → `backup_x_1.tar.gz`.
pub fn suffixed_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    let split = [".tar.gz", ".tar.bz2", ".tar.xz", ".tar.zst"]
        .iter()
        .find(|ext| name.len() > ext.len() && name.ends_with(*ext))
        .map(|ext| name.len() - ext.len())
        .or_else(|| name.rfind('.').filter(|idx| *idx > 0))
        .unwrap_or(name.len());
    let (stem, ext) = name.split_at(split);
    format!("{}_{}{}", stem, n, ext)
}

fn normalize_checksum(value: &str) -> String {
    value.trim().trim_matches('"').to_ascii_lowercase()
}

/// Generic [`TransferAdapter`]: no-clobber naming, whole-transfer retries, verification, purge.
pub struct StoreAdapter<S> {
    name: String,
    kind: DestinationKind,
    store: S,
    policy: RetryPolicy,
    allow_overwrite: bool,
    keep_latest: Option<usize>,
    clock: Arc<dyn Clock>,
}

impl<S: RemoteStore> StoreAdapter<S> {
    pub fn new(config: &DestinationConfig, store: S, policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: config.name.clone(),
            kind: config.kind(),
            store,
            policy,
            allow_overwrite: config.allow_overwrite,
            keep_latest: config.keep_latest,
            clock,
        }
    }

    async fn resolve_name(&self, base: &str) -> Result<String, TransferError> {
        if self.allow_overwrite {
            return Ok(base.to_string());
        }
        for n in 0..=MAX_NAME_SUFFIX {
            let candidate = suffixed_name(base, n);
            if !self.store.exists(&candidate).await? {
                if n > 0 {
                    info!(destination = %self.name, name = %candidate, "Name already taken, using suffixed name");
                }
                return Ok(candidate);
            }
        }
        Err(TransferError::Rejected(format!(
            "no free name for {} after {} suffixes",
            base, MAX_NAME_SUFFIX
        )))
    }

    async fn sleep_or_cancel(&self, attempts: u32, cancel: &CancellationToken) -> Result<(), TransferError> {
        let delay = self.policy.next_delay(attempts);
        tokio::select! {
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            _ = self.clock.sleep(delay) => Ok(()),
        }
    }

    /// Verification read with its own retry budget, so a flaky HEAD never re-uploads.
    async fn verify(&self, artifact: &Artifact, uploaded: &Uploaded, cancel: &CancellationToken) -> Result<(), TransferError> {
        let mut attempts = 0;
        let stat = loop {
            attempts += 1;
            match self.store.stat(uploaded).await {
                Ok(stat) => break stat,
                Err(err) if err.is_transient() && self.policy.allows_another(attempts) => {
                    warn!(destination = %self.name, attempt = attempts, error = %err, "Verification read failed, retrying");
                    self.sleep_or_cancel(attempts, cancel).await?;
                }
                Err(err) => return Err(err),
            }
        };

        let Some(stat) = stat else {
            return Err(TransferError::VerificationMismatch(format!(
                "{} not found after upload",
                uploaded.handle
            )));
        };
        if stat.size != artifact.size_bytes {
            return Err(TransferError::VerificationMismatch(format!(
                "size {} at destination, {} locally",
                stat.size, artifact.size_bytes
            )));
        }
        if let (Some(expected), Some(actual)) = (&uploaded.expected_checksum, &stat.checksum) {
            if normalize_checksum(expected) != normalize_checksum(actual) {
                return Err(TransferError::VerificationMismatch(format!(
                    "checksum {} at destination, expected {}",
                    actual, expected
                )));
            }
        }
        Ok(())
    }

    async fn attempt(&self, artifact: &Artifact, base_name: &str, cancel: &CancellationToken) -> Result<(String, Uploaded), TransferError> {
        let name = self.resolve_name(base_name).await?;
        let uploaded = self.store.put(artifact, &name, cancel).await?;
        Ok((name, uploaded))
    }

    fn failed(&self, err: &TransferError, attempts: u32) -> TransferResult {
        TransferResult::failed(&self.name, self.kind, FailureReason::from(err), attempts)
    }
}

#[async_trait]
impl<S: RemoteStore> TransferAdapter for StoreAdapter<S> {
    fn destination(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DestinationKind {
        self.kind
    }

    async fn upload(&self, artifact: &Artifact, cancel: &CancellationToken) -> TransferResult {
        let Some(base_name) = artifact.file_name() else {
            return self.failed(
                &TransferError::Rejected(format!("{} has no usable file name", artifact.path.display())),
                0,
            );
        };
        if cancel.is_cancelled() {
            return self.failed(&TransferError::Cancelled, 0);
        }

        info!(destination = %self.name, file = %artifact.path.display(), size = artifact.size_bytes, "Uploading backup");
        let mut attempts = 0;
        let (remote_name, uploaded) = loop {
            attempts += 1;
            match self.attempt(artifact, base_name, cancel).await {
                Ok(done) => break done,
                Err(err) if err.is_transient() && self.policy.allows_another(attempts) && !cancel.is_cancelled() => {
                    warn!(destination = %self.name, attempt = attempts, error = %err, "Upload attempt failed, retrying");
                    if let Err(cancelled) = self.sleep_or_cancel(attempts, cancel).await {
                        return self.failed(&cancelled, attempts);
                    }
                }
                Err(err) => {
                    warn!(destination = %self.name, attempts, error = %err, "Upload failed");
                    return self.failed(&err, attempts);
                }
            }
        };

        if let Err(err) = self.verify(artifact, &uploaded, cancel).await {
            warn!(destination = %self.name, error = %err, "Uploaded backup failed verification");
            let mut result = self.failed(&err, attempts);
            result.bytes_transferred = uploaded.bytes;
            result.remote_name = Some(remote_name);
            return result;
        }
        let verified_at = self.clock.now();
        info!(destination = %self.name, name = %remote_name, attempts, "✓ Backup uploaded and verified");

        let mut result = TransferResult {
            destination: self.name.clone(),
            kind: self.kind,
            outcome: TransferOutcome::Succeeded,
            bytes_transferred: uploaded.bytes,
            attempts,
            remote_name: Some(remote_name),
            verified_at: Some(verified_at),
            purged: Vec::new(),
            purge_error: None,
        };

        if let Some(keep) = self.keep_latest {
            match self.store.purge(keep).await {
                Ok(purged) => {
                    for name in &purged {
                        info!(destination = %self.name, %name, "Purged old backup");
                    }
                    result.purged = purged;
                }
                Err(err) => {
                    warn!(destination = %self.name, error = %err, "Purging old backups failed");
                    result.purge_error = Some(err.to_string());
                }
            }
        }
        result
    }
}
