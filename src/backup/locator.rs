// panelbackup/src/backup/locator.rs
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::Artifact;
use crate::errors::LocateError;
use crate::utils::clock::{remaining_until, to_chrono, Clock};

/// What a file must look like to count as the backup of this run.
#[derive(Debug, Clone)]
pub struct LocateCriteria {
    pub search_dir: PathBuf,
    /// Anchored regex over the bare file name.
    pub name_pattern: Regex,
    /// Files modified up to this long before the anchor still qualify.
    pub clock_skew: Duration,
}

/// A regular file in the search directory, with the metadata the locator ranks by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

impl Candidate {
    fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

impl From<Candidate> for Artifact {
    fn from(candidate: Candidate) -> Self {
        Artifact {
            path: candidate.path,
            size_bytes: candidate.size_bytes,
            created_at: candidate.modified,
            checksum: None,
        }
    }
}

/// Lists regular files directly inside `dir` (no recursion, symlinks ignored).
pub fn scan_dir(dir: &Path) -> std::io::Result<Vec<Candidate>> {
    let mut candidates = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let metadata = entry.metadata()?;
        candidates.push(Candidate {
            path: entry.path().to_path_buf(),
            size_bytes: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
        });
    }
    Ok(candidates)
}

/// Picks the single qualifying candidate.
///
/// A candidate qualifies when its name matches the pattern and it was modified no earlier
/// than `anchor - clock_skew`. Among qualifying files the latest modification time wins; an
/// exact tie for the latest time is an error, never a guess. The result does not depend on
/// the order of `candidates`.
pub fn select_candidate(
    candidates: Vec<Candidate>,
    criteria: &LocateCriteria,
    anchor: DateTime<Utc>,
) -> Result<Candidate, LocateError> {
    let not_before = anchor - to_chrono(criteria.clock_skew);
    let matching: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| {
            c.file_name().is_some_and(|name| criteria.name_pattern.is_match(name)) && c.modified >= not_before
        })
        .collect();

    let Some(latest) = matching.iter().map(|c| c.modified).max() else {
        return Err(LocateError::NotFound {
            dir: criteria.search_dir.clone(),
            pattern: criteria.name_pattern.as_str().to_string(),
        });
    };

    let mut newest: Vec<Candidate> = matching.into_iter().filter(|c| c.modified == latest).collect();
    if newest.len() > 1 {
        let mut candidates: Vec<PathBuf> = newest.into_iter().map(|c| c.path).collect();
        candidates.sort();
        return Err(LocateError::Ambiguous { candidates });
    }
    newest.pop().ok_or_else(|| LocateError::NotFound {
        dir: criteria.search_dir.clone(),
        pattern: criteria.name_pattern.as_str().to_string(),
    })
}

/// Lists the search directory off the async runtime and applies [`select_candidate`].
pub async fn find_once(criteria: &LocateCriteria, anchor: DateTime<Utc>) -> Result<Candidate, LocateError> {
    let dir = criteria.search_dir.clone();
    let listing = tokio::task::spawn_blocking({
        let dir = dir.clone();
        move || scan_dir(&dir)
    })
    .await
    .map_err(std::io::Error::other)
    .and_then(|listed| listed)
    .map_err(|source| LocateError::Io { dir, source })?;

    select_candidate(listing, criteria, anchor)
}

/// Finds the artifact produced by a completed backup job.
pub struct ArtifactLocator {
    criteria: LocateCriteria,
    /// How long a missing artifact is waited for before giving up.
    wait: Duration,
    retry_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl ArtifactLocator {
    pub fn new(criteria: LocateCriteria, wait: Duration, retry_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            criteria,
            wait,
            retry_interval: retry_interval.max(Duration::from_millis(100)),
            clock,
        }
    }

    /// Returns the newest matching file modified after `anchor` (minus clock skew).
    ///
    /// A directory that does not show the file yet is rescanned until the configured wait
    /// runs out (`NotFound`). Ambiguity and listing errors are returned immediately.
    pub async fn locate(&self, anchor: DateTime<Utc>, cancel: &CancellationToken) -> Result<Artifact, LocateError> {
        let deadline = self.clock.now() + to_chrono(self.wait);
        info!(
            dir = %self.criteria.search_dir.display(),
            pattern = self.criteria.name_pattern.as_str(),
            %anchor,
            "Looking for backup file"
        );

        loop {
            match find_once(&self.criteria, anchor).await {
                Ok(candidate) => {
                    info!(path = %candidate.path.display(), size = candidate.size_bytes, "Backup file located");
                    return Ok(candidate.into());
                }
                Err(LocateError::NotFound { .. }) if remaining_until(self.clock.as_ref(), deadline) > Duration::ZERO => {
                    let nap = self.retry_interval.min(remaining_until(self.clock.as_ref(), deadline));
                    debug!(?nap, "Backup file not visible yet, rescanning later");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LocateError::Cancelled),
                        _ = self.clock.sleep(nap) => {}
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Backup file lookup failed");
                    return Err(err);
                }
            }
        }
    }
}
