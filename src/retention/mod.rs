// panelbackup/src/retention/mod.rs
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::backup::Artifact;
use crate::errors::RetentionError;
use crate::transfer::TransferResult;

/// When the local artifact may be deleted after transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Delete only when every destination succeeded.
    #[default]
    RequireAll,
    /// Delete as soon as one destination succeeded.
    RequireAny,
}

/// `true` keeps the local artifact.
///
/// With no results at all nothing was copied offsite, so both policies retain.
pub fn decide(results: &[TransferResult], policy: RetentionPolicy) -> bool {
    match policy {
        RetentionPolicy::RequireAll => results.is_empty() || !results.iter().all(TransferResult::succeeded),
        RetentionPolicy::RequireAny => !results.iter().any(TransferResult::succeeded),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionDecision {
    pub retained: bool,
    /// Set when deletion was wanted but failed; the run still counts as successful.
    pub warning: Option<String>,
}

/// The single place that deletes local artifacts.
pub struct RetentionManager {
    policy: RetentionPolicy,
    scope_dir: PathBuf,
}

impl RetentionManager {
    /// Deletions are only ever performed on direct children of `scope_dir`.
    pub fn new(policy: RetentionPolicy, scope_dir: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            scope_dir: scope_dir.into(),
        }
    }

    /// Applies the policy to the finished transfers of one run.
    ///
    /// Callers pass results only after every transfer is terminal; the dispatcher
    /// returns nothing before that.
    pub async fn apply(&self, artifact: &Artifact, results: &[TransferResult]) -> RetentionDecision {
        if decide(results, self.policy) {
            info!(policy = ?self.policy, file = %artifact.path.display(), "Keeping local backup");
            return RetentionDecision {
                retained: true,
                warning: None,
            };
        }

        match self.delete(&artifact.path).await {
            Ok(()) => {
                info!(file = %artifact.path.display(), "✓ Deleted local backup after transfer");
                RetentionDecision {
                    retained: false,
                    warning: None,
                }
            }
            Err(err) => {
                warn!(error = %err, "Local backup could not be deleted");
                RetentionDecision {
                    retained: true,
                    warning: Some(err.to_string()),
                }
            }
        }
    }

    async fn delete(&self, path: &Path) -> Result<(), RetentionError> {
        if !is_within(&self.scope_dir, path) {
            return Err(RetentionError::OutsideScope {
                path: path.to_path_buf(),
                scope: self.scope_dir.clone(),
            });
        }
        tokio::fs::remove_file(path)
            .await
            .map_err(|source| RetentionError::Delete {
                path: path.to_path_buf(),
                source,
            })
    }
}

fn is_within(scope: &Path, path: &Path) -> bool {
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return false,
    };
    match (std::fs::canonicalize(scope), std::fs::canonicalize(parent)) {
        (Ok(scope), Ok(parent)) => scope == parent,
        _ => scope == parent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DestinationKind;
    use crate::transfer::{FailureKind, FailureReason, TransferOutcome};
    use chrono::Utc;
    use rstest::rstest;

    fn result(outcome: TransferOutcome) -> TransferResult {
        TransferResult {
            destination: "d".into(),
            kind: DestinationKind::ObjectStore,
            outcome,
            bytes_transferred: 0,
            attempts: 1,
            remote_name: None,
            verified_at: None,
            purged: Vec::new(),
            purge_error: None,
        }
    }

    fn ok() -> TransferResult {
        result(TransferOutcome::Succeeded)
    }

    fn failed() -> TransferResult {
        result(TransferOutcome::Failed {
            reason: FailureReason {
                kind: FailureKind::Transport,
                message: "reset".into(),
            },
        })
    }

    fn skipped() -> TransferResult {
        result(TransferOutcome::Skipped)
    }

    #[rstest]
    #[case(vec![ok(), ok()], RetentionPolicy::RequireAll, false)]
    #[case(vec![ok(), failed()], RetentionPolicy::RequireAll, true)]
    #[case(vec![ok(), skipped()], RetentionPolicy::RequireAll, true)]
    #[case(vec![failed(), failed()], RetentionPolicy::RequireAll, true)]
    #[case(vec![], RetentionPolicy::RequireAll, true)]
    #[case(vec![ok(), ok()], RetentionPolicy::RequireAny, false)]
    #[case(vec![ok(), failed()], RetentionPolicy::RequireAny, false)]
    #[case(vec![skipped(), ok()], RetentionPolicy::RequireAny, false)]
    #[case(vec![failed(), skipped()], RetentionPolicy::RequireAny, true)]
    #[case(vec![], RetentionPolicy::RequireAny, true)]
    fn retention_matrix(#[case] results: Vec<TransferResult>, #[case] policy: RetentionPolicy, #[case] retain: bool) {
        assert_eq!(decide(&results, policy), retain);
    }

    fn artifact_at(path: PathBuf) -> Artifact {
        Artifact {
            path,
            size_bytes: 3,
            created_at: Utc::now(),
            checksum: None,
        }
    }

    #[tokio::test]
    async fn deletes_when_policy_allows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.tar.gz");
        std::fs::write(&path, b"abc").unwrap();

        let manager = RetentionManager::new(RetentionPolicy::RequireAll, dir.path());
        let decision = manager.apply(&artifact_at(path.clone()), &[ok()]).await;

        assert!(!decision.retained);
        assert!(decision.warning.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn keeps_file_when_policy_retains() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.tar.gz");
        std::fs::write(&path, b"abc").unwrap();

        let manager = RetentionManager::new(RetentionPolicy::RequireAll, dir.path());
        let decision = manager.apply(&artifact_at(path.clone()), &[ok(), failed()]).await;

        assert!(decision.retained);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn delete_failure_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("already-gone.tar.gz");

        let manager = RetentionManager::new(RetentionPolicy::RequireAny, dir.path());
        let decision = manager.apply(&artifact_at(path), &[ok()]).await;

        assert!(decision.retained);
        assert!(decision.warning.unwrap().contains("already-gone"));
    }

    #[tokio::test]
    async fn refuses_to_delete_outside_scope() {
        let scope = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let path = elsewhere.path().join("backup.tar.gz");
        std::fs::write(&path, b"abc").unwrap();

        let manager = RetentionManager::new(RetentionPolicy::RequireAny, scope.path());
        let decision = manager.apply(&artifact_at(path.clone()), &[ok()]).await;

        assert!(decision.retained);
        assert!(decision.warning.unwrap().contains("outside"));
        assert!(path.exists());
    }
}
