// panelbackup/src/transfer/dispatcher.rs
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{FailureKind, FailureReason, TransferAdapter, TransferResult};
use crate::backup::Artifact;

/// Fans one artifact out to every destination concurrently.
pub struct UploadDispatcher {
    max_concurrency: Option<usize>,
}

impl UploadDispatcher {
    /// `None` runs every destination at once.
    pub fn new(max_concurrency: Option<usize>) -> Self {
        Self {
            max_concurrency: max_concurrency.map(|n| n.max(1)),
        }
    }

    /// Returns exactly one result per adapter, in adapter order.
    ///
    /// A destination failing never stops the others. A task that panics or is
    /// aborted is reported as a failed transfer for its destination.
    pub async fn dispatch(
        &self,
        artifact: Arc<Artifact>,
        adapters: &[Arc<dyn TransferAdapter>],
        cancel: &CancellationToken,
    ) -> Vec<TransferResult> {
        let permits = Arc::new(Semaphore::new(self.max_concurrency.unwrap_or(adapters.len()).max(1)));
        let collected: Arc<Mutex<HashMap<usize, TransferResult>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut tasks = JoinSet::new();

        info!(destinations = adapters.len(), file = %artifact.path.display(), "Dispatching transfers");
        for (index, adapter) in adapters.iter().enumerate() {
            let adapter = Arc::clone(adapter);
            let artifact = Arc::clone(&artifact);
            let permits = Arc::clone(&permits);
            let collected = Arc::clone(&collected);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => adapter.upload(&artifact, &cancel).await,
                    Err(_) => TransferResult::failed(
                        adapter.destination(),
                        adapter.kind(),
                        aborted("transfer slot unavailable"),
                        0,
                    ),
                };
                collected.lock().await.insert(index, result);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "Transfer task ended abnormally");
            }
        }

        let mut collected = collected.lock().await;
        adapters
            .iter()
            .enumerate()
            .map(|(index, adapter)| {
                collected.remove(&index).unwrap_or_else(|| {
                    TransferResult::failed(adapter.destination(), adapter.kind(), aborted("transfer task aborted"), 0)
                })
            })
            .collect()
    }
}

fn aborted(message: &str) -> FailureReason {
    FailureReason {
        kind: FailureKind::Transport,
        message: message.to_string(),
    }
}
