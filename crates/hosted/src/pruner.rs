//! Snapshot pruner.
//!
//! Every successful push signals the pruner; pruning itself is heavily
//! debounced (a multiple of the push window) so a busy document is pruned
//! at a fraction of its upload rate. Which versions are expendable is the
//! retention policy's call; the pruner only lists and deletes.

use crate::scheduler::{KeyedOps, KeyedOpsOptions};
use granary_storage::{ExternalStorage, ObjectSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Strategy deciding which versions to drop.
pub trait RetentionPolicy: Send + Sync + 'static {
    /// Given versions newest first, return the snapshot ids to delete.
    fn select_expendable(&self, versions: &[ObjectSnapshot]) -> Vec<String>;
}

/// Keep the newest N versions, drop the rest.
pub struct KeepRecent {
    pub keep: usize,
}

impl Default for KeepRecent {
    fn default() -> Self {
        Self { keep: 300 }
    }
}

impl RetentionPolicy for KeepRecent {
    fn select_expendable(&self, versions: &[ObjectSnapshot]) -> Vec<String> {
        versions
            .iter()
            .skip(self.keep)
            .map(|v| v.snapshot_id.clone())
            .collect()
    }
}

/// Background deleter of old object versions. Keys are object-store keys.
pub struct SnapshotPruner {
    ops: KeyedOps,
}

impl SnapshotPruner {
    /// `min_delay` is the minimum quiet interval before a prune runs;
    /// callers derive it from the push window.
    pub fn new(
        storage: Arc<dyn ExternalStorage>,
        policy: Arc<dyn RetentionPolicy>,
        min_delay: Duration,
    ) -> Self {
        let ops = KeyedOps::new(
            KeyedOpsOptions {
                delay_before_operation: min_delay,
                // Pruning is best effort; the next upload re-requests it.
                retry: false,
                ..Default::default()
            },
            Box::new(move |key| {
                let storage = storage.clone();
                let policy = policy.clone();
                Box::pin(async move {
                    let versions = storage.versions(&key).await?;
                    let expendable = policy.select_expendable(&versions);
                    if !expendable.is_empty() {
                        storage.remove(&key, Some(&expendable)).await?;
                        info!(key, removed = expendable.len(), "pruned old snapshots");
                    }
                    Ok(())
                })
            }),
        );
        Self { ops }
    }

    /// Signal that a new version of `key` was just uploaded.
    pub fn request_prune(&self, key: &str) {
        self.ops.add_operation(key);
    }

    pub fn has_pending(&self) -> bool {
        self.ops.has_pending_operations()
    }

    /// Resolve once no pruning work remains (tests).
    pub async fn wait(&self) {
        self.ops.wait(None).await;
    }

    /// Expedite and drain everything outstanding.
    pub async fn close(&self) {
        self.ops.expedite_operations();
        self.ops.wait(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str) -> ObjectSnapshot {
        ObjectSnapshot {
            snapshot_id: id.to_string(),
            last_modified: None,
        }
    }

    #[test]
    fn test_keep_recent_selects_tail() {
        let policy = KeepRecent { keep: 2 };
        let versions = vec![snapshot("v4"), snapshot("v3"), snapshot("v2"), snapshot("v1")];
        assert_eq!(policy.select_expendable(&versions), vec!["v2", "v1"]);

        let versions = vec![snapshot("v1")];
        assert!(policy.select_expendable(&versions).is_empty());
    }
}
