use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tally_core::{Checkpoint, CheckpointId, CheckpointStore, Result};

#[derive(Default)]
struct Inner {
    checkpoints: BTreeMap<CheckpointId, Checkpoint>,
}

/// A `CheckpointStore` that keeps the newest checkpoints in memory.
///
/// Clones share the same storage, so a store handed to a job can be inspected
/// (or handed to the next job) after the job ends.
#[derive(Clone)]
pub struct InMemoryCheckpointStore {
    inner: Arc<Mutex<Inner>>,
    retained: usize,
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::with_retained(crate::DEFAULT_RETAINED)
    }
}

impl InMemoryCheckpointStore {
    pub fn with_retained(retained: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            retained: retained.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut guard = self.inner.lock();
        guard.checkpoints.insert(checkpoint.id, checkpoint.clone());
        while guard.checkpoints.len() > self.retained {
            guard.checkpoints.pop_first();
        }
        Ok(())
    }

    async fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.inner.lock().checkpoints.values().next_back().cloned())
    }

    async fn list(&self) -> Result<Vec<CheckpointId>> {
        Ok(self.inner.lock().checkpoints.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keeps_latest_and_prunes_oldest() {
        let store = InMemoryCheckpointStore::with_retained(2);
        assert!(store.latest().await.unwrap().is_none());
        for id in 1..=3 {
            store.save(&Checkpoint::new(id)).await.unwrap();
        }
        assert_eq!(store.list().await.unwrap(), vec![2, 3]);
        assert_eq!(store.latest().await.unwrap().unwrap().id, 3);
        // clones observe the same state
        let other = store.clone();
        assert_eq!(other.len(), 2);
    }
}
