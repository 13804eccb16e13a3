#![cfg(feature = "rocksdb")]
use anyhow::Context as _;
use async_trait::async_trait;
use tally_core::{Checkpoint, CheckpointId, CheckpointStore, Error, Result};

const KEY_PREFIX: &[u8] = b"checkpoint:";

/// A RocksDB-backed `CheckpointStore` (enable with `--features rocksdb`).
///
/// Each checkpoint is one JSON value under `checkpoint:<id, zero padded>`, so the
/// key order is the id order. A `put` is atomic, which gives the same
/// all-or-nothing visibility as the directory store's rename.
pub struct RocksDbCheckpointStore {
    db: rocksdb::DB,
    retained: usize,
}

impl RocksDbCheckpointStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = rocksdb::DB::open_default(path).with_context(|| format!("opening rocksdb at {path}"))?;
        Ok(Self {
            db,
            retained: crate::DEFAULT_RETAINED,
        })
    }

    pub fn with_retained(mut self, retained: usize) -> Self {
        self.retained = retained.max(1);
        self
    }

    fn key(id: CheckpointId) -> Vec<u8> {
        let mut k = KEY_PREFIX.to_vec();
        k.extend_from_slice(format!("{id:020}").as_bytes());
        k
    }

    fn parse_key(key: &[u8]) -> Option<CheckpointId> {
        std::str::from_utf8(key.strip_prefix(KEY_PREFIX)?).ok()?.parse().ok()
    }

    fn ids(&self) -> Result<Vec<CheckpointId>> {
        let mode = rocksdb::IteratorMode::From(KEY_PREFIX, rocksdb::Direction::Forward);
        let mut out = Vec::new();
        for item in self.db.iterator(mode) {
            let (k, _) = item.context("iterating checkpoints")?;
            if !k.starts_with(KEY_PREFIX) {
                break;
            }
            if let Some(id) = Self::parse_key(&k) {
                out.push(id);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl CheckpointStore for RocksDbCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let bytes = serde_json::to_vec(checkpoint)?;
        self.db
            .put(Self::key(checkpoint.id), bytes)
            .map_err(|e| Error::CheckpointWrite {
                id: checkpoint.id,
                reason: e.to_string(),
            })?;
        let ids = self.ids()?;
        if ids.len() > self.retained {
            for id in &ids[..ids.len() - self.retained] {
                self.db.delete(Self::key(*id)).context("pruning checkpoint")?;
            }
        }
        Ok(())
    }

    async fn latest(&self) -> Result<Option<Checkpoint>> {
        let Some(id) = self.ids()?.last().copied() else {
            return Ok(None);
        };
        let Some(bytes) = self.db.get(Self::key(id)).context("reading checkpoint")? else {
            return Ok(None);
        };
        let checkpoint = serde_json::from_slice(&bytes).map_err(|e| Error::StateCorruption {
            checkpoint: Some(id),
            reason: format!("cannot decode checkpoint: {e}"),
        })?;
        Ok(Some(checkpoint))
    }

    async fn list(&self) -> Result<Vec<CheckpointId>> {
        self.ids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path() -> String {
        let mut d = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        d.push(format!("tally_rocks_{nanos}"));
        d.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn keeps_newest_checkpoints() {
        let path = tmp_path();
        let store = RocksDbCheckpointStore::open(&path).unwrap().with_retained(2);
        for id in 1..=3 {
            store.save(&Checkpoint::new(id)).await.unwrap();
        }
        assert_eq!(store.list().await.unwrap(), vec![2, 3]);
        assert_eq!(store.latest().await.unwrap().map(|c| c.id), Some(3));
        drop(store);
        let _ = std::fs::remove_dir_all(path);
    }
}
