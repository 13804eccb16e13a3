use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tally_core::{Checkpoint, CheckpointId, CheckpointStore, Error, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const PREFIX: &str = "chk-";
const SUFFIX: &str = ".json";

/// Stores each checkpoint as `chk-<id>.json` in a directory.
///
/// Files are written to a temporary name, synced, then renamed, so a crash
/// mid-write never leaves a partially written checkpoint visible to `latest`.
#[derive(Debug, Clone)]
pub struct DirCheckpointStore {
    dir: PathBuf,
    retained: usize,
}

impl DirCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_retained(dir, crate::DEFAULT_RETAINED)
    }

    pub fn with_retained(dir: impl Into<PathBuf>, retained: usize) -> Self {
        Self {
            dir: dir.into(),
            retained: retained.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: CheckpointId) -> PathBuf {
        self.dir.join(format!("{PREFIX}{id:020}{SUFFIX}"))
    }

    fn parse_id(name: &str) -> Option<CheckpointId> {
        name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?.parse().ok()
    }

    async fn ids(&self) -> Result<Vec<CheckpointId>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(Self::parse_id) {
                out.push(id);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    async fn write(&self, checkpoint: &Checkpoint) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let final_path = self.path_for(checkpoint.id);
        let tmp_path = final_path.with_extension("json.tmp");
        let mut f = tokio::fs::File::create(&tmp_path).await?;
        f.write_all(&bytes).await?;
        f.sync_all().await?;
        drop(f);
        tokio::fs::rename(&tmp_path, &final_path).await
    }

    async fn prune(&self) -> Result<()> {
        let ids = self.ids().await?;
        if ids.len() <= self.retained {
            return Ok(());
        }
        for id in &ids[..ids.len() - self.retained] {
            let path = self.path_for(*id);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to prune old checkpoint");
            } else {
                debug!(checkpoint = id, "pruned checkpoint");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for DirCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.write(checkpoint)
            .await
            .map_err(|e| Error::CheckpointWrite {
                id: checkpoint.id,
                reason: format!("{}: {e}", self.dir.display()),
            })?;
        self.prune().await
    }

    async fn latest(&self) -> Result<Option<Checkpoint>> {
        let Some(id) = self.ids().await?.last().copied() else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(self.path_for(id)).await?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).map_err(|e| Error::StateCorruption {
            checkpoint: Some(id),
            reason: format!("cannot decode {}: {e}", self.path_for(id).display()),
        })?;
        if checkpoint.id != id {
            return Err(Error::StateCorruption {
                checkpoint: Some(id),
                reason: format!("file is named for checkpoint {id} but contains checkpoint {}", checkpoint.id),
            });
        }
        Ok(Some(checkpoint))
    }

    async fn list(&self) -> Result<Vec<CheckpointId>> {
        self.ids().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_dir(prefix: &str) -> PathBuf {
        let mut d = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        d.push(format!("tally_state_test_{}_{}", prefix, nanos));
        d
    }

    #[tokio::test]
    async fn missing_dir_has_no_checkpoint() {
        let store = DirCheckpointStore::new(tmp_dir("missing"));
        assert!(store.latest().await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn saves_prunes_and_loads_latest() {
        let dir = tmp_dir("prune");
        let store = DirCheckpointStore::with_retained(&dir, 2);
        for id in [3, 1, 2] {
            let mut cp = Checkpoint::new(id);
            cp.partition_offsets.insert(0, id * 10);
            store.save(&cp).await.unwrap();
        }
        assert_eq!(store.list().await.unwrap(), vec![2, 3]);
        let latest = store.latest().await.unwrap().unwrap();
        assert_eq!(latest.id, 3);
        assert_eq!(latest.partition_offsets[&0], 30);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn leftover_temp_file_is_ignored() {
        let dir = tmp_dir("tmpfile");
        let store = DirCheckpointStore::new(&dir);
        store.save(&Checkpoint::new(1)).await.unwrap();
        std::fs::write(dir.join("chk-00000000000000000002.json.tmp"), b"{\"checkpoint_id\":").unwrap();
        assert_eq!(store.latest().await.unwrap().unwrap().id, 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn undecodable_checkpoint_is_corruption() {
        let dir = tmp_dir("corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("chk-00000000000000000005.json"), b"not json").unwrap();
        let store = DirCheckpointStore::new(&dir);
        let err = store.latest().await.unwrap_err();
        assert!(matches!(err, Error::StateCorruption { checkpoint: Some(5), .. }));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn unwritable_location_is_write_error() {
        let dir = tmp_dir("blocked");
        // a regular file where the directory should be
        std::fs::write(&dir, b"occupied").unwrap();
        let store = DirCheckpointStore::new(&dir);
        let err = store.save(&Checkpoint::new(1)).await.unwrap_err();
        assert!(matches!(err, Error::CheckpointWrite { id: 1, .. }));
        let _ = std::fs::remove_file(dir);
    }
}
