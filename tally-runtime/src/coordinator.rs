//! Periodic checkpoints via barrier alignment.
//!
//! The coordinator injects `Barrier(id)` into every partition reader. Readers
//! acknowledge with their next offset and last published watermark, workers
//! with their open accumulators once aligned, and the sink once it has emitted
//! every result produced before the cut. When every participant has
//! acknowledged, the checkpoint is assembled and written in the background.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tally_core::metrics::{CHECKPOINTS, LAST_CHECKPOINT_ID};
use tally_core::{
    AccumulatorSnapshot, Checkpoint, CheckpointId, CheckpointStore, Offset, PartitionId, Result, Watermark,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Acknowledgements flowing back to the coordinator.
#[derive(Debug)]
pub(crate) enum Ack {
    Reader {
        partition: PartitionId,
        checkpoint_id: CheckpointId,
        next_offset: Offset,
        watermark: Watermark,
    },
    Worker {
        worker: usize,
        checkpoint_id: CheckpointId,
        accumulators: Vec<AccumulatorSnapshot>,
    },
    Sink {
        checkpoint_id: CheckpointId,
    },
    ReaderFinished {
        partition: PartitionId,
    },
}

#[derive(Debug)]
struct PendingCheckpoint {
    id: CheckpointId,
    offsets: BTreeMap<PartitionId, Offset>,
    watermarks: BTreeMap<PartitionId, Watermark>,
    workers: BTreeSet<usize>,
    accumulators: Vec<AccumulatorSnapshot>,
    sink_done: bool,
}

pub struct CheckpointCoordinator {
    store: Arc<dyn CheckpointStore>,
    partitions: u32,
    workers: usize,
    next_id: CheckpointId,
    pending: Option<PendingCheckpoint>,
    inputs_finished: bool,
    writes: JoinSet<(CheckpointId, Result<()>)>,
    last_completed: Option<CheckpointId>,
}

impl CheckpointCoordinator {
    /// `last_id` is the id of the checkpoint the run was restored from; new
    /// checkpoints continue after it.
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        partitions: u32,
        workers: usize,
        last_id: Option<CheckpointId>,
    ) -> Self {
        Self {
            store,
            partitions,
            workers,
            next_id: last_id.map_or(1, |id| id + 1),
            pending: None,
            inputs_finished: false,
            writes: JoinSet::new(),
            last_completed: last_id,
        }
    }

    /// Id of the newest checkpoint known to be durable.
    pub fn last_completed(&self) -> Option<CheckpointId> {
        self.last_completed
    }

    pub fn in_flight(&self) -> Option<CheckpointId> {
        self.pending.as_ref().map(|p| p.id)
    }

    /// Starts a new checkpoint unless one is in flight or an input has ended.
    pub(crate) fn trigger(&mut self) -> Option<CheckpointId> {
        if self.pending.is_some() || self.inputs_finished {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.pending = Some(PendingCheckpoint {
            id,
            offsets: BTreeMap::new(),
            watermarks: BTreeMap::new(),
            workers: BTreeSet::new(),
            accumulators: Vec::new(),
            sink_done: false,
        });
        debug!(checkpoint = id, "checkpoint triggered");
        Some(id)
    }

    /// Records an acknowledgement; returns the assembled checkpoint once every
    /// reader, every worker and the sink have acknowledged the pending one.
    pub(crate) fn acknowledge(&mut self, ack: Ack) -> Option<Checkpoint> {
        let pending = match ack {
            Ack::ReaderFinished { partition } => {
                self.inputs_finished = true;
                if let Some(p) = self.pending.take() {
                    info!(checkpoint = p.id, partition, "input ended, abandoning checkpoint");
                    CHECKPOINTS.with_label_values(&["abandoned"]).inc();
                }
                return None;
            }
            Ack::Reader {
                partition,
                checkpoint_id,
                next_offset,
                watermark,
            } => {
                let p = self.pending.as_mut().filter(|p| p.id == checkpoint_id)?;
                p.offsets.insert(partition, next_offset);
                p.watermarks.insert(partition, watermark);
                p
            }
            Ack::Worker {
                worker,
                checkpoint_id,
                accumulators,
            } => {
                let p = self.pending.as_mut().filter(|p| p.id == checkpoint_id)?;
                if p.workers.insert(worker) {
                    p.accumulators.extend(accumulators);
                }
                p
            }
            Ack::Sink { checkpoint_id } => {
                let p = self.pending.as_mut().filter(|p| p.id == checkpoint_id)?;
                p.sink_done = true;
                p
            }
        };
        if pending.offsets.len() < self.partitions as usize
            || pending.workers.len() < self.workers
            || !pending.sink_done
        {
            return None;
        }
        let p = self.pending.take()?;
        let mut checkpoint = Checkpoint::new(p.id);
        checkpoint.partition_offsets = p.offsets;
        checkpoint.watermarks = p.watermarks;
        checkpoint.accumulators = p.accumulators;
        checkpoint
            .accumulators
            .sort_by(|a, b| (a.window_start, &a.key).cmp(&(b.window_start, &b.key)));
        Some(checkpoint)
    }

    /// Writes `checkpoint` in the background.
    pub(crate) fn persist(&mut self, checkpoint: Checkpoint) {
        let store = self.store.clone();
        self.writes.spawn(async move {
            let id = checkpoint.id;
            (id, store.save(&checkpoint).await)
        });
    }

    /// Waits for the next background write; `None` when nothing is being written.
    pub(crate) async fn next_write(&mut self) -> Option<(CheckpointId, Result<()>)> {
        match self.writes.join_next().await? {
            Ok(done) => Some(done),
            Err(e) => {
                warn!(error = %e, "checkpoint write task failed");
                CHECKPOINTS.with_label_values(&["failed"]).inc();
                None
            }
        }
    }

    pub(crate) fn on_write(&mut self, id: CheckpointId, result: Result<()>) {
        match result {
            Ok(()) => {
                if self.last_completed.map_or(true, |last| id > last) {
                    self.last_completed = Some(id);
                    LAST_CHECKPOINT_ID.set(id as i64);
                }
                CHECKPOINTS.with_label_values(&["completed"]).inc();
                info!(checkpoint = id, "checkpoint completed");
            }
            Err(e) => {
                CHECKPOINTS.with_label_values(&["failed"]).inc();
                warn!(checkpoint = id, error = %e, "checkpoint write failed, retrying next cycle");
            }
        }
    }

    /// Awaits every in-flight write and drops any pending alignment.
    pub(crate) async fn drain(&mut self) {
        if let Some(p) = self.pending.take() {
            debug!(checkpoint = p.id, "dropping unfinished checkpoint");
        }
        while !self.writes.is_empty() {
            if let Some((id, result)) = self.next_write().await {
                self.on_write(id, result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tally_core::Error;

    struct NullStore;

    #[async_trait]
    impl CheckpointStore for NullStore {
        async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
            Err(Error::CheckpointWrite {
                id: checkpoint.id,
                reason: "read-only".into(),
            })
        }
        async fn latest(&self) -> Result<Option<Checkpoint>> {
            Ok(None)
        }
        async fn list(&self) -> Result<Vec<CheckpointId>> {
            Ok(vec![])
        }
    }

    fn coordinator(partitions: u32, workers: usize) -> CheckpointCoordinator {
        CheckpointCoordinator::new(Arc::new(NullStore), partitions, workers, None)
    }

    fn reader_ack(partition: PartitionId, id: CheckpointId, offset: Offset, wm: i64) -> Ack {
        Ack::Reader {
            partition,
            checkpoint_id: id,
            next_offset: offset,
            watermark: Watermark::new(partition, wm),
        }
    }

    #[test]
    fn assembles_after_every_participant_acks() {
        let mut c = coordinator(2, 2);
        let id = c.trigger().unwrap();
        assert_eq!(c.trigger(), None, "one checkpoint in flight at a time");

        assert!(c.acknowledge(reader_ack(0, id, 2, 899)).is_none());
        assert!(c
            .acknowledge(Ack::Worker {
                worker: 1,
                checkpoint_id: id,
                accumulators: vec![AccumulatorSnapshot {
                    key: "A".into(),
                    window_start: 0,
                    window_end: 2_000,
                    value: json!(2),
                }],
            })
            .is_none());
        assert!(c.acknowledge(reader_ack(1, id, 5, 1_200)).is_none());
        assert!(c
            .acknowledge(Ack::Worker {
                worker: 0,
                checkpoint_id: id,
                accumulators: vec![],
            })
            .is_none());
        let chk = c.acknowledge(Ack::Sink { checkpoint_id: id }).unwrap();
        assert_eq!(chk.id, 1);
        assert_eq!(chk.partition_offsets, BTreeMap::from([(0, 2), (1, 5)]));
        assert_eq!(chk.global_watermark(), 899);
        assert_eq!(chk.accumulators.len(), 1);
        assert!(chk.validate(2, 2_000).is_ok());
        assert_eq!(c.trigger(), Some(2));
    }

    #[test]
    fn stale_acks_are_ignored() {
        let mut c = coordinator(1, 1);
        let id = c.trigger().unwrap();
        assert!(c.acknowledge(reader_ack(0, id + 7, 1, 10)).is_none());
        assert!(c.acknowledge(Ack::Sink { checkpoint_id: id + 7 }).is_none());
        assert!(c
            .acknowledge(Ack::Worker {
                worker: 0,
                checkpoint_id: id,
                accumulators: vec![],
            })
            .is_none());
        assert!(c.acknowledge(reader_ack(0, id, 1, 10)).is_none());
        assert!(c.acknowledge(Ack::Sink { checkpoint_id: id }).is_some());
    }

    #[test]
    fn finished_input_abandons_and_stops_checkpoints() {
        let mut c = coordinator(2, 1);
        let id = c.trigger().unwrap();
        c.acknowledge(reader_ack(0, id, 1, 10));
        assert!(c.acknowledge(Ack::ReaderFinished { partition: 1 }).is_none());
        assert_eq!(c.in_flight(), None);
        assert_eq!(c.trigger(), None);
    }

    #[test]
    fn ids_continue_after_restored_checkpoint() {
        let mut c = CheckpointCoordinator::new(Arc::new(NullStore), 1, 1, Some(41));
        assert_eq!(c.last_completed(), Some(41));
        assert_eq!(c.trigger(), Some(42));
    }

    #[tokio::test]
    async fn failed_write_is_discarded() {
        let mut c = coordinator(1, 1);
        let id = c.trigger().unwrap();
        c.acknowledge(reader_ack(0, id, 3, 10));
        c.acknowledge(Ack::Worker {
            worker: 0,
            checkpoint_id: id,
            accumulators: vec![],
        });
        let chk = c.acknowledge(Ack::Sink { checkpoint_id: id }).unwrap();
        c.persist(chk);
        c.drain().await;
        assert_eq!(c.last_completed(), None);
        assert_eq!(c.trigger(), Some(2));
    }
}
