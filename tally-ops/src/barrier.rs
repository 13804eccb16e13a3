//! Checkpoint barrier alignment for a worker fed by several partitions.
//!
//! A worker receives one in-order stream per source partition. When the
//! barrier for checkpoint `n` arrives on a partition, everything that partition
//! sends afterwards belongs to the state *after* the cut and is buffered until
//! the barrier has arrived on every other partition (or that partition ended).
//! At that point the worker snapshots, then replays the buffer.

use std::collections::{BTreeSet, VecDeque};

use tally_core::{CheckpointId, PartitionId};

/// Outcome of feeding a barrier or end-of-input marker to the aligner.
#[derive(Debug, PartialEq)]
pub enum Alignment<T> {
    /// Still waiting for other partitions.
    Pending,
    /// Every partition delivered the barrier; snapshot now, then replay `buffered`.
    Aligned {
        checkpoint_id: CheckpointId,
        buffered: Vec<(PartitionId, T)>,
    },
    /// A barrier for a different checkpoint arrived mid-alignment.
    Mismatch {
        expected: CheckpointId,
        got: CheckpointId,
    },
}

#[derive(Debug)]
pub struct BarrierAligner<T> {
    inputs: u32,
    current: Option<CheckpointId>,
    arrived: BTreeSet<PartitionId>,
    finished: BTreeSet<PartitionId>,
    buffered: VecDeque<(PartitionId, T)>,
}

impl<T> BarrierAligner<T> {
    pub fn new(inputs: u32) -> Self {
        Self {
            inputs,
            current: None,
            arrived: BTreeSet::new(),
            finished: BTreeSet::new(),
            buffered: VecDeque::new(),
        }
    }

    /// Checkpoint currently being aligned.
    pub fn aligning(&self) -> Option<CheckpointId> {
        self.current
    }

    /// Whether input from `partition` must be held back.
    pub fn is_blocked(&self, partition: PartitionId) -> bool {
        self.current.is_some() && self.arrived.contains(&partition)
    }

    pub fn buffer(&mut self, partition: PartitionId, item: T) {
        self.buffered.push_back((partition, item));
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    pub fn on_barrier(&mut self, partition: PartitionId, checkpoint_id: CheckpointId) -> Alignment<T> {
        match self.current {
            Some(expected) if expected != checkpoint_id => {
                return Alignment::Mismatch {
                    expected,
                    got: checkpoint_id,
                }
            }
            Some(_) => {}
            None => self.current = Some(checkpoint_id),
        }
        self.arrived.insert(partition);
        self.try_complete()
    }

    /// Marks `partition` as ended; an ended partition never blocks alignment.
    pub fn on_end(&mut self, partition: PartitionId) -> Alignment<T> {
        self.finished.insert(partition);
        if self.current.is_some() {
            self.try_complete()
        } else {
            Alignment::Pending
        }
    }

    fn try_complete(&mut self) -> Alignment<T> {
        let reported = self.arrived.union(&self.finished).count();
        if reported < self.inputs as usize {
            return Alignment::Pending;
        }
        let Some(checkpoint_id) = self.current.take() else {
            return Alignment::Pending;
        };
        self.arrived.clear();
        Alignment::Aligned {
            checkpoint_id,
            buffered: self.buffered.drain(..).collect(),
        }
    }
}
