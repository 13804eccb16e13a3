use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Offset, PartitionId, Watermark, WATERMARK_MIN};
use crate::{Error, Result};

/// Identifier of a checkpoint; strictly increasing over the lifetime of a job.
pub type CheckpointId = u64;

/// Serialized state of one open accumulator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccumulatorSnapshot {
    pub key: String,
    pub window_start: i64,
    pub window_end: i64,
    pub value: serde_json::Value,
}

/// A globally consistent cut of the pipeline: where every partition should resume
/// reading, the watermark each partition had published, and every open accumulator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    #[serde(rename = "checkpoint_id")]
    pub id: CheckpointId,
    pub created_at: DateTime<Utc>,
    /// Next offset to read, per partition.
    pub partition_offsets: BTreeMap<PartitionId, Offset>,
    pub watermarks: BTreeMap<PartitionId, Watermark>,
    pub accumulators: Vec<AccumulatorSnapshot>,
}

impl Checkpoint {
    pub fn new(id: CheckpointId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            partition_offsets: BTreeMap::new(),
            watermarks: BTreeMap::new(),
            accumulators: Vec::new(),
        }
    }

    /// Minimum watermark across all recorded partitions.
    pub fn global_watermark(&self) -> i64 {
        self.watermarks
            .values()
            .map(|w| w.timestamp)
            .min()
            .unwrap_or(WATERMARK_MIN)
    }

    /// Checks that this checkpoint can be restored into a pipeline with
    /// `partitions` partitions and tumbling windows of `window_size_ms`.
    ///
    /// Any violation is reported as [`Error::StateCorruption`]; resuming from such a
    /// snapshot would silently under- or over-count.
    pub fn validate(&self, partitions: u32, window_size_ms: i64) -> Result<()> {
        let corrupt = |reason: String| Error::StateCorruption {
            checkpoint: Some(self.id),
            reason,
        };

        for p in 0..partitions {
            if !self.partition_offsets.contains_key(&p) {
                return Err(corrupt(format!("missing offset for partition {p}")));
            }
            match self.watermarks.get(&p) {
                None => return Err(corrupt(format!("missing watermark for partition {p}"))),
                Some(wm) if wm.partition != p => {
                    return Err(corrupt(format!(
                        "watermark stored under partition {p} belongs to partition {}",
                        wm.partition
                    )))
                }
                Some(_) => {}
            }
        }
        if let Some(p) = self
            .partition_offsets
            .keys()
            .chain(self.watermarks.keys())
            .find(|p| **p >= partitions)
        {
            return Err(corrupt(format!(
                "partition {p} recorded but the pipeline has {partitions} partitions"
            )));
        }

        if window_size_ms <= 0 {
            return Err(Error::Config(format!("window size must be positive, got {window_size_ms}")));
        }
        let global = self.global_watermark();
        let mut seen = HashSet::with_capacity(self.accumulators.len());
        for acc in &self.accumulators {
            // same window the assigner produces for its start, including the saturated end near i64::MAX
            if acc.window_start.rem_euclid(window_size_ms) != 0
                || acc.window_end != acc.window_start.saturating_add(window_size_ms)
            {
                return Err(corrupt(format!(
                    "accumulator for key {:?} has window [{}, {}) which is not aligned to size {window_size_ms}",
                    acc.key, acc.window_start, acc.window_end
                )));
            }
            if acc.window_end <= global {
                return Err(corrupt(format!(
                    "accumulator for key {:?} window [{}, {}) should already have been emitted at watermark {global}",
                    acc.key, acc.window_start, acc.window_end
                )));
            }
            if !seen.insert((acc.key.as_str(), acc.window_start)) {
                return Err(corrupt(format!(
                    "duplicate accumulator for key {:?} window [{}, {})",
                    acc.key, acc.window_start, acc.window_end
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        let mut cp = Checkpoint::new(7);
        cp.created_at = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        for p in 0..2 {
            cp.partition_offsets.insert(p, 2);
            cp.watermarks.insert(p, Watermark::new(p, 899));
        }
        cp.accumulators.push(AccumulatorSnapshot {
            key: "A".into(),
            window_start: 0,
            window_end: 2000,
            value: serde_json::json!(2),
        });
        cp
    }

    #[test]
    fn checkpoint_json_uses_persisted_field_names() {
        let cp = sample();
        let v = serde_json::to_value(&cp).unwrap();
        assert_eq!(v["checkpoint_id"], serde_json::json!(7));
        assert!(v.get("created_at").is_some());
        assert_eq!(v["partition_offsets"]["1"], serde_json::json!(2));
        let back: Checkpoint = serde_json::from_value(v).unwrap();
        assert_eq!(back, cp);
    }

    #[test]
    fn valid_checkpoint_passes() {
        sample().validate(2, 2000).unwrap();
    }

    #[test]
    fn missing_partition_is_corruption() {
        let cp = sample();
        let err = cp.validate(3, 2000).unwrap_err();
        assert!(matches!(err, Error::StateCorruption { checkpoint: Some(7), .. }));
    }

    #[test]
    fn misaligned_window_is_corruption() {
        let mut cp = sample();
        cp.accumulators[0].window_start = 100;
        cp.accumulators[0].window_end = 2100;
        assert!(cp.validate(2, 2000).is_err());
    }

    #[test]
    fn extreme_window_bounds_are_corruption() {
        let mut cp = sample();
        cp.accumulators[0].window_start = i64::MIN;
        cp.accumulators[0].window_end = 1;
        let err = cp.validate(2, 2000).unwrap_err();
        assert!(matches!(err, Error::StateCorruption { checkpoint: Some(7), .. }));

        cp.accumulators[0].window_start = 0;
        cp.accumulators[0].window_end = i64::MIN;
        assert!(matches!(cp.validate(2, 2000), Err(Error::StateCorruption { .. })));
    }

    #[test]
    fn last_window_before_end_of_time_is_valid() {
        let mut cp = sample();
        let start = i64::MAX.div_euclid(2000) * 2000;
        cp.accumulators[0].window_start = start;
        cp.accumulators[0].window_end = i64::MAX;
        cp.validate(2, 2000).unwrap();
    }

    #[test]
    fn duplicate_accumulator_is_corruption() {
        let mut cp = sample();
        let dup = cp.accumulators[0].clone();
        cp.accumulators.push(dup);
        assert!(cp.validate(2, 2000).is_err());
    }

    #[test]
    fn window_behind_watermark_is_corruption() {
        let mut cp = sample();
        for wm in cp.watermarks.values_mut() {
            wm.timestamp = 2500;
        }
        assert!(cp.validate(2, 2000).is_err());
    }
}
