use serde::{Deserialize, Serialize};

/// Index of a source partition, `0..partition_count`.
pub type PartitionId = u32;

/// Position of a record within its partition.
pub type Offset = u64;

/// Watermark value before any event has been observed. No window can close on it.
pub const WATERMARK_MIN: i64 = i64::MIN;

/// Watermark value emitted by bounded sources at end of input; closes every window.
pub const END_OF_INPUT: i64 = i64::MAX;

/// A raw record as produced by a source adapter, before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub partition: PartitionId,
    pub offset: Offset,
    pub payload: Vec<u8>,
}

impl RawRecord {
    pub fn new(partition: PartitionId, offset: Offset, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            payload: payload.into(),
        }
    }

    /// Builds a record whose payload is the JSON encoding of `value`.
    pub fn json(partition: PartitionId, offset: Offset, value: &serde_json::Value) -> Self {
        Self::new(partition, offset, value.to_string().into_bytes())
    }
}

/// A parsed event with explicit event-time (epoch milliseconds).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub key: String,
    pub timestamp: i64,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(key: impl Into<String>, timestamp: i64, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            timestamp,
            payload,
        }
    }
}

/// Claim that no future event on `partition` carries a timestamp below `timestamp`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Watermark {
    pub partition: PartitionId,
    pub timestamp: i64,
}

impl Watermark {
    pub fn new(partition: PartitionId, timestamp: i64) -> Self {
        Self {
            partition,
            timestamp,
        }
    }

    pub fn is_end_of_input(&self) -> bool {
        self.timestamp == END_OF_INPUT
    }
}

/// Final aggregate for one (key, window) pair, handed to the sink exactly once per run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowResult {
    pub key: String,
    pub window_start: i64,
    pub window_end: i64,
    pub value: serde_json::Value,
}
