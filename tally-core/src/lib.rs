//! tally-core: fundamental types and traits for keyed event-time window aggregation.
//!
//! This crate defines the data model and the seams the rest of the workspace plugs into:
//! - `Event`, `RawRecord`, `Watermark`, `WindowResult`
//! - `Checkpoint` and its persisted layout
//! - Traits: `EventSource`, `PartitionReader`, `EventParser`, `SinkAdapter`, `CheckpointStore`
//! - The error taxonomy shared by every stage
//!
//! Quick example:
//! ```no_run
//! use tally_core::{Event, EventParser, ParseError, RawRecord};
//!
//! struct CsvParser;
//!
//! impl EventParser for CsvParser {
//!     fn parse(&self, raw: &RawRecord) -> Result<Event, ParseError> {
//!         let text = std::str::from_utf8(&raw.payload)
//!             .map_err(|e| ParseError::malformed(raw, e.to_string()))?;
//!         let (key, ts) = text
//!             .split_once(',')
//!             .ok_or_else(|| ParseError::malformed(raw, "expected `key,timestamp`"))?;
//!         let ts = ts
//!             .trim()
//!             .parse::<i64>()
//!             .map_err(|e| ParseError::malformed(raw, e.to_string()))?;
//!         Ok(Event::new(key, ts, serde_json::Value::Null))
//!     }
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod event;
pub mod metrics;

use async_trait::async_trait;

pub use checkpoint::{AccumulatorSnapshot, Checkpoint, CheckpointId};
pub use event::{
    Event, Offset, PartitionId, RawRecord, Watermark, WindowResult, END_OF_INPUT, WATERMARK_MIN,
};

/// A raw record that could not be turned into an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("record {partition}@{offset} is malformed: {reason}")]
    Malformed {
        partition: PartitionId,
        offset: Offset,
        reason: String,
    },
    #[error("record {partition}@{offset} has no usable `{field}` field")]
    MissingField {
        partition: PartitionId,
        offset: Offset,
        field: String,
    },
}

impl ParseError {
    pub fn malformed(raw: &RawRecord, reason: impl Into<String>) -> Self {
        ParseError::Malformed {
            partition: raw.partition,
            offset: raw.offset,
            reason: reason.into(),
        }
    }

    pub fn missing_field(raw: &RawRecord, field: impl Into<String>) -> Self {
        ParseError::MissingField {
            partition: raw.partition,
            offset: raw.offset,
            field: field.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("late event for key {key:?}: window [{window_start}, {window_end}) closed at watermark {watermark}")]
    LateData {
        key: String,
        window_start: i64,
        window_end: i64,
        watermark: i64,
    },
    #[error("event for key {key:?} at {timestamp} falls outside every representable window")]
    Unassignable { key: String, timestamp: i64 },
    #[error("checkpoint {id} could not be written: {reason}")]
    CheckpointWrite { id: CheckpointId, reason: String },
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),
    #[error("checkpoint state is corrupt ({reason}); refusing to resume, inspect or remove checkpoint {checkpoint:?} before restarting")]
    StateCorruption {
        checkpoint: Option<CheckpointId>,
        reason: String,
    },
    #[error("pipeline still failing after {attempts} restarts, giving up; last error: {last_error}")]
    RestartsExhausted { attempts: u32, last_error: String },
    #[error("pipeline task failed: {0}")]
    Task(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the fixed-delay restart strategy may retry after this error.
    ///
    /// Event-level errors never reach the restart loop; state corruption must be
    /// resolved by an operator.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::SourceUnavailable(_)
            | Error::SinkUnavailable(_)
            | Error::Task(_)
            | Error::Io(_)
            | Error::Anyhow(_) => true,
            Error::Parse(_)
            | Error::LateData { .. }
            | Error::Unassignable { .. }
            | Error::CheckpointWrite { .. }
            | Error::StateCorruption { .. }
            | Error::RestartsExhausted { .. }
            | Error::Config(_)
            | Error::Json(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reads one partition sequentially from a start offset.
#[async_trait]
pub trait PartitionReader: Send {
    /// Next record, or `None` once a bounded partition is exhausted.
    ///
    /// The runtime keeps a pending call alive across watermark ticks and
    /// barriers; the future is only dropped when the pipeline shuts down.
    async fn next(&mut self) -> Result<Option<RawRecord>>;
}

/// A partitioned, replayable source of raw records.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn partitions(&self) -> u32;

    /// Opens `partition` so that the first record returned has offset `start_offset`.
    async fn open(&self, partition: PartitionId, start_offset: Offset) -> Result<Box<dyn PartitionReader>>;
}

/// Domain mapping from a raw record to an [`Event`].
pub trait EventParser: Send + Sync {
    fn parse(&self, raw: &RawRecord) -> std::result::Result<Event, ParseError>;
}

/// Closure adapter for [`EventParser`].
pub struct ParseFn<F>(pub F);

impl<F> ParseFn<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventParser for ParseFn<F>
where
    F: Fn(&RawRecord) -> std::result::Result<Event, ParseError> + Send + Sync,
{
    fn parse(&self, raw: &RawRecord) -> std::result::Result<Event, ParseError> {
        (self.0)(raw)
    }
}

/// Receives finalized window results.
#[async_trait]
pub trait SinkAdapter: Send {
    async fn emit(&mut self, result: WindowResult) -> Result<()>;
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Durable storage for completed checkpoints, keyed by checkpoint id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists a completed checkpoint. A checkpoint is only visible through
    /// [`CheckpointStore::latest`] once this returns `Ok`.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;
    /// Most recent fully written checkpoint.
    async fn latest(&self) -> Result<Option<Checkpoint>>;
    /// Ids of retained checkpoints, ascending.
    async fn list(&self) -> Result<Vec<CheckpointId>>;
}

#[async_trait]
impl<S: EventSource + ?Sized> EventSource for std::sync::Arc<S> {
    fn partitions(&self) -> u32 {
        (**self).partitions()
    }

    async fn open(&self, partition: PartitionId, start_offset: Offset) -> Result<Box<dyn PartitionReader>> {
        (**self).open(partition, start_offset).await
    }
}

#[async_trait]
impl<K: SinkAdapter + ?Sized> SinkAdapter for Box<K> {
    async fn emit(&mut self, result: WindowResult) -> Result<()> {
        (**self).emit(result).await
    }

    async fn flush(&mut self) -> Result<()> {
        (**self).flush().await
    }
}

#[async_trait]
impl<C: CheckpointStore + ?Sized> CheckpointStore for std::sync::Arc<C> {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        (**self).save(checkpoint).await
    }

    async fn latest(&self) -> Result<Option<Checkpoint>> {
        (**self).latest().await
    }

    async fn list(&self) -> Result<Vec<CheckpointId>> {
        (**self).list().await
    }
}

pub mod prelude {
    pub use super::{
        Checkpoint, CheckpointStore, Error, Event, EventParser, EventSource, PartitionReader, RawRecord,
        Result, SinkAdapter, Watermark, WindowResult,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(Error::SourceUnavailable("broker down".into()).is_retryable());
        assert!(Error::SinkUnavailable("disk full".into()).is_retryable());
        assert!(!Error::StateCorruption {
            checkpoint: Some(3),
            reason: "bad".into()
        }
        .is_retryable());
        assert!(!Error::RestartsExhausted {
            attempts: 4,
            last_error: "x".into()
        }
        .is_retryable());
        assert!(!Error::Config("window_size must be positive".into()).is_retryable());
        assert!(!Error::Unassignable {
            key: "A".into(),
            timestamp: i64::MIN
        }
        .is_retryable());
    }

    #[test]
    fn parse_fn_adapts_closures() {
        let parser = ParseFn::new(|raw: &RawRecord| -> std::result::Result<Event, ParseError> {
            let s = std::str::from_utf8(&raw.payload).map_err(|e| ParseError::malformed(raw, e.to_string()))?;
            Ok(Event::new(s, raw.offset as i64, serde_json::Value::Null))
        });
        let ev = parser.parse(&RawRecord::new(0, 42, "k")).unwrap();
        assert_eq!(ev.key, "k");
        assert_eq!(ev.timestamp, 42);
        let err = parser.parse(&RawRecord::new(1, 5, vec![0xff, 0xfe])).unwrap_err();
        assert!(matches!(err, ParseError::Malformed { partition: 1, offset: 5, .. }));
    }
}
