//! tally-io: sources, sinks and parsers.
//! - `JsonEventParser`: JSON objects to events with a key and event-time field
//! - `FileSource`: one JSON Lines file per partition, offsets are line numbers
//! - `MemorySource`: bounded in-memory partitions
//! - `FileSink`: writes window results as JSON lines to stdout or a file
//! - `CollectSink`: keeps results in memory
//! - `KafkaSource` / `KafkaSink` behind the `kafka` feature

pub mod parse;
pub mod sink;
pub mod source;

#[cfg(feature = "kafka")]
mod kafka;

pub use parse::JsonEventParser;
pub use sink::{CollectSink, FileSink};
pub use source::{FileSource, MemorySource};

#[cfg(feature = "kafka")]
pub use kafka::{KafkaSink, KafkaSource};
