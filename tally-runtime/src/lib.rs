//! tally-runtime: executes a keyed window aggregation over a partitioned source.
//!
//! One reader task per partition parses records, extracts event time and
//! routes each event to the worker owning its key. Watermarks and checkpoint
//! barriers travel in-band behind the events they cover. Workers hold the
//! window state; a single sink task receives finalized results. The
//! [`CheckpointCoordinator`] snapshots offsets, watermarks and open
//! accumulators on a timer, and [`Job`] restarts the whole pipeline from the
//! latest checkpoint on failure.
//!
//! ```no_run
//! use tally_io::{FileSink, JsonEventParser, MemorySource};
//! use tally_ops::Count;
//! use tally_runtime::{Job, JobConfig};
//! use tally_state::InMemoryCheckpointStore;
//!
//! # async fn demo() -> tally_core::Result<()> {
//! let source = MemorySource::from_json(vec![vec![serde_json::json!({"terminal": "pc", "ts": 100})]]);
//! let job = Job::builder(JobConfig::new(2_000, 1), Count)
//!     .source(source)
//!     .parser(JsonEventParser::new("terminal", "ts"))
//!     .sink(FileSink::stdout())
//!     .checkpoint_store(InMemoryCheckpointStore::default())
//!     .build()?;
//! let summary = job.run().await?;
//! println!("finished after {} restarts", summary.restarts);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod job;
mod pipeline;
pub mod route;

pub use config::{JobConfig, RestartStrategy};
pub use coordinator::CheckpointCoordinator;
pub use job::{Job, JobBuilder, RunSummary};
pub use route::{key_hash, route};
