//! Counts events per terminal type (pc, mobile, tablet) in 2 second event-time windows.
//! Run:
//!   cargo run -p tally-examples --bin terminal_types
//!   cargo run -p tally-examples --bin terminal_types -- p0.jsonl p1.jsonl
//! Input JSONL fields: terminal (string), ts (epoch ms or RFC3339). Without
//! arguments three partitions of generated events are used.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tally_core::EventSource;
use tally_io::{FileSink, FileSource, JsonEventParser, MemorySource};
use tally_ops::Count;
use tally_runtime::{Job, JobConfig};
use tally_state::InMemoryCheckpointStore;

const TERMINALS: [&str; 3] = ["pc", "mobile", "tablet"];

fn generated(partitions: u32, per_partition: i64) -> MemorySource {
    MemorySource::from_json(
        (0..partitions as i64)
            .map(|p| {
                (0..per_partition)
                    .map(|i| {
                        serde_json::json!({
                            "terminal": TERMINALS[((i * 5 + p) % 3) as usize],
                            "ts": i * 150 + p * 20,
                        })
                    })
                    .collect()
            })
            .collect(),
    )
}

async fn run<S: EventSource + 'static>(source: S) -> Result<()> {
    let partitions = source.partitions();
    let config = JobConfig::new(2_000, partitions)
        .with_watermark_interval(Duration::from_millis(50))
        .with_checkpoint_interval(Duration::from_millis(500));
    let job = Job::builder(config, Count)
        .source(source)
        .parser(JsonEventParser::new("terminal", "ts"))
        .sink(FileSink::stdout())
        .checkpoint_store(InMemoryCheckpointStore::default())
        .build()?;
    let summary = job.run().await?;
    eprintln!("done: restarts={} last_checkpoint={:?}", summary.restarts, summary.last_checkpoint);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        run(generated(3, 100)).await
    } else {
        run(FileSource::jsonl(paths)).await
    }
}
