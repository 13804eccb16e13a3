use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tally_core::{Error, EventSource, Offset, PartitionId, PartitionReader, RawRecord, Result};
use tokio::io::AsyncBufReadExt;
use tracing::debug;

/// Bounded in-memory partitions, mostly for tests and demos.
#[derive(Clone, Default)]
pub struct MemorySource {
    partitions: Arc<Vec<Vec<Vec<u8>>>>,
}

impl MemorySource {
    pub fn new(partitions: Vec<Vec<Vec<u8>>>) -> Self {
        Self {
            partitions: Arc::new(partitions),
        }
    }

    /// One JSON document per record.
    pub fn from_json(partitions: Vec<Vec<serde_json::Value>>) -> Self {
        Self::new(
            partitions
                .into_iter()
                .map(|p| p.into_iter().map(|v| v.to_string().into_bytes()).collect())
                .collect(),
        )
    }
}

struct MemoryReader {
    partition: PartitionId,
    records: Arc<Vec<Vec<Vec<u8>>>>,
    next: Offset,
}

#[async_trait]
impl PartitionReader for MemoryReader {
    async fn next(&mut self) -> Result<Option<RawRecord>> {
        let records = &self.records[self.partition as usize];
        let Some(payload) = records.get(self.next as usize) else {
            return Ok(None);
        };
        let rec = RawRecord::new(self.partition, self.next, payload.clone());
        self.next += 1;
        Ok(Some(rec))
    }
}

#[async_trait]
impl EventSource for MemorySource {
    fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    async fn open(&self, partition: PartitionId, start_offset: Offset) -> Result<Box<dyn PartitionReader>> {
        if partition as usize >= self.partitions.len() {
            return Err(Error::SourceUnavailable(format!("no partition {partition}")));
        }
        Ok(Box::new(MemoryReader {
            partition,
            records: self.partitions.clone(),
            next: start_offset,
        }))
    }
}

/// Reads one JSON Lines file per partition; the offset of a record is its
/// zero-based line number.
#[derive(Clone)]
pub struct FileSource {
    pub paths: Vec<PathBuf>,
}

impl FileSource {
    pub fn jsonl(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }
}

struct FileReader {
    partition: PartitionId,
    lines: tokio::io::Lines<tokio::io::BufReader<tokio::fs::File>>,
    next: Offset,
}

#[async_trait]
impl PartitionReader for FileReader {
    async fn next(&mut self) -> Result<Option<RawRecord>> {
        let line = self
            .lines
            .next_line()
            .await
            .map_err(|e| Error::SourceUnavailable(format!("partition {}: {e}", self.partition)))?;
        Ok(line.map(|l| {
            let rec = RawRecord::new(self.partition, self.next, l.into_bytes());
            self.next += 1;
            rec
        }))
    }
}

#[async_trait]
impl EventSource for FileSource {
    fn partitions(&self) -> u32 {
        self.paths.len() as u32
    }

    async fn open(&self, partition: PartitionId, start_offset: Offset) -> Result<Box<dyn PartitionReader>> {
        let path = self
            .paths
            .get(partition as usize)
            .ok_or_else(|| Error::SourceUnavailable(format!("no path for partition {partition}")))?;
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::SourceUnavailable(format!("{}: {e}", path.display())))?;
        let mut lines = tokio::io::BufReader::new(file).lines();
        // offsets are line numbers, so resuming means skipping what was consumed
        for _ in 0..start_offset {
            let skipped = lines
                .next_line()
                .await
                .map_err(|e| Error::SourceUnavailable(format!("{}: {e}", path.display())))?;
            if skipped.is_none() {
                break;
            }
        }
        debug!(partition, start_offset, path = %path.display(), "opened file partition");
        Ok(Box::new(FileReader {
            partition,
            lines,
            next: start_offset,
        }))
    }
}
