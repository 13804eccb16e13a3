use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tally_core::{Error, Result, SinkAdapter, WindowResult};
use tokio::io::AsyncWriteExt;

/// Writes each window result as a single JSON line to stdout or a file.
pub struct FileSink {
    pub path: Option<PathBuf>,
    file: Option<tokio::fs::File>,
}

impl FileSink {
    pub fn stdout() -> Self {
        Self { path: None, file: None }
    }

    pub fn append(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            file: None,
        }
    }

    async fn ensure_open(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if self.file.is_none() {
            let f = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .map_err(|e| Error::SinkUnavailable(format!("{}: {e}", path.display())))?;
            self.file = Some(f);
        }
        Ok(())
    }
}

#[async_trait]
impl SinkAdapter for FileSink {
    async fn emit(&mut self, result: WindowResult) -> Result<()> {
        let line = serde_json::to_string(&result)?;
        self.ensure_open().await?;
        match self.file.as_mut() {
            Some(f) => {
                let write = async {
                    f.write_all(line.as_bytes()).await?;
                    f.write_all(b"\n").await
                };
                if let Err(e) = write.await {
                    // reopen on the next emit
                    self.file = None;
                    return Err(Error::SinkUnavailable(e.to_string()));
                }
                tally_core::metrics::BYTES_WRITTEN
                    .with_label_values(&["file"])
                    .inc_by((line.len() + 1) as u64);
            }
            None => println!("{line}"),
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(f) = self.file.as_mut() {
            f.flush().await.map_err(|e| Error::SinkUnavailable(e.to_string()))?;
        }
        Ok(())
    }
}

/// Collects results in memory; clones share the same buffer.
#[derive(Clone, Default)]
pub struct CollectSink {
    results: Arc<Mutex<Vec<WindowResult>>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<WindowResult> {
        self.results.lock().clone()
    }
}

#[async_trait]
impl SinkAdapter for CollectSink {
    async fn emit(&mut self, result: WindowResult) -> Result<()> {
        self.results.lock().push(result);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(key: &str, value: serde_json::Value) -> WindowResult {
        WindowResult {
            key: key.into(),
            window_start: 0,
            window_end: 2_000,
            value,
        }
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let mut path = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        path.push(format!("tally_io_sink_{nanos}.jsonl"));

        let mut sink = FileSink::append(&path);
        sink.emit(result("pc", json!(3))).await.unwrap();
        sink.emit(result("mobile", json!(1))).await.unwrap();
        sink.flush().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<WindowResult> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines, vec![result("pc", json!(3)), result("mobile", json!(1))]);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn unwritable_path_is_sink_unavailable() {
        let mut sink = FileSink::append("/nonexistent/tally/out.jsonl");
        let err = sink.emit(result("pc", json!(1))).await.unwrap_err();
        assert!(matches!(err, Error::SinkUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn collect_sink_clones_share_results() {
        let sink = CollectSink::new();
        let mut writer = sink.clone();
        writer.emit(result("tablet", json!(2))).await.unwrap();
        assert_eq!(sink.results(), vec![result("tablet", json!(2))]);
    }
}
