use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_name() -> String {
    "tally".into()
}
fn default_allowed_lateness() -> String {
    "1ms".into()
}
fn default_watermark_interval() -> String {
    "200ms".into()
}
fn default_checkpoint_interval() -> String {
    "5s".into()
}
fn default_restart_max_attempts() -> u32 {
    4
}
fn default_restart_delay() -> String {
    "10s".into()
}
fn default_channel_capacity() -> usize {
    1024
}
fn default_retained() -> usize {
    3
}
fn default_store_kind() -> String {
    "dir".into()
}

/// Event-time and fault-tolerance settings of a pipeline.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineSection {
    #[serde(default = "default_name")]
    pub name: String,
    pub window_size: String, // e.g., "2s"
    #[serde(default = "default_allowed_lateness")]
    pub allowed_lateness: String,
    #[serde(default = "default_watermark_interval")]
    pub watermark_interval: String,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: String,
    #[serde(default = "default_restart_max_attempts")]
    pub restart_max_attempts: u32,
    #[serde(default = "default_restart_delay")]
    pub restart_delay: String,
    pub partition_count: u32,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    pub kind: String,        // "file" | "kafka"
    #[serde(default)]
    pub paths: Vec<PathBuf>, // one JSONL file per partition
    #[serde(default)]
    pub brokers: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    pub key_field: String,
    pub time_field: String, // epoch ms or RFC3339
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AggregateConfig {
    pub kind: String, // count|sum|latest|distinct
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SinkConfig {
    pub kind: String, // "stdout" | "file" | "kafka"
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub brokers: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CheckpointStoreConfig {
    #[serde(default = "default_store_kind")]
    pub kind: String, // "dir" | "rocksdb"
    pub dir: PathBuf,
    #[serde(default = "default_retained")]
    pub retained: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub source: SourceConfig,
    pub aggregate: AggregateConfig,
    pub sink: SinkConfig,
    pub checkpoint: CheckpointStoreConfig,
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        let cfg: PipelineConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let p = &self.pipeline;
        if p.partition_count == 0 {
            anyhow::bail!("pipeline.partition_count must be at least 1");
        }
        if parse_duration_ms(&p.window_size)? <= 0 {
            anyhow::bail!("pipeline.window_size must be positive, got {}", p.window_size);
        }
        for (name, value) in [
            ("allowed_lateness", &p.allowed_lateness),
            ("watermark_interval", &p.watermark_interval),
            ("checkpoint_interval", &p.checkpoint_interval),
            ("restart_delay", &p.restart_delay),
        ] {
            if parse_duration_ms(value)? < 0 {
                anyhow::bail!("pipeline.{name} must not be negative, got {value}");
            }
        }
        if parse_duration_ms(&p.watermark_interval)? == 0 || parse_duration_ms(&p.checkpoint_interval)? == 0 {
            anyhow::bail!("watermark_interval and checkpoint_interval must be non-zero");
        }
        if p.channel_capacity == 0 {
            anyhow::bail!("pipeline.channel_capacity must be at least 1");
        }

        match self.source.kind.as_str() {
            "file" => {
                if self.source.paths.len() != p.partition_count as usize {
                    anyhow::bail!(
                        "file source needs one path per partition: {} paths for {} partitions",
                        self.source.paths.len(),
                        p.partition_count
                    );
                }
            }
            "kafka" => {
                if self.source.brokers.is_none() || self.source.topic.is_none() {
                    anyhow::bail!("kafka source needs `brokers` and `topic`");
                }
            }
            other => anyhow::bail!("unsupported source kind: {other}"),
        }

        match self.aggregate.kind.as_str() {
            "count" => {}
            "sum" | "latest" | "distinct" => {
                if self.aggregate.field.is_none() {
                    anyhow::bail!("aggregate.field must be set for `{}`", self.aggregate.kind);
                }
            }
            other => anyhow::bail!("unsupported aggregate kind: {other}"),
        }

        match self.sink.kind.as_str() {
            "stdout" => {}
            "file" => {
                if self.sink.path.is_none() {
                    anyhow::bail!("file sink needs `path`");
                }
            }
            "kafka" => {
                if self.sink.brokers.is_none() || self.sink.topic.is_none() {
                    anyhow::bail!("kafka sink needs `brokers` and `topic`");
                }
            }
            other => anyhow::bail!("unsupported sink kind: {other}"),
        }

        if !matches!(self.checkpoint.kind.as_str(), "dir" | "rocksdb") {
            anyhow::bail!("unsupported checkpoint store kind: {}", self.checkpoint.kind);
        }
        if self.checkpoint.retained == 0 {
            anyhow::bail!("checkpoint.retained must be at least 1");
        }
        Ok(())
    }
}

pub fn parse_duration_ms(s: &str) -> anyhow::Result<i64> {
    // very small parser for values like "10s", "500ms", "2m"
    let s = s.trim();
    let (num, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1_000)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60_000)
    } else if let Some(num) = s.strip_suffix('h') {
        (num, 3_600_000)
    } else {
        // default assume seconds
        (s, 1_000)
    };
    num.trim()
        .parse::<i64>()?
        .checked_mul(unit_ms)
        .ok_or_else(|| anyhow::anyhow!("duration {s:?} is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [pipeline]
        window_size = "2s"
        partition_count = 2

        [source]
        kind = "file"
        paths = ["p0.jsonl", "p1.jsonl"]
        key_field = "terminal"
        time_field = "ts"

        [aggregate]
        kind = "count"

        [sink]
        kind = "stdout"

        [checkpoint]
        dir = "/tmp/tally-cp"
    "#;

    #[test]
    fn defaults_follow_reference_job() {
        let cfg = PipelineConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.pipeline.allowed_lateness, "1ms");
        assert_eq!(cfg.pipeline.watermark_interval, "200ms");
        assert_eq!(cfg.pipeline.checkpoint_interval, "5s");
        assert_eq!(cfg.pipeline.restart_max_attempts, 4);
        assert_eq!(cfg.pipeline.restart_delay, "10s");
        assert_eq!(cfg.checkpoint.retained, 3);
        assert_eq!(cfg.checkpoint.kind, "dir");
    }

    #[test]
    fn path_count_must_match_partitions() {
        let text = SAMPLE.replace("partition_count = 2", "partition_count = 3");
        assert!(PipelineConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn sum_requires_field() {
        let text = SAMPLE.replace(r#"kind = "count""#, r#"kind = "sum""#);
        assert!(PipelineConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn zero_window_rejected() {
        let text = SAMPLE.replace(r#"window_size = "2s""#, r#"window_size = "0ms""#);
        assert!(PipelineConfig::from_toml_str(&text).is_err());
    }

    #[test]
    fn parses_duration_suffixes() {
        assert_eq!(parse_duration_ms("500ms").unwrap(), 500);
        assert_eq!(parse_duration_ms("2s").unwrap(), 2_000);
        assert_eq!(parse_duration_ms("3m").unwrap(), 180_000);
        assert_eq!(parse_duration_ms("1h").unwrap(), 3_600_000);
        assert_eq!(parse_duration_ms("7").unwrap(), 7_000);
        assert!(parse_duration_ms("soon").is_err());
    }

    #[test]
    fn oversized_duration_is_an_error() {
        assert!(parse_duration_ms("9999999999999999h").is_err());
        assert!(parse_duration_ms("9223372036854775807s").is_err());
        assert_eq!(parse_duration_ms("9223372036854775807ms").unwrap(), i64::MAX);
    }
}
