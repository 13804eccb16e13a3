use std::time::Duration;

use tally_core::config::{parse_duration_ms, PipelineConfig};
use tally_core::{Error, Result};

/// Fixed-delay restart policy: after a retryable failure the whole pipeline is
/// restarted from the last durable checkpoint, at most `max_attempts` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartStrategy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RestartStrategy {
    pub fn fixed_delay(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    pub fn none() -> Self {
        Self::fixed_delay(0, Duration::ZERO)
    }
}

impl Default for RestartStrategy {
    fn default() -> Self {
        Self::fixed_delay(4, Duration::from_secs(10))
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub window_size_ms: i64,
    pub allowed_lateness_ms: i64,
    pub watermark_interval: Duration,
    pub checkpoint_interval: Duration,
    pub restart: RestartStrategy,
    pub partition_count: u32,
    pub channel_capacity: usize,
}

impl JobConfig {
    /// Defaults: 1 ms lateness, 200 ms watermark cadence, 5 s checkpoints,
    /// 4 restarts 10 s apart.
    pub fn new(window_size_ms: i64, partition_count: u32) -> Self {
        Self {
            window_size_ms,
            allowed_lateness_ms: 1,
            watermark_interval: Duration::from_millis(200),
            checkpoint_interval: Duration::from_secs(5),
            restart: RestartStrategy::default(),
            partition_count,
            channel_capacity: 1024,
        }
    }

    pub fn with_allowed_lateness_ms(mut self, ms: i64) -> Self {
        self.allowed_lateness_ms = ms;
        self
    }

    pub fn with_watermark_interval(mut self, interval: Duration) -> Self {
        self.watermark_interval = interval;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_restart(mut self, restart: RestartStrategy) -> Self {
        self.restart = restart;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size_ms <= 0 {
            return Err(Error::Config(format!(
                "window size must be positive, got {} ms",
                self.window_size_ms
            )));
        }
        if self.allowed_lateness_ms < 0 {
            return Err(Error::Config("allowed lateness must not be negative".into()));
        }
        if self.partition_count == 0 {
            return Err(Error::Config("partition count must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel capacity must be at least 1".into()));
        }
        if self.watermark_interval.is_zero() || self.checkpoint_interval.is_zero() {
            return Err(Error::Config(
                "watermark and checkpoint intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn duration(field: &str, value: &str) -> Result<Duration> {
    let ms = parse_duration_ms(value).map_err(|e| Error::Config(format!("{field} = {value:?}: {e}")))?;
    if ms < 0 {
        return Err(Error::Config(format!("{field} must not be negative")));
    }
    Ok(Duration::from_millis(ms as u64))
}

impl TryFrom<&PipelineConfig> for JobConfig {
    type Error = Error;

    fn try_from(cfg: &PipelineConfig) -> Result<Self> {
        let p = &cfg.pipeline;
        let window_size_ms =
            parse_duration_ms(&p.window_size).map_err(|e| Error::Config(format!("window_size: {e}")))?;
        let allowed_lateness_ms = parse_duration_ms(&p.allowed_lateness)
            .map_err(|e| Error::Config(format!("allowed_lateness: {e}")))?;
        let job = JobConfig {
            window_size_ms,
            allowed_lateness_ms,
            watermark_interval: duration("watermark_interval", &p.watermark_interval)?,
            checkpoint_interval: duration("checkpoint_interval", &p.checkpoint_interval)?,
            restart: RestartStrategy::fixed_delay(
                p.restart_max_attempts,
                duration("restart_delay", &p.restart_delay)?,
            ),
            partition_count: p.partition_count,
            channel_capacity: p.channel_capacity,
        };
        job.validate()?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_reference_job() {
        let cfg = JobConfig::new(2_000, 3);
        assert_eq!(cfg.allowed_lateness_ms, 1);
        assert_eq!(cfg.checkpoint_interval, Duration::from_secs(5));
        assert_eq!(cfg.restart, RestartStrategy::fixed_delay(4, Duration::from_secs(10)));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn converts_from_pipeline_toml() {
        let text = r#"
[pipeline]
window_size = "2s"
watermark_interval = "50ms"
partition_count = 2
restart_max_attempts = 2
restart_delay = "1s"

[source]
kind = "file"
paths = ["a.jsonl", "b.jsonl"]
key_field = "terminal"
time_field = "ts"

[aggregate]
kind = "count"

[sink]
kind = "stdout"

[checkpoint]
dir = "/tmp/tally-chk"
"#;
        let cfg = PipelineConfig::from_toml_str(text).unwrap();
        let job = JobConfig::try_from(&cfg).unwrap();
        assert_eq!(job.window_size_ms, 2_000);
        assert_eq!(job.watermark_interval, Duration::from_millis(50));
        assert_eq!(job.restart.max_attempts, 2);
        assert_eq!(job.restart.delay, Duration::from_secs(1));
        assert_eq!(job.partition_count, 2);
    }

    #[test]
    fn rejects_zero_window() {
        let err = JobConfig::new(0, 1).validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
