use std::sync::Arc;

use tally_core::metrics::RESTARTS;
use tally_core::{
    Checkpoint, CheckpointId, CheckpointStore, Error, EventParser, EventSource, Result, SinkAdapter,
};
use tally_ops::Aggregator;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::config::JobConfig;
use crate::pipeline::{self, RunOutcome};

/// How a job ended when it ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Restarts performed before the successful run.
    pub restarts: u32,
    /// Checkpoint the successful run resumed from.
    pub restored_from: Option<CheckpointId>,
    /// Newest checkpoint persisted by the successful run (or the one it resumed from).
    pub last_checkpoint: Option<CheckpointId>,
}

/// A keyed tumbling-window aggregation with checkpointing and a fixed-delay
/// restart strategy.
pub struct Job<A: Aggregator> {
    pub(crate) config: JobConfig,
    pub(crate) source: Arc<dyn EventSource>,
    pub(crate) parser: Arc<dyn EventParser>,
    pub(crate) aggregator: Arc<A>,
    pub(crate) sink: Arc<Mutex<Box<dyn SinkAdapter>>>,
    pub(crate) store: Arc<dyn CheckpointStore>,
}

pub struct JobBuilder<A: Aggregator> {
    config: JobConfig,
    aggregator: Arc<A>,
    source: Option<Arc<dyn EventSource>>,
    parser: Option<Arc<dyn EventParser>>,
    sink: Option<Box<dyn SinkAdapter>>,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl<A: Aggregator> JobBuilder<A> {
    pub fn source<S: EventSource + 'static>(mut self, source: S) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn parser<P: EventParser + 'static>(mut self, parser: P) -> Self {
        self.parser = Some(Arc::new(parser));
        self
    }

    pub fn sink<K: SinkAdapter + 'static>(mut self, sink: K) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn checkpoint_store<C: CheckpointStore + 'static>(mut self, store: C) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn build(self) -> Result<Job<A>> {
        self.config.validate()?;
        let missing = |what: &str| Error::Config(format!("job has no {what}"));
        Ok(Job {
            source: self.source.ok_or_else(|| missing("source"))?,
            parser: self.parser.ok_or_else(|| missing("parser"))?,
            sink: Arc::new(Mutex::new(self.sink.ok_or_else(|| missing("sink"))?)),
            store: self.store.ok_or_else(|| missing("checkpoint store"))?,
            aggregator: self.aggregator,
            config: self.config,
        })
    }
}

impl<A: Aggregator> Job<A> {
    pub fn builder(config: JobConfig, aggregator: A) -> JobBuilder<A> {
        JobBuilder {
            config,
            aggregator: Arc::new(aggregator),
            source: None,
            parser: None,
            sink: None,
            store: None,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Runs until every partition is exhausted. Retryable failures restart the
    /// pipeline from the latest checkpoint after `restart.delay`; state
    /// corruption and configuration errors end the job immediately.
    #[instrument(skip_all, fields(window_ms = self.config.window_size_ms, partitions = self.config.partition_count))]
    pub async fn run(&self) -> Result<RunSummary> {
        let strategy = self.config.restart;
        let mut restarts = 0u32;
        loop {
            let err = match self.attempt().await {
                Ok(outcome) => {
                    info!(restarts, last_checkpoint = ?outcome.last_checkpoint, "job finished");
                    return Ok(RunSummary {
                        restarts,
                        restored_from: outcome.restored_from,
                        last_checkpoint: outcome.last_checkpoint,
                    });
                }
                Err(e) => e,
            };
            if !err.is_retryable() {
                error!(error = %err, "job failed");
                return Err(err);
            }
            if restarts >= strategy.max_attempts {
                error!(restarts, error = %err, "restart attempts exhausted");
                return Err(Error::RestartsExhausted {
                    attempts: restarts,
                    last_error: err.to_string(),
                });
            }
            restarts += 1;
            RESTARTS.inc();
            warn!(
                attempt = restarts,
                max_attempts = strategy.max_attempts,
                delay_ms = strategy.delay.as_millis() as u64,
                error = %err,
                "pipeline failed, restarting from last checkpoint"
            );
            tokio::time::sleep(strategy.delay).await;
        }
    }

    async fn attempt(&self) -> Result<RunOutcome> {
        let restored = self.restore_point().await?;
        pipeline::run_once(self, restored).await
    }

    /// Latest durable checkpoint, validated against this job's shape.
    async fn restore_point(&self) -> Result<Option<Checkpoint>> {
        let Some(checkpoint) = self.store.latest().await? else {
            info!("no checkpoint, reading every partition from the start");
            return Ok(None);
        };
        checkpoint.validate(self.config.partition_count, self.config.window_size_ms)?;
        info!(
            checkpoint = checkpoint.id,
            accumulators = checkpoint.accumulators.len(),
            global_watermark = checkpoint.global_watermark(),
            "restoring from checkpoint"
        );
        Ok(Some(checkpoint))
    }
}
