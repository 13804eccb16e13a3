//! One run of the dataflow: partition readers, key-owning workers, the sink
//! task and the checkpoint coordinator, from a restore point until every input
//! ends or a task fails.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use prometheus::{IntCounter, IntGauge};
use tally_core::metrics::{
    EVENTS_TOTAL, GLOBAL_WATERMARK_MS, LATE_DROPPED, LIVE_ACCUMULATORS, PARSE_SKIPPED, UNASSIGNABLE_DROPPED, WINDOWS_EMITTED,
};
use tally_core::{
    AccumulatorSnapshot, Checkpoint, CheckpointId, Error, Event, EventParser, Offset, PartitionId, PartitionReader,
    RawRecord, Result, SinkAdapter, WindowResult, WATERMARK_MIN,
};
use tally_ops::{
    Aggregator, Alignment, BarrierAligner, KeyedWindows, TumblingWindows, WatermarkGenerator, WatermarkPolicy,
    WatermarkRegister, WatermarkUpdate,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::coordinator::{Ack, CheckpointCoordinator};
use crate::job::Job;
use crate::route::route;

/// What flows from a reader to a worker, in partition order.
#[derive(Debug, Clone)]
pub(crate) enum Input {
    Event(Event),
    Watermark(WatermarkUpdate),
    Barrier(CheckpointId),
    End,
}

/// What flows from the workers to the sink task.
#[derive(Debug)]
enum SinkInput {
    Result(WindowResult),
    Barrier(CheckpointId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RunOutcome {
    pub restored_from: Option<CheckpointId>,
    pub last_checkpoint: Option<CheckpointId>,
}

fn tag_corruption(err: Error, id: CheckpointId) -> Error {
    match err {
        Error::StateCorruption { checkpoint: None, reason } => Error::StateCorruption {
            checkpoint: Some(id),
            reason,
        },
        other => other,
    }
}

/// Runs the pipeline once from `restored` (or from offset 0 everywhere).
pub(crate) async fn run_once<A: Aggregator>(job: &Job<A>, restored: Option<Checkpoint>) -> Result<RunOutcome> {
    let cfg = &job.config;
    let partitions = cfg.partition_count;
    let workers = partitions as usize;
    if job.source.partitions() != partitions {
        return Err(Error::Config(format!(
            "source has {} partitions, job is configured for {partitions}",
            job.source.partitions()
        )));
    }
    let restored_from = restored.as_ref().map(|c| c.id);
    let global = restored.as_ref().map_or(WATERMARK_MIN, Checkpoint::global_watermark);

    // open every partition before spawning anything so a failing source leaves nothing behind
    let mut readers = Vec::with_capacity(workers);
    for p in 0..partitions {
        let start = restored
            .as_ref()
            .and_then(|c| c.partition_offsets.get(&p).copied())
            .unwrap_or(0);
        readers.push((p, start, job.source.open(p, start).await?));
    }

    let mut owned: Vec<Vec<AccumulatorSnapshot>> = vec![Vec::new(); workers];
    if let Some(chk) = &restored {
        for snap in &chk.accumulators {
            owned[route(&snap.key, workers)].push(snap.clone());
        }
    }

    let assigner = TumblingWindows::new(cfg.window_size_ms);
    let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<Ack>();
    let (result_tx, result_rx) = mpsc::channel::<SinkInput>(cfg.channel_capacity);
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    let mut worker_txs = Vec::with_capacity(workers);
    let mut worker_tasks = Vec::with_capacity(workers);
    for (id, snapshots) in owned.into_iter().enumerate() {
        let mut windows = KeyedWindows::new(assigner, job.aggregator.clone());
        let mut register = WatermarkRegister::new(partitions);
        if let Some(chk) = &restored {
            windows
                .restore(&snapshots, global)
                .map_err(|e| tag_corruption(e, chk.id))?;
            register.restore(chk.watermarks.values().copied());
        }
        let (tx, rx) = mpsc::channel(cfg.channel_capacity);
        worker_txs.push(tx);
        worker_tasks.push((
            Worker {
                id,
                live_gauge: LIVE_ACCUMULATORS.with_label_values(&[&id.to_string()]),
                watermark_gauge: GLOBAL_WATERMARK_MS.with_label_values(&[&id.to_string()]),
                windows,
                register,
                aligner: BarrierAligner::new(partitions),
                results: result_tx.clone(),
                acks: ack_tx.clone(),
            },
            rx,
        ));
    }
    drop(result_tx);
    for (worker, rx) in worker_tasks {
        tasks.spawn(worker.run(rx));
    }
    tasks.spawn(run_sink(job.sink.clone(), result_rx, workers, ack_tx.clone()));

    let policy = WatermarkPolicy::new(cfg.allowed_lateness_ms);
    let mut controls = Vec::with_capacity(workers);
    for (partition, start, reader) in readers {
        let mut generator = WatermarkGenerator::new(partition, policy);
        if let Some(wm) = restored.as_ref().and_then(|c| c.watermarks.get(&partition)) {
            generator.restore(wm.timestamp);
        }
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        controls.push(ctl_tx);
        let task = PartitionTask {
            partition,
            events: EVENTS_TOTAL.with_label_values(&[&partition.to_string()]),
            parser: job.parser.clone(),
            generator,
            next_offset: start,
            workers: worker_txs.clone(),
            control: ctl_rx,
            acks: ack_tx.clone(),
            watermark_interval: cfg.watermark_interval,
        };
        tasks.spawn(task.run(reader));
    }
    drop(worker_txs);
    drop(ack_tx);
    info!(partitions, restored_from = ?restored_from, global_watermark = global, "pipeline started");

    let mut coordinator = CheckpointCoordinator::new(job.store.clone(), partitions, workers, restored_from);
    let mut ticker = tokio::time::interval_at(Instant::now() + cfg.checkpoint_interval, cfg.checkpoint_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(id) = coordinator.trigger() {
                    for ctl in &controls {
                        // a finished reader has dropped its receiver
                        let _ = ctl.send(id);
                    }
                }
            }
            Some(ack) = ack_rx.recv() => {
                if let Some(checkpoint) = coordinator.acknowledge(ack) {
                    debug!(checkpoint = checkpoint.id, accumulators = checkpoint.accumulators.len(), "checkpoint aligned");
                    coordinator.persist(checkpoint);
                }
            }
            Some((id, result)) = coordinator.next_write() => coordinator.on_write(id, result),
            done = tasks.join_next() => match done {
                None => break Ok(()),
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => break Err(e),
                Some(Err(e)) => break Err(Error::Task(e.to_string())),
            },
        }
    };

    if let Err(e) = &outcome {
        warn!(error = %e, "pipeline task failed, stopping remaining tasks");
        tasks.shutdown().await;
    }
    coordinator.drain().await;
    outcome.map(|()| RunOutcome {
        restored_from,
        last_checkpoint: coordinator.last_completed(),
    })
}

/// Reads one partition: parses, stamps event time, routes events to their
/// owning worker and publishes watermarks and barriers in-band.
struct PartitionTask {
    partition: PartitionId,
    events: IntCounter,
    parser: Arc<dyn EventParser>,
    generator: WatermarkGenerator,
    next_offset: Offset,
    workers: Vec<mpsc::Sender<(PartitionId, Input)>>,
    control: mpsc::UnboundedReceiver<CheckpointId>,
    acks: mpsc::UnboundedSender<Ack>,
    watermark_interval: Duration,
}

impl PartitionTask {
    #[instrument(name = "reader", skip_all, fields(partition = self.partition))]
    async fn run(mut self, mut reader: Box<dyn PartitionReader>) -> Result<()> {
        debug!(offset = self.next_offset, "reading");
        let mut ticker = tokio::time::interval(self.watermark_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            // the pending read survives ticks and barriers; only a completed read is replaced
            let mut next = reader.next();
            let record = loop {
                tokio::select! {
                    biased;
                    Some(id) = self.control.recv() => self.on_barrier(id).await?,
                    _ = ticker.tick() => self.publish_watermark().await?,
                    record = &mut next => break record?,
                }
            };
            match record {
                Some(raw) => self.on_record(raw).await?,
                None => return self.finish().await,
            }
        }
    }

    async fn on_record(&mut self, raw: RawRecord) -> Result<()> {
        self.next_offset = raw.offset + 1;
        match self.parser.parse(&raw) {
            Ok(event) => {
                self.events.inc();
                self.generator.extract_timestamp(&event);
                let owner = route(&event.key, self.workers.len());
                self.send(owner, Input::Event(event)).await
            }
            Err(e) => {
                PARSE_SKIPPED.inc();
                debug!(error = %e, "skipping record");
                Ok(())
            }
        }
    }

    async fn publish_watermark(&mut self) -> Result<()> {
        match self.generator.poll_watermark() {
            Some(update) => self.broadcast(Input::Watermark(update)).await,
            None => Ok(()),
        }
    }

    /// Publishes the current watermark first so the recorded one is exact, then
    /// acknowledges and forwards the barrier behind everything already sent.
    async fn on_barrier(&mut self, id: CheckpointId) -> Result<()> {
        self.publish_watermark().await?;
        let _ = self.acks.send(Ack::Reader {
            partition: self.partition,
            checkpoint_id: id,
            next_offset: self.next_offset,
            watermark: self.generator.last_emitted(),
        });
        self.broadcast(Input::Barrier(id)).await
    }

    async fn finish(&mut self) -> Result<()> {
        let update = self.generator.finish();
        self.broadcast(Input::Watermark(update)).await?;
        self.broadcast(Input::End).await?;
        let _ = self.acks.send(Ack::ReaderFinished {
            partition: self.partition,
        });
        info!(offset = self.next_offset, "partition exhausted");
        Ok(())
    }

    async fn send(&mut self, worker: usize, input: Input) -> Result<()> {
        self.workers[worker]
            .send((self.partition, input))
            .await
            .map_err(|_| Error::Task(format!("worker {worker} stopped")))
    }

    async fn broadcast(&mut self, input: Input) -> Result<()> {
        for worker in 0..self.workers.len() {
            self.send(worker, input.clone()).await?;
        }
        Ok(())
    }
}

/// Owns the keys routed to it: keyed windows, its view of every partition's
/// watermark, and barrier alignment across partitions.
struct Worker<A: Aggregator> {
    id: usize,
    live_gauge: IntGauge,
    watermark_gauge: IntGauge,
    windows: KeyedWindows<A>,
    register: WatermarkRegister,
    aligner: BarrierAligner<Input>,
    results: mpsc::Sender<SinkInput>,
    acks: mpsc::UnboundedSender<Ack>,
}

impl<A: Aggregator> Worker<A> {
    #[instrument(name = "worker", skip_all, fields(worker = self.id))]
    async fn run(mut self, mut input: mpsc::Receiver<(PartitionId, Input)>) -> Result<()> {
        let mut queue = VecDeque::new();
        while let Some(item) = input.recv().await {
            queue.push_back(item);
            while let Some((partition, msg)) = queue.pop_front() {
                if self.aligner.is_blocked(partition) {
                    self.aligner.buffer(partition, msg);
                    continue;
                }
                let alignment = match msg {
                    Input::Event(event) => {
                        self.on_event(&event)?;
                        continue;
                    }
                    Input::Watermark(update) => {
                        self.on_watermark(update).await?;
                        continue;
                    }
                    Input::Barrier(id) => self.aligner.on_barrier(partition, id),
                    Input::End => self.aligner.on_end(partition),
                };
                match alignment {
                    Alignment::Pending => {}
                    Alignment::Aligned {
                        checkpoint_id,
                        buffered,
                    } => {
                        let accumulators = self.windows.snapshot()?;
                        debug!(checkpoint = checkpoint_id, accumulators = accumulators.len(), replay = buffered.len(), "aligned");
                        let _ = self.acks.send(Ack::Worker {
                            worker: self.id,
                            checkpoint_id,
                            accumulators,
                        });
                        // results emitted before the cut must reach the sink before it acks
                        self.emit(SinkInput::Barrier(checkpoint_id)).await?;
                        for item in buffered.into_iter().rev() {
                            queue.push_front(item);
                        }
                    }
                    Alignment::Mismatch { expected, got } => {
                        return Err(Error::Task(format!(
                            "worker {} received barrier {got} while aligning {expected}",
                            self.id
                        )))
                    }
                }
            }
        }
        debug!(live = self.windows.live(), "inputs closed");
        Ok(())
    }

    fn on_event(&mut self, event: &Event) -> Result<()> {
        match self.windows.process(event) {
            Ok(_) => {}
            Err(Error::LateData {
                key,
                window_start,
                window_end,
                watermark,
            }) => {
                LATE_DROPPED.inc();
                debug!(%key, window_start, window_end, watermark, ts = event.timestamp, "dropping late event");
            }
            Err(Error::Unassignable { key, timestamp }) => {
                UNASSIGNABLE_DROPPED.inc();
                warn!(%key, timestamp, "dropping event outside every window");
            }
            Err(e) => return Err(e),
        }
        self.live_gauge.set(self.windows.live() as i64);
        Ok(())
    }

    async fn on_watermark(&mut self, update: WatermarkUpdate) -> Result<()> {
        let Some(global) = self.register.update(update) else {
            return Ok(());
        };
        self.watermark_gauge.set(global);
        for result in self.windows.on_watermark(global) {
            WINDOWS_EMITTED.inc();
            self.emit(SinkInput::Result(result)).await?;
        }
        self.live_gauge.set(self.windows.live() as i64);
        Ok(())
    }
}

impl<A: Aggregator> Worker<A> {
    async fn emit(&mut self, input: SinkInput) -> Result<()> {
        self.results
            .send(input)
            .await
            .map_err(|_| Error::Task("sink task stopped".into()))
    }
}

/// Hands results to the sink adapter. A checkpoint is acknowledged once its
/// barrier arrived from every worker and the adapter has been flushed.
#[instrument(name = "sink", skip_all)]
async fn run_sink(
    sink: Arc<Mutex<Box<dyn SinkAdapter>>>,
    mut input: mpsc::Receiver<SinkInput>,
    workers: usize,
    acks: mpsc::UnboundedSender<Ack>,
) -> Result<()> {
    let mut sink = sink.lock_owned().await;
    let mut barrier: Option<(CheckpointId, usize)> = None;
    while let Some(msg) = input.recv().await {
        match msg {
            SinkInput::Result(result) => sink.emit(result).await?,
            SinkInput::Barrier(id) => {
                let seen = match barrier {
                    Some((current, n)) if current == id => n + 1,
                    _ => 1,
                };
                if seen < workers {
                    barrier = Some((id, seen));
                    continue;
                }
                barrier = None;
                sink.flush().await?;
                let _ = acks.send(Ack::Sink { checkpoint_id: id });
            }
        }
    }
    sink.flush().await
}
