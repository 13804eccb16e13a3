use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use clap::{Parser, Subcommand};
use tally_core::config::PipelineConfig;
use tally_core::{CheckpointStore, EventSource, SinkAdapter};
use tally_io::{FileSink, FileSource, JsonEventParser};
use tally_ops::{Aggregator, Count, DistinctCount, Latest, Sum};
use tally_runtime::{Job, JobConfig};
use tally_state::DirCheckpointStore;

#[derive(Parser, Debug)]
#[command(name = "tally", version, about = "Keyed event-time window aggregation", disable_help_subcommand = false)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline from a pipeline.toml
    Run {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 0)]
        http_port: u16,
    },
    /// Serve only /metrics
    Serve {
        #[arg(long, default_value_t = 9898)]
        port: u16,
    },
    /// Print the latest checkpoint in a checkpoint directory
    Inspect {
        #[arg(short, long)]
        dir: PathBuf,
    },
}

fn app() -> Router {
    Router::new().route("/metrics", get(metrics))
}

async fn metrics() -> String {
    tally_core::metrics::render_prometheus()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port } => {
            let addr = SocketAddr::from(([127, 0, 0, 1], port));
            tracing::info!("serving /metrics on {}", addr);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app()).await?;
            Ok(())
        }
        Commands::Run { config, http_port } => {
            if http_port != 0 {
                let addr = SocketAddr::from(([127, 0, 0, 1], http_port));
                let listener = tokio::net::TcpListener::bind(addr).await?;
                tracing::info!("serving /metrics on {}", addr);
                tokio::spawn(async move {
                    let _ = axum::serve(listener, app()).await;
                });
            }
            run_pipeline(config).await
        }
        Commands::Inspect { dir } => inspect(dir).await,
    }
}

async fn run_pipeline(path: PathBuf) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let cfg = PipelineConfig::from_toml_str(&text)?;
    let job_cfg = JobConfig::try_from(&cfg)?;
    tracing::info!(pipeline = %cfg.pipeline.name, aggregate = %cfg.aggregate.kind, "loaded pipeline config");

    let field = cfg.aggregate.field.clone().unwrap_or_default();
    match cfg.aggregate.kind.as_str() {
        "count" => run_job(&cfg, job_cfg, Count).await,
        "sum" => run_job(&cfg, job_cfg, Sum::new(field)).await,
        "latest" => run_job(&cfg, job_cfg, Latest::new(field)).await,
        "distinct" => run_job(&cfg, job_cfg, DistinctCount::new(field)).await,
        other => anyhow::bail!("unsupported aggregate kind: {other}"),
    }
}

async fn run_job<A: Aggregator>(cfg: &PipelineConfig, job_cfg: JobConfig, aggregator: A) -> anyhow::Result<()> {
    let job = Job::builder(job_cfg, aggregator)
        .source(build_source(cfg)?)
        .parser(JsonEventParser::new(&cfg.source.key_field, &cfg.source.time_field))
        .sink(build_sink(cfg)?)
        .checkpoint_store(build_store(cfg)?)
        .build()?;
    let summary = job.run().await?;
    tracing::info!(
        restarts = summary.restarts,
        last_checkpoint = ?summary.last_checkpoint,
        "pipeline finished"
    );
    Ok(())
}

fn build_source(cfg: &PipelineConfig) -> anyhow::Result<Arc<dyn EventSource>> {
    match cfg.source.kind.as_str() {
        "file" => Ok(Arc::new(FileSource::jsonl(cfg.source.paths.clone()))),
        #[cfg(feature = "kafka")]
        "kafka" => {
            let brokers = cfg.source.brokers.clone().context("kafka source needs `brokers`")?;
            let topic = cfg.source.topic.clone().context("kafka source needs `topic`")?;
            let group = cfg.source.group_id.clone().unwrap_or_else(|| cfg.pipeline.name.clone());
            Ok(Arc::new(tally_io::KafkaSource::new(
                brokers,
                group,
                topic,
                cfg.pipeline.partition_count,
            )))
        }
        other => anyhow::bail!("source kind `{other}` is not available in this build"),
    }
}

fn build_sink(cfg: &PipelineConfig) -> anyhow::Result<Box<dyn SinkAdapter>> {
    match cfg.sink.kind.as_str() {
        "stdout" => Ok(Box::new(FileSink::stdout())),
        "file" => {
            let path = cfg.sink.path.clone().context("file sink needs `path`")?;
            Ok(Box::new(FileSink::append(path)))
        }
        #[cfg(feature = "kafka")]
        "kafka" => {
            let brokers = cfg.sink.brokers.clone().context("kafka sink needs `brokers`")?;
            let topic = cfg.sink.topic.clone().context("kafka sink needs `topic`")?;
            Ok(Box::new(tally_io::KafkaSink::new(brokers, topic)))
        }
        other => anyhow::bail!("sink kind `{other}` is not available in this build"),
    }
}

fn build_store(cfg: &PipelineConfig) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    let c = &cfg.checkpoint;
    match c.kind.as_str() {
        "dir" => Ok(Arc::new(DirCheckpointStore::with_retained(&c.dir, c.retained))),
        #[cfg(feature = "rocksdb")]
        "rocksdb" => {
            let path = c.dir.to_string_lossy();
            Ok(Arc::new(tally_state::RocksDbCheckpointStore::open(&path)?.with_retained(c.retained)))
        }
        other => anyhow::bail!("checkpoint store `{other}` is not available in this build"),
    }
}

async fn inspect(dir: PathBuf) -> anyhow::Result<()> {
    let store = DirCheckpointStore::new(&dir);
    let ids = store.list().await?;
    let Some(latest) = store.latest().await? else {
        println!("no checkpoints in {}", dir.display());
        return Ok(());
    };
    println!("retained checkpoints: {ids:?}");
    println!("{}", serde_json::to_string_pretty(&latest)?);
    Ok(())
}
