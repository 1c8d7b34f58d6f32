//! vigil - 分析パイプラインのデモ起動
//!
//! 設定を読み、entity を登録し、scheduler と executor を一定時間動かしてから
//! graceful shutdown して統計を出す。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use eyre::{Context, Result, eyre};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vigil_core::app::CheckpointHandle;
use vigil_core::domain::{
    AnalysisOutput, Artifact, EntityId, EntityOutcome, QueueStats, Task, TaskError,
};
use vigil_core::impls::{FileStore, InMemoryStateStore, JsonlHookSink};
use vigil_core::ports::{AnalysisHandler, AnalysisRequest};
use vigil_core::{PipelineBuilder, VigilConfig};

#[derive(Debug, Parser)]
#[command(name = "vigil", version, about = "Periodic analysis scheduler with a checkpointed task pipeline")]
struct Cli {
    /// Config file (defaults to ./vigil.yml, then built-in defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides `log-level` from the config
    #[arg(long)]
    log_level: Option<String>,

    /// Entities to track
    #[arg(short, long, value_delimiter = ',', default_value = "AAPL,MSFT,NVDA,TSLA")]
    entities: Vec<String>,

    /// Stop after this many seconds (ctrl-c stops earlier)
    #[arg(long, default_value_t = 10)]
    run_secs: u64,

    /// Per-entity work time of the demo handler
    #[arg(long, default_value_t = 200)]
    step_ms: u64,

    /// Print the final summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    queues: Vec<QueueStats>,
    retrying: Vec<Task>,
    dead: Vec<Task>,
    hook_events_dropped: u64,
}

fn setup_logging(level: &str) -> Result<()> {
    let directive = level
        .parse::<tracing_subscriber::filter::Directive>()
        .with_context(|| format!("invalid log level: {level}"))?;
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .try_init()
        .map_err(|e| eyre!("failed to install subscriber: {e}"))?;

    info!("Logging initialized (level: {})", level);
    Ok(())
}

/// handler 本体の代わり。entity ごとに少し待って checkpoint を残す。
struct DemoHandler {
    step: Duration,
}

#[async_trait]
impl AnalysisHandler for DemoHandler {
    async fn execute(
        &self,
        request: AnalysisRequest,
        progress: CheckpointHandle,
        cancel: CancellationToken,
    ) -> Result<AnalysisOutput, TaskError> {
        if request.resume_snapshot.is_some() {
            info!(task_id = %request.task_id, remaining = request.entity_ids.len(), "DemoHandler: resuming");
        }

        let mut output = AnalysisOutput::new();
        for entity in request.entity_ids {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TaskError::cancelled(format!("stopped before {entity}")));
                }
                _ = tokio::time::sleep(self.step) => {}
            }
            progress
                .save([entity.clone()], serde_json::json!({ "last": entity.as_str() }))
                .await
                .map_err(|e| TaskError::transient(format!("checkpoint write failed: {e}")))?;
            let summary = format!("{} looks steady", entity);
            output = output.with_entity(entity, EntityOutcome::analyzed(summary));
        }

        Ok(output.with_artifact(Artifact::Report(format!(
            "{} analyzed by {}",
            request.kind.entity_ids().len(),
            request.kind.label()
        ))))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = VigilConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.log_level.clone())
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level).context("Failed to setup logging")?;

    let entities = cli
        .entities
        .iter()
        .map(|raw| EntityId::parse(raw.trim()))
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid --entities")?;
    info!(entities = entities.len(), run_secs = cli.run_secs, "vigil: starting");

    let queue_name = config.scheduler.queue_name();
    let handler = Arc::new(DemoHandler {
        step: Duration::from_millis(cli.step_ms),
    });
    let mut builder = PipelineBuilder::new(config.clone())
        .queue(queue_name.clone(), handler)
        .state_store(Arc::new(InMemoryStateStore::with_entities(entities)));

    if let Some(dir) = &config.storage.dir {
        let store = Arc::new(
            FileStore::open(dir)
                .await
                .with_context(|| format!("Failed to open storage at {}", dir.display()))?,
        );
        info!(dir = %dir.display(), "vigil: using file storage");
        builder = builder
            .task_store(store.clone())
            .checkpoint_store(store)
            .hook_sink(Arc::new(JsonlHookSink::new(dir.join("hooks.jsonl"))));
    }

    let handle = builder
        .build()
        .context("Invalid pipeline wiring")?
        .start()
        .await
        .context("Failed to start pipeline")?;

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(cli.run_secs)) => {
            info!("vigil: run time elapsed");
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "vigil: ctrl-c handler failed");
            }
            info!("vigil: interrupted");
        }
    }

    let summary = RunSummary {
        queues: handle.stats().await,
        retrying: handle.retrying_tasks(&queue_name).await?,
        dead: handle.dead_tasks(&queue_name).await?,
        hook_events_dropped: handle.recorder().dropped(),
    };
    handle.shutdown_and_join().await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for stats in &summary.queues {
            println!(
                "{}: active={} pending={} running={} completed={} retrying={} dead={}",
                stats.queue,
                stats.active(),
                stats.pending,
                stats.running,
                stats.completed,
                stats.retrying,
                stats.dead
            );
        }
        for task in &summary.retrying {
            let retry_at = task.retry_at.map(|at| at.to_rfc3339()).unwrap_or_default();
            println!("retrying {} (attempt {}) at {}", task.task_id, task.attempts, retry_at);
        }
        for task in &summary.dead {
            let error = task.last_error.as_ref().map(ToString::to_string).unwrap_or_default();
            println!("dead {} after {} attempts: {}", task.task_id, task.attempts, error);
        }
    }
    Ok(())
}
