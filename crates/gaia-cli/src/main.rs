//! `gaiad` — the orchestrator daemon and a few operator conveniences.

mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gaia_approval::{
    run_inbound_poller, ApprovalConfig, ApprovalPipeline, ExecutionPolicy, InboundQueue,
};
use gaia_delivery::{Delivery, DeliveryConfig, JobFile, MetricsFile};
use gaia_events::EventLog;
use gaia_gateway::{run_gateway, GatewayConfig, GatewayState};
use gaia_queue::{run_reclaimer, Coordinator};
use gaia_store::{SqliteStore, TaskState};
use gaia_telegram::{OffsetStore, TelegramApi, TelegramConfig};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;

const PROCESSOR_INTERVAL: Duration = Duration::from_millis(500);
const RETRY_WORKER_INTERVAL: Duration = Duration::from_secs(30);
const RECLAIMER_INTERVAL: Duration = Duration::from_secs(30);
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const POLLER_IDLE_SLEEP: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "gaiad", about = "Local orchestrator daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon: poller, approval processor, delivery worker,
    /// reclaimer and the admin gateway.
    Run,
    /// Enqueue a task onto the durable queue.
    Enqueue {
        task_type: String,
        /// JSON payload; defaults to an empty object.
        #[arg(default_value = "{}")]
        payload: String,
    },
    /// List tasks, optionally filtered by state.
    Tasks {
        #[arg(long)]
        state: Option<String>,
    },
    /// List pending commands after the retention sweep.
    Pending,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start runtime: {error}");
            std::process::exit(1);
        }
    };
    if let Err(error) = runtime.block_on(run(cli)) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = DaemonConfig::from_env();
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("failed to create {}", config.state_dir.display()))?;
    let store = Arc::new(SqliteStore::with_lock_timeout(
        &config.db_path,
        config.lock_timeout_secs,
    )?);
    let events = EventLog::open(&config.events_path)?;

    match cli.command {
        Command::Run => run_daemon(config, store, events).await,
        Command::Enqueue { task_type, payload } => {
            let payload = serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let coordinator = Coordinator::new(store.as_ref().clone(), events.clone());
            let task_id = coordinator.enqueue(&task_type, payload)?;
            events.flush()?;
            println!("enqueued task {task_id}");
            Ok(())
        }
        Command::Tasks { state } => {
            let state = match state.as_deref() {
                None => None,
                Some(raw) => Some(
                    TaskState::parse(raw)
                        .with_context(|| format!("unknown task state '{raw}'"))?,
                ),
            };
            for task in store.list_tasks(state)? {
                println!(
                    "{}\t{}\t{}\t{}",
                    task.id,
                    task.task_type,
                    task.state.as_str(),
                    task.worker_id.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        Command::Pending => {
            let pipeline = build_pipeline(&config, store, events)?;
            for pending in pipeline.list_pending()? {
                println!(
                    "{}\t{}\t{}",
                    gaia_approval::short_id(&pending.id),
                    pending.status.as_str(),
                    pending.command
                );
            }
            Ok(())
        }
    }
}

fn build_delivery(config: &DaemonConfig) -> Result<Delivery> {
    let api = TelegramApi::new(TelegramConfig::from_env(config.bot_token.clone()))?;
    Ok(Delivery::new(
        Arc::new(api),
        JobFile::new(config.failed_queue_path()),
        JobFile::new(config.dead_letter_path()),
        MetricsFile::new(config.metrics_path()),
        DeliveryConfig::from_env(),
    ))
}

fn build_pipeline(
    config: &DaemonConfig,
    store: Arc<SqliteStore>,
    events: EventLog,
) -> Result<ApprovalPipeline> {
    Ok(ApprovalPipeline::new(
        store,
        events,
        build_delivery(config)?,
        InboundQueue::new(config.inbound_queue_path()),
        ExecutionPolicy::from_env(),
        ApprovalConfig::from_env(),
    ))
}

async fn run_daemon(config: DaemonConfig, store: Arc<SqliteStore>, events: EventLog) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let flusher = events.spawn_flusher();

    let delivery = build_delivery(&config)?;
    let pipeline = ApprovalPipeline::new(
        store.clone(),
        events.clone(),
        delivery.clone(),
        InboundQueue::new(config.inbound_queue_path()),
        ExecutionPolicy::from_env(),
        ApprovalConfig::from_env(),
    );
    let coordinator = Coordinator::new(store.as_ref().clone(), events.clone());

    let mut tasks = tokio::task::JoinSet::new();

    if config.bot_token.is_empty() {
        tracing::warn!("TELEGRAM_BOT_TOKEN not set; inbound poller disabled");
    } else {
        let api: Arc<dyn gaia_telegram::ChatApi> = Arc::new(TelegramApi::new(
            TelegramConfig::from_env(config.bot_token.clone()),
        )?);
        let poller_inbound = InboundQueue::new(config.inbound_queue_path());
        let offsets = OffsetStore::new(config.offset_path());
        let poller_shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            run_inbound_poller(api, poller_inbound, offsets, POLLER_IDLE_SLEEP, poller_shutdown)
                .await;
        });
    }

    let processor = pipeline.clone();
    let processor_shutdown = shutdown_rx.clone();
    tasks.spawn(async move {
        processor
            .run_processor(PROCESSOR_INTERVAL, processor_shutdown)
            .await;
    });

    let sweeper = pipeline.clone();
    let sweeper_shutdown = shutdown_rx.clone();
    tasks.spawn(async move {
        sweeper
            .run_expiry_sweep(EXPIRY_SWEEP_INTERVAL, sweeper_shutdown)
            .await;
    });

    let retry_delivery = delivery.clone();
    let retry_shutdown = shutdown_rx.clone();
    tasks.spawn(async move {
        retry_delivery.run(RETRY_WORKER_INTERVAL, retry_shutdown).await;
    });

    let reclaimer_shutdown = shutdown_rx.clone();
    let ttl = config.reclaim_ttl_secs;
    let max_attempts = config.reclaim_max_attempts;
    tasks.spawn(async move {
        if let Err(error) = run_reclaimer(
            coordinator,
            ttl,
            max_attempts,
            RECLAIMER_INTERVAL,
            reclaimer_shutdown,
        )
        .await
        {
            tracing::error!(%error, "reclaimer exited");
        }
    });

    let gateway_config = GatewayConfig {
        bind: config.bind.clone(),
        ..GatewayConfig::from_env(config.bind.clone())
    };
    let gateway_state = GatewayState {
        store: store.clone(),
        events: events.clone(),
        pipeline,
        delivery,
        admin_token: gateway_config.admin_token.clone(),
    };
    let gateway_shutdown = shutdown_rx.clone();
    tasks.spawn(async move {
        if let Err(error) = run_gateway(gateway_config, gateway_state, gateway_shutdown).await {
            tracing::error!(%error, "gateway exited");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install ctrl-c handler")?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    while tasks.join_next().await.is_some() {}
    flusher.abort();
    events.flush()?;
    Ok(())
}
