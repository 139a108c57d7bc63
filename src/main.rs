//! PulseDetect - Real-Time Market Event Engine
//! Mission: Turn raw snapshot firehose into clean, deduplicated market events
//!
//! Pipeline: upstream snapshots -> ingestor -> sharded detection workers ->
//! {broadcast bus, TimescaleDB writer, trigger engine}.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulsedetect_backend::{
    broadcast::{spawn_publisher, PublisherStats},
    config::Config,
    detectors::default_registry,
    engine::{EngineSinks, EventEngine},
    ingest::SnapshotIngestor,
    persistence::EventWriter,
    triggers::TriggerEngine,
};

/// How long graceful drain may take before the process exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,pulsedetect_backend=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        max_symbols = config.max_symbols,
        workers = config.num_workers,
        "🚀 PulseDetect starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Redis: one multiplexed manager for streams/registry, plus a dedicated
    // pub/sub connection for the upstream firehose.
    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;
    let redis_manager = redis_client
        .get_connection_manager()
        .await
        .context("connecting to Redis")?;

    // TimescaleDB: lazy pool, schema creation retries inside the writer loop.
    let pg_pool = PgPoolOptions::new()
        .max_connections(4)
        .connect_lazy(&config.database_url)
        .context("invalid DATABASE_URL")?;
    let writer = Arc::new(EventWriter::new(
        pg_pool,
        config.writer_max_buffer,
        config.writer_max_batch,
        config.writer_flush_interval_s,
        config.retention_days,
        config.compression_after_days,
    ));
    if let Err(err) = writer.ensure_schema().await {
        warn!(error = %err, "schema not ready yet, writer will retry");
    }
    let writer_task = tokio::spawn(writer.clone().run(shutdown_rx.clone()));

    // Redis stream publisher feeding the trigger engine and any external
    // stream consumers.
    let publisher_stats = Arc::new(PublisherStats::default());
    let (publisher_tx, publisher_task) = spawn_publisher(
        redis_manager.clone(),
        publisher_stats.clone(),
        shutdown_rx.clone(),
    );

    // Detection engine.
    let engine = EventEngine::start(
        &config,
        default_registry(config.orb_minutes),
        EngineSinks {
            writer: Some(writer.clone()),
            publisher: Some(publisher_tx),
        },
        shutdown_rx.clone(),
    );
    let cache = engine.cache();
    tokio::spawn(cache.clone().run_sweeper(shutdown_rx.clone()));

    // Trigger engine consumes the event stream.
    let trigger_engine = TriggerEngine::new(redis_manager, config.orchestrator_url.clone());
    let trigger_task = trigger_engine
        .clone()
        .start(shutdown_rx.clone())
        .await
        .context("starting trigger engine")?;

    // Upstream intake.
    let ingestor = SnapshotIngestor::new(engine.handle());
    let ingest_stats = ingestor.stats();
    let engine_stats = engine.stats();
    let ingest_task = tokio::spawn(ingestor.run(
        redis_client,
        config.upstream_channel.clone(),
        shutdown_rx.clone(),
    ));

    // Periodic health line.
    {
        let writer = writer.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        info!(
                            engine = ?engine_stats.snapshot(),
                            ingest = ?ingest_stats.snapshot(),
                            writer = ?writer.stats(),
                            cached = cache.len(),
                            "heartbeat"
                        );
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    info!("✅ PulseDetect running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("shutdown signal received, draining");

    // Cascade: ingestor stops, workers drain, writer flushes, trigger loop
    // exits, broadcast closes with the engine.
    let _ = shutdown_tx.send(true);
    let drain = async {
        let _ = ingest_task.await;
        engine.shutdown().await;
        let _ = writer_task.await;
        let _ = publisher_task.await;
        let _ = trigger_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        error!(
            grace_s = SHUTDOWN_GRACE.as_secs(),
            "graceful drain timed out, forcing exit"
        );
    }

    info!("PulseDetect stopped");
    Ok(())
}
