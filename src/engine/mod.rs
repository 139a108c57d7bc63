//! Event engine: per-symbol serialized dispatch with parallel shards.
//!
//! A configurable worker pool consumes normalized updates; symbols are
//! sharded to workers by a stable hash, so successive updates of one symbol
//! always hit the same worker in order. Across symbols processing is fully
//! parallel. Downstream pressure never blocks dispatch: the broadcast bus
//! drops for slow subscribers, the writer buffer drops oldest on overflow,
//! and the stream publisher channel drops on backpressure.

pub mod cache;
mod worker;

pub use cache::{stable_shard, TickerStateCache};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::analytics::RollingWindowTracker;
use crate::config::Config;
use crate::detectors::DetectorRegistry;
use crate::ingest::EnrichedSnapshot;
use crate::models::{EventRecord, TickerState};
use crate::persistence::EventWriter;

use worker::ShardWorker;

const SHARD_CHANNEL_CAPACITY: usize = 2048;
const BROADCAST_CAPACITY: usize = 1024;

/// One normalized update entering the engine. The enriched snapshot rides
/// along for the writer's context column only.
pub struct SymbolUpdate {
    pub state: TickerState,
    pub enriched: Option<Arc<EnrichedSnapshot>>,
}

#[derive(Debug, Default)]
pub struct EngineStats {
    snapshots_processed: AtomicU64,
    first_sight_symbols: AtomicU64,
    out_of_order_dropped: AtomicU64,
    detector_errors: AtomicU64,
    events_emitted: AtomicU64,
    dedup_suppressed: AtomicU64,
    cooldown_suppressed: AtomicU64,
    publish_dropped: AtomicU64,
}

macro_rules! bump {
    ($name:ident, $field:ident) => {
        pub(crate) fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl EngineStats {
    bump!(bump_processed, snapshots_processed);
    bump!(bump_first_sight, first_sight_symbols);
    bump!(bump_out_of_order, out_of_order_dropped);
    bump!(bump_detector_error, detector_errors);
    bump!(bump_emitted, events_emitted);
    bump!(bump_dedup_suppressed, dedup_suppressed);
    bump!(bump_cooldown_suppressed, cooldown_suppressed);
    bump!(bump_publish_dropped, publish_dropped);

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            snapshots_processed: self.snapshots_processed.load(Ordering::Relaxed),
            first_sight_symbols: self.first_sight_symbols.load(Ordering::Relaxed),
            out_of_order_dropped: self.out_of_order_dropped.load(Ordering::Relaxed),
            detector_errors: self.detector_errors.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            dedup_suppressed: self.dedup_suppressed.load(Ordering::Relaxed),
            cooldown_suppressed: self.cooldown_suppressed.load(Ordering::Relaxed),
            publish_dropped: self.publish_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct EngineStatsSnapshot {
    pub snapshots_processed: u64,
    pub first_sight_symbols: u64,
    pub out_of_order_dropped: u64,
    pub detector_errors: u64,
    pub events_emitted: u64,
    pub dedup_suppressed: u64,
    pub cooldown_suppressed: u64,
    pub publish_dropped: u64,
}

/// Optional fan-out sinks besides the in-process broadcast bus.
#[derive(Default)]
pub struct EngineSinks {
    pub writer: Option<Arc<EventWriter>>,
    pub publisher: Option<mpsc::Sender<Arc<EventRecord>>>,
}

/// Cheap cloneable submission handle, used by the ingestor.
#[derive(Clone)]
pub struct EngineHandle {
    senders: Vec<mpsc::Sender<SymbolUpdate>>,
}

impl EngineHandle {
    /// Route one update to its symbol's shard, preserving per-symbol order.
    pub async fn submit(&self, update: SymbolUpdate) -> bool {
        let shard = stable_shard(&update.state.symbol, self.senders.len());
        self.senders[shard].send(update).await.is_ok()
    }
}

pub struct EventEngine {
    senders: Vec<mpsc::Sender<SymbolUpdate>>,
    broadcast_tx: broadcast::Sender<Arc<EventRecord>>,
    cache: Arc<TickerStateCache>,
    stats: Arc<EngineStats>,
    handles: Vec<JoinHandle<()>>,
}

impl EventEngine {
    /// Spawn the worker pool. The registry is read-only from here on.
    pub fn start(
        config: &Config,
        registry: DetectorRegistry,
        sinks: EngineSinks,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let num_workers = config.num_workers.max(1);
        let registry = Arc::new(registry);
        let cache = Arc::new(TickerStateCache::new(
            num_workers,
            Duration::from_secs(config.cache_max_age_s),
        ));
        let stats = Arc::new(EngineStats::default());
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        // Split the symbol budget across shards; hashing spreads 10k symbols
        // evenly enough that a small headroom per shard suffices.
        let shard_symbols = config.max_symbols.div_ceil(num_workers) + 64;

        let mut senders = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);
        for shard_id in 0..num_workers {
            let (tx, rx) = mpsc::channel(SHARD_CHANNEL_CAPACITY);
            senders.push(tx);
            let worker = ShardWorker::new(
                shard_id,
                registry.clone(),
                cache.clone(),
                RollingWindowTracker::new(shard_symbols, config.window_size_seconds),
                config.default_cooldown_s,
                config.dedup_window_s,
                broadcast_tx.clone(),
                sinks.writer.clone(),
                sinks.publisher.clone(),
                stats.clone(),
            );
            handles.push(tokio::spawn(worker.run(rx, shutdown.clone())));
        }

        info!(
            workers = num_workers,
            detectors = registry.len(),
            "event engine started"
        );

        Self {
            senders,
            broadcast_tx,
            cache,
            stats,
            handles,
        }
    }

    /// Route one update to its symbol's shard, preserving per-symbol order.
    pub async fn submit(&self, update: SymbolUpdate) -> bool {
        let shard = stable_shard(&update.state.symbol, self.senders.len());
        self.senders[shard].send(update).await.is_ok()
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            senders: self.senders.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EventRecord>> {
        self.broadcast_tx.subscribe()
    }

    pub fn cache(&self) -> Arc<TickerStateCache> {
        self.cache.clone()
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    /// Stop accepting updates and wait for the workers to drain.
    pub async fn shutdown(mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        info!("event engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::default_registry;
    use crate::models::EventType;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    #[tokio::test]
    async fn test_end_to_end_new_high_through_broadcast() {
        let config = Config {
            num_workers: 2,
            max_symbols: 128,
            ..Config::default()
        };
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = EventEngine::start(
            &config,
            default_registry(config.orb_minutes),
            EngineSinks::default(),
            shutdown_rx,
        );
        let mut events = engine.subscribe();

        let t0 = Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap();
        let mut s0 = TickerState::new("TSLA", t0, 250.0);
        s0.intraday_high = Some(250.0);
        let mut s1 = TickerState::new("TSLA", t0 + ChronoDuration::seconds(1), 250.5);
        s1.intraday_high = Some(250.0);

        assert!(engine.submit(SymbolUpdate { state: s0, enriched: None }).await);
        assert!(engine.submit(SymbolUpdate { state: s1, enriched: None }).await);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within deadline")
            .expect("broadcast open");
        assert_eq!(event.event_type, EventType::NewHigh);
        assert_eq!(event.symbol, "TSLA");

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cache_reflects_latest_submitted_state() {
        let config = Config {
            num_workers: 1,
            max_symbols: 16,
            ..Config::default()
        };
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = EventEngine::start(
            &config,
            default_registry(config.orb_minutes),
            EngineSinks::default(),
            shutdown_rx,
        );
        let t0 = Utc.with_ymd_and_hms(2025, 6, 2, 15, 0, 0).unwrap();
        engine
            .submit(SymbolUpdate {
                state: TickerState::new("AAPL", t0, 180.0),
                enriched: None,
            })
            .await;
        engine
            .submit(SymbolUpdate {
                state: TickerState::new("AAPL", t0 + ChronoDuration::seconds(1), 181.0),
                enriched: None,
            })
            .await;

        let cache = engine.cache();
        engine.shutdown().await;
        assert_eq!(cache.get("AAPL").unwrap().price, 181.0);
    }
}
