//! Snapshot ingestor: upstream tick intake.
//!
//! Each upstream broadcast tick is one JSON object mapping symbol to its
//! enriched field bag. Rows are validated, normalized into `TickerState`
//! and routed to the engine shard that owns the symbol. Symbols within a
//! tick process in arbitrary order; per-symbol order across ticks is
//! preserved by the sharded channels.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::engine::{EngineHandle, SymbolUpdate};
use crate::ingest::snapshot::EnrichedSnapshot;

#[derive(Debug, Default)]
pub struct IngestStats {
    ticks_received: AtomicU64,
    symbols_processed: AtomicU64,
    invalid_dropped: AtomicU64,
    parse_errors: AtomicU64,
    submit_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct IngestStatsSnapshot {
    pub ticks_received: u64,
    pub symbols_processed: u64,
    pub invalid_dropped: u64,
    pub parse_errors: u64,
    pub submit_failed: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            ticks_received: self.ticks_received.load(Ordering::Relaxed),
            symbols_processed: self.symbols_processed.load(Ordering::Relaxed),
            invalid_dropped: self.invalid_dropped.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            submit_failed: self.submit_failed.load(Ordering::Relaxed),
        }
    }
}

pub struct SnapshotIngestor {
    engine: EngineHandle,
    stats: Arc<IngestStats>,
}

impl SnapshotIngestor {
    pub fn new(engine: EngineHandle) -> Self {
        Self {
            engine,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Parse and dispatch one broadcast tick. Returns the number of symbols
    /// accepted into the engine.
    pub async fn process_tick(&self, payload: &[u8]) -> usize {
        self.stats.ticks_received.fetch_add(1, Ordering::Relaxed);
        let parsed: serde_json::Map<String, serde_json::Value> =
            match serde_json::from_slice(payload) {
                Ok(map) => map,
                Err(err) => {
                    self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %err, "unparseable snapshot tick");
                    return 0;
                }
            };

        let mut accepted = 0;
        for (symbol, bag) in parsed {
            let snapshot: EnrichedSnapshot = match serde_json::from_value(bag) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(symbol = %symbol, error = %err, "unparseable snapshot row");
                    continue;
                }
            };
            let Some(state) = snapshot.normalize(Some(&symbol)) else {
                self.stats.invalid_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let update = SymbolUpdate {
                state,
                enriched: Some(Arc::new(snapshot)),
            };
            if self.engine.submit(update).await {
                accepted += 1;
                self.stats.symbols_processed.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.submit_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        accepted
    }

    /// Consume enriched snapshot ticks from the upstream pub/sub channel
    /// until shutdown.
    pub async fn run(
        self,
        redis_client: redis::Client,
        channel: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut pubsub = redis_client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        info!(channel = %channel, "snapshot ingestor subscribed");
        let mut messages = pubsub.on_message();

        loop {
            tokio::select! {
                maybe = messages.next() => {
                    let Some(message) = maybe else { break };
                    let payload: Vec<u8> = message.get_payload_bytes().to_vec();
                    self.process_tick(&payload).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("snapshot ingestor stopped");
        Ok(())
    }
}
