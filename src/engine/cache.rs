//! Bounded last-state cache.
//!
//! Sharded by the same stable symbol hash the engine uses for worker
//! routing, so each shard has exactly one writer (its worker). Readers get
//! an `Arc` snapshot. A background sweep evicts entries idle past the
//! configured max age; eviction emits no event.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::models::TickerState;

/// FNV-1a. Stable across runs so a symbol always lands on the same shard.
pub fn stable_shard(symbol: &str, shards: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in symbol.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % shards.max(1) as u64) as usize
}

struct CacheEntry {
    state: Arc<TickerState>,
    touched: Instant,
}

pub struct TickerStateCache {
    shards: Vec<RwLock<HashMap<String, CacheEntry>>>,
    max_age: Duration,
}

impl TickerStateCache {
    pub fn new(num_shards: usize, max_age: Duration) -> Self {
        Self {
            shards: (0..num_shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            max_age,
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<TickerState>> {
        let shard = &self.shards[stable_shard(symbol, self.shards.len())];
        shard.read().get(symbol).map(|entry| entry.state.clone())
    }

    pub fn insert(&self, state: Arc<TickerState>) {
        let shard = &self.shards[stable_shard(&state.symbol, self.shards.len())];
        shard.write().insert(
            state.symbol.clone(),
            CacheEntry {
                state,
                touched: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict entries idle past the max age. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut guard = shard.write();
            let before = guard.len();
            guard.retain(|_, entry| entry.touched.elapsed() < self.max_age);
            removed += before - guard.len();
        }
        removed
    }

    /// Background eviction loop; runs until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(max_age_s = self.max_age.as_secs(), "cache sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        debug!(removed, remaining = self.len(), "evicted stale ticker states");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
