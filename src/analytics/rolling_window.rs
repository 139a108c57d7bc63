//! Rolling per-second price/volume windows.
//!
//! One pre-allocated arena holds circular buffers for every tracked symbol:
//! no allocation on the hot path, O(1) updates, and reads that walk backward
//! from the head. All lookbacks use the tracker's own most-recent sample as
//! the reference point rather than wall-clock, so readings stay consistent
//! under processing delays.

use std::collections::HashMap;
use tracing::{info, warn};

/// Lookback windows, in minutes.
pub const WINDOW_MINUTES: [i64; 5] = [1, 5, 10, 15, 30];

/// A lookback anchor may trail the exact window edge by at most this many
/// seconds. Without the guard, a thin after-hours ticker whose nearest
/// earlier sample is 40 minutes old would report that whole span as
/// "vol_5min".
pub const FRESHNESS_SLACK_S: i64 = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PriceChanges {
    pub chg_1min: Option<f64>,
    pub chg_5min: Option<f64>,
    pub chg_10min: Option<f64>,
    pub chg_15min: Option<f64>,
    pub chg_30min: Option<f64>,
    /// Raw price five minutes ago, for momentum criteria.
    pub price_5min_ago: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeWindows {
    pub vol_1min: Option<i64>,
    pub vol_5min: Option<i64>,
    pub vol_10min: Option<i64>,
    pub vol_15min: Option<i64>,
    pub vol_30min: Option<i64>,
}

/// Circular per-second buffers for up to `max_symbols` symbols.
pub struct RollingWindowTracker {
    max_symbols: usize,
    window: usize,

    symbol_index: HashMap<String, usize>,
    next_index: usize,

    // Flat arenas, one row of `window` slots per symbol.
    timestamps: Box<[i64]>,
    prices: Box<[f64]>,
    volumes: Box<[i64]>,

    heads: Box<[u32]>,
    counts: Box<[u32]>,
    last_second: Box<[i64]>,

    rejected_symbols: u64,
}

impl RollingWindowTracker {
    pub fn new(max_symbols: usize, window: usize) -> Self {
        let slots = max_symbols * window;
        let tracker = Self {
            max_symbols,
            window,
            symbol_index: HashMap::with_capacity(max_symbols),
            next_index: 0,
            timestamps: vec![0i64; slots].into_boxed_slice(),
            prices: vec![0f64; slots].into_boxed_slice(),
            volumes: vec![0i64; slots].into_boxed_slice(),
            heads: vec![0u32; max_symbols].into_boxed_slice(),
            counts: vec![0u32; max_symbols].into_boxed_slice(),
            last_second: vec![0i64; max_symbols].into_boxed_slice(),
            rejected_symbols: 0,
        };
        let memory_mb =
            (slots * (8 + 8 + 8) + max_symbols * (4 + 4 + 8)) as f64 / 1024.0 / 1024.0;
        info!(
            max_symbols,
            window,
            memory_mb = format!("{memory_mb:.1}"),
            "rolling window tracker initialized"
        );
        tracker
    }

    fn index_of(&mut self, symbol: &str) -> Option<usize> {
        if let Some(&idx) = self.symbol_index.get(symbol) {
            return Some(idx);
        }
        if self.next_index >= self.max_symbols {
            self.rejected_symbols += 1;
            if self.rejected_symbols.is_power_of_two() {
                warn!(
                    symbol,
                    max = self.max_symbols,
                    rejected = self.rejected_symbols,
                    "rolling window arena full, refusing new symbol"
                );
            }
            return None;
        }
        let idx = self.next_index;
        self.symbol_index.insert(symbol.to_string(), idx);
        self.next_index += 1;
        Some(idx)
    }

    /// Upsert the sample for the current second. Returns true when a new
    /// second slot was appended, false on an intra-second overwrite, an
    /// invalid price, or a full arena.
    pub fn update(&mut self, symbol: &str, price: f64, cumulative_volume: i64, ts: i64) -> bool {
        if price <= 0.0 {
            return false;
        }
        let Some(idx) = self.index_of(symbol) else {
            return false;
        };

        let head = self.heads[idx] as usize;
        if self.last_second[idx] == ts && self.counts[idx] > 0 {
            // Same second: overwrite in place, no head advance.
            let slot = idx * self.window + head;
            self.prices[slot] = price;
            self.volumes[slot] = cumulative_volume;
            return false;
        }

        self.last_second[idx] = ts;
        let new_head = (head + 1) % self.window;
        self.heads[idx] = new_head as u32;

        let slot = idx * self.window + new_head;
        self.timestamps[slot] = ts;
        self.prices[slot] = price;
        self.volumes[slot] = cumulative_volume;

        if (self.counts[idx] as usize) < self.window {
            self.counts[idx] += 1;
        }
        true
    }

    /// Find, per window, the newest sample at or before `ts_now - window`,
    /// subject to the freshness guard. Returns slot indices.
    fn anchors(&self, idx: usize) -> [Option<usize>; 5] {
        let mut out = [None; 5];
        let count = self.counts[idx] as usize;
        if count < 2 {
            return out;
        }
        let head = self.heads[idx] as usize;
        let base = idx * self.window;
        let ts_now = self.timestamps[base + head];

        let mut remaining = WINDOW_MINUTES.len();
        for i in 1..count {
            let slot = base + (head + self.window - i) % self.window;
            let ts_past = self.timestamps[slot];
            for (w, minutes) in WINDOW_MINUTES.iter().enumerate() {
                if out[w].is_some() {
                    continue;
                }
                let window_s = minutes * 60;
                if ts_past <= ts_now - window_s {
                    // Found the anchor for this window; apply the guard once.
                    if ts_now - ts_past <= window_s + FRESHNESS_SLACK_S {
                        out[w] = Some(slot);
                    } else {
                        out[w] = Some(usize::MAX); // resolved but stale
                    }
                    remaining -= 1;
                }
            }
            if remaining == 0 {
                break;
            }
        }
        // usize::MAX markers collapse to None for the caller.
        for slot in out.iter_mut() {
            if *slot == Some(usize::MAX) {
                *slot = None;
            }
        }
        out
    }

    /// Percent price changes over the standard lookbacks plus the raw price
    /// five minutes ago. Slots resolve to None when the window cannot be
    /// satisfied under the freshness guard.
    pub fn price_changes(&self, symbol: &str) -> PriceChanges {
        let Some(&idx) = self.symbol_index.get(symbol) else {
            return PriceChanges::default();
        };
        let count = self.counts[idx] as usize;
        if count < 2 {
            return PriceChanges::default();
        }
        let base = idx * self.window;
        let head = self.heads[idx] as usize;
        let price_now = self.prices[base + head];
        if price_now <= 0.0 {
            return PriceChanges::default();
        }

        let anchors = self.anchors(idx);
        let chg = |slot: Option<usize>| -> Option<f64> {
            let past = self.prices[slot?];
            if past <= 0.0 {
                return None;
            }
            Some((price_now - past) / past * 100.0)
        };
        PriceChanges {
            chg_1min: chg(anchors[0]),
            chg_5min: chg(anchors[1]),
            chg_10min: chg(anchors[2]),
            chg_15min: chg(anchors[3]),
            chg_30min: chg(anchors[4]),
            price_5min_ago: anchors[1].map(|slot| self.prices[slot]),
        }
    }

    /// Volume deltas `cumulative_now - cumulative_at_lookback` over the
    /// standard lookbacks, under the same freshness guard.
    pub fn volume_windows(&self, symbol: &str) -> VolumeWindows {
        let Some(&idx) = self.symbol_index.get(symbol) else {
            return VolumeWindows::default();
        };
        let count = self.counts[idx] as usize;
        if count < 2 {
            return VolumeWindows::default();
        }
        let base = idx * self.window;
        let head = self.heads[idx] as usize;
        let vol_now = self.volumes[base + head];

        let anchors = self.anchors(idx);
        let delta = |slot: Option<usize>| -> Option<i64> {
            let past = self.volumes[slot?];
            Some((vol_now - past).max(0))
        };
        VolumeWindows {
            vol_1min: delta(anchors[0]),
            vol_5min: delta(anchors[1]),
            vol_10min: delta(anchors[2]),
            vol_15min: delta(anchors[3]),
            vol_30min: delta(anchors[4]),
        }
    }

    /// Drop a symbol's history (new-trading-day reset). The arena slot stays
    /// assigned to the symbol.
    pub fn clear_symbol(&mut self, symbol: &str) {
        if let Some(&idx) = self.symbol_index.get(symbol) {
            self.heads[idx] = 0;
            self.counts[idx] = 0;
            self.last_second[idx] = 0;
        }
    }

    /// Full reset, releasing all arena slots.
    pub fn clear_all(&mut self) {
        self.symbol_index.clear();
        self.next_index = 0;
        self.heads.fill(0);
        self.counts.fill(0);
        self.last_second.fill(0);
    }

    pub fn tracked_symbols(&self) -> usize {
        self.symbol_index.len()
    }

    pub fn rejected_symbols(&self) -> u64 {
        self.rejected_symbols
    }
}
