//! Event detector plugins.
//!
//! Detectors are stateless by contract: they read the previous and current
//! `TickerState` plus a detector-local per-symbol memo slot, and emit zero or
//! more `EventRecord`s. They never touch shared state outside their memo.
//! The engine isolates failures: a detector returning an error is logged and
//! skipped for that update, never halting the pipeline.

pub mod breakout;
pub mod extremes;
pub mod gap;
pub mod halt;
pub mod indicator;
pub mod levels;
pub mod pullback;
pub mod thresholds;

use anyhow::Result;

use crate::models::{EventRecord, EventType, TickerState};

/// Inputs for one evaluation. `prev` is None on a symbol's first sight;
/// detectors that are not initial-safe are skipped by the engine in that
/// case.
pub struct DetectorCtx<'a> {
    pub prev: Option<&'a TickerState>,
    pub curr: &'a TickerState,
}

pub trait Detector: Send + Sync {
    /// Stable rule identifier, used for cooldown keying.
    fn rule_id(&self) -> &'static str;

    /// Tags this detector may emit.
    fn emits(&self) -> &'static [EventType];

    /// Whether the detector may run on a symbol's first-ever tick
    /// (memo-seeding detectors are; pure edge detectors are not).
    fn initial_safe(&self) -> bool {
        false
    }

    /// Suggested cooldown in seconds; the engine applies
    /// `max(config floor, this, per-rule override)`.
    fn default_cooldown_s(&self) -> u64 {
        0
    }

    fn evaluate(&self, ctx: &DetectorCtx<'_>, memo: &mut Memo) -> Result<Vec<EventRecord>>;

    /// Called when a symbol's session rolls into pre-market (new trading
    /// day). The default discards the memo entirely.
    fn reset_session(&self, memo: &mut Memo) {
        *memo = Memo::None;
    }
}

// ── Per-symbol memo slots ────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct LevelCrossMemo {
    /// +1 after an up fire, -1 after a down fire, 0 unarmed.
    pub last_dir: i8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfirmMemo {
    /// Direction of an unconfirmed cross awaiting its confirming tick.
    pub pending_dir: i8,
    pub last_dir: i8,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExtremeMemo {
    pub seeded: bool,
    pub high: f64,
    pub low: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdMemo {
    pub seeded: bool,
    pub in_bucket: bool,
    /// Unix seconds when the metric entered the bucket (sustained variants).
    pub entered_at: i64,
    pub fired_sustained: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PullbackMemo {
    pub seeded: bool,
    pub extreme: f64,
    pub fired: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GapMemo {
    pub seeded: bool,
    /// Sign of the opening gap: +1 up, -1 down, 0 flat.
    pub gap_sign: i8,
    /// An unconfirmed reversal cross awaiting one more tick.
    pub pending: bool,
    pub pending_price: f64,
    pub fired: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HaltMemo {
    pub seeded: bool,
    pub halted: bool,
    pub halted_at: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct BarCrossMemo {
    pub last_fire_bar_up: i64,
    pub last_fire_bar_down: i64,
}

impl Default for BarCrossMemo {
    fn default() -> Self {
        Self {
            last_fire_bar_up: i64::MIN,
            last_fire_bar_down: i64::MIN,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OrbMemo {
    pub active: bool,
    pub open_ts: i64,
    pub high: f64,
    pub low: f64,
    pub frozen: bool,
    pub fired_up: bool,
    pub fired_down: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolidationMemo {
    pub seeded: bool,
    /// Current 1-minute bar index and its running extremes.
    pub cur_bar: i64,
    pub cur_high: f64,
    pub cur_low: f64,
    /// Consolidation band under evaluation.
    pub band_high: f64,
    pub band_low: f64,
    pub tight_bars: u32,
    pub armed: bool,
}

/// One memo slot per detector per symbol, owned by the engine shard.
#[derive(Debug, Clone, Default)]
pub enum Memo {
    #[default]
    None,
    LevelCross(LevelCrossMemo),
    Confirm(ConfirmMemo),
    Extreme(ExtremeMemo),
    Threshold(ThresholdMemo),
    Pullback(PullbackMemo),
    Gap(GapMemo),
    Halt(HaltMemo),
    BarCross(BarCrossMemo),
    Orb(OrbMemo),
    Consolidation(ConsolidationMemo),
}

macro_rules! memo_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&mut self) -> &mut $ty {
            if !matches!(self, Memo::$variant(_)) {
                *self = Memo::$variant(<$ty>::default());
            }
            match self {
                Memo::$variant(m) => m,
                _ => unreachable!(),
            }
        }
    };
}

impl Memo {
    memo_accessor!(level_cross, LevelCross, LevelCrossMemo);
    memo_accessor!(confirm, Confirm, ConfirmMemo);
    memo_accessor!(extreme, Extreme, ExtremeMemo);
    memo_accessor!(threshold, Threshold, ThresholdMemo);
    memo_accessor!(pullback, Pullback, PullbackMemo);
    memo_accessor!(gap, Gap, GapMemo);
    memo_accessor!(halt, Halt, HaltMemo);
    memo_accessor!(bar_cross, BarCross, BarCrossMemo);
    memo_accessor!(orb, Orb, OrbMemo);
    memo_accessor!(consolidation, Consolidation, ConsolidationMemo);
}

// ── Registry ─────────────────────────────────────────────────────

pub struct RegisteredDetector {
    pub detector: Box<dyn Detector>,
    /// Optional per-rule cooldown override (seconds); may only increase the
    /// effective cooldown.
    pub cooldown_override: Option<u64>,
}

/// Read-only after startup; iteration order fixes per-symbol determinism.
#[derive(Default)]
pub struct DetectorRegistry {
    entries: Vec<RegisteredDetector>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, detector: Box<dyn Detector>) {
        self.entries.push(RegisteredDetector {
            detector,
            cooldown_override: None,
        });
    }

    pub fn register_with_cooldown(&mut self, detector: Box<dyn Detector>, cooldown_s: u64) {
        self.entries.push(RegisteredDetector {
            detector,
            cooldown_override: Some(cooldown_s),
        });
    }

    pub fn entries(&self) -> &[RegisteredDetector] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn effective_cooldown_s(&self, index: usize, floor: u64) -> u64 {
        let entry = &self.entries[index];
        floor
            .max(entry.detector.default_cooldown_s())
            .max(entry.cooldown_override.unwrap_or(0))
    }
}

/// The full production detector set, in registration order.
pub fn default_registry(orb_minutes: i64) -> DetectorRegistry {
    let mut registry = DetectorRegistry::new();
    levels::register_all(&mut registry);
    extremes::register_all(&mut registry);
    thresholds::register_all(&mut registry);
    pullback::register_all(&mut registry);
    gap::register_all(&mut registry);
    halt::register_all(&mut registry);
    indicator::register_all(&mut registry);
    breakout::register_all(&mut registry, orb_minutes);
    registry
}
