//! Level-crossing detectors.
//!
//! Fire when the sign of `price - level` flips between two successive
//! states. The level itself may drift (VWAP, moving averages), so each side
//! of the comparison uses that bar's then-current level. One fire per
//! direction segment; a reverse crossing rearms immediately.

use anyhow::Result;

use crate::detectors::{Detector, DetectorCtx, DetectorRegistry, Memo};
use crate::models::{EventRecord, EventType, TickerState};

/// Which field of the state provides the reference level.
#[derive(Debug, Clone, Copy)]
pub enum LevelSource {
    Open,
    PrevClose,
    Vwap,
    Sma20Daily,
    Sma50Daily,
    Sma200Daily,
    BollingerUpper,
    BollingerLower,
    DailyHigh,
    DailyLow,
}

impl LevelSource {
    pub fn value(&self, state: &TickerState) -> Option<f64> {
        match self {
            LevelSource::Open => state.open,
            LevelSource::PrevClose => state.prev_close,
            LevelSource::Vwap => state.vwap,
            LevelSource::Sma20Daily => state.sma20_daily,
            LevelSource::Sma50Daily => state.sma50_daily,
            LevelSource::Sma200Daily => state.sma200_daily,
            LevelSource::BollingerUpper => state.bb_upper,
            LevelSource::BollingerLower => state.bb_lower,
            LevelSource::DailyHigh => state.daily_high,
            LevelSource::DailyLow => state.daily_low,
        }
        .filter(|v| *v > 0.0)
    }
}

pub struct LevelCrossDetector {
    rule_id: &'static str,
    source: LevelSource,
    up: Option<EventType>,
    down: Option<EventType>,
    emits: &'static [EventType],
}

impl LevelCrossDetector {
    pub fn new(
        rule_id: &'static str,
        source: LevelSource,
        up: Option<EventType>,
        down: Option<EventType>,
        emits: &'static [EventType],
    ) -> Self {
        Self {
            rule_id,
            source,
            up,
            down,
            emits,
        }
    }

    fn make_event(&self, ty: EventType, ctx: &DetectorCtx<'_>, level: f64) -> EventRecord {
        let prev_price = ctx.prev.map(|p| p.price).unwrap_or(ctx.curr.price);
        let mut event = EventRecord::new(
            ty,
            self.rule_id,
            &ctx.curr.symbol,
            ctx.curr.timestamp,
            ctx.curr.price,
        )
        .with_values(prev_price, ctx.curr.price);
        // Delta is the distance to the level being crossed, not the tick move.
        event.delta = Some(ctx.curr.price - level);
        event.delta_percent = Some((ctx.curr.price - level) / level * 100.0);
        event
    }
}

impl Detector for LevelCrossDetector {
    fn rule_id(&self) -> &'static str {
        self.rule_id
    }

    fn emits(&self) -> &'static [EventType] {
        self.emits
    }

    fn evaluate(&self, ctx: &DetectorCtx<'_>, memo: &mut Memo) -> Result<Vec<EventRecord>> {
        let Some(prev) = ctx.prev else {
            return Ok(Vec::new());
        };
        let (Some(level_prev), Some(level_curr)) =
            (self.source.value(prev), self.source.value(ctx.curr))
        else {
            return Ok(Vec::new());
        };

        let m = memo.level_cross();
        let crossed_up = prev.price <= level_prev && ctx.curr.price > level_curr;
        let crossed_down = prev.price >= level_prev && ctx.curr.price < level_curr;

        if crossed_up && m.last_dir != 1 {
            m.last_dir = 1;
            if let Some(ty) = self.up {
                return Ok(vec![self.make_event(ty, ctx, level_curr)]);
            }
        } else if crossed_down && m.last_dir != -1 {
            m.last_dir = -1;
            if let Some(ty) = self.down {
                return Ok(vec![self.make_event(ty, ctx, level_curr)]);
            }
        }
        Ok(Vec::new())
    }
}

/// Confirmed level crosses: the raw cross arms a pending state, and the fire
/// happens on the next tick that holds beyond the level in the same
/// direction. A tick back across the level cancels the pending cross.
pub struct ConfirmedCrossDetector {
    rule_id: &'static str,
    source: LevelSource,
    up: EventType,
    down: EventType,
    emits: &'static [EventType],
}

impl ConfirmedCrossDetector {
    pub fn new(
        rule_id: &'static str,
        source: LevelSource,
        up: EventType,
        down: EventType,
        emits: &'static [EventType],
    ) -> Self {
        Self {
            rule_id,
            source,
            up,
            down,
            emits,
        }
    }
}

impl Detector for ConfirmedCrossDetector {
    fn rule_id(&self) -> &'static str {
        self.rule_id
    }

    fn emits(&self) -> &'static [EventType] {
        self.emits
    }

    fn default_cooldown_s(&self) -> u64 {
        60
    }

    fn evaluate(&self, ctx: &DetectorCtx<'_>, memo: &mut Memo) -> Result<Vec<EventRecord>> {
        let Some(prev) = ctx.prev else {
            return Ok(Vec::new());
        };
        let (Some(level_prev), Some(level_curr)) =
            (self.source.value(prev), self.source.value(ctx.curr))
        else {
            return Ok(Vec::new());
        };

        let m = memo.confirm();

        // Confirmation pass: does the current tick hold beyond the level?
        if m.pending_dir == 1 {
            m.pending_dir = 0;
            if ctx.curr.price > level_curr && m.last_dir != 1 {
                m.last_dir = 1;
                let event = EventRecord::new(
                    self.up,
                    self.rule_id,
                    &ctx.curr.symbol,
                    ctx.curr.timestamp,
                    ctx.curr.price,
                )
                .with_values(prev.price, ctx.curr.price);
                return Ok(vec![event]);
            }
        } else if m.pending_dir == -1 {
            m.pending_dir = 0;
            if ctx.curr.price < level_curr && m.last_dir != -1 {
                m.last_dir = -1;
                let event = EventRecord::new(
                    self.down,
                    self.rule_id,
                    &ctx.curr.symbol,
                    ctx.curr.timestamp,
                    ctx.curr.price,
                )
                .with_values(prev.price, ctx.curr.price);
                return Ok(vec![event]);
            }
        }

        // Arming pass: a fresh raw cross.
        if prev.price <= level_prev && ctx.curr.price > level_curr {
            m.pending_dir = 1;
        } else if prev.price >= level_prev && ctx.curr.price < level_curr {
            m.pending_dir = -1;
        }
        Ok(Vec::new())
    }
}

pub fn register_all(registry: &mut DetectorRegistry) {
    registry.register(Box::new(LevelCrossDetector::new(
        "event:system:crossed_open",
        LevelSource::Open,
        Some(EventType::CrossedAboveOpen),
        Some(EventType::CrossedBelowOpen),
        &[EventType::CrossedAboveOpen, EventType::CrossedBelowOpen],
    )));
    registry.register(Box::new(LevelCrossDetector::new(
        "event:system:crossed_prev_close",
        LevelSource::PrevClose,
        Some(EventType::CrossedAbovePrevClose),
        Some(EventType::CrossedBelowPrevClose),
        &[
            EventType::CrossedAbovePrevClose,
            EventType::CrossedBelowPrevClose,
        ],
    )));
    registry.register(Box::new(LevelCrossDetector::new(
        "event:system:vwap_cross",
        LevelSource::Vwap,
        Some(EventType::VwapCrossUp),
        Some(EventType::VwapCrossDown),
        &[EventType::VwapCrossUp, EventType::VwapCrossDown],
    )));
    registry.register(Box::new(LevelCrossDetector::new(
        "event:system:sma20_daily_cross",
        LevelSource::Sma20Daily,
        Some(EventType::CrossedAboveSma20Daily),
        Some(EventType::CrossedBelowSma20Daily),
        &[
            EventType::CrossedAboveSma20Daily,
            EventType::CrossedBelowSma20Daily,
        ],
    )));
    registry.register(Box::new(LevelCrossDetector::new(
        "event:system:sma50_daily_cross",
        LevelSource::Sma50Daily,
        Some(EventType::CrossedAboveSma50Daily),
        Some(EventType::CrossedBelowSma50Daily),
        &[
            EventType::CrossedAboveSma50Daily,
            EventType::CrossedBelowSma50Daily,
        ],
    )));
    registry.register(Box::new(LevelCrossDetector::new(
        "event:system:sma200_daily_cross",
        LevelSource::Sma200Daily,
        Some(EventType::CrossedAboveSma200),
        Some(EventType::CrossedBelowSma200),
        &[EventType::CrossedAboveSma200, EventType::CrossedBelowSma200],
    )));
    // Bollinger band events only fire outward.
    registry.register(Box::new(LevelCrossDetector::new(
        "event:system:bb_upper_breakout",
        LevelSource::BollingerUpper,
        Some(EventType::BbUpperBreakout),
        None,
        &[EventType::BbUpperBreakout],
    )));
    registry.register(Box::new(LevelCrossDetector::new(
        "event:system:bb_lower_breakdown",
        LevelSource::BollingerLower,
        None,
        Some(EventType::BbLowerBreakdown),
        &[EventType::BbLowerBreakdown],
    )));
    registry.register(Box::new(LevelCrossDetector::new(
        "event:system:daily_high_resistance",
        LevelSource::DailyHigh,
        Some(EventType::CrossedDailyHighResistance),
        None,
        &[EventType::CrossedDailyHighResistance],
    )));
    registry.register(Box::new(LevelCrossDetector::new(
        "event:system:daily_low_support",
        LevelSource::DailyLow,
        None,
        Some(EventType::CrossedDailyLowSupport),
        &[EventType::CrossedDailyLowSupport],
    )));
    registry.register(Box::new(ConfirmedCrossDetector::new(
        "event:system:crossed_open_confirmed",
        LevelSource::Open,
        EventType::CrossedAboveOpenConfirmed,
        EventType::CrossedBelowOpenConfirmed,
        &[
            EventType::CrossedAboveOpenConfirmed,
            EventType::CrossedBelowOpenConfirmed,
        ],
    )));
    registry.register(Box::new(ConfirmedCrossDetector::new(
        "event:system:crossed_close_confirmed",
        LevelSource::PrevClose,
        EventType::CrossedAboveCloseConfirmed,
        EventType::CrossedBelowCloseConfirmed,
        &[
            EventType::CrossedAboveCloseConfirmed,
            EventType::CrossedBelowCloseConfirmed,
        ],
    )));
}
