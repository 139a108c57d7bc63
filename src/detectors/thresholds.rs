//! Window-threshold detectors.
//!
//! These fire on first-time entry into a bucket: `prev < threshold <= curr`.
//! Crossing rather than state is the whole point; a hot symbol sitting at
//! RVOL 6 must not fire on every tick. The memo tracks bucket membership so
//! a symbol re-arms only after leaving the bucket.

use anyhow::Result;
use serde_json::json;

use crate::detectors::{Detector, DetectorCtx, DetectorRegistry, Memo};
use crate::models::{EventRecord, EventType, TickerState};

/// RVOL_SPIKE fires at 3x average volume.
pub const RVOL_SPIKE_THRESHOLD: f64 = 3.0;
/// VOLUME_SURGE fires at 5x average volume.
pub const VOLUME_SURGE_THRESHOLD: f64 = 5.0;
/// Running up/down threshold over the rolling 10-minute window.
pub const RUNNING_THRESHOLD_PCT: f64 = 3.0;
/// UNUSUAL_PRINTS fires when the trade count z-score exceeds this.
pub const UNUSUAL_PRINTS_Z: f64 = 3.0;
/// BLOCK_TRADE fires on a single print of at least this many shares.
pub const BLOCK_TRADE_SHARES: f64 = 10_000.0;
/// VOLUME_SPIKE_1MIN fires when the last minute runs at 5x the pace of the
/// preceding four minutes.
pub const VOLUME_SPIKE_1MIN_RATIO: f64 = 5.0;
/// Seconds a sustained-momentum condition must hold before firing.
pub const SUSTAIN_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy)]
pub enum ThresholdMetric {
    Rvol,
    ChangePercent,
    Chg10Min,
    TradesZScore,
    LastTradeSize,
    /// vol_1min relative to the per-minute pace of the preceding 4 minutes.
    Vol1MinBurst,
    StochK5m,
}

impl ThresholdMetric {
    pub fn value(&self, state: &TickerState) -> Option<f64> {
        match self {
            ThresholdMetric::Rvol => state.rvol,
            ThresholdMetric::ChangePercent => state.change_percent,
            ThresholdMetric::Chg10Min => state.chg_10min,
            ThresholdMetric::TradesZScore => state.trades_z_score,
            ThresholdMetric::LastTradeSize => state.last_trade_size.map(|s| s as f64),
            ThresholdMetric::Vol1MinBurst => {
                let v1 = state.vol_1min? as f64;
                let v5 = state.vol_5min? as f64;
                let trailing_pace = (v5 - v1) / 4.0;
                if trailing_pace <= 0.0 {
                    return None;
                }
                Some(v1 / trailing_pace)
            }
            ThresholdMetric::StochK5m => state.stoch_k_5m,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Above,
    Below,
}

impl Direction {
    fn in_bucket(&self, value: f64, threshold: f64) -> bool {
        match self {
            Direction::Above => value >= threshold,
            Direction::Below => value <= threshold,
        }
    }
}

pub struct ThresholdDetector {
    rule_id: &'static str,
    metric: ThresholdMetric,
    threshold: f64,
    direction: Direction,
    event: EventType,
    emits: &'static [EventType],
    cooldown_s: u64,
}

impl ThresholdDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rule_id: &'static str,
        metric: ThresholdMetric,
        threshold: f64,
        direction: Direction,
        event: EventType,
        emits: &'static [EventType],
        cooldown_s: u64,
    ) -> Self {
        Self {
            rule_id,
            metric,
            threshold,
            direction,
            event,
            emits,
            cooldown_s,
        }
    }

    fn fire(&self, ctx: &DetectorCtx<'_>, prev_metric: Option<f64>, value: f64) -> EventRecord {
        let curr = ctx.curr;
        let mut event = EventRecord::new(
            self.event,
            self.rule_id,
            &curr.symbol,
            curr.timestamp,
            curr.price,
        );
        event.new_value = Some(value);
        event.prev_value = prev_metric;
        if let Some(prev) = prev_metric {
            event.delta = Some(value - prev);
        }
        event.with_detail("threshold", json!(self.threshold))
    }
}

impl Detector for ThresholdDetector {
    fn rule_id(&self) -> &'static str {
        self.rule_id
    }

    fn emits(&self) -> &'static [EventType] {
        self.emits
    }

    fn initial_safe(&self) -> bool {
        true
    }

    fn default_cooldown_s(&self) -> u64 {
        self.cooldown_s
    }

    fn evaluate(&self, ctx: &DetectorCtx<'_>, memo: &mut Memo) -> Result<Vec<EventRecord>> {
        let Some(value) = self.metric.value(ctx.curr) else {
            return Ok(Vec::new());
        };
        let in_bucket = self.direction.in_bucket(value, self.threshold);
        let m = memo.threshold();

        if !m.seeded {
            // First sight only establishes membership.
            m.seeded = true;
            m.in_bucket = in_bucket;
            return Ok(Vec::new());
        }

        let entered = in_bucket && !m.in_bucket;
        m.in_bucket = in_bucket;
        if !entered {
            return Ok(Vec::new());
        }
        let prev_metric = ctx.prev.and_then(|p| self.metric.value(p));
        Ok(vec![self.fire(ctx, prev_metric, value)])
    }
}

/// Sustained variant: the bucket must hold continuously for
/// `SUSTAIN_SECONDS` before the fire, one fire per stay.
pub struct SustainedThresholdDetector {
    inner: ThresholdDetector,
}

impl SustainedThresholdDetector {
    pub fn new(inner: ThresholdDetector) -> Self {
        Self { inner }
    }
}

impl Detector for SustainedThresholdDetector {
    fn rule_id(&self) -> &'static str {
        self.inner.rule_id
    }

    fn emits(&self) -> &'static [EventType] {
        self.inner.emits
    }

    fn initial_safe(&self) -> bool {
        true
    }

    fn default_cooldown_s(&self) -> u64 {
        self.inner.cooldown_s
    }

    fn evaluate(&self, ctx: &DetectorCtx<'_>, memo: &mut Memo) -> Result<Vec<EventRecord>> {
        let Some(value) = self.inner.metric.value(ctx.curr) else {
            return Ok(Vec::new());
        };
        let now = ctx.curr.unix_seconds();
        let in_bucket = self.inner.direction.in_bucket(value, self.inner.threshold);
        let m = memo.threshold();

        if !in_bucket {
            m.seeded = true;
            m.in_bucket = false;
            m.entered_at = 0;
            m.fired_sustained = false;
            return Ok(Vec::new());
        }

        if !m.in_bucket || m.entered_at == 0 {
            m.seeded = true;
            m.in_bucket = true;
            m.entered_at = now;
            return Ok(Vec::new());
        }

        if !m.fired_sustained && now - m.entered_at >= SUSTAIN_SECONDS {
            m.fired_sustained = true;
            let prev_metric = ctx.prev.and_then(|p| self.inner.metric.value(p));
            let event = self
                .inner
                .fire(ctx, prev_metric, value)
                .with_detail("sustained_seconds", json!(now - m.entered_at));
            return Ok(vec![event]);
        }
        Ok(Vec::new())
    }
}

/// Confirmed momentum: a short-window move backed by a longer-window move
/// (chg_5min and chg_15min both beyond their thresholds, same sign).
pub struct ConfirmedMomentumDetector {
    rule_id: &'static str,
    up: bool,
    event: EventType,
    emits: &'static [EventType],
}

impl ConfirmedMomentumDetector {
    pub fn new(rule_id: &'static str, up: bool, event: EventType, emits: &'static [EventType]) -> Self {
        Self {
            rule_id,
            up,
            event,
            emits,
        }
    }

    fn condition(&self, state: &TickerState) -> Option<bool> {
        let chg_5 = state.chg_5min?;
        let chg_15 = state.chg_15min?;
        Some(if self.up {
            chg_5 > 2.0 && chg_15 > 4.0
        } else {
            chg_5 < -2.0 && chg_15 < -4.0
        })
    }
}

impl Detector for ConfirmedMomentumDetector {
    fn rule_id(&self) -> &'static str {
        self.rule_id
    }

    fn emits(&self) -> &'static [EventType] {
        self.emits
    }

    fn initial_safe(&self) -> bool {
        true
    }

    fn default_cooldown_s(&self) -> u64 {
        300
    }

    fn evaluate(&self, ctx: &DetectorCtx<'_>, memo: &mut Memo) -> Result<Vec<EventRecord>> {
        let Some(in_bucket) = self.condition(ctx.curr) else {
            return Ok(Vec::new());
        };
        let m = memo.threshold();
        if !m.seeded {
            m.seeded = true;
            m.in_bucket = in_bucket;
            return Ok(Vec::new());
        }
        let entered = in_bucket && !m.in_bucket;
        m.in_bucket = in_bucket;
        if !entered {
            return Ok(Vec::new());
        }
        let curr = ctx.curr;
        let mut event = EventRecord::new(
            self.event,
            self.rule_id,
            &curr.symbol,
            curr.timestamp,
            curr.price,
        );
        event.new_value = curr.chg_5min;
        event = event
            .with_detail("chg_5min", json!(curr.chg_5min))
            .with_detail("chg_15min", json!(curr.chg_15min));
        Ok(vec![event])
    }
}

pub fn register_all(registry: &mut DetectorRegistry) {
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:rvol_spike_3x",
        ThresholdMetric::Rvol,
        RVOL_SPIKE_THRESHOLD,
        Direction::Above,
        EventType::RvolSpike,
        &[EventType::RvolSpike],
        60,
    )));
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:volume_surge_5x",
        ThresholdMetric::Rvol,
        VOLUME_SURGE_THRESHOLD,
        Direction::Above,
        EventType::VolumeSurge,
        &[EventType::VolumeSurge],
        60,
    )));
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:percent_up_5",
        ThresholdMetric::ChangePercent,
        5.0,
        Direction::Above,
        EventType::PercentUp5,
        &[EventType::PercentUp5],
        60,
    )));
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:percent_down_5",
        ThresholdMetric::ChangePercent,
        -5.0,
        Direction::Below,
        EventType::PercentDown5,
        &[EventType::PercentDown5],
        60,
    )));
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:percent_up_10",
        ThresholdMetric::ChangePercent,
        10.0,
        Direction::Above,
        EventType::PercentUp10,
        &[EventType::PercentUp10],
        60,
    )));
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:percent_down_10",
        ThresholdMetric::ChangePercent,
        -10.0,
        Direction::Below,
        EventType::PercentDown10,
        &[EventType::PercentDown10],
        60,
    )));
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:running_up_10min",
        ThresholdMetric::Chg10Min,
        RUNNING_THRESHOLD_PCT,
        Direction::Above,
        EventType::RunningUp,
        &[EventType::RunningUp],
        60,
    )));
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:running_down_10min",
        ThresholdMetric::Chg10Min,
        -RUNNING_THRESHOLD_PCT,
        Direction::Below,
        EventType::RunningDown,
        &[EventType::RunningDown],
        60,
    )));
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:unusual_prints",
        ThresholdMetric::TradesZScore,
        UNUSUAL_PRINTS_Z,
        Direction::Above,
        EventType::UnusualPrints,
        &[EventType::UnusualPrints],
        300,
    )));
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:block_trade",
        ThresholdMetric::LastTradeSize,
        BLOCK_TRADE_SHARES,
        Direction::Above,
        EventType::BlockTrade,
        &[EventType::BlockTrade],
        60,
    )));
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:volume_spike_1min",
        ThresholdMetric::Vol1MinBurst,
        VOLUME_SPIKE_1MIN_RATIO,
        Direction::Above,
        EventType::VolumeSpike1Min,
        &[EventType::VolumeSpike1Min],
        300,
    )));
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:stoch_oversold_5m",
        ThresholdMetric::StochK5m,
        20.0,
        Direction::Below,
        EventType::StochOversold5m,
        &[EventType::StochOversold5m],
        300,
    )));
    registry.register(Box::new(ThresholdDetector::new(
        "event:system:stoch_overbought_5m",
        ThresholdMetric::StochK5m,
        80.0,
        Direction::Above,
        EventType::StochOverbought5m,
        &[EventType::StochOverbought5m],
        300,
    )));
    registry.register(Box::new(SustainedThresholdDetector::new(
        ThresholdDetector::new(
            "event:system:running_up_sustained",
            ThresholdMetric::Chg10Min,
            RUNNING_THRESHOLD_PCT,
            Direction::Above,
            EventType::RunningUpSustained,
            &[EventType::RunningUpSustained],
            300,
        ),
    )));
    registry.register(Box::new(SustainedThresholdDetector::new(
        ThresholdDetector::new(
            "event:system:running_down_sustained",
            ThresholdMetric::Chg10Min,
            -RUNNING_THRESHOLD_PCT,
            Direction::Below,
            EventType::RunningDownSustained,
            &[EventType::RunningDownSustained],
            300,
        ),
    )));
    registry.register(Box::new(ConfirmedMomentumDetector::new(
        "event:system:running_up_confirmed",
        true,
        EventType::RunningUpConfirmed,
        &[EventType::RunningUpConfirmed],
    )));
    registry.register(Box::new(ConfirmedMomentumDetector::new(
        "event:system:running_down_confirmed",
        false,
        EventType::RunningDownConfirmed,
        &[EventType::RunningDownConfirmed],
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn rvol_state(rvol: f64, offset: i64) -> TickerState {
        let mut s = TickerState::new("GME", Utc::now() + Duration::seconds(offset), 25.0);
        s.rvol = Some(rvol);
        s
    }

    fn spike_detector() -> ThresholdDetector {
        ThresholdDetector::new(
            "event:system:rvol_spike_3x",
            ThresholdMetric::Rvol,
            RVOL_SPIKE_THRESHOLD,
            Direction::Above,
            EventType::RvolSpike,
            &[EventType::RvolSpike],
            60,
        )
    }

    #[test]
    fn test_rvol_spike_crossing_sequence() {
        let detector = spike_detector();
        let mut memo = Memo::None;
        let ticks = [2.5, 4.0, 4.5, 2.0, 3.5];
        let mut fired = Vec::new();
        let mut prev: Option<TickerState> = None;
        for (i, rvol) in ticks.iter().enumerate() {
            let curr = rvol_state(*rvol, i as i64);
            let events = detector
                .evaluate(
                    &DetectorCtx {
                        prev: prev.as_ref(),
                        curr: &curr,
                    },
                    &mut memo,
                )
                .unwrap();
            fired.push(events.len());
            prev = Some(curr);
        }
        // Fire on entry at 4.0, stay silent at 4.5, disarm at 2.0, re-fire at 3.5.
        assert_eq!(fired, vec![0, 1, 0, 0, 1]);
    }

    #[test]
    fn test_first_sight_inside_bucket_does_not_fire() {
        let detector = spike_detector();
        let mut memo = Memo::None;
        let curr = rvol_state(6.0, 0);
        let events = detector
            .evaluate(&DetectorCtx { prev: None, curr: &curr }, &mut memo)
            .unwrap();
        assert!(events.is_empty());
        // But the bucket is seeded; dropping out and back in fires.
        let out = rvol_state(1.0, 1);
        let back = rvol_state(3.2, 2);
        detector
            .evaluate(&DetectorCtx { prev: Some(&curr), curr: &out }, &mut memo)
            .unwrap();
        let events = detector
            .evaluate(&DetectorCtx { prev: Some(&out), curr: &back }, &mut memo)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].prev_value, Some(1.0));
        assert_eq!(events[0].new_value, Some(3.2));
    }

    #[test]
    fn test_percent_down_direction() {
        let detector = ThresholdDetector::new(
            "event:system:percent_down_5",
            ThresholdMetric::ChangePercent,
            -5.0,
            Direction::Below,
            EventType::PercentDown5,
            &[EventType::PercentDown5],
            60,
        );
        let mut memo = Memo::None;
        let mk = |chg: f64, offset: i64| {
            let mut s = TickerState::new("BBBY", Utc::now() + Duration::seconds(offset), 4.0);
            s.change_percent = Some(chg);
            s
        };
        let s1 = mk(-3.0, 0);
        let s2 = mk(-6.0, 1);
        detector
            .evaluate(&DetectorCtx { prev: None, curr: &s1 }, &mut memo)
            .unwrap();
        let events = detector
            .evaluate(&DetectorCtx { prev: Some(&s1), curr: &s2 }, &mut memo)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::PercentDown5);
    }

    #[test]
    fn test_sustained_requires_duration() {
        let detector = SustainedThresholdDetector::new(ThresholdDetector::new(
            "event:system:running_up_sustained",
            ThresholdMetric::Chg10Min,
            RUNNING_THRESHOLD_PCT,
            Direction::Above,
            EventType::RunningUpSustained,
            &[EventType::RunningUpSustained],
            300,
        ));
        let mut memo = Memo::None;
        let t = Utc::now();
        let mk = |chg: f64, offset: i64| {
            let mut s = TickerState::new("NVDA", t + Duration::seconds(offset), 700.0);
            s.chg_10min = Some(chg);
            s
        };

        let s0 = mk(3.5, 0);
        let s1 = mk(3.6, 30);
        let s2 = mk(3.8, 70);
        assert!(detector
            .evaluate(&DetectorCtx { prev: None, curr: &s0 }, &mut memo)
            .unwrap()
            .is_empty());
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s0), curr: &s1 }, &mut memo)
            .unwrap()
            .is_empty(), "only 30s in bucket");
        let events = detector
            .evaluate(&DetectorCtx { prev: Some(&s1), curr: &s2 }, &mut memo)
            .unwrap();
        assert_eq!(events.len(), 1, "70s in bucket fires");
        // Still in bucket: no second fire.
        let s3 = mk(4.0, 120);
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s2), curr: &s3 }, &mut memo)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_confirmed_momentum_conjunction() {
        let detector = ConfirmedMomentumDetector::new(
            "event:system:running_up_confirmed",
            true,
            EventType::RunningUpConfirmed,
            &[EventType::RunningUpConfirmed],
        );
        let mut memo = Memo::None;
        let mk = |chg5: f64, chg15: f64, offset: i64| {
            let mut s = TickerState::new("AMD", Utc::now() + Duration::seconds(offset), 150.0);
            s.chg_5min = Some(chg5);
            s.chg_15min = Some(chg15);
            s
        };
        let s0 = mk(2.5, 3.0, 0); // long leg missing
        let s1 = mk(2.5, 4.5, 1); // both legs in
        detector
            .evaluate(&DetectorCtx { prev: None, curr: &s0 }, &mut memo)
            .unwrap();
        let events = detector
            .evaluate(&DetectorCtx { prev: Some(&s0), curr: &s1 }, &mut memo)
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_vol_1min_burst_metric() {
        let mut s = TickerState::new("SPY", Utc::now(), 500.0);
        s.vol_1min = Some(500_000);
        s.vol_5min = Some(900_000);
        // trailing pace = (900k - 500k) / 4 = 100k/min, burst = 5.0
        let burst = ThresholdMetric::Vol1MinBurst.value(&s).unwrap();
        assert!((burst - 5.0).abs() < 1e-9);
    }
}
