//! Indicator-cross detectors on 5-minute bars.
//!
//! Fire on the edge of the comparison between two indicator series. A fire
//! for a given direction requires the 5-minute bar index to have advanced
//! since the last fire of the same symbol+rule, which suppresses intra-bar
//! flapping when the indicators hover at the cross.

use anyhow::Result;
use serde_json::json;

use crate::detectors::{Detector, DetectorCtx, DetectorRegistry, Memo};
use crate::models::{EventRecord, EventType, TickerState};

const BAR_SECONDS: i64 = 300;

/// Stochastic zone boundaries gating the %K/%D cross events.
const STOCH_OVERSOLD: f64 = 20.0;
const STOCH_OVERBOUGHT: f64 = 80.0;

/// Which pair of 5-minute series is compared.
#[derive(Debug, Clone, Copy)]
pub enum PairSource {
    Sma8Sma20,
    MacdSignal,
    MacdZero,
    /// %K vs %D, with the bullish cross gated to the oversold zone and the
    /// bearish cross to the overbought zone.
    StochKd,
}

impl PairSource {
    fn values(&self, state: &TickerState) -> Option<(f64, f64)> {
        match self {
            PairSource::Sma8Sma20 => Some((state.sma8_5m?, state.sma20_5m?)),
            PairSource::MacdSignal => Some((state.macd_5m?, state.macd_signal_5m?)),
            PairSource::MacdZero => Some((state.macd_5m?, 0.0)),
            PairSource::StochKd => Some((state.stoch_k_5m?, state.stoch_d_5m?)),
        }
    }
}

pub struct BarCrossDetector {
    rule_id: &'static str,
    source: PairSource,
    up: EventType,
    down: EventType,
    emits: &'static [EventType],
}

impl BarCrossDetector {
    pub fn new(
        rule_id: &'static str,
        source: PairSource,
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

    fn fire(
        &self,
        ty: EventType,
        ctx: &DetectorCtx<'_>,
        fast: f64,
        slow: f64,
    ) -> EventRecord {
        let curr = ctx.curr;
        let mut event = EventRecord::new(
            ty,
            self.rule_id,
            &curr.symbol,
            curr.timestamp,
            curr.price,
        );
        event.prev_value = Some(slow);
        event.new_value = Some(fast);
        event.delta = Some(fast - slow);
        event.with_detail("bar_seconds", json!(BAR_SECONDS))
    }
}

impl Detector for BarCrossDetector {
    fn rule_id(&self) -> &'static str {
        self.rule_id
    }

    fn emits(&self) -> &'static [EventType] {
        self.emits
    }

    fn default_cooldown_s(&self) -> u64 {
        300
    }

    fn evaluate(&self, ctx: &DetectorCtx<'_>, memo: &mut Memo) -> Result<Vec<EventRecord>> {
        let Some(prev) = ctx.prev else {
            return Ok(Vec::new());
        };
        let (Some((fast_prev, slow_prev)), Some((fast_curr, slow_curr))) =
            (self.source.values(prev), self.source.values(ctx.curr))
        else {
            return Ok(Vec::new());
        };

        let bar = ctx.curr.unix_seconds() / BAR_SECONDS;
        let m = memo.bar_cross();

        let crossed_up = fast_prev <= slow_prev && fast_curr > slow_curr;
        let crossed_down = fast_prev >= slow_prev && fast_curr < slow_curr;

        if crossed_up && bar > m.last_fire_bar_up {
            if let PairSource::StochKd = self.source {
                // Bullish stochastic cross only counts out of oversold.
                if fast_prev >= STOCH_OVERSOLD {
                    return Ok(Vec::new());
                }
            }
            m.last_fire_bar_up = bar;
            return Ok(vec![self.fire(self.up, ctx, fast_curr, slow_curr)]);
        }
        if crossed_down && bar > m.last_fire_bar_down {
            if let PairSource::StochKd = self.source {
                if fast_prev <= STOCH_OVERBOUGHT {
                    return Ok(Vec::new());
                }
            }
            m.last_fire_bar_down = bar;
            return Ok(vec![self.fire(self.down, ctx, fast_curr, slow_curr)]);
        }
        Ok(Vec::new())
    }
}

pub fn register_all(registry: &mut DetectorRegistry) {
    registry.register(Box::new(BarCrossDetector::new(
        "event:system:sma8x20_5m",
        PairSource::Sma8Sma20,
        EventType::Sma8AboveSma205m,
        EventType::Sma8BelowSma205m,
        &[EventType::Sma8AboveSma205m, EventType::Sma8BelowSma205m],
    )));
    registry.register(Box::new(BarCrossDetector::new(
        "event:system:macd_signal_5m",
        PairSource::MacdSignal,
        EventType::MacdAboveSignal5m,
        EventType::MacdBelowSignal5m,
        &[EventType::MacdAboveSignal5m, EventType::MacdBelowSignal5m],
    )));
    registry.register(Box::new(BarCrossDetector::new(
        "event:system:macd_zero_5m",
        PairSource::MacdZero,
        EventType::MacdAboveZero5m,
        EventType::MacdBelowZero5m,
        &[EventType::MacdAboveZero5m, EventType::MacdBelowZero5m],
    )));
    registry.register(Box::new(BarCrossDetector::new(
        "event:system:stoch_kd_5m",
        PairSource::StochKd,
        EventType::StochCrossBullish5m,
        EventType::StochCrossBearish5m,
        &[
            EventType::StochCrossBullish5m,
            EventType::StochCrossBearish5m,
        ],
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn mk(macd: f64, signal: f64, secs: i64) -> TickerState {
        let ts = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        let mut s = TickerState::new("QQQ", ts, 400.0);
        s.macd_5m = Some(macd);
        s.macd_signal_5m = Some(signal);
        s
    }

    fn macd_detector() -> BarCrossDetector {
        BarCrossDetector::new(
            "event:system:macd_signal_5m",
            PairSource::MacdSignal,
            EventType::MacdAboveSignal5m,
            EventType::MacdBelowSignal5m,
            &[EventType::MacdAboveSignal5m, EventType::MacdBelowSignal5m],
        )
    }

    #[test]
    fn test_macd_signal_cross_fires_on_edge() {
        let detector = macd_detector();
        let mut memo = Memo::None;
        let s0 = mk(-0.1, 0.0, 0);
        let s1 = mk(0.05, 0.0, 10);
        let fired = detector
            .evaluate(&DetectorCtx { prev: Some(&s0), curr: &s1 }, &mut memo)
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event_type, EventType::MacdAboveSignal5m);
    }

    #[test]
    fn test_intra_bar_flapping_suppressed() {
        let detector = macd_detector();
        let mut memo = Memo::None;
        // Cross up, dip back, cross up again inside the same 5-minute bar.
        let s0 = mk(-0.1, 0.0, 0);
        let s1 = mk(0.05, 0.0, 10);
        let s2 = mk(-0.02, 0.0, 20);
        let s3 = mk(0.04, 0.0, 30);
        assert_eq!(
            detector
                .evaluate(&DetectorCtx { prev: Some(&s0), curr: &s1 }, &mut memo)
                .unwrap()
                .len(),
            1
        );
        // The down cross may fire (different direction), but the repeated
        // up cross within the same bar must not.
        detector
            .evaluate(&DetectorCtx { prev: Some(&s1), curr: &s2 }, &mut memo)
            .unwrap();
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s2), curr: &s3 }, &mut memo)
            .unwrap()
            .is_empty());

        // Next bar re-arms the direction.
        let s4 = mk(-0.03, 0.0, 310);
        let s5 = mk(0.02, 0.0, 320);
        detector
            .evaluate(&DetectorCtx { prev: Some(&s3), curr: &s4 }, &mut memo)
            .unwrap();
        assert_eq!(
            detector
                .evaluate(&DetectorCtx { prev: Some(&s4), curr: &s5 }, &mut memo)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_stoch_cross_gated_to_zone() {
        let detector = BarCrossDetector::new(
            "event:system:stoch_kd_5m",
            PairSource::StochKd,
            EventType::StochCrossBullish5m,
            EventType::StochCrossBearish5m,
            &[
                EventType::StochCrossBullish5m,
                EventType::StochCrossBearish5m,
            ],
        );
        let mut memo = Memo::None;
        let mk_stoch = |k: f64, d: f64, secs: i64| {
            let ts = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
            let mut s = TickerState::new("IWM", ts, 200.0);
            s.stoch_k_5m = Some(k);
            s.stoch_d_5m = Some(d);
            s
        };
        // Mid-range cross: ignored.
        let s0 = mk_stoch(45.0, 50.0, 0);
        let s1 = mk_stoch(55.0, 50.0, 10);
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s0), curr: &s1 }, &mut memo)
            .unwrap()
            .is_empty());
        // Oversold cross: fires.
        let s2 = mk_stoch(12.0, 18.0, 400);
        let s3 = mk_stoch(22.0, 18.0, 410);
        let fired = detector
            .evaluate(&DetectorCtx { prev: Some(&s2), curr: &s3 }, &mut memo)
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event_type, EventType::StochCrossBullish5m);
    }
}
