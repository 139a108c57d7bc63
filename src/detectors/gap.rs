//! Gap reversal and false-gap retracement detectors.
//!
//! The opening gap sign is recorded at the first regular-session tick. A
//! reversal fires when price crosses back through the reference level
//! against the gap, confirmed by one subsequent tick still on the far side.
//! The confirmation guards against noise right at the open.

use anyhow::Result;
use serde_json::json;

use crate::detectors::{Detector, DetectorCtx, DetectorRegistry, Memo};
use crate::models::{EventRecord, EventType, Session};

/// Full reversal: price trades back through the previous close.
const FULL_REVERSAL_FRACTION: f64 = 1.0;
/// False gap: price gives back half the opening gap.
const FALSE_GAP_FRACTION: f64 = 0.5;

pub struct GapReversalDetector {
    rule_id: &'static str,
    /// Direction of the gap this detector watches.
    gap_up: bool,
    /// Fraction of the gap that must be retraced (1.0 = prior close).
    fraction: f64,
    event: EventType,
    emits: &'static [EventType],
}

impl GapReversalDetector {
    pub fn new(
        rule_id: &'static str,
        gap_up: bool,
        fraction: f64,
        event: EventType,
        emits: &'static [EventType],
    ) -> Self {
        Self {
            rule_id,
            gap_up,
            fraction,
            event,
            emits,
        }
    }
}

impl Detector for GapReversalDetector {
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
        600
    }

    fn evaluate(&self, ctx: &DetectorCtx<'_>, memo: &mut Memo) -> Result<Vec<EventRecord>> {
        let curr = ctx.curr;
        if curr.session != Session::MarketOpen {
            return Ok(Vec::new());
        }
        let (Some(open), Some(prev_close)) = (
            curr.open.filter(|v| *v > 0.0),
            curr.prev_close.filter(|v| *v > 0.0),
        ) else {
            return Ok(Vec::new());
        };

        let m = memo.gap();
        if !m.seeded {
            m.seeded = true;
            m.gap_sign = if open > prev_close {
                1
            } else if open < prev_close {
                -1
            } else {
                0
            };
        }

        let want_sign = if self.gap_up { 1 } else { -1 };
        if m.gap_sign != want_sign || m.fired {
            return Ok(Vec::new());
        }

        let level = if self.gap_up {
            open - self.fraction * (open - prev_close)
        } else {
            open + self.fraction * (prev_close - open)
        };

        let Some(prev) = ctx.prev else {
            return Ok(Vec::new());
        };

        if m.pending {
            m.pending = false;
            let confirmed = if self.gap_up {
                curr.price < level
            } else {
                curr.price > level
            };
            if confirmed {
                m.fired = true;
                let gap_pct = (open - prev_close) / prev_close * 100.0;
                let event = EventRecord::new(
                    self.event,
                    self.rule_id,
                    &curr.symbol,
                    curr.timestamp,
                    curr.price,
                )
                .with_values(level, curr.price)
                .with_detail("gap_percent", json!(gap_pct))
                .with_detail("reversal_level", json!(level));
                return Ok(vec![event]);
            }
            return Ok(Vec::new());
        }

        let crossed = if self.gap_up {
            prev.price >= level && curr.price < level
        } else {
            prev.price <= level && curr.price > level
        };
        if crossed {
            m.pending = true;
            m.pending_price = curr.price;
        }
        Ok(Vec::new())
    }
}

pub fn register_all(registry: &mut DetectorRegistry) {
    registry.register(Box::new(GapReversalDetector::new(
        "event:system:gap_up_reversal",
        true,
        FULL_REVERSAL_FRACTION,
        EventType::GapUpReversal,
        &[EventType::GapUpReversal],
    )));
    registry.register(Box::new(GapReversalDetector::new(
        "event:system:gap_down_reversal",
        false,
        FULL_REVERSAL_FRACTION,
        EventType::GapDownReversal,
        &[EventType::GapDownReversal],
    )));
    registry.register(Box::new(GapReversalDetector::new(
        "event:system:false_gap_up",
        true,
        FALSE_GAP_FRACTION,
        EventType::FalseGapUpRetracement,
        &[EventType::FalseGapUpRetracement],
    )));
    registry.register(Box::new(GapReversalDetector::new(
        "event:system:false_gap_down",
        false,
        FALSE_GAP_FRACTION,
        EventType::FalseGapDownRetracement,
        &[EventType::FalseGapDownRetracement],
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TickerState;
    use chrono::{Duration, Utc};

    fn mk(price: f64, offset: i64) -> TickerState {
        let mut s = TickerState::new("GAPR", Utc::now() + Duration::seconds(offset), price);
        s.open = Some(105.0);
        s.prev_close = Some(100.0); // 5% gap up
        s.session = Session::MarketOpen;
        s
    }

    fn gap_up_detector() -> GapReversalDetector {
        GapReversalDetector::new(
            "event:system:gap_up_reversal",
            true,
            FULL_REVERSAL_FRACTION,
            EventType::GapUpReversal,
            &[EventType::GapUpReversal],
        )
    }

    #[test]
    fn test_gap_up_reversal_with_confirmation() {
        let detector = gap_up_detector();
        let mut memo = Memo::None;

        let s0 = mk(105.5, 0);
        let s1 = mk(99.8, 1); // crosses below prev close
        let s2 = mk(99.5, 2); // confirms

        detector
            .evaluate(&DetectorCtx { prev: None, curr: &s0 }, &mut memo)
            .unwrap();
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s0), curr: &s1 }, &mut memo)
            .unwrap()
            .is_empty(), "cross alone is pending");
        let fired = detector
            .evaluate(&DetectorCtx { prev: Some(&s1), curr: &s2 }, &mut memo)
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event_type, EventType::GapUpReversal);
        assert_eq!(fired[0].prev_value, Some(100.0));

        // One fire per session.
        let s3 = mk(100.5, 3);
        let s4 = mk(99.0, 4);
        let s5 = mk(98.5, 5);
        for (prev, curr) in [(&s2, &s3), (&s3, &s4), (&s4, &s5)] {
            assert!(detector
                .evaluate(&DetectorCtx { prev: Some(prev), curr }, &mut memo)
                .unwrap()
                .is_empty());
        }
    }

    #[test]
    fn test_unconfirmed_cross_does_not_fire() {
        let detector = gap_up_detector();
        let mut memo = Memo::None;
        let s0 = mk(105.5, 0);
        let s1 = mk(99.8, 1);
        let s2 = mk(100.4, 2); // bounces right back above

        detector
            .evaluate(&DetectorCtx { prev: None, curr: &s0 }, &mut memo)
            .unwrap();
        detector
            .evaluate(&DetectorCtx { prev: Some(&s0), curr: &s1 }, &mut memo)
            .unwrap();
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s1), curr: &s2 }, &mut memo)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_gap_down_symbol_ignored_by_gap_up_detector() {
        let detector = gap_up_detector();
        let mut memo = Memo::None;
        let mut s0 = mk(95.0, 0);
        s0.open = Some(96.0); // gap down
        let mut s1 = s0.clone();
        s1.price = 101.0;
        s1.timestamp = s0.timestamp + Duration::seconds(1);
        detector
            .evaluate(&DetectorCtx { prev: None, curr: &s0 }, &mut memo)
            .unwrap();
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s0), curr: &s1 }, &mut memo)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_false_gap_fires_at_half_retrace() {
        let detector = GapReversalDetector::new(
            "event:system:false_gap_up",
            true,
            FALSE_GAP_FRACTION,
            EventType::FalseGapUpRetracement,
            &[EventType::FalseGapUpRetracement],
        );
        let mut memo = Memo::None;
        // Gap 100 -> 105; half retrace level is 102.5.
        let s0 = mk(105.5, 0);
        let s1 = mk(102.3, 1);
        let s2 = mk(102.0, 2);
        detector
            .evaluate(&DetectorCtx { prev: None, curr: &s0 }, &mut memo)
            .unwrap();
        detector
            .evaluate(&DetectorCtx { prev: Some(&s0), curr: &s1 }, &mut memo)
            .unwrap();
        let fired = detector
            .evaluate(&DetectorCtx { prev: Some(&s1), curr: &s2 }, &mut memo)
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event_type, EventType::FalseGapUpRetracement);
        assert_eq!(fired[0].prev_value, Some(102.5));
    }
}
