//! Pullback detectors.
//!
//! Track the session extreme and measure how much of the move from a chosen
//! anchor (open, previous close, or the opposite intraday extreme) has been
//! retraced. One fire per extreme; a fresh extreme re-arms the detector.

use anyhow::Result;
use serde_json::json;

use crate::detectors::{Detector, DetectorCtx, DetectorRegistry, Memo};
use crate::models::{EventRecord, EventType, TickerState};

#[derive(Debug, Clone, Copy)]
pub enum PullbackAnchor {
    Open,
    PrevClose,
    /// The opposite intraday extreme (low for pullback-from-high, high for
    /// pullback-from-low).
    OppositeExtreme,
}

impl PullbackAnchor {
    fn value(&self, state: &TickerState, from_high: bool) -> Option<f64> {
        match self {
            PullbackAnchor::Open => state.open,
            PullbackAnchor::PrevClose => state.prev_close,
            PullbackAnchor::OppositeExtreme => {
                if from_high {
                    state.intraday_low
                } else {
                    state.intraday_high
                }
            }
        }
        .filter(|v| *v > 0.0)
    }
}

pub struct PullbackDetector {
    rule_id: &'static str,
    from_high: bool,
    fraction: f64,
    anchor: PullbackAnchor,
    event: EventType,
    emits: &'static [EventType],
}

impl PullbackDetector {
    pub fn new(
        rule_id: &'static str,
        from_high: bool,
        fraction: f64,
        anchor: PullbackAnchor,
        event: EventType,
        emits: &'static [EventType],
    ) -> Self {
        Self {
            rule_id,
            from_high,
            fraction,
            anchor,
            event,
            emits,
        }
    }
}

impl Detector for PullbackDetector {
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
        let curr = ctx.curr;
        let m = memo.pullback();

        if !m.seeded {
            m.seeded = true;
            m.extreme = if self.from_high {
                curr.intraday_high.unwrap_or(curr.price).max(curr.price)
            } else {
                curr.intraday_low
                    .filter(|v| *v > 0.0)
                    .unwrap_or(curr.price)
                    .min(curr.price)
            };
            return Ok(Vec::new());
        }

        // A fresh extreme re-arms the detector.
        if self.from_high {
            if curr.price > m.extreme {
                m.extreme = curr.price;
                m.fired = false;
                return Ok(Vec::new());
            }
        } else if curr.price < m.extreme {
            m.extreme = curr.price;
            m.fired = false;
            return Ok(Vec::new());
        }
        if m.fired {
            return Ok(Vec::new());
        }

        let Some(anchor) = self.anchor.value(curr, self.from_high) else {
            return Ok(Vec::new());
        };

        let (travel, retraced) = if self.from_high {
            (m.extreme - anchor, m.extreme - curr.price)
        } else {
            (anchor - m.extreme, curr.price - m.extreme)
        };
        if travel <= 0.0 {
            return Ok(Vec::new());
        }
        let ratio = retraced / travel;
        if ratio < self.fraction {
            return Ok(Vec::new());
        }

        m.fired = true;
        let event = EventRecord::new(
            self.event,
            self.rule_id,
            &curr.symbol,
            curr.timestamp,
            curr.price,
        )
        .with_values(m.extreme, curr.price)
        .with_detail("retracement_pct", json!(ratio * 100.0))
        .with_detail("anchor", json!(anchor));
        Ok(vec![event])
    }
}

pub fn register_all(registry: &mut DetectorRegistry) {
    struct Entry(
        &'static str,
        bool,
        f64,
        PullbackAnchor,
        EventType,
        &'static [EventType],
    );
    let entries = [
        Entry(
            "event:system:pullback_75_from_high",
            true,
            0.75,
            PullbackAnchor::OppositeExtreme,
            EventType::Pullback75FromHigh,
            &[EventType::Pullback75FromHigh],
        ),
        Entry(
            "event:system:pullback_25_from_high",
            true,
            0.25,
            PullbackAnchor::OppositeExtreme,
            EventType::Pullback25FromHigh,
            &[EventType::Pullback25FromHigh],
        ),
        Entry(
            "event:system:pullback_75_from_low",
            false,
            0.75,
            PullbackAnchor::OppositeExtreme,
            EventType::Pullback75FromLow,
            &[EventType::Pullback75FromLow],
        ),
        Entry(
            "event:system:pullback_25_from_low",
            false,
            0.25,
            PullbackAnchor::OppositeExtreme,
            EventType::Pullback25FromLow,
            &[EventType::Pullback25FromLow],
        ),
        Entry(
            "event:system:pullback_75_from_high_close",
            true,
            0.75,
            PullbackAnchor::PrevClose,
            EventType::Pullback75FromHighClose,
            &[EventType::Pullback75FromHighClose],
        ),
        Entry(
            "event:system:pullback_25_from_high_close",
            true,
            0.25,
            PullbackAnchor::PrevClose,
            EventType::Pullback25FromHighClose,
            &[EventType::Pullback25FromHighClose],
        ),
        Entry(
            "event:system:pullback_75_from_low_close",
            false,
            0.75,
            PullbackAnchor::PrevClose,
            EventType::Pullback75FromLowClose,
            &[EventType::Pullback75FromLowClose],
        ),
        Entry(
            "event:system:pullback_25_from_low_close",
            false,
            0.25,
            PullbackAnchor::PrevClose,
            EventType::Pullback25FromLowClose,
            &[EventType::Pullback25FromLowClose],
        ),
        Entry(
            "event:system:pullback_75_from_high_open",
            true,
            0.75,
            PullbackAnchor::Open,
            EventType::Pullback75FromHighOpen,
            &[EventType::Pullback75FromHighOpen],
        ),
        Entry(
            "event:system:pullback_25_from_high_open",
            true,
            0.25,
            PullbackAnchor::Open,
            EventType::Pullback25FromHighOpen,
            &[EventType::Pullback25FromHighOpen],
        ),
        Entry(
            "event:system:pullback_75_from_low_open",
            false,
            0.75,
            PullbackAnchor::Open,
            EventType::Pullback75FromLowOpen,
            &[EventType::Pullback75FromLowOpen],
        ),
        Entry(
            "event:system:pullback_25_from_low_open",
            false,
            0.25,
            PullbackAnchor::Open,
            EventType::Pullback25FromLowOpen,
            &[EventType::Pullback25FromLowOpen],
        ),
    ];
    for Entry(rule_id, from_high, fraction, anchor, event, emits) in entries {
        registry.register(Box::new(PullbackDetector::new(
            rule_id, from_high, fraction, anchor, event, emits,
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn mk(price: f64, low: f64, offset: i64) -> TickerState {
        let mut s = TickerState::new("RUNR", Utc::now() + Duration::seconds(offset), price);
        s.intraday_low = Some(low);
        s.open = Some(low);
        s
    }

    #[test]
    fn test_pullback_25_from_high() {
        let detector = PullbackDetector::new(
            "event:system:pullback_25_from_high",
            true,
            0.25,
            PullbackAnchor::OppositeExtreme,
            EventType::Pullback25FromHigh,
            &[EventType::Pullback25FromHigh],
        );
        let mut memo = Memo::None;

        // Low 10, runs to 20, pulls back.
        let s0 = mk(10.0, 10.0, 0);
        let s1 = mk(20.0, 10.0, 1);
        let s2 = mk(18.0, 10.0, 2); // 20% retrace, below fraction
        let s3 = mk(17.0, 10.0, 3); // 30% retrace, fires

        detector
            .evaluate(&DetectorCtx { prev: None, curr: &s0 }, &mut memo)
            .unwrap();
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s0), curr: &s1 }, &mut memo)
            .unwrap()
            .is_empty());
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s1), curr: &s2 }, &mut memo)
            .unwrap()
            .is_empty());
        let fired = detector
            .evaluate(&DetectorCtx { prev: Some(&s2), curr: &s3 }, &mut memo)
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].prev_value, Some(20.0));

        // Deeper pullback does not fire again for the same extreme.
        let s4 = mk(16.0, 10.0, 4);
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s3), curr: &s4 }, &mut memo)
            .unwrap()
            .is_empty());

        // New high re-arms.
        let s5 = mk(21.0, 10.0, 5);
        let s6 = mk(18.0, 10.0, 6); // (21-18)/(21-10) = 27%
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s4), curr: &s5 }, &mut memo)
            .unwrap()
            .is_empty());
        assert_eq!(
            detector
                .evaluate(&DetectorCtx { prev: Some(&s5), curr: &s6 }, &mut memo)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_pullback_from_low_bounce() {
        let detector = PullbackDetector::new(
            "event:system:pullback_75_from_low_close",
            false,
            0.75,
            PullbackAnchor::PrevClose,
            EventType::Pullback75FromLowClose,
            &[EventType::Pullback75FromLowClose],
        );
        let mut memo = Memo::None;
        let mk = |price: f64, offset: i64| {
            let mut s = TickerState::new("DIPR", Utc::now() + Duration::seconds(offset), price);
            s.prev_close = Some(100.0);
            s.intraday_high = Some(100.0);
            s
        };
        // Falls from 100 to 80, bounces to 95+ (75% of the 20-point drop).
        let s0 = mk(100.0, 0);
        let s1 = mk(80.0, 1);
        let s2 = mk(90.0, 2); // 50% bounce
        let s3 = mk(95.5, 3); // 77.5% bounce
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
        let fired = detector
            .evaluate(&DetectorCtx { prev: Some(&s2), curr: &s3 }, &mut memo)
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event_type, EventType::Pullback75FromLowClose);
    }

    #[test]
    fn test_no_fire_without_travel() {
        let detector = PullbackDetector::new(
            "event:system:pullback_25_from_high",
            true,
            0.25,
            PullbackAnchor::OppositeExtreme,
            EventType::Pullback25FromHigh,
            &[EventType::Pullback25FromHigh],
        );
        let mut memo = Memo::None;
        // Extreme never rises above the anchor: travel <= 0.
        let s0 = mk(10.0, 10.0, 0);
        let s1 = mk(9.9, 10.0, 1);
        detector
            .evaluate(&DetectorCtx { prev: None, curr: &s0 }, &mut memo)
            .unwrap();
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s0), curr: &s1 }, &mut memo)
            .unwrap()
            .is_empty());
    }
}
