//! Opening-range and consolidation breakout detectors.

use anyhow::Result;
use serde_json::json;

use crate::detectors::{Detector, DetectorCtx, DetectorRegistry, Memo};
use crate::models::{EventRecord, EventType, Session};

/// Bars of tight range required before a consolidation is armed.
const CONSOLIDATION_MIN_BARS: u32 = 3;
/// A bar is "tight" when its running range is below this fraction of ATR.
const CONSOLIDATION_RANGE_ATR: f64 = 0.5;
const CONSOLIDATION_BAR_SECONDS: i64 = 60;

/// Opening-range breakout: the session's high/low over the first N minutes
/// freeze at the N-minute mark; a later cross of that range fires once per
/// direction per session.
pub struct OrbDetector {
    minutes: i64,
}

impl OrbDetector {
    pub fn new(minutes: i64) -> Self {
        Self {
            minutes: minutes.max(1),
        }
    }
}

impl Detector for OrbDetector {
    fn rule_id(&self) -> &'static str {
        "event:system:orb_breakout"
    }

    fn emits(&self) -> &'static [EventType] {
        &[EventType::OrbBreakoutUp, EventType::OrbBreakoutDown]
    }

    fn initial_safe(&self) -> bool {
        true
    }

    fn evaluate(&self, ctx: &DetectorCtx<'_>, memo: &mut Memo) -> Result<Vec<EventRecord>> {
        let curr = ctx.curr;
        if curr.session != Session::MarketOpen {
            return Ok(Vec::new());
        }
        let now = curr.unix_seconds();
        let m = memo.orb();

        if !m.active {
            m.active = true;
            m.open_ts = now;
            // Seed from upstream boundaries when it already froze a range,
            // otherwise start accumulating from the first observed tick.
            m.high = curr.or_high.unwrap_or(curr.price);
            m.low = curr.or_low.filter(|v| *v > 0.0).unwrap_or(curr.price);
            m.frozen = curr.or_high.is_some() && curr.or_low.is_some();
            return Ok(Vec::new());
        }

        if !m.frozen {
            if now - m.open_ts < self.minutes * 60 {
                m.high = m.high.max(curr.price);
                m.low = m.low.min(curr.price);
                return Ok(Vec::new());
            }
            m.frozen = true;
        }

        let mut events = Vec::new();
        if !m.fired_up && curr.price > m.high {
            m.fired_up = true;
            events.push(
                EventRecord::new(
                    EventType::OrbBreakoutUp,
                    self.rule_id(),
                    &curr.symbol,
                    curr.timestamp,
                    curr.price,
                )
                .with_values(m.high, curr.price)
                .with_detail("range_high", json!(m.high))
                .with_detail("range_low", json!(m.low))
                .with_detail("range_minutes", json!(self.minutes)),
            );
        }
        if !m.fired_down && curr.price < m.low {
            m.fired_down = true;
            events.push(
                EventRecord::new(
                    EventType::OrbBreakoutDown,
                    self.rule_id(),
                    &curr.symbol,
                    curr.timestamp,
                    curr.price,
                )
                .with_values(m.low, curr.price)
                .with_detail("range_high", json!(m.high))
                .with_detail("range_low", json!(m.low))
                .with_detail("range_minutes", json!(self.minutes)),
            );
        }
        Ok(events)
    }
}

/// Consolidation breakout: after at least `CONSOLIDATION_MIN_BARS`
/// one-minute bars whose combined range stays under half an ATR, a close
/// outside the band fires and the band rebuilds.
pub struct ConsolidationDetector;

impl ConsolidationDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConsolidationDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for ConsolidationDetector {
    fn rule_id(&self) -> &'static str {
        "event:system:consolidation_breakout"
    }

    fn emits(&self) -> &'static [EventType] {
        &[
            EventType::ConsolidationBreakoutUp,
            EventType::ConsolidationBreakoutDown,
        ]
    }

    fn initial_safe(&self) -> bool {
        true
    }

    fn default_cooldown_s(&self) -> u64 {
        300
    }

    fn evaluate(&self, ctx: &DetectorCtx<'_>, memo: &mut Memo) -> Result<Vec<EventRecord>> {
        let curr = ctx.curr;
        let Some(atr) = curr.atr.filter(|v| *v > 0.0) else {
            return Ok(Vec::new());
        };
        let bar = curr.unix_seconds() / CONSOLIDATION_BAR_SECONDS;
        let m = memo.consolidation();

        if !m.seeded {
            m.seeded = true;
            m.cur_bar = bar;
            m.cur_high = curr.price;
            m.cur_low = curr.price;
            m.band_high = curr.price;
            m.band_low = curr.price;
            m.tight_bars = 0;
            m.armed = false;
            return Ok(Vec::new());
        }

        // Armed band: any trade outside it is the breakout.
        if m.armed {
            let fired = if curr.price > m.band_high {
                Some((EventType::ConsolidationBreakoutUp, m.band_high))
            } else if curr.price < m.band_low {
                Some((EventType::ConsolidationBreakoutDown, m.band_low))
            } else {
                None
            };
            if let Some((ty, edge)) = fired {
                let event = EventRecord::new(
                    ty,
                    self.rule_id(),
                    &curr.symbol,
                    curr.timestamp,
                    curr.price,
                )
                .with_values(edge, curr.price)
                .with_detail("band_high", json!(m.band_high))
                .with_detail("band_low", json!(m.band_low))
                .with_detail("bars", json!(m.tight_bars));
                // Breakout consumes the consolidation; rebuild from here.
                m.cur_bar = bar;
                m.cur_high = curr.price;
                m.cur_low = curr.price;
                m.band_high = curr.price;
                m.band_low = curr.price;
                m.tight_bars = 0;
                m.armed = false;
                return Ok(vec![event]);
            }
        }

        if bar == m.cur_bar {
            m.cur_high = m.cur_high.max(curr.price);
            m.cur_low = m.cur_low.min(curr.price);
            return Ok(Vec::new());
        }

        // Bar rolled over: fold the finished bar into the band and test it.
        m.band_high = m.band_high.max(m.cur_high);
        m.band_low = m.band_low.min(m.cur_low);
        m.cur_bar = bar;
        m.cur_high = curr.price;
        m.cur_low = curr.price;

        if (m.band_high - m.band_low) / atr < CONSOLIDATION_RANGE_ATR {
            m.tight_bars += 1;
            if m.tight_bars >= CONSOLIDATION_MIN_BARS {
                m.armed = true;
            }
        } else {
            // Range blew out without a clean breakout: restart the band.
            m.band_high = curr.price;
            m.band_low = curr.price;
            m.tight_bars = 0;
            m.armed = false;
        }
        Ok(Vec::new())
    }
}

pub fn register_all(registry: &mut DetectorRegistry, orb_minutes: i64) {
    registry.register(Box::new(OrbDetector::new(orb_minutes)));
    registry.register(Box::new(ConsolidationDetector::new()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TickerState;
    use chrono::{TimeZone, Utc};

    fn mk(price: f64, secs: i64) -> TickerState {
        let ts = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        let mut s = TickerState::new("ORBT", ts, price);
        s.session = Session::MarketOpen;
        s.atr = Some(2.0);
        s
    }

    #[test]
    fn test_orb_freezes_then_breaks_out() {
        let detector = OrbDetector::new(5);
        let mut memo = Memo::None;

        // Range builds over the first five minutes: 100..102.
        let s0 = mk(100.0, 0);
        let s1 = mk(102.0, 60);
        let s2 = mk(101.0, 200);
        for (prev, curr) in [(None, &s0), (Some(&s0), &s1), (Some(&s1), &s2)] {
            assert!(detector
                .evaluate(&DetectorCtx { prev, curr }, &mut memo)
                .unwrap()
                .is_empty());
        }

        // Inside the frozen range after the mark: nothing.
        let s3 = mk(101.5, 320);
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s2), curr: &s3 }, &mut memo)
            .unwrap()
            .is_empty());

        // Break above the frozen high.
        let s4 = mk(102.4, 360);
        let fired = detector
            .evaluate(&DetectorCtx { prev: Some(&s3), curr: &s4 }, &mut memo)
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].event_type, EventType::OrbBreakoutUp);
        assert_eq!(fired[0].prev_value, Some(102.0));

        // Once per direction per session.
        let s5 = mk(103.0, 420);
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s4), curr: &s5 }, &mut memo)
            .unwrap()
            .is_empty());

        // The downside is still armed.
        let s6 = mk(99.5, 480);
        let down = detector
            .evaluate(&DetectorCtx { prev: Some(&s5), curr: &s6 }, &mut memo)
            .unwrap();
        assert_eq!(down.len(), 1);
        assert_eq!(down[0].event_type, EventType::OrbBreakoutDown);
    }

    #[test]
    fn test_orb_ticks_inside_window_extend_range() {
        let detector = OrbDetector::new(5);
        let mut memo = Memo::None;
        let s0 = mk(100.0, 0);
        let s1 = mk(104.0, 120); // extends the range high
        let s2 = mk(103.0, 400);
        detector
            .evaluate(&DetectorCtx { prev: None, curr: &s0 }, &mut memo)
            .unwrap();
        detector
            .evaluate(&DetectorCtx { prev: Some(&s0), curr: &s1 }, &mut memo)
            .unwrap();
        // 103 is below the 104 range high: no breakout.
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s1), curr: &s2 }, &mut memo)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_consolidation_arms_then_breaks() {
        let detector = ConsolidationDetector::new();
        let mut memo = Memo::None;

        // Four one-minute bars inside a 0.6-wide band (ATR 2.0 -> ratio 0.3).
        let mut prev: Option<TickerState> = None;
        let mut fired = Vec::new();
        let prices = [
            (100.0, 0),
            (100.3, 30),
            (100.1, 65),
            (100.4, 95),
            (100.2, 130),
            (100.3, 185),
            (100.1, 245),
            (100.2, 305),
        ];
        for (price, secs) in prices {
            let curr = mk(price, secs);
            let events = detector
                .evaluate(
                    &DetectorCtx {
                        prev: prev.as_ref(),
                        curr: &curr,
                    },
                    &mut memo,
                )
                .unwrap();
            fired.extend(events);
            prev = Some(curr);
        }
        assert!(fired.is_empty(), "no breakout inside the band");

        // Pop above the band.
        let breakout = mk(101.5, 340);
        let events = detector
            .evaluate(
                &DetectorCtx {
                    prev: prev.as_ref(),
                    curr: &breakout,
                },
                &mut memo,
            )
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ConsolidationBreakoutUp);
    }

    #[test]
    fn test_consolidation_needs_atr() {
        let detector = ConsolidationDetector::new();
        let mut memo = Memo::None;
        let mut s = mk(100.0, 0);
        s.atr = None;
        assert!(detector
            .evaluate(&DetectorCtx { prev: None, curr: &s }, &mut memo)
            .unwrap()
            .is_empty());
    }
}
