//! New-extreme detectors.
//!
//! Unlike level crossings, the reference value is updated by the event
//! itself: the memo holds the session extreme so far and every push beyond
//! it fires exactly once. Memos reset at the start of each trading session.

use anyhow::Result;

use crate::detectors::{Detector, DetectorCtx, DetectorRegistry, Memo};
use crate::models::{EventRecord, EventType, Session};

pub struct NewExtremeDetector {
    rule_id: &'static str,
    high_event: Option<EventType>,
    low_event: Option<EventType>,
    /// When set, the detector only runs (and its memo only accumulates)
    /// inside this session.
    session_filter: Option<Session>,
    emits: &'static [EventType],
}

impl NewExtremeDetector {
    pub fn new(
        rule_id: &'static str,
        high_event: Option<EventType>,
        low_event: Option<EventType>,
        session_filter: Option<Session>,
        emits: &'static [EventType],
    ) -> Self {
        Self {
            rule_id,
            high_event,
            low_event,
            session_filter,
            emits,
        }
    }
}

impl Detector for NewExtremeDetector {
    fn rule_id(&self) -> &'static str {
        self.rule_id
    }

    fn emits(&self) -> &'static [EventType] {
        self.emits
    }

    fn initial_safe(&self) -> bool {
        true
    }

    fn evaluate(&self, ctx: &DetectorCtx<'_>, memo: &mut Memo) -> Result<Vec<EventRecord>> {
        let curr = ctx.curr;
        if let Some(session) = self.session_filter {
            if curr.session != session {
                // Leaving the session drops the memo so re-entry reseeds.
                if matches!(memo, Memo::Extreme(_)) {
                    *memo = Memo::None;
                }
                return Ok(Vec::new());
            }
        }

        let m = memo.extreme();
        if !m.seeded {
            // First sight seeds from the known extremes without firing.
            m.seeded = true;
            m.high = curr.intraday_high.unwrap_or(curr.price).max(curr.price);
            m.low = curr
                .intraday_low
                .filter(|v| *v > 0.0)
                .unwrap_or(curr.price)
                .min(curr.price);
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        if curr.price > m.high {
            if let Some(ty) = self.high_event {
                events.push(
                    EventRecord::new(ty, self.rule_id, &curr.symbol, curr.timestamp, curr.price)
                        .with_values(m.high, curr.price),
                );
            }
            m.high = curr.price;
        }
        if curr.price < m.low {
            if let Some(ty) = self.low_event {
                events.push(
                    EventRecord::new(ty, self.rule_id, &curr.symbol, curr.timestamp, curr.price)
                        .with_values(m.low, curr.price),
                );
            }
            m.low = curr.price;
        }
        Ok(events)
    }
}

pub fn register_all(registry: &mut DetectorRegistry) {
    registry.register(Box::new(NewExtremeDetector::new(
        "event:system:new_high",
        Some(EventType::NewHigh),
        None,
        None,
        &[EventType::NewHigh],
    )));
    registry.register(Box::new(NewExtremeDetector::new(
        "event:system:new_low",
        None,
        Some(EventType::NewLow),
        None,
        &[EventType::NewLow],
    )));
    registry.register(Box::new(NewExtremeDetector::new(
        "event:system:pre_market_extreme",
        Some(EventType::PreMarketHigh),
        Some(EventType::PreMarketLow),
        Some(Session::PreMarket),
        &[EventType::PreMarketHigh, EventType::PreMarketLow],
    )));
    registry.register(Box::new(NewExtremeDetector::new(
        "event:system:post_market_extreme",
        Some(EventType::PostMarketHigh),
        Some(EventType::PostMarketLow),
        Some(Session::PostMarket),
        &[EventType::PostMarketHigh, EventType::PostMarketLow],
    )));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TickerState;
    use chrono::{Duration, Utc};

    fn new_high_detector() -> NewExtremeDetector {
        NewExtremeDetector::new(
            "event:system:new_high",
            Some(EventType::NewHigh),
            None,
            None,
            &[EventType::NewHigh],
        )
    }

    #[test]
    fn test_new_high_fires_once_per_extreme() {
        let detector = new_high_detector();
        let mut memo = Memo::None;
        let t = Utc::now();

        let mut s1 = TickerState::new("TSLA", t, 250.0);
        s1.intraday_high = Some(250.0);
        let mut s2 = TickerState::new("TSLA", t + Duration::seconds(1), 250.5);
        s2.intraday_high = Some(250.0);

        // First sight seeds.
        assert!(detector
            .evaluate(&DetectorCtx { prev: None, curr: &s1 }, &mut memo)
            .unwrap()
            .is_empty());

        let fired = detector
            .evaluate(&DetectorCtx { prev: Some(&s1), curr: &s2 }, &mut memo)
            .unwrap();
        assert_eq!(fired.len(), 1);
        let event = &fired[0];
        assert_eq!(event.event_type, EventType::NewHigh);
        assert_eq!(event.prev_value, Some(250.0));
        assert_eq!(event.new_value, Some(250.5));
        assert!((event.delta.unwrap() - 0.5).abs() < 1e-9);

        // Same price again: not a new extreme.
        let s3 = TickerState::new("TSLA", t + Duration::seconds(2), 250.5);
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&s2), curr: &s3 }, &mut memo)
            .unwrap()
            .is_empty());

        // Every further push fires again.
        let s4 = TickerState::new("TSLA", t + Duration::seconds(3), 250.75);
        assert_eq!(
            detector
                .evaluate(&DetectorCtx { prev: Some(&s3), curr: &s4 }, &mut memo)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_session_scoped_extreme_reseeds_on_reentry() {
        let detector = NewExtremeDetector::new(
            "event:system:pre_market_extreme",
            Some(EventType::PreMarketHigh),
            Some(EventType::PreMarketLow),
            Some(Session::PreMarket),
            &[EventType::PreMarketHigh, EventType::PreMarketLow],
        );
        let mut memo = Memo::None;
        let t = Utc::now();

        let mut pre = TickerState::new("XYZ", t, 10.0);
        pre.session = Session::PreMarket;
        assert!(detector
            .evaluate(&DetectorCtx { prev: None, curr: &pre }, &mut memo)
            .unwrap()
            .is_empty());

        let mut pre2 = pre.clone();
        pre2.price = 10.5;
        pre2.timestamp = t + Duration::seconds(1);
        assert_eq!(
            detector
                .evaluate(&DetectorCtx { prev: Some(&pre), curr: &pre2 }, &mut memo)
                .unwrap()
                .len(),
            1
        );

        // Regular hours: detector is inert and drops its memo.
        let mut open = pre2.clone();
        open.session = Session::MarketOpen;
        open.price = 20.0;
        assert!(detector
            .evaluate(&DetectorCtx { prev: Some(&pre2), curr: &open }, &mut memo)
            .unwrap()
            .is_empty());
        assert!(matches!(memo, Memo::None));
    }

    #[test]
    fn test_new_low() {
        let detector = NewExtremeDetector::new(
            "event:system:new_low",
            None,
            Some(EventType::NewLow),
            None,
            &[EventType::NewLow],
        );
        let mut memo = Memo::None;
        let t = Utc::now();
        let mut s1 = TickerState::new("F", t, 12.0);
        s1.intraday_low = Some(11.8);
        detector
            .evaluate(&DetectorCtx { prev: None, curr: &s1 }, &mut memo)
            .unwrap();
        let mut s2 = s1.clone();
        s2.price = 11.7;
        s2.timestamp = t + Duration::seconds(1);
        let fired = detector
            .evaluate(&DetectorCtx { prev: Some(&s1), curr: &s2 }, &mut memo)
            .unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].prev_value, Some(11.8));
    }
}
