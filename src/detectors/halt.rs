//! Halt / resume state machine.
//!
//! The only true state machine at detector level: `ACTIVE <-> HALTED` on the
//! edges of the halt flag, with the halt start memoized so the resume event
//! can report the outage duration.

use anyhow::Result;
use serde_json::json;

use crate::detectors::{Detector, DetectorCtx, DetectorRegistry, Memo};
use crate::models::{EventRecord, EventType};

pub struct HaltResumeDetector;

impl HaltResumeDetector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HaltResumeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for HaltResumeDetector {
    fn rule_id(&self) -> &'static str {
        "event:system:halt_resume"
    }

    fn emits(&self) -> &'static [EventType] {
        &[EventType::Halt, EventType::Resume]
    }

    fn initial_safe(&self) -> bool {
        true
    }

    fn evaluate(&self, ctx: &DetectorCtx<'_>, memo: &mut Memo) -> Result<Vec<EventRecord>> {
        let curr = ctx.curr;
        let now = curr.unix_seconds();
        let m = memo.halt();

        if !m.seeded {
            m.seeded = true;
            m.halted = curr.halted;
            if curr.halted {
                // First sight of a symbol already halted (e.g. after a
                // restart) still surfaces the halt.
                m.halted_at = now;
                return Ok(vec![EventRecord::new(
                    EventType::Halt,
                    self.rule_id(),
                    &curr.symbol,
                    curr.timestamp,
                    curr.price,
                )]);
            }
            return Ok(Vec::new());
        }

        if curr.halted == m.halted {
            return Ok(Vec::new());
        }
        m.halted = curr.halted;

        if curr.halted {
            m.halted_at = now;
            return Ok(vec![EventRecord::new(
                EventType::Halt,
                self.rule_id(),
                &curr.symbol,
                curr.timestamp,
                curr.price,
            )]);
        }

        let mut event = EventRecord::new(
            EventType::Resume,
            self.rule_id(),
            &curr.symbol,
            curr.timestamp,
            curr.price,
        );
        if m.halted_at > 0 {
            event = event.with_detail("duration_seconds", json!(now - m.halted_at));
        }
        m.halted_at = 0;
        Ok(vec![event])
    }

    fn reset_session(&self, memo: &mut Memo) {
        // Carry an open halt across the session roll; only the seed flag on
        // a flat symbol is irrelevant to keep.
        if let Memo::Halt(m) = memo {
            if !m.halted {
                *memo = Memo::None;
            }
        }
    }
}

pub fn register_all(registry: &mut DetectorRegistry) {
    registry.register(Box::new(HaltResumeDetector::new()));
}
