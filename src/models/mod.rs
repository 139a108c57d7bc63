//! Core data model: event tags, event records and the normalized per-symbol
//! snapshot consumed by detectors.

pub mod event;
pub mod ticker;

pub use event::{EventRecord, EventType};
pub use ticker::{Session, TickerState};
