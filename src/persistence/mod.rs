//! Durable storage for fired events.

pub mod event_writer;

pub use event_writer::{EventWriter, WriterStatsSnapshot};
