//! PulseDetect Backend Library
//!
//! Real-time market event engine: consumes enriched per-symbol snapshots,
//! runs the detector set over each update, deduplicates and enriches fired
//! events, fans them out to subscribers and persists them to TimescaleDB.
//! Exposes all core modules for use by the binary and tests.

pub mod analytics;
pub mod broadcast;
pub mod config;
pub mod detectors;
pub mod engine;
pub mod ingest;
pub mod models;
pub mod persistence;
pub mod triggers;

pub use config::Config;
pub use models::{EventRecord, EventType, Session, TickerState};
