//! Upstream snapshot intake: parsing, normalization and worker routing.

pub mod ingestor;
pub mod snapshot;

pub use ingestor::{IngestStats, IngestStatsSnapshot, SnapshotIngestor};
pub use snapshot::EnrichedSnapshot;
