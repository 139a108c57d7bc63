//! Per-second analytics over the live tick flow.

pub mod rolling_window;

pub use rolling_window::{PriceChanges, RollingWindowTracker, VolumeWindows};
