//! User-registered reactive triggers.

pub mod engine;
pub mod model;

pub use engine::{TriggerEngine, TriggerEngineStats};
pub use model::{TriggerAction, TriggerConditions, TriggerConfig, TriggerEvent};
