//! Trigger configuration and the event view triggers evaluate against.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

fn default_true() -> bool {
    true
}

fn default_cooldown() -> u64 {
    60
}

/// Condition predicate; all populated filters are AND-combined. Empty lists
/// mean "no constraint".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConditions {
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub symbols_include: Vec<String>,
    #[serde(default)]
    pub symbols_exclude: Vec<String>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub min_volume: Option<i64>,
    #[serde(default)]
    pub min_rvol: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerAction {
    /// Invoke the external orchestrator with the firing event as context.
    Workflow { workflow_id: String },
    /// Publish a rendered message onto the user's alert stream.
    Alert { message_template: String },
}

/// A user-scoped reactive rule, persisted as one hash field under
/// `triggers:active:{user_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: TriggerConditions,
    pub action: TriggerAction,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    /// Unix seconds of the last dispatch; best-effort persisted.
    #[serde(default)]
    pub last_triggered: Option<f64>,
}

impl TriggerConfig {
    /// Validate and fill generated fields. Returns an error for configs that
    /// could never fire or would misbehave.
    pub fn validate(mut self) -> Result<Self> {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.user_id.is_empty() {
            bail!("trigger requires a user_id");
        }
        if self.name.trim().is_empty() {
            bail!("trigger requires a name");
        }
        if let TriggerAction::Workflow { workflow_id } = &self.action {
            if workflow_id.is_empty() {
                bail!("workflow action requires a workflow_id");
            }
        }
        if let (Some(min), Some(max)) = (self.conditions.min_price, self.conditions.max_price) {
            if min > max {
                bail!("min_price exceeds max_price");
            }
        }
        Ok(self)
    }
}

/// Flat view of a market event as read back from the stream.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub event_id: String,
    pub event_type: String,
    pub symbol: String,
    pub price: Option<f64>,
    pub volume: Option<i64>,
    pub rvol: Option<f64>,
    pub timestamp: f64,
    /// All stream fields verbatim, for template rendering and workflow
    /// context.
    pub raw: HashMap<String, String>,
}

impl TriggerEvent {
    /// Build from raw stream fields; unparseable numerics degrade to None.
    pub fn from_stream_fields(event_id: &str, fields: HashMap<String, String>) -> Self {
        let price = fields.get("price").and_then(|v| v.parse().ok());
        let volume = fields.get("volume").and_then(|v| v.parse().ok());
        let rvol = fields.get("rvol").and_then(|v| v.parse().ok());
        let timestamp = fields
            .get("timestamp")
            .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
            .map(|ts| ts.timestamp() as f64)
            .unwrap_or(0.0);
        Self {
            event_id: event_id.to_string(),
            event_type: fields.get("event_type").cloned().unwrap_or_default(),
            symbol: fields.get("symbol").cloned().unwrap_or_default(),
            price,
            volume,
            rvol,
            timestamp,
            raw: fields,
        }
    }

    /// Substitute `{field}` placeholders from the raw event fields, plus
    /// `{trigger_name}`.
    pub fn render_template(&self, template: &str, trigger_name: &str) -> String {
        let mut out = String::with_capacity(template.len() + 32);
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            match after.find('}') {
                Some(end) => {
                    let key = &after[..end];
                    if key == "trigger_name" {
                        out.push_str(trigger_name);
                    } else if let Some(value) = self.raw.get(key) {
                        out.push_str(value);
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}
