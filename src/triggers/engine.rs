//! Trigger evaluation engine.
//!
//! Consumes the market event stream through a consumer group, evaluates
//! every event against all cached user triggers, and dispatches matching
//! actions: an alert record onto the user's capped stream, or a
//! fire-and-forget workflow invocation against the external orchestrator.
//!
//! `last_triggered` is advanced in memory at match time (before the async
//! dispatch) so cooldowns hold even while dispatches are in flight; the
//! Redis write-back is best effort, so a restart may allow one spurious
//! re-fire inside the cooldown window. That trade-off is accepted.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broadcast::MARKET_EVENTS_STREAM;
use crate::triggers::model::{TriggerAction, TriggerConfig, TriggerEvent};

const CONSUMER_GROUP: &str = "trigger-engine";
const ACTIVE_KEY_PREFIX: &str = "triggers:active";
const BLOCK_MS: usize = 2000;
const BATCH_SIZE: usize = 50;
const ALERTS_MAXLEN: usize = 1000;

type TriggerCache = HashMap<String, HashMap<String, TriggerConfig>>;

#[derive(Debug, Default)]
pub struct TriggerEngineStats {
    pub events_seen: AtomicU64,
    pub matches: AtomicU64,
    pub alerts_published: AtomicU64,
    pub workflows_invoked: AtomicU64,
    pub dispatch_errors: AtomicU64,
    pub malformed_skipped: AtomicU64,
}

pub struct TriggerEngine {
    redis: ConnectionManager,
    http: reqwest::Client,
    orchestrator_url: Option<String>,
    consumer_name: String,
    /// user_id -> trigger_id -> config; enabled triggers only.
    cache: RwLock<TriggerCache>,
    stats: TriggerEngineStats,
}

fn now_unix() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl TriggerEngine {
    pub fn new(redis: ConnectionManager, orchestrator_url: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            redis,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            orchestrator_url,
            consumer_name: format!("engine-{}", &Uuid::new_v4().simple().to_string()[..8]),
            cache: RwLock::new(HashMap::new()),
            stats: TriggerEngineStats::default(),
        })
    }

    pub fn stats(&self) -> &TriggerEngineStats {
        &self.stats
    }

    // ── registration ─────────────────────────────────────────────

    /// Add or update a trigger: persist to the registry hash and refresh the
    /// evaluation cache (disabled configs persist but do not evaluate).
    pub async fn register(&self, config: TriggerConfig) -> Result<TriggerConfig> {
        let config = config.validate()?;
        let key = format!("{ACTIVE_KEY_PREFIX}:{}", config.user_id);
        let payload = serde_json::to_string(&config)?;
        let mut conn = self.redis.clone();
        let _: () = conn
            .hset(&key, &config.id, payload)
            .await
            .context("persisting trigger")?;

        let mut cache = self.cache.write();
        if config.enabled {
            cache
                .entry(config.user_id.clone())
                .or_default()
                .insert(config.id.clone(), config.clone());
        } else if let Some(user_triggers) = cache.get_mut(&config.user_id) {
            user_triggers.remove(&config.id);
            if user_triggers.is_empty() {
                cache.remove(&config.user_id);
            }
        }
        info!(
            trigger = %config.id,
            user = %config.user_id,
            enabled = config.enabled,
            "registered trigger"
        );
        Ok(config)
    }

    /// Remove a trigger. Returns whether it existed in the registry.
    pub async fn unregister(&self, user_id: &str, trigger_id: &str) -> Result<bool> {
        let key = format!("{ACTIVE_KEY_PREFIX}:{user_id}");
        let mut conn = self.redis.clone();
        let removed: i64 = conn
            .hdel(&key, trigger_id)
            .await
            .context("removing trigger")?;

        let mut cache = self.cache.write();
        if let Some(user_triggers) = cache.get_mut(user_id) {
            user_triggers.remove(trigger_id);
            if user_triggers.is_empty() {
                cache.remove(user_id);
            }
        }
        info!(trigger = %trigger_id, user = %user_id, existed = removed > 0, "unregistered trigger");
        Ok(removed > 0)
    }

    /// In-memory (enabled) triggers for a user.
    pub fn user_triggers(&self, user_id: &str) -> HashMap<String, TriggerConfig> {
        self.cache.read().get(user_id).cloned().unwrap_or_default()
    }

    /// All of a user's triggers straight from the registry (source of
    /// truth), including disabled ones.
    pub async fn user_triggers_from_store(
        &self,
        user_id: &str,
    ) -> Result<HashMap<String, TriggerConfig>> {
        let key = format!("{ACTIVE_KEY_PREFIX}:{user_id}");
        let mut conn = self.redis.clone();
        let entries: HashMap<String, String> = conn.hgetall(&key).await?;
        let mut out = HashMap::new();
        for (field, raw) in entries {
            match serde_json::from_str::<TriggerConfig>(&raw) {
                Ok(config) => {
                    out.insert(config.id.clone(), config);
                }
                Err(err) => {
                    warn!(key = %key, field = %field, error = %err, "skipping malformed trigger")
                }
            }
        }
        Ok(out)
    }

    // ── lifecycle ────────────────────────────────────────────────

    /// Create the consumer group, hydrate the cache and start the consumer
    /// loop.
    pub async fn start(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>> {
        let mut conn = self.redis.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(MARKET_EVENTS_STREAM)
            .arg(CONSUMER_GROUP)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => info!(group = CONSUMER_GROUP, "created consumer group"),
            Err(err) if err.to_string().contains("BUSYGROUP") => {
                debug!(group = CONSUMER_GROUP, "consumer group already exists")
            }
            Err(err) => return Err(err).context("creating consumer group"),
        }

        self.hydrate().await?;
        let loaded: usize = self.cache.read().values().map(|t| t.len()).sum();
        info!(
            consumer = %self.consumer_name,
            triggers_loaded = loaded,
            "trigger engine started"
        );

        let engine = self.clone();
        Ok(tokio::spawn(engine.consume_loop(shutdown)))
    }

    /// Scan every `triggers:active:*` hash into the evaluation cache.
    async fn hydrate(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let pattern = format!("{ACTIVE_KEY_PREFIX}:*");
        let mut cache: TriggerCache = HashMap::new();
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .context("scanning trigger registry")?;
            for key in keys {
                let user_id = key.rsplit(':').next().unwrap_or_default().to_string();
                let entries: HashMap<String, String> = conn.hgetall(&key).await?;
                let mut user_triggers = HashMap::new();
                for (_field, raw) in entries {
                    match serde_json::from_str::<TriggerConfig>(&raw) {
                        Ok(config) if config.enabled => {
                            user_triggers.insert(config.id.clone(), config);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(key = %key, error = %err, "skipping malformed trigger")
                        }
                    }
                }
                if !user_triggers.is_empty() {
                    cache.insert(user_id, user_triggers);
                }
            }
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        *self.cache.write() = cache;
        Ok(())
    }

    async fn consume_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut conn = self.redis.clone();
        let options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.consumer_name)
            .count(BATCH_SIZE)
            .block(BLOCK_MS);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let read = tokio::select! {
                r = conn.xread_options::<_, _, StreamReadReply>(
                    &[MARKET_EVENTS_STREAM],
                    &[">"],
                    &options,
                ) => r,
                _ = shutdown.changed() => continue,
            };

            let reply = match read {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(error = %err, "stream read failed, retrying in 2s");
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                    continue;
                }
            };

            for stream_key in reply.keys {
                for entry in stream_key.ids {
                    self.stats.events_seen.fetch_add(1, Ordering::Relaxed);
                    let mut fields: HashMap<String, String> = HashMap::new();
                    let mut malformed = false;
                    for (field, value) in &entry.map {
                        match redis::from_redis_value::<String>(value) {
                            Ok(text) => {
                                fields.insert(field.clone(), text);
                            }
                            Err(_) => malformed = true,
                        }
                    }

                    if malformed || !fields.contains_key("event_type") {
                        self.stats.malformed_skipped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        let event = TriggerEvent::from_stream_fields(&entry.id, fields);
                        let matched = self.evaluate_and_mark(&event, now_unix());
                        for trigger in matched {
                            let engine = self.clone();
                            let event = event.clone();
                            tokio::spawn(async move {
                                engine.dispatch(trigger, event).await;
                            });
                        }
                    }

                    // ACK regardless of dispatch outcome.
                    let ack: redis::RedisResult<i64> = conn
                        .xack(MARKET_EVENTS_STREAM, CONSUMER_GROUP, &[&entry.id])
                        .await;
                    if let Err(err) = ack {
                        warn!(id = %entry.id, error = %err, "xack failed");
                    }
                }
            }
        }
        info!("trigger engine stopped");
    }

    // ── evaluation ───────────────────────────────────────────────

    /// Pure condition check; all filters AND-combined.
    pub fn matches(trigger: &TriggerConfig, event: &TriggerEvent, now: f64) -> bool {
        if !trigger.enabled {
            return false;
        }
        if let Some(last) = trigger.last_triggered {
            if now - last < trigger.cooldown_seconds as f64 {
                return false;
            }
        }
        let cond = &trigger.conditions;
        if !cond.event_types.is_empty() && !cond.event_types.contains(&event.event_type) {
            return false;
        }
        if !cond.symbols_include.is_empty() && !cond.symbols_include.contains(&event.symbol) {
            return false;
        }
        if cond.symbols_exclude.contains(&event.symbol) {
            return false;
        }
        if let Some(min_price) = cond.min_price {
            if event.price.map_or(true, |p| p < min_price) {
                return false;
            }
        }
        if let Some(max_price) = cond.max_price {
            if event.price.map_or(true, |p| p > max_price) {
                return false;
            }
        }
        if let Some(min_rvol) = cond.min_rvol {
            if event.rvol.map_or(true, |r| r < min_rvol) {
                return false;
            }
        }
        if let Some(min_volume) = cond.min_volume {
            if event.volume.map_or(true, |v| v < min_volume) {
                return false;
            }
        }
        true
    }

    /// Find matching triggers and advance their in-memory `last_triggered`
    /// before the (async) dispatch, so cooldowns hold under concurrency.
    fn evaluate_and_mark(&self, event: &TriggerEvent, now: f64) -> Vec<TriggerConfig> {
        Self::evaluate_and_mark_cache(&mut self.cache.write(), event, now)
    }

    fn evaluate_and_mark_cache(
        cache: &mut TriggerCache,
        event: &TriggerEvent,
        now: f64,
    ) -> Vec<TriggerConfig> {
        let mut matched = Vec::new();
        for user_triggers in cache.values_mut() {
            for trigger in user_triggers.values_mut() {
                if Self::matches(trigger, event, now) {
                    trigger.last_triggered = Some(now);
                    matched.push(trigger.clone());
                }
            }
        }
        matched
    }

    // ── dispatch ─────────────────────────────────────────────────

    async fn dispatch(self: Arc<Self>, trigger: TriggerConfig, event: TriggerEvent) {
        self.stats.matches.fetch_add(1, Ordering::Relaxed);

        // Best-effort persistence of the advanced cooldown timestamp.
        let key = format!("{ACTIVE_KEY_PREFIX}:{}", trigger.user_id);
        if let Ok(payload) = serde_json::to_string(&trigger) {
            let mut conn = self.redis.clone();
            let persisted: redis::RedisResult<()> = conn.hset(&key, &trigger.id, payload).await;
            if let Err(err) = persisted {
                warn!(trigger = %trigger.id, error = %err, "last_triggered persist failed");
            }
        }

        let result = match &trigger.action {
            TriggerAction::Alert { message_template } => {
                self.publish_alert(&trigger, &event, message_template).await
            }
            TriggerAction::Workflow { workflow_id } => {
                self.invoke_workflow(&trigger, &event, workflow_id).await
            }
        };
        if let Err(err) = result {
            self.stats.dispatch_errors.fetch_add(1, Ordering::Relaxed);
            error!(trigger = %trigger.id, error = %err, "trigger dispatch failed");
        }
    }

    async fn publish_alert(
        &self,
        trigger: &TriggerConfig,
        event: &TriggerEvent,
        template: &str,
    ) -> Result<()> {
        let message = event.render_template(template, &trigger.name);
        let stream = format!("stream:alerts:{}", trigger.user_id);
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(ALERTS_MAXLEN)
            .arg("*")
            .arg("trigger_id")
            .arg(&trigger.id)
            .arg("trigger_name")
            .arg(&trigger.name)
            .arg("symbol")
            .arg(&event.symbol)
            .arg("event_type")
            .arg(&event.event_type)
            .arg("event_id")
            .arg(&event.event_id)
            .arg("message")
            .arg(&message)
            .query_async(&mut conn)
            .await
            .context("publishing alert")?;
        self.stats.alerts_published.fetch_add(1, Ordering::Relaxed);
        debug!(user = %trigger.user_id, trigger = %trigger.id, "alert published");
        Ok(())
    }

    /// Fire-and-forget orchestrator invocation; the response body is never
    /// awaited beyond status.
    async fn invoke_workflow(
        &self,
        trigger: &TriggerConfig,
        event: &TriggerEvent,
        workflow_id: &str,
    ) -> Result<()> {
        let Some(base) = &self.orchestrator_url else {
            warn!(trigger = %trigger.id, "workflow action with no orchestrator configured");
            return Ok(());
        };
        let url = format!("{}/workflows/{}/invoke", base.trim_end_matches('/'), workflow_id);
        let body = serde_json::json!({
            "query": format!("Trigger '{}' fired for {}", trigger.name, event.symbol),
            "mode": "auto",
            "market_context": {
                "symbol": event.symbol,
                "price": event.price,
                "event_type": event.event_type,
            },
            "trigger_context": {
                "trigger_id": trigger.id,
                "trigger_name": trigger.name,
                "event": event.raw,
            },
        });
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("invoking orchestrator")?;
        if !response.status().is_success() {
            anyhow::bail!("orchestrator returned {}", response.status());
        }
        self.stats.workflows_invoked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
