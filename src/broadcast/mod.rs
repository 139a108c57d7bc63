//! Redis stream fan-out for fired events.
//!
//! A dedicated task drains an mpsc channel and XADDs each event onto the
//! market event stream. The engine uses `try_send` into this channel, so a
//! slow or down Redis never stalls detection; overflow is counted upstream.

use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::models::EventRecord;

/// Append-only stream all fired events land on.
pub const MARKET_EVENTS_STREAM: &str = "stream:events:market";

const PUBLISH_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
pub struct PublisherStats {
    pub published: AtomicU64,
    pub errors: AtomicU64,
}

/// Spawn the publisher task. Returns the sender the engine feeds and the
/// task handle.
pub fn spawn_publisher(
    conn: ConnectionManager,
    stats: Arc<PublisherStats>,
    shutdown: watch::Receiver<bool>,
) -> (mpsc::Sender<Arc<EventRecord>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(PUBLISH_CHANNEL_CAPACITY);
    let handle = tokio::spawn(run_publisher(conn, rx, stats, shutdown));
    (tx, handle)
}

async fn run_publisher(
    mut conn: ConnectionManager,
    mut rx: mpsc::Receiver<Arc<EventRecord>>,
    stats: Arc<PublisherStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(stream = MARKET_EVENTS_STREAM, "event stream publisher started");
    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(event) = maybe else { break };
                publish(&mut conn, &stats, &event).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    // Drain what is already queued, then close.
                    while let Ok(event) = rx.try_recv() {
                        publish(&mut conn, &stats, &event).await;
                    }
                    break;
                }
            }
        }
    }
    info!("event stream publisher stopped");
}

async fn publish(conn: &mut ConnectionManager, stats: &PublisherStats, event: &EventRecord) {
    let fields = event.to_stream_fields();
    let mut cmd = redis::cmd("XADD");
    cmd.arg(MARKET_EVENTS_STREAM).arg("*");
    for (key, value) in &fields {
        cmd.arg(*key).arg(value);
    }
    let appended: redis::RedisResult<String> = cmd.query_async(conn).await;
    match appended {
        Ok(_) => {
            stats.published.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            stats.errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                symbol = %event.symbol,
                event_type = %event.event_type,
                error = %err,
                "event stream publish failed"
            );
        }
    }
}
