//! Age-based sampling for the Elasticsearch consumer. When the pipeline
//! falls behind, old low-severity messages are shed probabilistically: the
//! further behind a message is, the likelier the drop, with a half-life per
//! severity level. Critical messages are never dropped. Drops are counted
//! per app and per level and emitted once a minute for alerting.

use crate::decode::{FieldMap, FieldValue};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tracing::trace;

/// Messages younger than this are never dropped.
const DROP_GRACE_SECONDS: f64 = 120.0;

/// Probability of dropping a decoded message, given how far behind it is.
/// `1 - 2^(-delay/half_life)` past the grace window, clamped to zero inside
/// it. Messages without a level are treated as debug, unless the raw text
/// suggests a failure, which promotes them to critical.
pub fn drop_probability(fields: &FieldMap, now: DateTime<Utc>) -> f64 {
    let Some(FieldValue::Timestamp(timestamp)) = fields.get("timestamp") else {
        return 0.0;
    };
    let delay = (now - *timestamp).num_milliseconds() as f64 / 1000.0 - DROP_GRACE_SECONDS;
    if delay <= 0.0 {
        return 0.0;
    }

    let level = match fields.get("level").and_then(FieldValue::as_str) {
        Some(level) if !level.is_empty() => level.to_string(),
        _ => {
            let raw = fields
                .get("rawlog")
                .and_then(FieldValue::as_str)
                .unwrap_or("")
                .to_lowercase();
            if raw.contains("panic") || raw.contains("err") {
                "critical".to_string()
            } else {
                "debug".to_string()
            }
        }
    };

    // The delay at which half the messages of this level are dropped.
    let half_dropped: f64 = match level.as_str() {
        "critical" => return 0.0,
        "trace" => 600.0,
        "info" => 3600.0,
        "warning" => 7200.0,
        "error" => 14400.0,
        // debug, and any level we don't recognize
        _ => 1800.0,
    };

    1.0 - (-delay / half_dropped).exp2()
}

#[derive(Debug)]
struct DropEvent {
    app: String,
    level: String,
}

/// Aggregator for dropped-message counts. Owned by the record processor:
/// constructed at startup, fed by the sampler, drained on shutdown. Counts
/// are bucketed per minute and emitted as one event per bucket.
pub struct DropStats {
    tx: mpsc::Sender<DropEvent>,
    task: JoinHandle<()>,
}

impl DropStats {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<DropEvent>(64);
        let task = tokio::spawn(async move {
            let mut dropped: BTreeMap<String, u64> = BTreeMap::new();
            let mut total: u64 = 0;
            let mut tick = interval_at(
                Instant::now() + Duration::from_secs(60),
                Duration::from_secs(60),
            );

            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => {
                            *dropped.entry(format!("app={}", event.app)).or_insert(0) += 1;
                            *dropped.entry(format!("level={}", event.level)).or_insert(0) += 1;
                            total += 1;
                        }
                        None => {
                            emit(&mut dropped, &mut total);
                            break;
                        }
                    },
                    _ = tick.tick() => emit(&mut dropped, &mut total),
                }
            }
        });

        Self { tx, task }
    }

    pub async fn record(&self, fields: &FieldMap) {
        let app = match fields.get("container_app").and_then(FieldValue::as_str) {
            Some(app) if !app.is_empty() => app.to_string(),
            _ => "<unknown>".to_string(),
        };
        let level = match fields.get("level").and_then(FieldValue::as_str) {
            Some(level) if !level.is_empty() => level.to_string(),
            _ => "debug".to_string(),
        };
        let _ = self.tx.send(DropEvent { app, level }).await;
    }

    /// Emit the in-progress bucket and stop the aggregator.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

fn emit(dropped: &mut BTreeMap<String, u64>, total: &mut u64) {
    let counts = serde_json::to_string(&dropped).unwrap_or_default();
    trace!(total_dropped = *total, counts = %counts, "drop-stats");
    dropped.clear();
    *total = 0;
}
