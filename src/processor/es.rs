//! Accommodations for the Elasticsearch consumer: lines that must not reach
//! the index at all, the age-based sampling policy, and a field rewrite for
//! names Elasticsearch's dynamic mappings choke on.

use super::sampler::{drop_probability, DropStats};
use crate::decode::{FieldMap, FieldValue};
use chrono::Utc;

pub struct EsTransform {
    drop_stats: DropStats,
}

impl EsTransform {
    pub fn new(drop_stats: DropStats) -> Self {
        Self { drop_stats }
    }

    /// Apply the Elasticsearch policy to a decoded message. `None` means the
    /// message is intentionally not forwarded (ignored or sampled away).
    pub async fn apply(&self, fields: FieldMap) -> Option<FieldMap> {
        self.apply_with_roll(fields, rand::random::<f64>()).await
    }

    /// `roll` in [0,1) decides the sampling coin toss; split out so tests
    /// are deterministic.
    pub async fn apply_with_roll(&self, fields: FieldMap, roll: f64) -> Option<FieldMap> {
        if Self::should_ignore(&fields) {
            return None;
        }

        if roll < drop_probability(&fields, Utc::now()) {
            self.drop_stats.record(&fields).await;
            return None;
        }

        Some(make_es_safe(fields))
    }

    fn should_ignore(fields: &FieldMap) -> bool {
        let app = fields
            .get("container_app")
            .and_then(FieldValue::as_str)
            .unwrap_or("");

        // The search cluster's own haproxy echoes every query; indexing those
        // lines would surface a user's search inside its own results.
        if app == "haproxy-logs"
            && fields.get("type").and_then(FieldValue::as_str) != Some("Kayvee")
        {
            return true;
        }

        // Kinesis consumers logging through the pipeline replay daemon noise.
        let rawlog = fields
            .get("rawlog")
            .and_then(FieldValue::as_str)
            .unwrap_or("");
        if app.starts_with("kinesis-")
            && rawlog.starts_with("SEVERE: Received error line from subprocess")
        {
            return true;
        }

        false
    }

    /// Emit the final drop-stats bucket.
    pub async fn shutdown(self) {
        self.drop_stats.shutdown().await;
    }
}

/// Rewrite field names Elasticsearch rejects (leading underscores, dots) and
/// flatten nested values to strings. Dynamic mappings get finicky once a
/// field has been seen as an object: every later log carrying it as a
/// non-object would fail to index.
pub fn make_es_safe(fields: FieldMap) -> FieldMap {
    fields
        .into_iter()
        .map(|(key, value)| {
            let value = if value.is_nested() {
                FieldValue::String(value.to_json_string())
            } else {
                value
            };
            (safe_key(key), value)
        })
        .collect()
}

fn safe_key(mut key: String) -> String {
    if key.starts_with('_') {
        key = format!("kv_{key}");
    }
    if key.contains('.') {
        key = key.replace('.', "_");
    }
    key
}
