//! CloudWatch Logs subscription envelopes. A subscription delivers many log
//! events combined into one gzipped JSON record, unlike the one-log-per-record
//! format the rest of the pipeline reads. This module detects the envelope,
//! unpacks it, and rewrites each event as the pseudo-syslog line the decoder
//! expects.

use chrono::{TimeZone, Utc};
use flate2::read::GzDecoder;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::io::Read;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SplitterError {
    #[error("failed to decompress envelope: {0}")]
    Gunzip(#[from] std::io::Error),

    #[error("failed to parse envelope: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogEvent {
    pub id: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEventBatch {
    pub message_type: String,
    pub owner: String,
    pub log_group: String,
    pub log_stream: String,
    #[serde(default)]
    pub subscription_filters: Vec<String>,
    pub log_events: Vec<LogEvent>,
}

/// An envelope record is identified by the gzip magic at the payload start.
pub fn is_gzipped(data: &[u8]) -> bool {
    data.starts_with(&[0x1f, 0x8b])
}

pub fn unpack(data: &[u8]) -> Result<LogEventBatch, SplitterError> {
    let mut decoder = GzDecoder::new(data);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(serde_json::from_slice(&raw)?)
}

// env--app/task-id/container-id, as CWLogs names its streams.
static TASK_META_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"([a-z0-9-]+)--([a-z0-9-]+)/",
        r"([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})/",
        r"([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})",
    ))
    .expect("task meta regex")
});

/// Rewrite each envelope event as an RSyslog-shaped line, preserving event
/// order. The program name is a mocked ECS task ARN in the format the
/// decoder's container-metadata extraction expects.
pub fn split(batch: &LogEventBatch) -> Vec<String> {
    let (env, app, task) = match TASK_META_REGEX.captures(&batch.log_stream) {
        Some(caps) => (
            caps.get(1).map_or("", |m| m.as_str()).to_string(),
            caps.get(2).map_or("", |m| m.as_str()).to_string(),
            caps.get(3).map_or("", |m| m.as_str()).to_string(),
        ),
        None => (
            "unknown".to_string(),
            "unknown".to_string(),
            "00001111-2222-3333-4444-555566667777".to_string(),
        ),
    };

    let program_name =
        format!("{env}--{app}/arn%3Aaws%3Aecs%3Aus-east-1%3A999988887777%3Atask%2F{task}");
    let hostname = "aws-batch";
    let mock_pid = 1;

    batch
        .log_events
        .iter()
        .map(|event| {
            let log_time = Utc
                .timestamp_millis_opt(event.timestamp)
                .single()
                .unwrap_or_else(|| Utc.timestamp_millis_opt(0).unwrap())
                .format("%Y-%m-%dT%H:%M:%S%.6f%:z");
            format!(
                "{log_time} {hostname} {program_name}[{mock_pid}]: {message}",
                message = event.message
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn sample_batch_json() -> String {
        r#"{
            "messageType": "DATA_MESSAGE",
            "owner": "999988887777",
            "logGroup": "/aws/batch/job",
            "logStream": "production--reports/11112222-3333-4444-5555-666677778888/aaaabbbb-cccc-dddd-eeee-ffff00001111",
            "subscriptionFilters": ["all-logs"],
            "logEvents": [
                {"id": "1", "timestamp": 1483326245000, "message": "first line"},
                {"id": "2", "timestamp": 1483326245100, "message": "second line"}
            ]
        }"#
        .to_string()
    }

    #[test]
    fn test_gzip_magic_detection() {
        assert!(is_gzipped(&[0x1f, 0x8b, 0x08]));
        assert!(!is_gzipped(b"plain text"));
        assert!(!is_gzipped(&[0x1f]));
        assert!(!is_gzipped(&[]));
    }

    #[test]
    fn test_unpack_roundtrip() {
        let compressed = gzip(sample_batch_json().as_bytes());
        assert!(is_gzipped(&compressed));

        let batch = unpack(&compressed).expect("unpack");
        assert_eq!(batch.message_type, "DATA_MESSAGE");
        assert_eq!(batch.owner, "999988887777");
        assert_eq!(batch.log_events.len(), 2);
        assert_eq!(batch.log_events[0].message, "first line");
    }

    #[test]
    fn test_unpack_rejects_truncated_input() {
        let mut compressed = gzip(sample_batch_json().as_bytes());
        compressed.truncate(compressed.len() / 2);
        assert!(unpack(&compressed).is_err());
    }

    #[test]
    fn test_split_formats_pseudo_syslog_lines() {
        let compressed = gzip(sample_batch_json().as_bytes());
        let batch = unpack(&compressed).unwrap();

        let lines = split(&batch);
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "2017-01-02T03:04:05.000000+00:00 aws-batch \
             production--reports/arn%3Aaws%3Aecs%3Aus-east-1%3A999988887777%3Atask%2F\
             11112222-3333-4444-5555-666677778888[1]: first line"
        );
        assert!(lines[1].starts_with("2017-01-02T03:04:05.100000+00:00 "));
        assert!(lines[1].ends_with(": second line"));
    }

    #[test]
    fn test_split_unknown_stream_falls_back() {
        let compressed = gzip(
            r#"{
                "messageType": "DATA_MESSAGE",
                "owner": "o",
                "logGroup": "g",
                "logStream": "not-a-task-stream",
                "subscriptionFilters": [],
                "logEvents": [{"id": "1", "timestamp": 0, "message": "hello"}]
            }"#
            .as_bytes(),
        );
        let batch = unpack(&compressed).unwrap();

        let lines = split(&batch);
        assert!(lines[0].contains(
            "unknown--unknown/arn%3Aaws%3Aecs%3Aus-east-1%3A999988887777%3Atask%2F\
             00001111-2222-3333-4444-555566667777[1]: hello"
        ));
    }
}
