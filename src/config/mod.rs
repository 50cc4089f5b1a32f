use chrono::{DateTime, TimeZone, Utc};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("must specify env variable {0}")]
    MissingVar(String),

    #[error("env variable {name} must be {expected}, got '{value}'")]
    InvalidVar {
        name: String,
        value: String,
        expected: &'static str,
    },

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Worker configuration, loaded from the environment. The host daemon owns
/// stdin/stdout, so there is no CLI surface; everything arrives as env vars.
#[derive(Debug, Clone)]
pub struct Config {
    /// Region the Firehose delivery stream lives in.
    pub firehose_region: String,
    /// Name of the Firehose delivery stream.
    pub firehose_stream_name: String,
    /// Log destination. stdout/stderr carry the host protocol, so all
    /// diagnostics go to a file instead.
    pub log_file: PathBuf,
    /// Runtime environment name ("development" or "production"), injected
    /// into every decoded message.
    pub deploy_env: String,
    /// Records-per-second budget for the ingest loop. Per shard, since the
    /// host starts one worker per shard.
    pub read_rate_limit: f64,
    /// Messages with a timestamp at or below this floor are rejected.
    pub minimum_timestamp: DateTime<Utc>,
    /// Send nested JSON objects as strings instead of objects.
    pub stringify_nested: bool,
    /// Rename fields reserved by Elasticsearch (e.g. _source -> kv__source).
    pub rename_es_reserved_fields: bool,
    /// This consumer feeds Elasticsearch: enables the ignore rules, the
    /// age-based sampling policy, and the ES-safe field rewrite.
    pub is_elasticsearch_consumer: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup. `from_env` is a
    /// thin wrapper; tests supply a closure over a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| -> Result<String, ConfigError> {
            match lookup(name) {
                Some(value) if !value.is_empty() => Ok(value),
                _ => Err(ConfigError::MissingVar(name.to_string())),
            }
        };
        let flag = |name: &str| -> bool { lookup(name).as_deref() == Some("true") };

        let rate_raw = required("READ_RATE_LIMIT")?;
        let read_rate_limit: f64 =
            rate_raw
                .parse()
                .map_err(|_| ConfigError::InvalidVar {
                    name: "READ_RATE_LIMIT".to_string(),
                    value: rate_raw.clone(),
                    expected: "a number of records per second",
                })?;
        if read_rate_limit <= 0.0 {
            return Err(ConfigError::InvalidVar {
                name: "READ_RATE_LIMIT".to_string(),
                value: rate_raw,
                expected: "a positive number of records per second",
            });
        }

        let ts_raw = required("MINIMUM_TIMESTAMP")?;
        let ts_secs: i64 = ts_raw.parse().map_err(|_| ConfigError::InvalidVar {
            name: "MINIMUM_TIMESTAMP".to_string(),
            value: ts_raw.clone(),
            expected: "epoch seconds",
        })?;
        let minimum_timestamp = Utc
            .timestamp_opt(ts_secs, 0)
            .single()
            .ok_or(ConfigError::InvalidVar {
                name: "MINIMUM_TIMESTAMP".to_string(),
                value: ts_raw,
                expected: "epoch seconds",
            })?;

        Ok(Self {
            firehose_region: required("FIREHOSE_AWS_REGION")?,
            firehose_stream_name: required("FIREHOSE_STREAM_NAME")?,
            log_file: PathBuf::from(required("LOG_FILE")?),
            deploy_env: required("_DEPLOY_ENV")?,
            read_rate_limit,
            minimum_timestamp,
            stringify_nested: flag("STRINGIFY_NESTED"),
            rename_es_reserved_fields: flag("RENAME_ES_RESERVED_FIELDS"),
            is_elasticsearch_consumer: flag("IS_ELASTICSEARCH_CONSUMER"),
        })
    }
}
