//! Log line decoding and enrichment. A line arrives as an RSyslog-formatted
//! string, possibly carrying a JSON payload in its message body; decoding
//! extracts the syslog fields, merges the payload fields, and injects the
//! deployment metadata that downstream consumers search by.

use chrono::{DateTime, Datelike, SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::ser::{Serialize, Serializer};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("line is not in a recognized syslog format")]
    Syslog,

    #[error("log line carries a JSON payload that does not parse: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("message timestamp is at or below the configured floor")]
    TimestampBelowMinimum,
}

/// A decoded message value. Payload JSON nests arbitrarily; timestamps are
/// kept typed so the sampling policy and the floor check can read them, and
/// serialize back to RFC3339 strings.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<FieldValue>),
    Object(BTreeMap<String, FieldValue>),
    Timestamp(DateTime<Utc>),
}

pub type FieldMap = BTreeMap<String, FieldValue>;

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Objects and arrays; the values nested-stringification flattens.
    pub fn is_nested(&self) -> bool {
        matches!(self, FieldValue::Array(_) | FieldValue::Object(_))
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Null => serializer.serialize_unit(),
            FieldValue::Bool(b) => serializer.serialize_bool(*b),
            FieldValue::Number(n) => n.serialize(serializer),
            FieldValue::String(s) => serializer.serialize_str(s),
            FieldValue::Array(values) => values.serialize(serializer),
            FieldValue::Object(map) => map.serialize(serializer),
            FieldValue::Timestamp(ts) => {
                serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
            }
        }
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(b),
            serde_json::Value::Number(n) => FieldValue::Number(n),
            serde_json::Value::String(s) => FieldValue::String(s),
            serde_json::Value::Array(values) => {
                FieldValue::Array(values.into_iter().map(Into::into).collect())
            }
            serde_json::Value::Object(map) => {
                FieldValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

// Set during decoding; payload JSON must never overwrite them.
const RESERVED_FIELDS: [&str; 3] = ["prefix", "postfix", "type"];

// RSYSLOG_FileFormat: high-precision RFC3339 timestamp with timezone.
static SYSLOG_FILE_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(?P<timestamp>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2})) ",
        r"(?P<hostname>\S+) ",
        r"(?P<tag>[^\[\s:]+)(?:\[(?P<pid>\d+)\])?: ",
        r"(?P<content>.*)$",
    ))
    .expect("syslog file format regex")
});

// RSYSLOG_TraditionalFileFormat: low-precision timestamp, no year.
static SYSLOG_TRADITIONAL_FORMAT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(?P<month>[A-Z][a-z]{2}) +(?P<day>\d{1,2}) (?P<hour>\d{2}):(?P<minute>\d{2}):(?P<second>\d{2}) ",
        r"(?P<hostname>\S+) ",
        r"(?P<tag>[^\[\s:]+)(?:\[(?P<pid>\d+)\])?: ",
        r"(?P<content>.*)$",
    ))
    .expect("syslog traditional format regex")
});

// env--app/<ECS task ARN> as it appears in the syslog program name.
static CONTAINER_META_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"([a-z-]+)--([a-z-]+)/",
        r"arn%3Aaws%3Aecs%3Aus-(west|east)-[1-2]%3A[0-9]{12}%3Atask%2F",
        r"([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})",
    ))
    .expect("container meta regex")
});

#[derive(Debug)]
struct SyslogFields {
    timestamp: DateTime<Utc>,
    hostname: String,
    programname: String,
    rawlog: String,
}

fn month_number(name: &str) -> Option<u32> {
    match name {
        "Jan" => Some(1),
        "Feb" => Some(2),
        "Mar" => Some(3),
        "Apr" => Some(4),
        "May" => Some(5),
        "Jun" => Some(6),
        "Jul" => Some(7),
        "Aug" => Some(8),
        "Sep" => Some(9),
        "Oct" => Some(10),
        "Nov" => Some(11),
        "Dec" => Some(12),
        _ => None,
    }
}

fn fields_from_syslog(line: &str) -> Result<SyslogFields, DecodeError> {
    if let Some(caps) = SYSLOG_FILE_FORMAT.captures(line) {
        let timestamp = DateTime::parse_from_rfc3339(&caps["timestamp"])
            .map_err(|_| DecodeError::Syslog)?
            .with_timezone(&Utc);
        return Ok(SyslogFields {
            timestamp,
            hostname: caps["hostname"].to_string(),
            programname: caps["tag"].to_string(),
            rawlog: caps["content"].to_string(),
        });
    }

    if let Some(caps) = SYSLOG_TRADITIONAL_FORMAT.captures(line) {
        let month = month_number(&caps["month"]).ok_or(DecodeError::Syslog)?;
        let day: u32 = caps["day"].parse().map_err(|_| DecodeError::Syslog)?;
        let (hour, minute, second): (u32, u32, u32) = (
            caps["hour"].parse().map_err(|_| DecodeError::Syslog)?,
            caps["minute"].parse().map_err(|_| DecodeError::Syslog)?,
            caps["second"].parse().map_err(|_| DecodeError::Syslog)?,
        );
        // The traditional format has no year; assume the current one.
        let timestamp = Utc
            .with_ymd_and_hms(Utc::now().year(), month, day, hour, minute, second)
            .single()
            .ok_or(DecodeError::Syslog)?;
        return Ok(SyslogFields {
            timestamp,
            hostname: caps["hostname"].to_string(),
            programname: caps["tag"].to_string(),
            rawlog: caps["content"].to_string(),
        });
    }

    Err(DecodeError::Syslog)
}

/// Extract fields from the JSON payload between the first `{` and the last
/// `}`. `None` when the line carries no payload; an unparseable payload is
/// an error and fails the record.
fn fields_from_json_payload(line: &str) -> Result<Option<FieldMap>, DecodeError> {
    let (first, last) = match (line.find('{'), line.rfind('}')) {
        (Some(first), Some(last)) if first < last => (first, last),
        _ => return Ok(None),
    };

    let payload: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&line[first..=last])?;

    let mut out = FieldMap::new();
    out.insert("prefix".to_string(), FieldValue::String(line[..first].to_string()));
    out.insert(
        "postfix".to_string(),
        FieldValue::String(line[last + 1..].to_string()),
    );
    for (key, value) in payload {
        if !RESERVED_FIELDS.contains(&key.as_str()) {
            out.insert(key, value.into());
        }
    }
    out.insert("type".to_string(), FieldValue::String("Kayvee".to_string()));

    Ok(Some(out))
}

fn container_meta(
    programname: &str,
    force_env: &str,
    force_app: &str,
    force_task: &str,
) -> Option<BTreeMap<String, String>> {
    let (mut env, mut app, mut task) = match CONTAINER_META_REGEX.captures(programname) {
        Some(caps) => (
            caps.get(1).map_or("", |m| m.as_str()).to_string(),
            caps.get(2).map_or("", |m| m.as_str()).to_string(),
            caps.get(4).map_or("", |m| m.as_str()).to_string(),
        ),
        None => (String::new(), String::new(), String::new()),
    };

    // Forced values win; a container monitor uses these to file its events
    // under the app they concern rather than under itself.
    if !force_env.is_empty() {
        env = force_env.to_string();
    }
    if !force_app.is_empty() {
        app = force_app.to_string();
    }
    if !force_task.is_empty() {
        task = force_task.to_string();
    }

    if env.is_empty() || app.is_empty() || task.is_empty() {
        return None;
    }

    Some(BTreeMap::from([
        ("container_env".to_string(), env),
        ("container_app".to_string(), app),
        ("container_task".to_string(), task),
    ]))
}

static ES_FIELD_RENAMES: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("_index", "kv__index"),
        ("_uid", "kv__uid"),
        ("_type", "kv__type"),
        ("_id", "kv__id"),
        ("_source", "kv__source"),
        ("_size", "kv__size"),
        ("_all", "kv__all"),
        ("_field_names", "kv__field_names"),
        ("_timestamp", "kv__timestamp"),
        ("_ttl", "kv__ttl"),
        ("_parent", "kv__parent"),
        ("_routing", "kv__routing"),
        ("_meta", "kv__meta"),
    ])
});

/// Configured decoder for one worker.
#[derive(Debug, Clone)]
pub struct Decoder {
    deploy_env: String,
    stringify_nested: bool,
    rename_es_reserved_fields: bool,
    minimum_timestamp: DateTime<Utc>,
}

impl Decoder {
    pub fn new(
        deploy_env: String,
        stringify_nested: bool,
        rename_es_reserved_fields: bool,
        minimum_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            deploy_env,
            stringify_nested,
            rename_es_reserved_fields,
            minimum_timestamp,
        }
    }

    /// Extract fields from a log line and post-process them: payload merge,
    /// environment injection, container metadata, and the configured
    /// Elasticsearch accommodations. Messages at or below the timestamp
    /// floor are rejected.
    pub fn parse_and_enhance(&self, line: &str) -> Result<FieldMap, DecodeError> {
        let syslog = fields_from_syslog(line)?;

        let mut out = FieldMap::new();
        out.insert(
            "hostname".to_string(),
            FieldValue::String(syslog.hostname.clone()),
        );
        out.insert("timestamp".to_string(), FieldValue::Timestamp(syslog.timestamp));
        out.insert(
            "programname".to_string(),
            FieldValue::String(syslog.programname.clone()),
        );
        out.insert("rawlog".to_string(), FieldValue::String(syslog.rawlog.clone()));

        if let Some(payload) = fields_from_json_payload(&syslog.rawlog)? {
            out.extend(payload);
        }

        out.insert(
            "env".to_string(),
            FieldValue::String(self.deploy_env.clone()),
        );

        let force = |key: &str| -> String {
            out.get(key)
                .and_then(FieldValue::as_str)
                .unwrap_or("")
                .to_string()
        };
        if let Some(meta) = container_meta(
            &syslog.programname,
            &force("container_env"),
            &force("container_app"),
            &force("container_task"),
        ) {
            for (key, value) in meta {
                out.insert(key, FieldValue::String(value));
            }
        }

        if self.stringify_nested {
            let nested_keys: Vec<String> = out
                .iter()
                .filter(|(_, v)| v.is_nested())
                .map(|(k, _)| k.clone())
                .collect();
            for key in nested_keys {
                if let Some(value) = out.get(&key) {
                    let flattened = FieldValue::String(value.to_json_string());
                    out.insert(key, flattened);
                }
            }
        }

        if self.rename_es_reserved_fields {
            for (old_key, renamed_key) in ES_FIELD_RENAMES.iter() {
                if let Some(value) = out.remove(*old_key) {
                    out.insert(renamed_key.to_string(), value);
                }
            }
        }

        if let Some(FieldValue::Timestamp(ts)) = out.get("timestamp") {
            if *ts <= self.minimum_timestamp {
                return Err(DecodeError::TimestampBelowMinimum);
            }
        }

        Ok(out)
    }
}
