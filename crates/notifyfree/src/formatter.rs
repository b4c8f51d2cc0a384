// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion of [`LogRecord`]s into the NotifyFree wire shape.
//!
//! ```json
//! {
//!   "message": "Payment declined",
//!   "level": "error",
//!   "timestamp": "2025-03-01T12:00:00+00:00",
//!   "tags": ["billing"],
//!   "metadata": {"channel": "app", "timestamp": "...", "order_id": 17}
//! }
//! ```
//!
//! # Redaction
//!
//! Metadata values are replaced by [`REDACTED`] when their key (lowercased)
//! is one of the configured sensitive keys, or when a string value looks like
//! a credential: a bearer token, an opaque alphanumeric run of 32 or more
//! characters, or a `password=...` assignment. Redaction walks nested maps and
//! lists before they are flattened.
//!
//! # Flattening
//!
//! Metadata values are scalars. Nested maps and lists are serialized to their
//! JSON text after redaction.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::LazyLock;

use chrono::format::{Item, StrftimeItems};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::config::{FormatConfig, DEFAULT_TIMESTAMP_FORMAT, MIN_MAX_MESSAGE_LENGTH};
use crate::record::{Level, LogRecord};

/// Replacement for sensitive values.
pub const REDACTED: &str = "[FILTERED]";

/// Appended to truncated messages. Counted inside the length limit.
pub const TRUNCATION_MARKER: &str = "...";

const TAGS_KEY: &str = "tags";

#[allow(clippy::expect_used)]
static SENSITIVE_VALUE_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"Bearer\s+[A-Za-z0-9\-._~+/]+=*",
        r"[A-Za-z0-9]{32,}",
        r"(?i)password\s*[:=]\s*\S+",
    ])
    .expect("sensitive value patterns are valid")
});

/// Wire representation of one log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormattedEntry {
    pub message: String,
    pub level: Level,
    pub timestamp: String,
    pub tags: Vec<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct Formatter {
    include_context: bool,
    include_extra: bool,
    timestamp_format: String,
    max_message_length: usize,
    sensitive_keys: HashSet<String>,
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new(&FormatConfig::default())
    }
}

impl Formatter {
    #[must_use]
    pub fn new(config: &FormatConfig) -> Self {
        let timestamp_format = if is_valid_strftime(&config.timestamp_format) {
            config.timestamp_format.clone()
        } else {
            warn!(
                "NOTIFYFREE | Invalid timestamp format '{}', using '{}'",
                config.timestamp_format, DEFAULT_TIMESTAMP_FORMAT
            );
            DEFAULT_TIMESTAMP_FORMAT.to_string()
        };

        Formatter {
            include_context: config.include_context,
            include_extra: config.include_extra,
            timestamp_format,
            max_message_length: config.max_message_length.max(MIN_MAX_MESSAGE_LENGTH),
            sensitive_keys: config
                .sensitive_keys
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
        }
    }

    pub fn format(&self, record: &LogRecord) -> FormattedEntry {
        let timestamp = self.render_timestamp(record);

        let mut metadata = Map::new();
        metadata.insert("channel".to_string(), Value::String(record.channel.clone()));
        metadata.insert("timestamp".to_string(), Value::String(timestamp.clone()));

        if self.include_context {
            for (key, value) in &record.context {
                if key == TAGS_KEY {
                    continue;
                }
                metadata.insert(key.clone(), self.flatten(self.redact_field(key, value.clone())));
            }
        }
        if self.include_extra {
            for (key, value) in &record.extra {
                metadata.insert(key.clone(), self.flatten(self.redact_field(key, value.clone())));
            }
        }

        FormattedEntry {
            message: truncate_message(&record.message, self.max_message_length),
            level: record.level,
            timestamp,
            tags: self.extract_tags(&record.context),
            metadata,
        }
    }

    pub fn format_batch(&self, records: &[LogRecord]) -> Vec<FormattedEntry> {
        records.iter().map(|record| self.format(record)).collect()
    }

    fn render_timestamp(&self, record: &LogRecord) -> String {
        let mut rendered = String::new();
        if write!(rendered, "{}", record.datetime.format(&self.timestamp_format)).is_err() {
            return record.datetime.to_rfc3339();
        }
        rendered
    }

    fn extract_tags(&self, context: &Map<String, Value>) -> Vec<String> {
        match context.get(TAGS_KEY) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match self.redact_value(item.clone()) {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn is_sensitive_key(&self, key: &str) -> bool {
        self.sensitive_keys.contains(&key.to_lowercase())
    }

    fn redact_field(&self, key: &str, value: Value) -> Value {
        if self.is_sensitive_key(key) {
            return Value::String(REDACTED.to_string());
        }
        self.redact_value(value)
    }

    fn redact_value(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, value)| {
                        let value = self.redact_field(&key, value);
                        (key, value)
                    })
                    .collect(),
            ),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.redact_value(v)).collect())
            }
            Value::String(s) if contains_sensitive_data(&s) => Value::String(REDACTED.to_string()),
            other => other,
        }
    }

    fn flatten(&self, value: Value) -> Value {
        match value {
            Value::Object(_) | Value::Array(_) => Value::String(value.to_string()),
            scalar => scalar,
        }
    }
}

/// Returns true if the string looks like it carries a credential.
pub fn contains_sensitive_data(value: &str) -> bool {
    SENSITIVE_VALUE_PATTERNS.is_match(value)
}

/// Cuts `message` to at most `max_length` bytes, ending with
/// [`TRUNCATION_MARKER`] when anything was removed.
pub fn truncate_message(message: &str, max_length: usize) -> String {
    if message.len() <= max_length {
        return message.to_string();
    }
    let mut cut = max_length.saturating_sub(TRUNCATION_MARKER.len());
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &message[..cut])
}

fn is_valid_strftime(pattern: &str) -> bool {
    !StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected a JSON object"),
        }
    }

    fn record_with_context(context: Value) -> LogRecord {
        LogRecord::new(Level::Info, "user logged in")
            .with_channel("auth")
            .with_datetime(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap())
            .with_context(object(context))
    }

    #[test]
    fn test_format_basic_shape() {
        let formatter = Formatter::default();
        let entry = formatter.format(&record_with_context(json!({"user_id": 7})));

        assert_eq!(entry.message, "user logged in");
        assert_eq!(entry.level, Level::Info);
        assert_eq!(entry.timestamp, "2025-03-01T12:00:00+00:00");
        assert!(entry.tags.is_empty());
        assert_eq!(entry.metadata["channel"], "auth");
        assert_eq!(entry.metadata["timestamp"], "2025-03-01T12:00:00+00:00");
        assert_eq!(entry.metadata["user_id"], 7);
    }

    #[test]
    fn test_wire_json_uses_lowercase_level() {
        let formatter = Formatter::default();
        let entry = formatter.format(&LogRecord::new(Level::Emergency, "down"));
        let wire = serde_json::to_value(&entry).unwrap();

        assert_eq!(wire["level"], "emergency");
        assert!(wire.get("message").is_some());
        assert!(wire.get("tags").unwrap().is_array());
        assert!(wire.get("metadata").unwrap().is_object());
    }

    #[test]
    fn test_tags_are_extracted_and_removed_from_metadata() {
        let formatter = Formatter::default();
        let entry = formatter.format(&record_with_context(
            json!({"tags": ["billing", "eu", 3], "order": 17}),
        ));

        assert_eq!(entry.tags, vec!["billing", "eu", "3"]);
        assert!(!entry.metadata.contains_key("tags"));
        assert_eq!(entry.metadata["order"], 17);
    }

    #[test]
    fn test_non_list_tags_are_ignored() {
        let formatter = Formatter::default();
        let entry = formatter.format(&record_with_context(json!({"tags": "billing"})));

        assert!(entry.tags.is_empty());
        assert!(!entry.metadata.contains_key("tags"));
    }

    #[test]
    fn test_sensitive_keys_are_redacted_case_insensitively() {
        let formatter = Formatter::default();
        let entry = formatter.format(&record_with_context(json!({
            "Password": "hunter2",
            "API_KEY": "abc",
            "user": "alice",
        })));

        assert_eq!(entry.metadata["Password"], REDACTED);
        assert_eq!(entry.metadata["API_KEY"], REDACTED);
        assert_eq!(entry.metadata["user"], "alice");
    }

    #[test]
    fn test_sensitive_patterns_are_redacted() {
        let formatter = Formatter::default();
        let entry = formatter.format(&record_with_context(json!({
            "header": "Bearer eyJhbGciOiJIUzI1NiJ9.payload.sig",
            "opaque": "a".repeat(32),
            "dsn": "mysql://user password=letmein@db",
            "short": "abc123",
        })));

        assert_eq!(entry.metadata["header"], REDACTED);
        assert_eq!(entry.metadata["opaque"], REDACTED);
        assert_eq!(entry.metadata["dsn"], REDACTED);
        assert_eq!(entry.metadata["short"], "abc123");
    }

    #[test]
    fn test_nested_values_are_redacted_then_flattened() {
        let formatter = Formatter::default();
        let entry = formatter.format(&record_with_context(json!({
            "request": {"path": "/login", "auth": {"user": "alice"}, "token": "t"},
            "attempts": [1, {"secret": "s"}],
        })));

        let request: Value =
            serde_json::from_str(entry.metadata["request"].as_str().unwrap()).unwrap();
        assert_eq!(request["path"], "/login");
        assert_eq!(request["auth"], REDACTED);
        assert_eq!(request["token"], REDACTED);

        let attempts: Value =
            serde_json::from_str(entry.metadata["attempts"].as_str().unwrap()).unwrap();
        assert_eq!(attempts, json!([1, {"secret": REDACTED}]));
    }

    #[test]
    fn test_extra_is_merged_after_context() {
        let formatter = Formatter::default();
        let record = record_with_context(json!({"request_id": "ctx"}))
            .with_extra(object(json!({"request_id": "extra", "pid": 99})));
        let entry = formatter.format(&record);

        assert_eq!(entry.metadata["request_id"], "extra");
        assert_eq!(entry.metadata["pid"], 99);
    }

    #[test]
    fn test_include_flags() {
        let formatter = Formatter::new(&FormatConfig {
            include_context: false,
            include_extra: false,
            ..FormatConfig::default()
        });
        let record = record_with_context(json!({"tags": ["a"], "user": "bob"}))
            .with_extra(object(json!({"pid": 1})));
        let entry = formatter.format(&record);

        assert_eq!(entry.tags, vec!["a"]);
        assert_eq!(entry.metadata.len(), 2);
        assert!(entry.metadata.contains_key("channel"));
    }

    #[test]
    fn test_custom_and_invalid_timestamp_format() {
        let formatter = Formatter::new(&FormatConfig {
            timestamp_format: "%Y-%m-%d %H:%M:%S".to_string(),
            ..FormatConfig::default()
        });
        let entry = formatter.format(&record_with_context(json!({})));
        assert_eq!(entry.timestamp, "2025-03-01 12:00:00");

        let formatter = Formatter::new(&FormatConfig {
            timestamp_format: "%Q".to_string(),
            ..FormatConfig::default()
        });
        let entry = formatter.format(&record_with_context(json!({})));
        assert_eq!(entry.timestamp, "2025-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_truncate_short_message_untouched() {
        assert_eq!(truncate_message("hello", 10), "hello");
        assert_eq!(truncate_message("0123456789", 10), "0123456789");
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let truncated = truncate_message("ééééé", 6);
        assert_eq!(truncated, "é...");
        assert!(truncated.len() <= 6);
    }

    #[test]
    fn test_format_batch() {
        let formatter = Formatter::default();
        let records = vec![
            LogRecord::new(Level::Info, "one"),
            LogRecord::new(Level::Error, "two"),
        ];
        let entries = formatter.format_batch(&records);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].level, Level::Error);
    }

    proptest! {
        #[test]
        fn prop_truncated_messages_hit_the_limit(
            message in "[a-z ]{1001,3000}",
        ) {
            let formatter = Formatter::default();
            let entry = formatter.format(&LogRecord::new(Level::Info, message));

            prop_assert_eq!(entry.message.len(), 1000);
            prop_assert!(entry.message.ends_with(TRUNCATION_MARKER));
        }

        #[test]
        fn prop_sensitive_keys_never_leak(
            key in prop::sample::select(crate::config::DEFAULT_SENSITIVE_KEYS.to_vec()),
            upper in any::<bool>(),
            value in "[a-z]{1,20}",
        ) {
            let key = if upper { key.to_uppercase() } else { key.to_string() };
            let mut context = Map::new();
            context.insert(key.clone(), Value::String(value.clone()));
            let mut extra = Map::new();
            extra.insert(key.clone(), Value::String(value));

            let formatter = Formatter::default();
            let record = LogRecord::new(Level::Info, "m")
                .with_context(context)
                .with_extra(extra);
            let entry = formatter.format(&record);

            prop_assert_eq!(&entry.metadata[&key], REDACTED);
        }
    }
}
