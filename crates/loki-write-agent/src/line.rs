// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use loki_write::{Entry, LabelSet};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct JsonLine {
    #[serde(default)]
    labels: LabelSet,
    line: String,
    timestamp_ms: Option<u64>,
}

/// Turns one input line into an entry. A JSON object with a `line` field carries its
/// own labels (merged over `defaults`) and timestamp; anything else is shipped as is.
/// Blank lines are skipped.
pub fn parse_line(raw: &str, defaults: &LabelSet) -> Option<Entry> {
    let trimmed = raw.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return None;
    }

    if trimmed.trim_start().starts_with('{') {
        if let Ok(json) = serde_json::from_str::<JsonLine>(trimmed) {
            let mut labels = defaults.clone();
            labels.extend(json.labels);
            let timestamp = json
                .timestamp_ms
                .map_or_else(SystemTime::now, |ms| UNIX_EPOCH + Duration::from_millis(ms));
            return Some(Entry::new(labels, timestamp, json.line));
        }
    }
    Some(Entry::new(defaults.clone(), SystemTime::now(), trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use loki_write::label_set;

    #[test]
    fn json_lines_carry_labels_and_time() {
        let defaults = label_set([("job", "agent"), ("app", "default")]);
        let entry = parse_line(
            r#"{"labels":{"app":"api"},"line":"hello","timestamp_ms":1500}"#,
            &defaults,
        )
        .unwrap();
        assert_eq!(entry.line, "hello");
        assert_eq!(entry.labels, label_set([("job", "agent"), ("app", "api")]));
        assert_eq!(entry.timestamp, UNIX_EPOCH + Duration::from_millis(1500));
    }

    #[test]
    fn anything_else_is_plain_text() {
        let defaults = label_set([("job", "agent")]);
        let entry = parse_line("{not json at all}\n", &defaults).unwrap();
        assert_eq!(entry.line, "{not json at all}");
        assert_eq!(entry.labels, defaults);

        assert!(parse_line("   \n", &defaults).is_none());
    }
}
