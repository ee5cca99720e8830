// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::time::{Instant, SystemTime};

use fnv::FnvHasher;

/// Label that overrides the tenant configured on an endpoint for a single entry.
pub const RESERVED_LABEL_TENANT_ID: &str = "__tenant_id__";

/// Label names with this prefix are internal and never reach the wire.
const INTERNAL_LABEL_PREFIX: &str = "__";

/// Stream identity. Ordered so that iteration is already sorted by label name.
pub type LabelSet = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LabelPair {
    pub name: String,
    pub value: String,
}

impl LabelPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        LabelPair {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A single log line travelling through the pipeline.
///
/// Entries are plain values: cloning copies the label set, so every consumer in a
/// fan-out owns its own copy.
#[derive(Debug, Clone)]
pub struct Entry {
    pub labels: LabelSet,
    pub timestamp: SystemTime,
    pub line: String,
    pub structured_metadata: Vec<LabelPair>,
    /// When the entry entered the pipeline. Used for latency observation only.
    pub created_at: Instant,
}

impl Entry {
    pub fn new(labels: LabelSet, timestamp: SystemTime, line: impl Into<String>) -> Self {
        Entry {
            labels,
            timestamp,
            line: line.into(),
            structured_metadata: Vec::new(),
            created_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_structured_metadata(mut self, metadata: Vec<LabelPair>) -> Self {
        self.structured_metadata = metadata;
        self
    }

    /// Approximate payload size: line plus structured metadata, not the exact wire size.
    pub fn size(&self) -> usize {
        self.line.len()
            + self
                .structured_metadata
                .iter()
                .map(|pair| pair.name.len() + pair.value.len())
                .sum::<usize>()
    }

    pub fn fingerprint(&self) -> u64 {
        fingerprint(&self.labels)
    }

    /// Tenant for this entry: the reserved label if present, otherwise `default_tenant`.
    pub fn tenant<'a>(&'a self, default_tenant: &'a str) -> &'a str {
        self.labels
            .get(RESERVED_LABEL_TENANT_ID)
            .map(String::as_str)
            .unwrap_or(default_tenant)
    }
}

/// Splits the tenant off an entry: the reserved label is removed and its value
/// returned, or `default_tenant` when the entry carries none.
pub fn tenant_of(mut entry: Entry, default_tenant: &str) -> (Entry, String) {
    match entry.labels.remove(RESERVED_LABEL_TENANT_ID) {
        Some(tenant) => (entry, tenant),
        None => (entry, default_tenant.to_string()),
    }
}

/// Builds a label set from `(name, value)` pairs.
pub fn label_set<I, K, V>(pairs: I) -> LabelSet
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Renders a label set as `{a="b", c="d"}`, skipping internal labels.
pub fn labels_to_string(labels: &LabelSet) -> String {
    let size_hint = labels
        .iter()
        .map(|(name, value)| name.len() + value.len() + 5)
        .sum::<usize>();
    let mut out = String::with_capacity(size_hint + 2);
    out.push('{');
    let mut first = true;
    for (name, value) in labels {
        if name.starts_with(INTERNAL_LABEL_PREFIX) {
            continue;
        }
        if !first {
            out.push_str(", ");
        }
        first = false;
        out.push_str(name);
        out.push('=');
        push_quoted(&mut out, value);
    }
    out.push('}');
    out
}

/// Appends `value` in double quotes, escaping backslash, quote and newline the way
/// Prometheus label values are written. Everything else is kept verbatim.
fn push_quoted(out: &mut String, value: &str) {
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Stable FNV-1a fingerprint of a label set, used for shard routing.
pub fn fingerprint(labels: &LabelSet) -> u64 {
    let mut hasher = FnvHasher::default();
    for (name, value) in labels {
        hasher.write(name.as_bytes());
        hasher.write_u8(0xff);
        hasher.write(value.as_bytes());
        hasher.write_u8(0xff);
    }
    hasher.finish()
}
