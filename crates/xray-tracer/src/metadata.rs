// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Redaction and size bounding of segment metadata.
//!
//! Request metadata is a nested JSON object whose top-level keys are
//! sections (`query`, `form`, `cookies`, `server`, `response`, `stats`).
//! Processing happens in two steps:
//!
//! 1. **Redaction**: every `(section, key)` pair from the built-in rules and
//!    the caller's rules that exists in the metadata has its value replaced
//!    by the literal `"REDACTED"`.
//! 2. **Truncation**: if the encoded object is still larger than the total
//!    budget, string leaves are shortened, largest first, until it fits.
//!    Keys are never removed and redaction markers are never shortened.
//!
//! Processing an already processed object returns it unchanged.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::debug;

use crate::encoding::serialized_len;
use crate::truncate::truncate_string;

pub const REDACTED: &str = "REDACTED";

pub const QUERY_SECTION: &str = "query";
pub const FORM_SECTION: &str = "form";
pub const COOKIES_SECTION: &str = "cookies";
pub const SERVER_SECTION: &str = "server";
pub const RESPONSE_SECTION: &str = "response";
pub const STATS_SECTION: &str = "stats";

/// Keys that are always redacted, whatever the caller configures.
const BUILTIN_REDACT_KEYS: &[(&str, &[&str])] = &[(FORM_SECTION, &["pwd", "password"])];

/// Sensitive keys per metadata section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedactRules {
    rules: BTreeMap<String, Vec<String>>,
}

impl RedactRules {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builtin() -> Self {
        let mut rules = Self::new();
        for (section, keys) in BUILTIN_REDACT_KEYS {
            for key in *keys {
                rules.add(section, key);
            }
        }
        rules
    }

    /// Parses `section:key,key;section:key`. Malformed entries are skipped.
    #[must_use]
    pub fn from_env_string(value: &str) -> Self {
        let mut rules = Self::new();
        for entry in value.split(';') {
            let Some((section, keys)) = entry.split_once(':') else {
                continue;
            };
            let section = section.trim();
            if section.is_empty() {
                continue;
            }
            for key in keys.split(',').map(str::trim).filter(|k| !k.is_empty()) {
                rules.add(section, key);
            }
        }
        rules
    }

    pub fn add(&mut self, section: &str, key: &str) -> &mut Self {
        let keys = self.rules.entry(section.to_string()).or_default();
        if !keys.iter().any(|k| k == key) {
            keys.push(key.to_string());
        }
        self
    }

    pub fn merge(&mut self, other: &RedactRules) {
        for (section, keys) in other.iter() {
            for key in keys {
                self.add(section, key);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.rules.iter().map(|(s, k)| (s.as_str(), k.as_slice()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Replaces every value named by `rules` with [`REDACTED`].
pub fn redact(metadata: &mut Map<String, Value>, rules: &RedactRules) {
    for (section, keys) in rules.iter() {
        let Some(Value::Object(fields)) = metadata.get_mut(section) else {
            continue;
        };
        for key in keys {
            if let Some(value) = fields.get_mut(key) {
                *value = Value::String(REDACTED.to_string());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

fn collect_string_leaves(
    value: &Value,
    path: &mut Vec<PathSegment>,
    out: &mut Vec<(usize, Vec<PathSegment>)>,
) {
    match value {
        // markers stay intact so redaction output is stable
        Value::String(s) if s == REDACTED => {}
        Value::String(s) => out.push((s.len(), path.clone())),
        Value::Object(map) => {
            for (key, child) in map {
                path.push(PathSegment::Key(key.clone()));
                collect_string_leaves(child, path, out);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                path.push(PathSegment::Index(index));
                collect_string_leaves(child, path, out);
                path.pop();
            }
        }
        _ => {}
    }
}

fn leaf_mut<'a>(value: &'a mut Value, path: &[PathSegment]) -> Option<&'a mut String> {
    match path.split_first() {
        None => match value {
            Value::String(s) => Some(s),
            _ => None,
        },
        Some((PathSegment::Key(key), rest)) => leaf_mut(value.as_object_mut()?.get_mut(key)?, rest),
        Some((PathSegment::Index(index), rest)) => {
            leaf_mut(value.as_array_mut()?.get_mut(*index)?, rest)
        }
    }
}

/// Shortens the leaf at `path` to `max_size` bytes and returns how many
/// encoded bytes were saved.
fn shrink_leaf(root: &mut Value, path: &[PathSegment], max_size: usize) -> usize {
    let Some(leaf) = leaf_mut(root, path) else {
        return 0;
    };
    let before = serialized_len(leaf.as_str());
    if !truncate_string(leaf, max_size) {
        return 0;
    }
    before.saturating_sub(serialized_len(leaf.as_str()))
}

fn largest_leaves_first(root: &Value) -> Vec<(usize, Vec<PathSegment>)> {
    let mut leaves = Vec::new();
    collect_string_leaves(root, &mut Vec::new(), &mut leaves);
    // stable: ties keep document order
    leaves.sort_by(|a, b| b.0.cmp(&a.0));
    leaves
}

/// Size limits applied to metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataLimits {
    /// Budget a single oversized string is first cut down to.
    pub max_value_size: usize,
    /// Budget for the whole encoded metadata object.
    pub max_total_size: usize,
}

/// Shortens string leaves until the encoded metadata fits
/// `limits.max_total_size`. Returns `true` if anything was truncated.
///
/// Leaves larger than `max_value_size` are cut to that size first, largest
/// first. If the object is still over budget, the remaining excess is taken
/// from the largest leaves in turn.
pub fn truncate_metadata(metadata: &mut Map<String, Value>, limits: MetadataLimits) -> bool {
    let mut total = serialized_len(&*metadata);
    if total <= limits.max_total_size {
        return false;
    }
    let original_total = total;
    let mut root = Value::Object(std::mem::take(metadata));

    for (len, path) in largest_leaves_first(&root) {
        if total <= limits.max_total_size {
            break;
        }
        if len > limits.max_value_size {
            total -= shrink_leaf(&mut root, &path, limits.max_value_size);
        }
    }

    if total > limits.max_total_size {
        for (len, path) in largest_leaves_first(&root) {
            if total <= limits.max_total_size || len == 0 {
                break;
            }
            let excess = total - limits.max_total_size;
            total -= shrink_leaf(&mut root, &path, len.saturating_sub(excess));
        }
    }

    if let Value::Object(map) = root {
        *metadata = map;
    }
    debug!(
        "Truncated metadata from {} to {} bytes (budget {})",
        original_total, total, limits.max_total_size
    );
    total != original_total
}

/// Redacts then truncates metadata.
#[derive(Debug, Clone)]
pub struct MetadataProcessor {
    rules: RedactRules,
    limits: MetadataLimits,
}

impl MetadataProcessor {
    /// `rules` are added on top of the built-in ones.
    #[must_use]
    pub fn new(rules: &RedactRules, limits: MetadataLimits) -> Self {
        let mut all = RedactRules::builtin();
        all.merge(rules);
        Self { rules: all, limits }
    }

    #[must_use]
    pub fn rules(&self) -> &RedactRules {
        &self.rules
    }

    #[must_use]
    pub fn process(&self, mut metadata: Map<String, Value>) -> Map<String, Value> {
        redact(&mut metadata, &self.rules);
        truncate_metadata(&mut metadata, self.limits);
        metadata
    }
}

/// One-shot form of [`MetadataProcessor::process`].
#[must_use]
pub fn process(
    metadata: Map<String, Value>,
    redact_keys: &RedactRules,
    limits: MetadataLimits,
) -> Map<String, Value> {
    MetadataProcessor::new(redact_keys, limits).process(metadata)
}
