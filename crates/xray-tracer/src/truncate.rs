// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte-length bounding for scalar values and SQL text.

/// Appended to non-SELECT queries so database logs can be tied to a trace.
const QUERY_TRACE_ID_PREFIX: &str = " # Trace ID: ";

fn prefix_len(value: &str, max_size: usize) -> usize {
    if value.len() <= max_size {
        return value.len();
    }
    let mut end = max_size;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Returns the longest prefix of `value` that is at most `max_size` bytes and
/// does not split a UTF-8 code point. Values already within budget are
/// returned unchanged.
///
/// # Examples
///
/// ```
/// use xray_tracer::truncate::truncate_value;
///
/// assert_eq!(truncate_value("hello", 10), "hello");
/// assert_eq!(truncate_value("hello", 4), "hell");
/// // "é" is two bytes and is never split
/// assert_eq!(truncate_value("café", 4), "caf");
/// ```
#[must_use]
pub fn truncate_value(value: &str, max_size: usize) -> &str {
    &value[..prefix_len(value, max_size)]
}

/// In-place variant of [`truncate_value`]. Returns `true` if the string was
/// shortened.
pub fn truncate_string(value: &mut String, max_size: usize) -> bool {
    let end = prefix_len(value, max_size);
    if end == value.len() {
        return false;
    }
    value.truncate(end);
    true
}

/// Tags `query` with the root trace id as a trailing SQL comment.
///
/// `SELECT` statements are returned untouched unless `annotate_selects` is
/// set, since a trailing unique comment defeats query caches keyed on the
/// statement text.
#[must_use]
pub fn annotate_query(query: &str, trace_id: &str, annotate_selects: bool) -> String {
    let is_select = query
        .trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("select"));
    if is_select && !annotate_selects {
        return query.to_string();
    }
    format!("{query}{QUERY_TRACE_ID_PREFIX}{trace_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn long_insert(payload_len: usize) -> String {
        format!(
            "INSERT INTO wp_postmeta(`post_id`,`meta_key`,`meta_values`) values('123', 'long_meta', '{}')",
            "x".repeat(payload_len)
        )
    }

    #[test]
    fn test_truncate_long_value() {
        let value = "a".repeat(10 * 1024);
        let truncated = truncate_value(&value, 5120);
        assert_eq!(truncated.len(), 5120);
        assert!(value.starts_with(truncated));
    }

    #[test]
    fn test_short_value_unchanged() {
        let value = "a".repeat(2 * 1024);
        assert_eq!(truncate_value(&value, 5120), value);
    }

    #[test]
    fn test_truncate_long_query() {
        let query = long_insert(10 * 1024);
        assert!(truncate_value(&query, 5 * 1024).len() <= 5 * 1024);
    }

    #[test]
    fn test_truncate_short_query() {
        let query = long_insert(1024);
        assert_eq!(truncate_value(&query, 5 * 1024), query);
    }

    #[test]
    fn test_truncate_respects_multibyte_boundary() {
        // each snowman is three bytes
        let value = "☃☃☃";
        assert_eq!(truncate_value(value, 8), "☃☃");
        assert_eq!(truncate_value(value, 2), "");
    }

    #[test]
    fn test_truncate_string_in_place() {
        let mut value = "abcdef".to_string();
        assert!(truncate_string(&mut value, 3));
        assert_eq!(value, "abc");
        assert!(!truncate_string(&mut value, 3));
    }

    #[test]
    fn test_annotate_non_select_query() {
        assert_eq!(
            annotate_query("UPDATE wp_options SET x = 1", "1-abc-def", false),
            "UPDATE wp_options SET x = 1 # Trace ID: 1-abc-def"
        );
    }

    #[test]
    fn test_select_query_skipped_by_default() {
        let query = "  select * from wp_posts";
        assert_eq!(annotate_query(query, "1-abc-def", false), query);
        assert_eq!(
            annotate_query(query, "1-abc-def", true),
            "  select * from wp_posts # Trace ID: 1-abc-def"
        );
    }

    #[test]
    fn test_annotate_short_query() {
        assert_eq!(annotate_query("SET", "t", false), "SET # Trace ID: t");
    }

    proptest! {
        #[test]
        fn prop_truncation_never_grows(value in ".*", max_size in 0usize..64) {
            let truncated = truncate_value(&value, max_size);
            prop_assert!(truncated.len() <= value.len().max(max_size));
            if value.len() <= max_size {
                prop_assert_eq!(truncated, value.as_str());
            } else {
                prop_assert!(truncated.len() <= max_size);
            }
        }

        #[test]
        fn prop_truncation_is_a_prefix(value in "\\PC*", max_size in 0usize..64) {
            let truncated = truncate_value(&value, max_size);
            prop_assert!(value.starts_with(truncated));
            // the longest fitting prefix: the next char would overflow
            if let Some(next) = value[truncated.len()..].chars().next() {
                prop_assert!(truncated.len() + next.len_utf8() > max_size);
            }
        }
    }
}
