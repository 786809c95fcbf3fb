// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace and segment identifiers.
//!
//! X-Ray identifies a request with a root trace id of the form
//! `1-<unix seconds as hex>-<24 hex chars>` and each segment with 16 hex
//! characters. The root trace id may be propagated from upstream through the
//! `X-Amzn-Trace-Id` header, e.g.
//!
//! ```text
//! X-Amzn-Trace-Id: Root=1-5759e988-bd862e3fe1be46a994272793;Self=1-67891233-abcdef012345678912345678
//! ```
//!
//! `Self` wins over `Root` when both are present.
//!
//! All randomness comes from the operating system. When the OS source fails
//! the error is propagated: a predictable identifier is never substituted.

use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::debug;

use crate::clock::unix_seconds;
use crate::error::TracerError;

/// Inbound header carrying the propagated trace context.
pub const TRACE_ID_HEADER: &str = "x-amzn-trace-id";

const SEGMENT_ID_BYTES: usize = 8;
const TRACE_ID_RANDOM_BYTES: usize = 12;

/// Read access to request headers, case-insensitive on the key.
pub trait Extractor {
    fn get(&self, key: &str) -> Option<&str>;
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

fn random_hex(len_bytes: usize) -> Result<String, TracerError> {
    let mut buf = vec![0u8; len_bytes];
    getrandom::getrandom(&mut buf)?;
    Ok(hex::encode(buf))
}

/// Returns a fresh 16-hex-character segment id.
pub fn new_segment_id() -> Result<String, TracerError> {
    random_hex(SEGMENT_ID_BYTES)
}

/// Synthesizes a root trace id from the current time and 96 random bits.
pub fn generate_root_trace_id() -> Result<String, TracerError> {
    Ok(format!(
        "1-{:08x}-{}",
        unix_seconds(),
        random_hex(TRACE_ID_RANDOM_BYTES)?
    ))
}

/// Extracts the propagated trace id from a `X-Amzn-Trace-Id` header value.
///
/// The value is a list of semicolon separated `key=value` pairs. Returns the
/// `Self` entry if present, otherwise `Root`, otherwise `None`. A value
/// ends at the next `=`, so `Self=a=b` yields `a`.
pub fn parse_trace_header(value: &str) -> Option<String> {
    let mut self_id = None;
    let mut root_id = None;

    for pair in value.split(';') {
        let mut fields = pair.split('=');
        let (Some(key), Some(val)) = (fields.next(), fields.next()) else {
            continue;
        };
        let val = val.trim();
        if val.is_empty() {
            continue;
        }
        match key.trim() {
            "Self" => self_id = Some(val.to_string()),
            "Root" => root_id = Some(val.to_string()),
            _ => {}
        }
    }

    self_id.or(root_id)
}

/// Identifiers memoized for the lifetime of one request.
///
/// A new `TraceIds` is created at every request boundary, so a process that
/// serves many requests never reuses a trace id or main segment id.
#[derive(Debug, Default)]
pub struct TraceIds {
    propagated: Option<String>,
    root_trace_id: OnceLock<String>,
    main_segment_id: OnceLock<String>,
}

impl TraceIds {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds identifiers honouring a raw `X-Amzn-Trace-Id` header value.
    #[must_use]
    pub fn from_header(header: Option<&str>) -> Self {
        let propagated = header.and_then(parse_trace_header);
        if let Some(trace_id) = &propagated {
            debug!("Using propagated trace id {}", trace_id);
        }
        Self {
            propagated,
            ..Default::default()
        }
    }

    /// Builds identifiers from the request headers.
    #[must_use]
    pub fn from_carrier(carrier: &impl Extractor) -> Self {
        Self::from_header(carrier.get(TRACE_ID_HEADER))
    }

    /// The trace id shared by every segment of this request.
    pub fn root_trace_id(&self) -> Result<&str, TracerError> {
        if let Some(id) = self.root_trace_id.get() {
            return Ok(id);
        }
        let id = match &self.propagated {
            Some(id) => id.clone(),
            None => generate_root_trace_id()?,
        };
        Ok(self.root_trace_id.get_or_init(|| id))
    }

    /// The id of the request's root segment, stable for the request.
    pub fn main_segment_id(&self) -> Result<&str, TracerError> {
        if let Some(id) = self.main_segment_id.get() {
            return Ok(id);
        }
        let id = new_segment_id()?;
        Ok(self.main_segment_id.get_or_init(|| id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_hex(s: &str) -> bool {
        s.chars().all(|c| c.is_ascii_hexdigit())
    }

    #[test]
    fn test_segment_id_shape() {
        let id = new_segment_id().unwrap();
        assert_eq!(id.len(), 16);
        assert!(is_hex(&id));
        assert_ne!(id, new_segment_id().unwrap());
    }

    #[test]
    fn test_generated_root_trace_id_shape() {
        let id = generate_root_trace_id().unwrap();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "1");
        assert_eq!(parts[1].len(), 8);
        assert!(is_hex(parts[1]));
        assert_eq!(parts[2].len(), 24);
        assert!(is_hex(parts[2]));
    }

    #[test]
    fn test_parse_header_prefers_self() {
        let header = "Root=1-5759e988-bd862e3fe1be46a994272793;Self=1-67891233-abcdef012345678912345678";
        assert_eq!(
            parse_trace_header(header),
            Some("1-67891233-abcdef012345678912345678".to_string())
        );
    }

    #[test]
    fn test_parse_header_falls_back_to_root() {
        let header = "Root=1-5759e988-bd862e3fe1be46a994272793;Sampled=1";
        assert_eq!(
            parse_trace_header(header),
            Some("1-5759e988-bd862e3fe1be46a994272793".to_string())
        );
    }

    #[test]
    fn test_parse_header_value_stops_at_next_equals() {
        assert_eq!(
            parse_trace_header("Root=1-abc-def;Self=1-aaa-bbb=extra"),
            Some("1-aaa-bbb".to_string())
        );
    }

    #[test]
    fn test_parse_header_without_ids() {
        assert_eq!(parse_trace_header(""), None);
        assert_eq!(parse_trace_header("Sampled=1;Parent=53995c3f42cd8ad8"), None);
        assert_eq!(parse_trace_header("Root=;Self"), None);
    }

    #[test]
    fn test_root_trace_id_is_memoized() {
        let ids = TraceIds::new();
        let first = ids.root_trace_id().unwrap().to_string();
        let second = ids.root_trace_id().unwrap().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn test_root_trace_id_differs_between_requests() {
        let first = TraceIds::new().root_trace_id().unwrap().to_string();
        let second = TraceIds::new().root_trace_id().unwrap().to_string();
        assert_ne!(first, second);
    }

    #[test]
    fn test_main_segment_id_is_memoized() {
        let ids = TraceIds::new();
        let first = ids.main_segment_id().unwrap().to_string();
        assert_eq!(first, ids.main_segment_id().unwrap());
        assert_eq!(first.len(), 16);
    }

    #[test]
    fn test_propagated_trace_id_from_carrier() {
        let headers = HashMap::from([(
            "X-Amzn-Trace-Id".to_string(),
            "Root=1-5759e988-bd862e3fe1be46a994272793".to_string(),
        )]);
        let ids = TraceIds::from_carrier(&headers);
        assert_eq!(
            ids.root_trace_id().unwrap(),
            "1-5759e988-bd862e3fe1be46a994272793"
        );
    }
}
