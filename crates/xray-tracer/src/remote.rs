// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Subsegments for remote calls made while serving a request.
//!
//! Instrumentation only reports what happened (a query with its timings, an
//! HTTP call and its response, an AWS SDK transfer); the builders here turn
//! those reports into standalone subsegments linked to the main segment.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::TracerError;
use crate::ids::new_segment_id;
use crate::segment::{
    Aws, Exception, Http, HttpRequest, HttpResponse, Namespace, Segment, Sql,
};
use crate::truncate::truncate_value;

pub const OBJECT_CACHE_SEGMENT_NAME: &str = "object-cache";
const UNKNOWN_AWS_OPERATION: &str = "amz-unknown-target";

/// Identity a subsegment hangs off: the request's trace and main segment.
#[derive(Debug, Clone, Copy)]
pub struct Parent<'a> {
    pub trace_id: &'a str,
    pub id: &'a str,
}

impl Parent<'_> {
    fn subsegment(&self, name: impl Into<String>, start_time: f64) -> Result<Segment, TracerError> {
        Ok(Segment::new(name, new_segment_id()?, self.trace_id, start_time).child_of(self.id))
    }
}

/// Kind of remote call, used for the namespace and for time accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallKind {
    Database,
    Http,
    Aws,
    Cache,
}

impl CallKind {
    /// Key of the call's totals in the closing segment's `stats` metadata.
    #[must_use]
    pub fn stats_key(self) -> &'static str {
        match self {
            CallKind::Database => "db",
            CallKind::Http => "remote",
            CallKind::Aws => "aws",
            CallKind::Cache => "cache",
        }
    }

    #[must_use]
    pub fn namespace(self) -> Namespace {
        match self {
            CallKind::Aws => Namespace::Aws,
            _ => Namespace::Remote,
        }
    }
}

/// Running time and count of remote calls for one kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CallTotals {
    pub time: f64,
    pub count: u64,
}

/// Per-request remote call totals, keyed by [`CallKind`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallStats {
    totals: BTreeMap<CallKind, CallTotals>,
}

impl CallStats {
    pub fn record(&mut self, kind: CallKind, elapsed: f64) {
        let totals = self.totals.entry(kind).or_default();
        totals.time += elapsed.max(0.0);
        totals.count += 1;
    }

    #[must_use]
    pub fn get(&self, kind: CallKind) -> CallTotals {
        self.totals.get(&kind).copied().unwrap_or_default()
    }

    /// Totals as a JSON object keyed by [`CallKind::stats_key`].
    #[must_use]
    pub fn to_metadata(&self) -> Map<String, Value> {
        self.totals
            .iter()
            .map(|(kind, totals)| {
                (
                    kind.stats_key().to_string(),
                    serde_json::json!({"time": totals.time, "count": totals.count}),
                )
            })
            .collect()
    }
}

/// Object cache counters the host reports at the end of the request.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub misses: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_calls: Option<u64>,
    /// Seconds spent talking to the cache backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

/// A completed database query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbQuery {
    pub host: String,
    pub user: Option<String>,
    pub database_type: Option<String>,
    pub query: String,
    pub start_time: f64,
    pub end_time: f64,
    /// Error message reported by the driver, if the query failed.
    pub error: Option<String>,
}

/// An outbound HTTP call about to be made.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpCall {
    pub method: String,
    pub url: String,
    pub user_agent: Option<String>,
}

/// A remote call started now and completed later through its handle.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub name: String,
    pub kind: CallKind,
    pub http: Option<Http>,
    pub sql: Option<Sql>,
    pub aws: Option<Aws>,
    pub metadata: Option<Map<String, Value>>,
}

impl RemoteCall {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: CallKind) -> Self {
        Self {
            name: name.into(),
            kind,
            http: None,
            sql: None,
            aws: None,
            metadata: None,
        }
    }

    /// Named after the URL's host, carrying the request line.
    #[must_use]
    pub fn http(call: HttpCall) -> Self {
        let mut remote = Self::new(url_host(&call.url), CallKind::Http);
        remote.http = Some(Http {
            request: Some(HttpRequest {
                method: Some(call.method),
                url: Some(call.url),
                client_ip: None,
                user_agent: call.user_agent,
            }),
            response: None,
        });
        remote
    }
}

/// Transport-level failure of a remote call, e.g. a DNS or connect error.
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub code: Option<String>,
    pub message: String,
}

impl CallError {
    fn describe(&self) -> String {
        match &self.code {
            Some(code) => format!("{} ({})", self.message, code),
            None => self.message.clone(),
        }
    }
}

/// How a remote call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// A response was received; `status` is its HTTP-like status if any.
    Response { status: Option<u16> },
    Failed(CallError),
}

/// An AWS SDK transfer, reported once complete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwsCall {
    pub host: String,
    pub method: String,
    pub url: String,
    pub user_agent: Option<String>,
    /// Value of the `x-amz-target` request header (`Service.Operation`).
    pub target: Option<String>,
    pub request_id: Option<String>,
    pub status: Option<u16>,
    pub response_body: Option<String>,
    /// Seconds from request start to response end.
    pub total_time: f64,
}

/// Host part of `url`, without userinfo or port. Falls back to the whole
/// input when it does not look like a URL.
#[must_use]
pub fn url_host(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    if let Some(bracketed) = host.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    match host.split_once(':') {
        Some((name, _)) => name,
        None => host,
    }
}

/// Operation name from a `Service.Operation` target header.
#[must_use]
pub fn aws_operation(target: Option<&str>) -> String {
    target
        .and_then(|t| t.split('.').nth(1))
        .filter(|op| !op.is_empty())
        .unwrap_or(UNKNOWN_AWS_OPERATION)
        .to_string()
}

fn exception(message: impl Into<String>) -> Result<Exception, TracerError> {
    Ok(Exception {
        id: new_segment_id()?,
        message: message.into(),
        kind: None,
        stack: Vec::new(),
    })
}

/// A closed subsegment for a query. The query text is bounded to
/// `max_value_size` bytes.
pub fn db_query_segment(
    query: DbQuery,
    parent: Parent<'_>,
    max_value_size: usize,
) -> Result<Segment, TracerError> {
    let mut segment = parent.subsegment(query.host.clone(), query.start_time)?;
    segment.namespace = Some(CallKind::Database.namespace());
    segment.sql = Some(Sql {
        user: query.user,
        url: Some(query.host),
        database_type: query.database_type,
        sanitized_query: truncate_value(&query.query, max_value_size).to_string(),
    });
    segment.close(query.end_time);
    if let Some(message) = query.error {
        segment.set_fault(exception(message)?);
    }
    Ok(segment)
}

/// An in-progress subsegment for a call that completes later. The query
/// text, if any, is cut to `max_value_size` bytes. `call.metadata` is taken
/// as given and must already be processed.
pub fn remote_call_segment(
    call: RemoteCall,
    parent: Parent<'_>,
    start_time: f64,
    max_value_size: usize,
) -> Result<Segment, TracerError> {
    let mut segment = parent.subsegment(call.name, start_time)?;
    segment.namespace = Some(call.kind.namespace());
    segment.http = call.http;
    segment.sql = call.sql.map(|mut sql| {
        let kept = truncate_value(&sql.sanitized_query, max_value_size).len();
        sql.sanitized_query.truncate(kept);
        sql
    });
    segment.aws = call.aws;
    segment.metadata = call.metadata;
    Ok(segment)
}

/// Closes a remote call subsegment with its outcome.
pub fn complete_call(
    segment: &mut Segment,
    outcome: CallOutcome,
    end_time: f64,
) -> Result<(), TracerError> {
    segment.close(end_time);
    match outcome {
        CallOutcome::Response { status } => {
            if status.is_some() {
                segment
                    .http
                    .get_or_insert_with(Http::default)
                    .response = Some(HttpResponse { status });
            }
        }
        CallOutcome::Failed(error) => segment.set_fault(exception(error.describe())?),
    }
    Ok(())
}

/// A closed subsegment for an AWS SDK call that ended at `now`.
///
/// Status 5xx is a fault, 4xx an error; either way the response body becomes
/// the cause.
pub fn aws_call_segment(call: AwsCall, parent: Parent<'_>, now: f64) -> Result<Segment, TracerError> {
    let mut segment = parent.subsegment(call.host, now - call.total_time)?;
    segment.namespace = Some(CallKind::Aws.namespace());
    segment.http = Some(Http {
        request: Some(HttpRequest {
            method: Some(call.method),
            url: Some(call.url),
            client_ip: None,
            user_agent: call.user_agent,
        }),
        response: Some(HttpResponse {
            status: call.status,
        }),
    });
    segment.aws = Some(Aws {
        request_id: call.request_id,
        operation: Some(aws_operation(call.target.as_deref())),
    });
    segment.close(now);

    if let Some(status) = call.status.filter(|status| *status >= 400) {
        segment.fault = status > 499;
        segment.error = status <= 499;
        segment
            .cause
            .get_or_insert_with(Default::default)
            .exceptions
            .push(exception(call.response_body.unwrap_or_default())?);
    }
    Ok(segment)
}

/// A subsegment covering all object cache time, anchored at the request
/// start. `None` when no cache time was reported.
pub fn object_cache_segment(
    stats: &CacheStats,
    parent: Parent<'_>,
    request_start: f64,
) -> Result<Option<Segment>, TracerError> {
    let Some(time) = stats.time.filter(|time| *time > 0.0) else {
        return Ok(None);
    };
    let mut segment = parent.subsegment(OBJECT_CACHE_SEGMENT_NAME, request_start)?;
    segment.namespace = Some(CallKind::Cache.namespace());
    segment.close(request_start + time);
    Ok(Some(segment))
}
