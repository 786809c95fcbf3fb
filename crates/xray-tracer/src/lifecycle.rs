// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-request trace lifecycle.
//!
//! A [`Tracer`] is built once at startup with the configuration, transport
//! and observers. Every inbound request then gets its own [`RequestTrace`],
//! which owns all request-scoped state (identifiers, recorded errors, remote
//! call totals) and moves through three states:
//!
//! ```text
//! NotStarted --start()--> InProgress --finalize()--> Closed
//! ```
//!
//! `start` sends the in-progress main segment. While in progress every remote
//! call is sent on its own as soon as it is known. `finalize` sends the
//! profile subsegment (if any), the closing main segment and the object cache
//! subsegment. A trace dropped while still in progress is finalized on drop,
//! and a trace is never closed twice.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, error, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::TracerConfig;
use crate::error::TracerError;
use crate::flatten::flatten;
use crate::host_error::HostError;
use crate::ids::TraceIds;
use crate::metadata::{MetadataProcessor, RESPONSE_SECTION, STATS_SECTION};
use crate::observer::{Observers, TraceObserver};
use crate::profile::{Profile, ProfileBuilder, PROFILE_SEGMENT_NAME};
use crate::remote::{
    aws_call_segment, complete_call, db_query_segment, object_cache_segment, remote_call_segment,
    AwsCall, CacheStats, CallKind, CallOutcome, CallStats, DbQuery, HttpCall, Parent, RemoteCall,
};
use crate::segment::{Cause, Http, HttpRequest, HttpResponse, Segment, Service};
use crate::transport::{SendReport, Transport, UdpTransport};
use crate::truncate::annotate_query;

const BYTES_PER_MIB: f64 = 1_048_576.0;

struct TracerInner {
    config: TracerConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    observers: Observers,
    metadata: MetadataProcessor,
    profiles: ProfileBuilder,
}

/// Process-wide entry point, cheap to clone.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("config", &self.inner.config)
            .field("observers", &self.inner.observers)
            .finish_non_exhaustive()
    }
}

/// Builds a [`Tracer`]. Transport defaults to UDP to the configured daemon,
/// clock to the system clock.
pub struct TracerBuilder {
    config: TracerConfig,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    observers: Observers,
}

impl TracerBuilder {
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn TraceObserver>) -> Self {
        self.observers.register(observer);
        self
    }

    pub fn build(self) -> Result<Tracer, TracerError> {
        self.config.validate()?;

        let mut rules = self.config.redact_keys.clone();
        self.observers.redact_keys(&mut rules);
        let metadata = MetadataProcessor::new(&rules, self.config.metadata_limits());
        let profiles = ProfileBuilder::new(self.config.max_stack_samples)
            .with_entry_point(self.config.profile_entry_point.clone());
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(UdpTransport::new(self.config.daemon_endpoint())));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        debug!(
            "X-Ray tracer ready, sending to {} with a {} byte segment budget",
            self.config.daemon_endpoint(),
            self.config.max_segment_size
        );
        Ok(Tracer {
            inner: Arc::new(TracerInner {
                config: self.config,
                transport,
                clock,
                observers: self.observers,
                metadata,
                profiles,
            }),
        })
    }
}

impl Tracer {
    #[must_use]
    pub fn builder(config: TracerConfig) -> TracerBuilder {
        TracerBuilder {
            config,
            transport: None,
            clock: None,
            observers: Observers::default(),
        }
    }

    /// A tracer sending over UDP to the configured daemon.
    pub fn new(config: TracerConfig) -> Result<Self, TracerError> {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &TracerConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn now(&self) -> f64 {
        self.inner.clock.now()
    }

    /// Redacts, truncates and filters request metadata.
    #[must_use]
    pub fn process_metadata(&self, metadata: Map<String, Value>) -> Map<String, Value> {
        let mut processed = self.inner.metadata.process(metadata);
        self.inner.observers.filter_metadata(&mut processed);
        processed
    }

    /// Hands a segment tree to the observers, flattens it to the datagram
    /// budget and sends every piece. `on_sent` only sees pieces the
    /// transport delivered.
    pub fn send(&self, mut segment: Segment, trace_id: &str) -> SendReport {
        self.inner.observers.before_send(&mut segment);
        let pieces = flatten(segment, trace_id, self.inner.config.max_segment_size);
        let observers = &self.inner.observers;
        self.inner
            .transport
            .send_batch(&pieces, &mut |piece| observers.on_sent(piece))
    }

    /// Creates the trace for one inbound request. Nothing is sent until
    /// [`RequestTrace::start`].
    #[must_use]
    pub fn request(&self, request: InboundRequest) -> RequestTrace {
        let ids = TraceIds::from_carrier(&request.headers);
        let start_time = request.start_time.unwrap_or_else(|| self.now());
        RequestTrace {
            tracer: self.clone(),
            ids,
            request,
            start_time,
            state: TraceState::NotStarted,
            errors: Vec::new(),
            stats: CallStats::default(),
            cache: None,
            pending: HashMap::new(),
            next_handle: 0,
            response: ResponseInfo::default(),
            user: None,
            peak_memory: None,
            report: SendReport::default(),
        }
    }
}

/// What the host knows about the inbound request when it starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundRequest {
    pub method: String,
    pub url: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    /// Request headers, used for the propagated trace context.
    pub headers: HashMap<String, String>,
    /// Environment snapshot by section (`query`, `form`, `cookies`,
    /// `server`). Redacted before it is sent.
    pub metadata: Map<String, Value>,
    /// When the request started; defaults to when the trace is created.
    pub start_time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ResponseInfo {
    status: Option<u16>,
    headers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    NotStarted,
    InProgress,
    Closed,
}

/// Opaque handle to a remote call started with
/// [`RequestTrace::start_remote_call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallHandle(u64);

impl CallHandle {
    #[must_use]
    pub fn id(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// The closing segment was sent; totals for the whole request.
    Closed(SendReport),
    /// The trace had already been finalized; nothing was sent.
    AlreadyClosed,
}

#[derive(Debug)]
struct PendingCall {
    kind: CallKind,
    segment: Segment,
}

/// Trace state for one request.
#[derive(Debug)]
pub struct RequestTrace {
    tracer: Tracer,
    ids: TraceIds,
    request: InboundRequest,
    start_time: f64,
    state: TraceState,
    errors: Vec<HostError>,
    stats: CallStats,
    cache: Option<CacheStats>,
    pending: HashMap<u64, PendingCall>,
    next_handle: u64,
    response: ResponseInfo,
    user: Option<String>,
    peak_memory: Option<u64>,
    report: SendReport,
}

impl RequestTrace {
    #[must_use]
    pub fn state(&self) -> TraceState {
        self.state
    }

    #[must_use]
    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Datagram totals for everything sent so far.
    #[must_use]
    pub fn report(&self) -> SendReport {
        self.report
    }

    #[must_use]
    pub fn errors(&self) -> &[HostError] {
        &self.errors
    }

    #[must_use]
    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    pub fn root_trace_id(&self) -> Result<&str, TracerError> {
        self.ids.root_trace_id()
    }

    pub fn main_segment_id(&self) -> Result<&str, TracerError> {
        self.ids.main_segment_id()
    }

    /// Tags SQL text with this request's trace id.
    pub fn annotate_query(&self, query: &str) -> Result<String, TracerError> {
        Ok(annotate_query(
            query,
            self.ids.root_trace_id()?,
            self.tracer.config().annotate_select_queries,
        ))
    }

    /// Sends the in-progress main segment.
    pub fn start(&mut self) -> Result<SendReport, TracerError> {
        if self.state != TraceState::NotStarted {
            debug!("Request trace already started, ignoring start");
            return Ok(SendReport::default());
        }
        let mut metadata = self.request.metadata.clone();
        metadata.insert(RESPONSE_SECTION.to_string(), json!({}));

        let mut segment = self.main_segment()?;
        segment.metadata = Some(self.tracer.process_metadata(metadata));
        self.state = TraceState::InProgress;
        self.send(segment)
    }

    /// Records a completed query and sends its subsegment.
    pub fn record_query(&mut self, query: DbQuery) -> Result<SendReport, TracerError> {
        self.ensure_in_progress()?;
        self.stats
            .record(CallKind::Database, query.end_time - query.start_time);
        let max_value_size = self.tracer.config().max_value_size;
        let segment = db_query_segment(query, self.parent()?, max_value_size)?;
        self.send(segment)
    }

    /// Sends an in-progress subsegment for `call` and returns the handle to
    /// complete it with.
    pub fn start_remote_call(&mut self, mut call: RemoteCall) -> Result<CallHandle, TracerError> {
        self.ensure_in_progress()?;
        let kind = call.kind;
        call.metadata = call
            .metadata
            .take()
            .map(|metadata| self.tracer.process_metadata(metadata));
        let max_value_size = self.tracer.config().max_value_size;
        let segment = remote_call_segment(call, self.parent()?, self.tracer.now(), max_value_size)?;
        self.send(segment.clone())?;

        let handle = CallHandle(self.next_handle);
        self.next_handle += 1;
        self.pending.insert(handle.0, PendingCall { kind, segment });
        Ok(handle)
    }

    pub fn start_http_call(&mut self, call: HttpCall) -> Result<CallHandle, TracerError> {
        self.start_remote_call(RemoteCall::http(call))
    }

    /// Closes the call behind `handle` and sends its final subsegment.
    pub fn end_remote_call(
        &mut self,
        handle: CallHandle,
        outcome: CallOutcome,
    ) -> Result<SendReport, TracerError> {
        self.ensure_in_progress()?;
        let PendingCall { kind, mut segment } = self
            .pending
            .remove(&handle.0)
            .ok_or(TracerError::UnknownHandle(handle.0))?;
        complete_call(&mut segment, outcome, self.tracer.now())?;
        let elapsed = segment.end_time.unwrap_or(segment.start_time) - segment.start_time;
        self.stats.record(kind, elapsed);
        self.send(segment)
    }

    /// Records an AWS SDK call that just completed.
    pub fn record_aws_call(&mut self, call: AwsCall) -> Result<SendReport, TracerError> {
        self.ensure_in_progress()?;
        self.stats.record(CallKind::Aws, call.total_time);
        let segment = aws_call_segment(call, self.parent()?, self.tracer.now())?;
        self.send(segment)
    }

    /// Records an error for the closing segment. Never fails.
    pub fn record_error(&mut self, error: HostError) {
        debug!("Recorded request error {}: {}", error.code, error.message);
        self.errors.push(error);
    }

    pub fn set_response(&mut self, status: u16, headers: Vec<String>) {
        self.response = ResponseInfo {
            status: Some(status),
            headers,
        };
    }

    pub fn set_user(&mut self, user: impl Into<String>) {
        self.user = Some(user.into());
    }

    /// Peak memory of the request in bytes, reported in MiB.
    pub fn set_peak_memory(&mut self, bytes: u64) {
        self.peak_memory = Some(bytes);
    }

    pub fn set_cache_stats(&mut self, stats: CacheStats) {
        self.cache = Some(stats);
    }

    /// Sends the closing segments and closes the trace.
    ///
    /// Sends, in order: the profile subsegment when `profile` has samples,
    /// the closing main segment, and the object cache subsegment when cache
    /// time was reported. Calls after the first return
    /// [`FinalizeOutcome::AlreadyClosed`] without sending anything.
    pub fn finalize(&mut self, profile: Option<Profile>) -> Result<FinalizeOutcome, TracerError> {
        match self.state {
            TraceState::Closed => {
                debug!("Request trace already closed, skipping finalize");
                return Ok(FinalizeOutcome::AlreadyClosed);
            }
            TraceState::NotStarted => return Err(TracerError::NotStarted),
            TraceState::InProgress => {}
        }
        self.state = TraceState::Closed;

        for pending in self.pending.values() {
            warn!(
                "Subsegment {} ({}) was never completed and stays in progress",
                pending.segment.id, pending.segment.name
            );
        }

        if let Some(profile) = profile.filter(|p| !p.samples.is_empty()) {
            let segment = self.profile_segment(profile)?;
            self.send(segment)?;
        }

        let segment = self.closing_segment()?;
        self.send(segment)?;

        let cache_segment = match &self.cache {
            Some(stats) => object_cache_segment(stats, self.parent()?, self.start_time)?,
            None => None,
        };
        if let Some(segment) = cache_segment {
            self.send(segment)?;
        }

        Ok(FinalizeOutcome::Closed(self.report))
    }

    fn ensure_in_progress(&self) -> Result<(), TracerError> {
        match self.state {
            TraceState::NotStarted => Err(TracerError::NotStarted),
            TraceState::InProgress => Ok(()),
            TraceState::Closed => Err(TracerError::Closed),
        }
    }

    fn parent(&self) -> Result<Parent<'_>, TracerError> {
        Ok(Parent {
            trace_id: self.ids.root_trace_id()?,
            id: self.ids.main_segment_id()?,
        })
    }

    fn send(&mut self, segment: Segment) -> Result<SendReport, TracerError> {
        let report = self.tracer.send(segment, self.ids.root_trace_id()?);
        self.report.merge(report);
        Ok(report)
    }

    fn http_request(&self) -> HttpRequest {
        HttpRequest {
            method: Some(self.request.method.clone()),
            url: Some(self.request.url.clone()),
            client_ip: self.request.client_ip.clone(),
            user_agent: self.request.user_agent.clone(),
        }
    }

    /// The main segment with the fields shared by its in-progress and
    /// closing versions.
    fn main_segment(&self) -> Result<Segment, TracerError> {
        let config = self.tracer.config();
        let mut segment = Segment::new(
            config.service_name.clone(),
            self.ids.main_segment_id()?,
            self.ids.root_trace_id()?,
            self.start_time,
        );
        segment.service = Some(Service {
            version: config.service_version.clone(),
        });
        segment.origin = Some(config.origin.clone());
        segment.http = Some(Http {
            request: Some(self.http_request()),
            response: None,
        });
        Ok(segment)
    }

    fn closing_segment(&self) -> Result<Segment, TracerError> {
        let mut segment = self.main_segment()?;
        segment.close(self.tracer.now());
        segment.user = self.user.clone();
        if let Some(http) = segment.http.as_mut() {
            http.response = self.response.status.map(|status| HttpResponse {
                status: Some(status),
            });
        }

        segment.fault = self.errors.iter().any(HostError::is_fatal);
        segment.error = self.errors.iter().any(|e| !e.is_fatal());
        if !self.errors.is_empty() {
            segment.cause = Some(Cause {
                exceptions: self
                    .errors
                    .iter()
                    .map(HostError::to_exception)
                    .collect::<Result<_, _>>()?,
            });
        }

        let mut stats = self.stats.to_metadata();
        if let Some(cache) = &self.cache {
            stats.insert("object_cache".to_string(), serde_json::to_value(cache)?);
        }
        let mut metadata = self.request.metadata.clone();
        metadata.insert(
            RESPONSE_SECTION.to_string(),
            json!({"headers": self.response.headers}),
        );
        metadata.insert(STATS_SECTION.to_string(), Value::Object(stats));
        segment.metadata = Some(self.tracer.process_metadata(metadata));

        if let Some(bytes) = self.peak_memory {
            segment
                .annotations
                .insert("memoryUsage".to_string(), json!(bytes as f64 / BYTES_PER_MIB));
        }
        Ok(segment)
    }

    fn profile_segment(&self, profile: Profile) -> Result<Segment, TracerError> {
        let tree = self.tracer.inner.profiles.build(
            &profile.samples,
            profile.sample_duration,
            self.start_time,
        );
        let mut segment = tree.into_segment(self.ids.root_trace_id()?)?;
        segment.name = PROFILE_SEGMENT_NAME.to_string();
        let mut segment = segment.child_of(self.ids.main_segment_id()?);
        segment.in_progress = false;
        Ok(segment)
    }
}

impl Drop for RequestTrace {
    fn drop(&mut self) {
        if self.state != TraceState::InProgress {
            return;
        }
        debug!("Request trace dropped while in progress, finalizing");
        if let Err(e) = self.finalize(None) {
            error!("Error finalizing dropped request trace: {e}");
        }
    }
}
