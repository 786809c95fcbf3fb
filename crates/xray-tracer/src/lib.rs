// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Assembly and transport of AWS X-Ray segments for one request at a time.
//!
//! The host builds a [`Tracer`] at startup and opens a [`RequestTrace`] per
//! inbound request. Segments are redacted and size-bounded, flattened to fit
//! a UDP datagram and sent fire-and-forget to the local X-Ray daemon.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod clock;
pub mod config;
pub mod encoding;
pub mod error;
pub mod flatten;
pub mod host_error;
pub mod ids;
pub mod lifecycle;
pub mod metadata;
pub mod observer;
pub mod profile;
pub mod remote;
pub mod segment;
pub mod transport;
pub mod truncate;

pub use config::TracerConfig;
pub use error::TracerError;
pub use lifecycle::{
    CallHandle, FinalizeOutcome, InboundRequest, RequestTrace, TraceState, Tracer, TracerBuilder,
};
pub use segment::Segment;
pub use transport::{SendReport, Transport, UdpTransport};
