// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire framing for the X-Ray daemon.
//!
//! Each datagram is the JSON header line followed by a newline and one
//! compact JSON segment document:
//!
//! ```text
//! {"format": "json", "version": 1}
//! {"name":"local","id":"53995c3f42cd8ad8",...}
//! ```

use std::io;

use serde::Serialize;

use crate::error::TracerError;
use crate::segment::Segment;

pub const DAEMON_HEADER: &str = r#"{"format": "json", "version": 1}"#;

/// Counts bytes without buffering them.
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Length in bytes of the compact JSON encoding of `value`.
///
/// Values that cannot be encoded report `usize::MAX`, so they never pass a
/// size check.
pub fn serialized_len<T: Serialize + ?Sized>(value: &T) -> usize {
    let mut counter = ByteCounter(0);
    match serde_json::to_writer(&mut counter, value) {
        Ok(()) => counter.0,
        Err(_) => usize::MAX,
    }
}

/// Frames a segment as a daemon datagram.
pub fn encode_message(segment: &Segment) -> Result<Vec<u8>, TracerError> {
    let mut buf = Vec::with_capacity(DAEMON_HEADER.len() + 1 + 512);
    buf.extend_from_slice(DAEMON_HEADER.as_bytes());
    buf.push(b'\n');
    serde_json::to_writer(&mut buf, segment)?;
    Ok(buf)
}
