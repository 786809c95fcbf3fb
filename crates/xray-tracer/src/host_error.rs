// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Errors the host reports while serving a request.
//!
//! Hosts report errors with numeric codes in the classic `E_*` bit values;
//! the closing segment lists each one as an exception and flags the segment
//! as a fault or an error depending on severity.

use crate::error::TracerError;
use crate::ids::new_segment_id;
use crate::segment::{Exception, StackFrame};

pub const E_ERROR: i32 = 1;
pub const E_WARNING: i32 = 2;
pub const E_PARSE: i32 = 4;
pub const E_NOTICE: i32 = 8;
pub const E_CORE_ERROR: i32 = 16;
pub const E_CORE_WARNING: i32 = 32;
pub const E_COMPILE_ERROR: i32 = 64;
pub const E_COMPILE_WARNING: i32 = 128;
pub const E_USER_ERROR: i32 = 256;
pub const E_USER_WARNING: i32 = 512;
pub const E_USER_NOTICE: i32 = 1024;
pub const E_STRICT: i32 = 2048;
pub const E_RECOVERABLE_ERROR: i32 = 4096;
pub const E_DEPRECATED: i32 = 8192;
pub const E_USER_DEPRECATED: i32 = 16384;

const ERROR_TYPES: [(i32, &str); 15] = [
    (E_ERROR, "E_ERROR"),
    (E_WARNING, "E_WARNING"),
    (E_PARSE, "E_PARSE"),
    (E_NOTICE, "E_NOTICE"),
    (E_CORE_ERROR, "E_CORE_ERROR"),
    (E_CORE_WARNING, "E_CORE_WARNING"),
    (E_COMPILE_ERROR, "E_COMPILE_ERROR"),
    (E_COMPILE_WARNING, "E_COMPILE_WARNING"),
    (E_USER_ERROR, "E_USER_ERROR"),
    (E_USER_WARNING, "E_USER_WARNING"),
    (E_USER_NOTICE, "E_USER_NOTICE"),
    (E_STRICT, "E_STRICT"),
    (E_RECOVERABLE_ERROR, "E_RECOVERABLE_ERROR"),
    (E_DEPRECATED, "E_DEPRECATED"),
    (E_USER_DEPRECATED, "E_USER_DEPRECATED"),
];

/// Codes that end the request.
const FATAL_CODES: [i32; 5] = [E_ERROR, E_PARSE, E_CORE_ERROR, E_COMPILE_ERROR, E_USER_ERROR];

/// Name of an error code, `None` for codes outside the table.
#[must_use]
pub fn error_type(code: i32) -> Option<&'static str> {
    ERROR_TYPES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// An error reported through `on_request_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError {
    pub code: i32,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl HostError {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            file: None,
            line: None,
        }
    }

    #[must_use]
    pub fn at(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        FATAL_CODES.contains(&self.code)
    }

    pub fn to_exception(&self) -> Result<Exception, TracerError> {
        let stack = if self.file.is_some() || self.line.is_some() {
            vec![StackFrame {
                path: self.file.clone(),
                line: self.line,
            }]
        } else {
            Vec::new()
        };
        Ok(Exception {
            id: new_segment_id()?,
            message: self.message.clone(),
            kind: error_type(self.code).map(str::to_string),
            stack,
        })
    }
}
