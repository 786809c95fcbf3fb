// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by the trace engine.
///
/// Transport failures are deliberately absent: they are logged and counted,
/// never returned to the host.
#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    #[error("Failed to generate a random identifier: {0}")]
    Randomness(#[from] getrandom::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to serialize segment: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Request trace has not been started")]
    NotStarted,

    #[error("Request trace is already closed")]
    Closed,

    #[error("Unknown remote call handle {0}")]
    UnknownHandle(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = TracerError::InvalidConfig("segment budget must be positive".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: segment budget must be positive"
        );
    }

    #[test]
    fn test_error_debug() {
        let error = TracerError::NotStarted;
        let debug_str = format!("{:?}", error);
        assert!(debug_str.contains("NotStarted"));
    }

    #[test]
    fn test_serialization_error_converts() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: TracerError = json_err.into();
        assert!(error.to_string().starts_with("Failed to serialize segment"));
    }

    #[test]
    fn test_lifecycle_messages() {
        assert_eq!(
            TracerError::NotStarted.to_string(),
            "Request trace has not been started"
        );
        assert_eq!(TracerError::Closed.to_string(), "Request trace is already closed");
    }

    #[test]
    fn test_unknown_handle_message() {
        assert_eq!(
            TracerError::UnknownHandle(7).to_string(),
            "Unknown remote call handle 7"
        );
    }
}
