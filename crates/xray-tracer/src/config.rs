// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::error::TracerError;
use crate::metadata::{MetadataLimits, RedactRules};
use crate::profile::ENTRY_POINT;

/// Well-known port the X-Ray daemon listens on.
pub const DAEMON_PORT: u16 = 2000;

/// Largest payload a single UDP datagram can carry over IPv4.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

pub const DEFAULT_MAX_SEGMENT_SIZE: usize = 63 * 1024;
pub const DEFAULT_MAX_VALUE_SIZE: usize = 5 * 1024;
pub const DEFAULT_MAX_METADATA_SIZE: usize = 16 * 1024;
pub const DEFAULT_MAX_STACK_SAMPLES: usize = 1000;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration for the trace engine
#[derive(Debug, Clone, PartialEq)]
pub struct TracerConfig {
    /// Address of the X-Ray daemon, always reached on [`DAEMON_PORT`]
    pub daemon_address: IpAddr,
    /// Name of the root segment (the environment or service name)
    pub service_name: String,
    /// Deployed revision, reported as `service.version`
    pub service_version: String,
    /// Origin of the root segment, e.g. `AWS::EC2::Instance`
    pub origin: String,
    /// Datagram payload budget segments are flattened to
    pub max_segment_size: usize,
    /// Budget for a single scalar value (SQL text, metadata strings)
    pub max_value_size: usize,
    /// Budget for the whole encoded metadata object of a segment
    pub max_metadata_size: usize,
    /// Stack samples kept per request before the profile is subsampled
    pub max_stack_samples: usize,
    /// Name of the profile root; samples whose outermost frame carries this
    /// name merge into the root instead of nesting below it
    pub profile_entry_point: String,
    /// Whether SELECT statements are tagged with the trace id too
    pub annotate_select_queries: bool,
    /// Redaction rules on top of the built-in ones
    pub redact_keys: RedactRules,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            daemon_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            service_name: "local".to_string(),
            service_version: "dev".to_string(),
            origin: "AWS::EC2::Instance".to_string(),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            max_metadata_size: DEFAULT_MAX_METADATA_SIZE,
            max_stack_samples: DEFAULT_MAX_STACK_SAMPLES,
            profile_entry_point: ENTRY_POINT.to_string(),
            annotate_select_queries: false,
            redact_keys: RedactRules::new(),
            log_level: "info".to_string(),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|val| val.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

impl TracerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, TracerError> {
        let defaults = Self::default();

        let daemon_address = env::var("AWS_XRAY_DAEMON_IP_ADDRESS")
            .ok()
            .and_then(|addr| addr.trim().parse::<IpAddr>().ok())
            .unwrap_or(defaults.daemon_address);
        let service_name = env::var("XRAY_SERVICE_NAME").unwrap_or(defaults.service_name);
        let service_version =
            env::var("XRAY_SERVICE_VERSION").unwrap_or(defaults.service_version);
        let origin = env::var("XRAY_ORIGIN").unwrap_or(defaults.origin);
        let max_segment_size = env_usize("XRAY_MAX_SEGMENT_SIZE", defaults.max_segment_size);
        let max_value_size = env_usize("XRAY_MAX_VALUE_SIZE", defaults.max_value_size);
        let max_metadata_size = env_usize("XRAY_MAX_METADATA_SIZE", defaults.max_metadata_size);
        let max_stack_samples = env_usize("XRAY_MAX_STACK_SAMPLES", defaults.max_stack_samples);
        let profile_entry_point = env::var("XRAY_PROFILE_ENTRY_POINT")
            .ok()
            .map(|val| val.trim().to_string())
            .filter(|val| !val.is_empty())
            .unwrap_or(defaults.profile_entry_point);
        let annotate_select_queries = env::var("XRAY_ANNOTATE_SELECT_QUERIES")
            .map(|val| val.to_lowercase() == "true")
            .unwrap_or(defaults.annotate_select_queries);
        let redact_keys = env::var("XRAY_REDACT_KEYS")
            .map(|val| RedactRules::from_env_string(&val))
            .unwrap_or(defaults.redact_keys);
        let log_level = env::var("XRAY_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let config = Self {
            daemon_address,
            service_name,
            service_version,
            origin,
            max_segment_size,
            max_value_size,
            max_metadata_size,
            max_stack_samples,
            profile_entry_point,
            annotate_select_queries,
            redact_keys,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TracerError> {
        if self.max_segment_size == 0 || self.max_segment_size > MAX_UDP_PAYLOAD {
            return Err(TracerError::InvalidConfig(format!(
                "Segment size budget must be between 1 and {MAX_UDP_PAYLOAD} bytes, got {}",
                self.max_segment_size
            )));
        }

        if self.max_value_size == 0 {
            return Err(TracerError::InvalidConfig(
                "Value size budget must be greater than 0".to_string(),
            ));
        }

        if self.max_metadata_size < self.max_value_size {
            return Err(TracerError::InvalidConfig(format!(
                "Metadata size budget ({}) cannot be smaller than the value size budget ({})",
                self.max_metadata_size, self.max_value_size
            )));
        }

        if self.max_stack_samples == 0 {
            return Err(TracerError::InvalidConfig(
                "Stack sample cap must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(TracerError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    /// Where datagrams are sent.
    #[must_use]
    pub fn daemon_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.daemon_address, DAEMON_PORT)
    }

    #[must_use]
    pub fn metadata_limits(&self) -> MetadataLimits {
        MetadataLimits {
            max_value_size: self.max_value_size,
            max_total_size: self.max_metadata_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_VARS: [&str; 12] = [
        "AWS_XRAY_DAEMON_IP_ADDRESS",
        "XRAY_SERVICE_NAME",
        "XRAY_SERVICE_VERSION",
        "XRAY_ORIGIN",
        "XRAY_MAX_SEGMENT_SIZE",
        "XRAY_MAX_VALUE_SIZE",
        "XRAY_MAX_METADATA_SIZE",
        "XRAY_MAX_STACK_SAMPLES",
        "XRAY_PROFILE_ENTRY_POINT",
        "XRAY_ANNOTATE_SELECT_QUERIES",
        "XRAY_REDACT_KEYS",
        "XRAY_LOG_LEVEL",
    ];

    fn clear_env() {
        for key in ENV_VARS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = TracerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.daemon_endpoint(),
            "127.0.0.1:2000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_validate_segment_budget() {
        for max_segment_size in [0, MAX_UDP_PAYLOAD + 1] {
            let config = TracerConfig {
                max_segment_size,
                ..Default::default()
            };
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_validate_value_budget() {
        let config = TracerConfig {
            max_value_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TracerConfig {
            max_value_size: 2048,
            max_metadata_size: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_sample_cap() {
        let config = TracerConfig {
            max_stack_samples: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = TracerConfig {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = TracerConfig::from_env().unwrap();
        assert_eq!(config, TracerConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        env::set_var("AWS_XRAY_DAEMON_IP_ADDRESS", "10.0.0.5");
        env::set_var("XRAY_SERVICE_NAME", "production");
        env::set_var("XRAY_SERVICE_VERSION", "abc123");
        env::set_var("XRAY_MAX_SEGMENT_SIZE", "32768");
        env::set_var("XRAY_MAX_METADATA_SIZE", "not-a-number");
        env::set_var("XRAY_PROFILE_ENTRY_POINT", "{main}");
        env::set_var("XRAY_ANNOTATE_SELECT_QUERIES", "TRUE");
        env::set_var("XRAY_REDACT_KEYS", "cookies:session");
        env::set_var("XRAY_LOG_LEVEL", "DEBUG");

        let config = TracerConfig::from_env().unwrap();
        clear_env();

        assert_eq!(
            config.daemon_endpoint(),
            "10.0.0.5:2000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.service_name, "production");
        assert_eq!(config.service_version, "abc123");
        assert_eq!(config.max_segment_size, 32768);
        assert_eq!(config.max_metadata_size, DEFAULT_MAX_METADATA_SIZE);
        assert_eq!(config.profile_entry_point, "{main}");
        assert!(config.annotate_select_queries);
        assert_eq!(config.log_level, "debug");
        let mut expected = RedactRules::new();
        expected.add("cookies", "session");
        assert_eq!(config.redact_keys, expected);
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_invalid_budget() {
        clear_env();
        env::set_var("XRAY_MAX_SEGMENT_SIZE", "100000");
        let result = TracerConfig::from_env();
        clear_env();
        assert!(matches!(result, Err(TracerError::InvalidConfig(_))));
    }
}
