//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (buffer sizes, watermarks, limits)
//! - Check that bind addresses parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `splice.low_watermark`.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !config.socks5.enabled && !config.http.enabled {
        errors.push(ValidationError::new(
            "socks5.enabled",
            "at least one of socks5 or http must be enabled",
        ));
    }
    if config.socks5.enabled {
        check_addr(&mut errors, "socks5.bind_address", &config.socks5.bind_address);
    }
    if config.http.enabled {
        check_addr(&mut errors, "http.bind_address", &config.http.bind_address);
    }

    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new(
            "listener.max_connections",
            "must be greater than 0",
        ));
    }

    let splice = &config.splice;
    if splice.read_buffer_size == 0 {
        errors.push(ValidationError::new(
            "splice.read_buffer_size",
            "must be greater than 0",
        ));
    }
    if splice.low_watermark >= splice.high_watermark {
        errors.push(ValidationError::new(
            "splice.low_watermark",
            format!(
                "must be below high_watermark ({} >= {})",
                splice.low_watermark, splice.high_watermark
            ),
        ));
    }

    let observability = &config.observability;
    if !LOG_LEVELS.contains(&observability.log_level.to_ascii_lowercase().as_str()) {
        errors.push(ValidationError::new(
            "observability.log_level",
            format!("unknown level {:?}", observability.log_level),
        ));
    }
    if observability.metrics_enabled {
        check_addr(
            &mut errors,
            "observability.metrics_address",
            &observability.metrics_address,
        );
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_addr(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if let Err(e) = value.parse::<SocketAddr>() {
        errors.push(ValidationError::new(field, format!("{:?}: {}", value, e)));
    }
}
