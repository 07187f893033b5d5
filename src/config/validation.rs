//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts within (0, one day], limits > 0, addresses parse)
//! - Check that configured TLS files exist
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;
use std::path::Path;

use crate::config::schema::ServerConfig;

/// Longest idle or handler timeout accepted, in seconds (one day).
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: invalid socket address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be at most {max}")]
    TooLarge { field: &'static str, max: u64 },

    #[error("{field}: file not found {path:?}")]
    MissingFile { field: &'static str, path: String },
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero { field: "listener.max_connections" });
    }
    if let Some(tls) = &config.listener.tls {
        for (field, path) in [("listener.tls.cert_path", &tls.cert_path), ("listener.tls.key_path", &tls.key_path)] {
            if !Path::new(path).exists() {
                errors.push(ValidationError::MissingFile { field, path: path.clone() });
            }
        }
    }

    let session = &config.session;
    let limits = [
        ("session.idle_timeout_secs", session.idle_timeout_secs == 0),
        ("session.request_body_limit", session.request_body_limit == 0),
        ("session.request_queue_limit", session.request_queue_limit == 0),
        ("session.max_header_bytes", session.max_header_bytes == 0),
        ("session.handler_timeout_secs", session.handler_timeout_secs == Some(0)),
        ("session.ws_max_message_size", session.ws_max_message_size == Some(0)),
    ];
    for (field, is_zero) in limits {
        if is_zero {
            errors.push(ValidationError::Zero { field });
        }
    }
    let timeouts = [
        ("session.idle_timeout_secs", Some(session.idle_timeout_secs)),
        ("session.handler_timeout_secs", session.handler_timeout_secs),
    ];
    for (field, secs) in timeouts {
        if secs.is_some_and(|secs| secs > MAX_TIMEOUT_SECS) {
            errors.push(ValidationError::TooLarge { field, max: MAX_TIMEOUT_SECS });
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
