//! Error types for the relay.

use std::time::Duration;

/// Configuration-related errors. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Errors raised while opening an inbound subscription.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to subscribe to source {source_id}: {reason}")]
    SubscribeFailed { source_id: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Outcome of a single failed send attempt, as reported by the transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// Rate limit or transient network failure; worth retrying.
    #[error("Transient send failure: {reason}")]
    Transient {
        reason: String,
        /// Minimum wait the transport asked for before the next attempt.
        retry_after: Option<Duration>,
    },

    /// The destination rejected the message; retrying will not help.
    #[error("Fatal send failure: {reason}")]
    Fatal { reason: String },
}

impl SendError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal {
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Terminal outcome of a dispatcher retry sequence for one message.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery of {message_ref} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        message_ref: String,
        attempts: u32,
        last_error: SendError,
    },

    #[error("Delivery of {message_ref} rejected by destination: {reason}")]
    Rejected { message_ref: String, reason: String },

    #[error("Delivery of {message_ref} cancelled by shutdown after {attempts} attempts")]
    Cancelled { message_ref: String, attempts: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_error_classification() {
        assert!(SendError::transient("timeout").is_transient());
        assert!(SendError::rate_limited("429", Duration::from_secs(3)).is_transient());
        assert!(!SendError::fatal("chat not found").is_transient());
    }

    #[test]
    fn delivery_error_display_names_message() {
        let err = DeliveryError::Exhausted {
            message_ref: "-100123/42".into(),
            attempts: 3,
            last_error: SendError::transient("connection reset"),
        };
        let text = err.to_string();
        assert!(text.contains("-100123/42"));
        assert!(text.contains("3 attempts"));
        assert!(text.contains("connection reset"));
    }

    #[test]
    fn invalid_config_names_the_key() {
        let err = ConfigError::invalid("sources", "must not be empty");
        assert_eq!(
            err.to_string(),
            "Invalid configuration value for sources: must not be empty"
        );
    }
}
