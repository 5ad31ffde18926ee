//! Shared error types for the Vigil cluster layer.
//!
//! Routing misses (no destination found, destination unreachable) are
//! deliberately not represented here: they are silent, non-fatal outcomes
//! reported through delivery counts and route outcomes, never through
//! errors.

use thiserror::Error;

/// Top-level error type for the Vigil cluster layer.
#[derive(Error, Debug)]
pub enum VigilError {
    /// Invalid or conflicting static configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A malformed message was received: rejected, logged, and the
    /// connection keeps running.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A connection-level fault. Isolated per connection; surfaced to the
    /// routing layer only through lifecycle events.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The requested endpoint is not registered.
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    /// A client connection was offered to a local endpoint.
    #[error("Endpoint '{0}' is local and cannot bind a client")]
    LocalClientBinding(String),

    /// An operation this baseline deliberately does not support.
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
}

/// Alias for Result with VigilError.
pub type VigilResult<T> = Result<T, VigilError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VigilError::EndpointNotFound("sat9".to_string());
        assert_eq!(err.to_string(), "Endpoint not found: sat9");

        let err = VigilError::LocalClientBinding("hub".to_string());
        assert_eq!(
            err.to_string(),
            "Endpoint 'hub' is local and cannot bind a client"
        );
    }

    #[test]
    fn test_protocol_error_carries_detail() {
        let err = VigilError::Protocol("request has no method".to_string());
        assert!(err.to_string().contains("no method"));
    }
}
