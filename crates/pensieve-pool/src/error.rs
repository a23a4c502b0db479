//! Error types for the relay pool.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing relays and running queries.
///
/// Per-relay failures during a fan-out are never returned through this type;
/// they are recorded on the affected leg instead. Only conditions that stop a
/// call before any network work (or a single-relay operation failing) surface
/// here.
#[derive(Error, Debug)]
pub enum Error {
    /// No relay in the pool is currently connected.
    #[error("no connected relays")]
    NoConnectedRelays,

    /// An explicit relay selection matched no connected relay.
    #[error("no relays matched selection")]
    NoRelaysMatched,

    /// Relay URL failed validation.
    #[error("invalid relay URL '{url}': {reason}")]
    InvalidUrl {
        /// The URL as given.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The relay is not tracked by the pool.
    #[error("relay not in pool: {0}")]
    NotTracked(String),

    /// An operation exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Relay transport error (connect, subscribe, publish).
    #[error("transport error: {0}")]
    Transport(String),

    /// NIP-11 document fetch or parse failure.
    #[error("relay info fetch failed: {0}")]
    InfoFetch(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error from the core types.
    #[error(transparent)]
    Core(#[from] pensieve_core::Error),

    /// The pool has been shut down.
    #[error("pool is shut down")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_connected_relays_display() {
        assert_eq!(Error::NoConnectedRelays.to_string(), "no connected relays");
        assert_eq!(
            Error::NoRelaysMatched.to_string(),
            "no relays matched selection"
        );
    }

    #[test]
    fn test_invalid_url_display() {
        let err = Error::InvalidUrl {
            url: "http://relay".to_string(),
            reason: "bad scheme".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("http://relay"));
        assert!(msg.contains("bad scheme"));
    }

    #[test]
    fn test_from_core_error() {
        let core = pensieve_core::Error::InvalidTagName("xx".to_string());
        let err: Error = core.into();
        assert!(matches!(err, Error::Core(_)));
        assert!(err.to_string().contains("xx"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err =
            serde_json::from_slice::<pensieve_core::RelayInformationDocument>(b"<html>")
                .unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
