//! Relay URL validation.
//!
//! The pool keys every table by the relay URL exactly as accepted, so
//! validation only trims surrounding whitespace and rejects URLs that cannot
//! be a relay. It does not rewrite case or trailing slashes:
//! two spellings of the same relay are two pool entries.
//!
//! # Rules
//!
//! - Scheme must be `wss://` or `ws://`
//! - The remainder must parse as a relay URL (host required)

use nostr_sdk::RelayUrl;

use crate::{Error, Result};

/// Validate a relay URL, returning the trimmed form used as its identity.
pub fn validate_relay_url(url: &str) -> Result<String> {
    let url = url.trim();

    if !url.starts_with("wss://") && !url.starts_with("ws://") {
        return Err(invalid(url, "URL must start with wss:// or ws://"));
    }

    if let Err(e) = RelayUrl::parse(url) {
        return Err(invalid(url, &format!("Invalid relay URL: {}", e)));
    }

    Ok(url.to_string())
}

/// Derive the HTTP(S) URL a relay serves its NIP-11 document from.
///
/// `wss://` maps to `https://` and `ws://` to `http://`; any other scheme is
/// rejected.
pub fn info_document_url(url: &str) -> Result<String> {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("wss://") {
        Ok(format!("https://{rest}"))
    } else if let Some(rest) = url.strip_prefix("ws://") {
        Ok(format!("http://{rest}"))
    } else {
        Err(invalid(url, "URL must start with wss:// or ws://"))
    }
}

fn invalid(url: &str, reason: &str) -> Error {
    Error::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_urls() {
        assert_eq!(
            validate_relay_url("wss://relay.damus.io").unwrap(),
            "wss://relay.damus.io"
        );
        assert_eq!(
            validate_relay_url("  ws://relay.example.com:8080  ").unwrap(),
            "ws://relay.example.com:8080"
        );
    }

    #[test]
    fn test_url_kept_verbatim() {
        // Trailing slash and case are part of the identity.
        assert_eq!(
            validate_relay_url("wss://Relay.Example.com/").unwrap(),
            "wss://Relay.Example.com/"
        );
    }

    #[test]
    fn test_invalid_scheme() {
        let err = validate_relay_url("https://relay.example.com").unwrap_err();
        assert!(matches!(err, Error::InvalidUrl { .. }));
        assert!(validate_relay_url("relay.example.com").is_err());
        assert!(validate_relay_url("").is_err());
    }

    #[test]
    fn test_info_document_url() {
        assert_eq!(
            info_document_url("wss://relay.damus.io").unwrap(),
            "https://relay.damus.io"
        );
        assert_eq!(
            info_document_url("ws://localhost:7777/path").unwrap(),
            "http://localhost:7777/path"
        );
        assert!(info_document_url("https://relay.damus.io").is_err());
    }
}
