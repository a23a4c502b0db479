//! Nostr event value type as exchanged with relays.
//!
//! The pool never verifies signatures; it moves events between relays and
//! callers. This type mirrors the NIP-01 JSON shape so it round-trips through
//! any relay transport without loss.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An immutable, identity-bearing Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event ID (64 hex chars).
    pub id: String,
    /// Author public key (64 hex chars).
    pub pubkey: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    /// Event kind.
    pub kind: u16,
    /// Tags as arrays of strings.
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    /// Event content.
    #[serde(default)]
    pub content: String,
    /// Schnorr signature (128 hex chars).
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Parse an event from its NIP-01 JSON representation.
    ///
    /// Only the shape of the identity fields is checked; signatures are not
    /// verified here.
    pub fn from_json(json: &str) -> Result<Self> {
        let event: Event = serde_json::from_str(json)?;
        event.validate_shape()?;
        Ok(event)
    }

    /// Serialize to NIP-01 JSON.
    pub fn as_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check that `id` and `pubkey` are 64-character hex strings.
    pub fn validate_shape(&self) -> Result<()> {
        check_hex("id", &self.id, 64)?;
        check_hex("pubkey", &self.pubkey, 64)?;
        Ok(())
    }

    /// Iterate over the values (second element) of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Whether any `e` tag references the given event ID.
    pub fn references_event(&self, event_id: &str) -> bool {
        self.tag_values("e").any(|v| v == event_id)
    }
}

fn check_hex(field: &'static str, value: &str, len: usize) -> Result<()> {
    if value.len() != len || !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::InvalidField {
            field,
            reason: format!("expected {len} hex characters"),
        });
    }
    Ok(())
}

/// Human-readable label for well-known event kinds.
///
/// Returns `None` for kinds without a common name.
pub fn kind_name(kind: u16) -> Option<&'static str> {
    let name = match kind {
        0 => "Profile",
        1 => "Note",
        3 => "Contacts",
        4 => "Encrypted DM",
        5 => "Deletion",
        6 => "Repost",
        7 => "Reaction",
        16 => "Generic Repost",
        1063 => "File Metadata",
        1984 => "Report",
        9734 => "Zap Request",
        9735 => "Zap Receipt",
        10002 => "Relay List",
        30023 => "Long-form Article",
        30024 => "Draft Article",
        34235 => "Video",
        34236 => "Short Video",
        _ => return None,
    };
    Some(name)
}

/// Display label for a kind: the well-known name, or `Kind <n>`.
pub fn kind_label(kind: u16) -> String {
    match kind_name(kind) {
        Some(name) => name.to_string(),
        None => format!("Kind {kind}"),
    }
}
