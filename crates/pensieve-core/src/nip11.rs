//! NIP-11 relay information documents.
//!
//! Relays publish a JSON descriptor at their HTTP(S) root when requested with
//! `Accept: application/nostr+json`. Every field is optional in practice, so
//! the types here default everything and ignore unknown keys.

use serde::{Deserialize, Serialize};

/// MIME type relays answer NIP-11 requests with.
pub const NIP11_ACCEPT: &str = "application/nostr+json";

/// A relay's self-published metadata document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayInformationDocument {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Operator public key.
    pub pubkey: Option<String>,
    /// Operator contact (email, URL, ...).
    pub contact: Option<String>,
    /// Supported NIP numbers.
    pub supported_nips: Vec<u32>,
    pub software: Option<String>,
    pub version: Option<String>,
    pub icon: Option<String>,
    pub payments_url: Option<String>,
    pub limitation: Option<Limitation>,
    pub fees: Option<Fees>,
}

impl RelayInformationDocument {
    /// Parse a document from JSON.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Whether the relay advertises support for the given NIP.
    pub fn supports_nip(&self, nip: u32) -> bool {
        self.supported_nips.contains(&nip)
    }

    /// Whether the relay requires payment to write.
    pub fn is_paid(&self) -> bool {
        self.limitation
            .as_ref()
            .and_then(|l| l.payment_required)
            .unwrap_or(false)
    }
}

/// Server limitations advertised by a relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limitation {
    pub max_message_length: Option<u64>,
    pub max_subscriptions: Option<u64>,
    pub max_filters: Option<u64>,
    pub max_limit: Option<u64>,
    pub max_subid_length: Option<u64>,
    pub max_event_tags: Option<u64>,
    pub max_content_length: Option<u64>,
    pub min_pow_difficulty: Option<u64>,
    pub auth_required: Option<bool>,
    pub payment_required: Option<bool>,
    pub restricted_writes: Option<bool>,
    pub created_at_lower_limit: Option<u64>,
    pub created_at_upper_limit: Option<u64>,
}

/// Fee schedule advertised by a relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fees {
    pub admission: Vec<Fee>,
    pub subscription: Vec<Fee>,
    pub publication: Vec<Fee>,
}

/// A single fee entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fee {
    pub amount: u64,
    pub unit: String,
    /// Billing period in seconds, for subscriptions.
    pub period: Option<u64>,
    /// Event kinds the fee applies to, for publication.
    pub kinds: Vec<u16>,
}
