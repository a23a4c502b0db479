//! TTL cache for relay information documents.
//!
//! Entries expire lazily: [`InfoCache::get`] hides expired entries but never
//! removes them, and [`InfoCache::get_with_metadata`] still returns them.
//! Memory is only reclaimed by overwriting, [`InfoCache::delete`], or an
//! explicit [`InfoCache::clean_expired`] sweep.
//!
//! The cache holds documents for any relay URL, pooled or not, so standalone
//! lookups can share it with the pool.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pensieve_core::RelayInformationDocument;

/// TTL used when a non-positive one is requested.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// A cached document with its fetch and expiry times.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheEntry {
    pub document: RelayInformationDocument,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn new(document: RelayInformationDocument, ttl: Duration) -> Self {
        let fetched_at = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            document,
            fetched_at,
            expires_at: fetched_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Whether the entry is past its expiry time.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

/// Thread-safe URL-keyed document cache.
#[derive(Debug)]
pub struct InfoCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl Default for InfoCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl InfoCache {
    /// Create a cache with the given default TTL (zero means [`DEFAULT_TTL`]).
    pub fn new(ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// The TTL applied by [`InfoCache::set`].
    pub fn default_ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a document with the default TTL, replacing any existing entry.
    pub fn set(&self, url: &str, document: RelayInformationDocument) {
        self.set_with_ttl(url, document, self.ttl);
    }

    /// Store a document with a custom TTL.
    pub fn set_with_ttl(&self, url: &str, document: RelayInformationDocument, ttl: Duration) {
        let entry = CacheEntry::new(document, ttl);
        let size = {
            let mut entries = self.entries.write();
            entries.insert(url.to_string(), entry);
            entries.len()
        };
        metrics::gauge!("info_cache_entries").set(size as f64);
    }

    /// The cached document, if present and not expired.
    pub fn get(&self, url: &str) -> Option<RelayInformationDocument> {
        let entries = self.entries.read();
        let entry = entries.get(url)?;
        if entry.is_expired() {
            return None;
        }
        metrics::counter!("info_cache_hits_total").increment(1);
        Some(entry.document.clone())
    }

    /// The raw entry regardless of expiry.
    pub fn get_with_metadata(&self, url: &str) -> Option<CacheEntry> {
        self.entries.read().get(url).cloned()
    }

    /// Remove an entry. Absent keys are ignored.
    pub fn delete(&self, url: &str) {
        let mut entries = self.entries.write();
        if entries.remove(url).is_some() {
            metrics::gauge!("info_cache_entries").set(entries.len() as f64);
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
        metrics::gauge!("info_cache_entries").set(0.0);
    }

    /// Remove all expired entries, returning how many were removed.
    pub fn clean_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        let removed = before - entries.len();
        metrics::gauge!("info_cache_entries").set(entries.len() as f64);

        if removed > 0 {
            tracing::debug!("Removed {} expired relay info entries", removed);
        }
        removed
    }

    /// Number of entries, expired ones included.
    pub fn size(&self) -> usize {
        self.entries.read().len()
    }

    /// Cached URLs, expired ones included.
    pub fn urls(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}
