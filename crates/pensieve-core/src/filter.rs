//! Relay query filters (NIP-01 `REQ` filters).

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::event::Event;

/// A query specification sent to relays to select events.
///
/// Empty collections mean "no constraint" for that field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Event IDs to match.
    pub ids: Vec<String>,
    /// Event kinds to match.
    pub kinds: Vec<u16>,
    /// Author public keys to match.
    pub authors: Vec<String>,
    /// Single-letter tag constraints (`#e`, `#p`, `#t`, ...).
    pub tags: BTreeMap<char, Vec<String>>,
    /// Lower bound on `created_at` (inclusive).
    pub since: Option<u64>,
    /// Upper bound on `created_at` (inclusive).
    pub until: Option<u64>,
    /// Maximum number of events per relay.
    pub limit: Option<usize>,
}

impl EventFilter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Match any of the given event IDs.
    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Match any of the given kinds.
    pub fn kinds<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.kinds.extend(kinds);
        self
    }

    /// Match any of the given authors.
    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors.extend(authors.into_iter().map(Into::into));
        self
    }

    /// Require a tag named `name` with one of `values`.
    pub fn tag<I, S>(mut self, name: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(name)
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Like [`EventFilter::tag`], but takes the tag name as a string.
    ///
    /// Accepts `"t"` as well as `"#t"`. Fails if the name is not a single
    /// ASCII letter.
    pub fn try_tag<I, S>(self, name: &str, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let trimmed = name.strip_prefix('#').unwrap_or(name);
        let mut chars = trimmed.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => Ok(self.tag(c, values)),
            _ => Err(Error::InvalidTagName(name.to_string())),
        }
    }

    /// Only events created at or after `since`.
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Only events created at or before `until`.
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    /// Maximum number of stored events each relay should return.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether an event satisfies every constraint of this filter.
    ///
    /// `limit` is not considered.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.ids.is_empty() && !self.ids.iter().any(|id| *id == event.id) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.iter().any(|a| *a == event.pubkey) {
            return false;
        }
        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }
        if let Some(until) = self.until
            && event.created_at > until
        {
            return false;
        }
        self.tags.iter().all(|(name, values)| {
            let name = name.to_string();
            event
                .tag_values(&name)
                .any(|v| values.iter().any(|want| want == v))
        })
    }

    /// Render the filter as a NIP-01 JSON object.
    pub fn to_json_value(&self) -> Value {
        let mut map = Map::new();
        if !self.ids.is_empty() {
            map.insert("ids".into(), Value::from(self.ids.clone()));
        }
        if !self.kinds.is_empty() {
            map.insert("kinds".into(), Value::from(self.kinds.clone()));
        }
        if !self.authors.is_empty() {
            map.insert("authors".into(), Value::from(self.authors.clone()));
        }
        for (name, values) in &self.tags {
            map.insert(format!("#{name}"), Value::from(values.clone()));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), Value::from(since));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), Value::from(until));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), Value::from(limit));
        }
        Value::Object(map)
    }

    /// Render the filter as a NIP-01 JSON string.
    pub fn as_json(&self) -> String {
        self.to_json_value().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: u16, pubkey: &str, created_at: u64, tags: Vec<Vec<&str>>) -> Event {
        Event {
            id: "1".repeat(64),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags: tags
                .into_iter()
                .map(|t| t.into_iter().map(String::from).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let e = event(1, "alice", 10, vec![]);
        assert!(EventFilter::new().matches(&e));
    }

    #[test]
    fn test_kind_and_author() {
        let filter = EventFilter::new().kinds([1, 6]).authors(["alice"]);
        assert!(filter.matches(&event(1, "alice", 10, vec![])));
        assert!(!filter.matches(&event(7, "alice", 10, vec![])));
        assert!(!filter.matches(&event(1, "bob", 10, vec![])));
    }

    #[test]
    fn test_time_window() {
        let filter = EventFilter::new().since(100).until(200);
        assert!(filter.matches(&event(1, "a", 100, vec![])));
        assert!(filter.matches(&event(1, "a", 200, vec![])));
        assert!(!filter.matches(&event(1, "a", 99, vec![])));
        assert!(!filter.matches(&event(1, "a", 201, vec![])));
    }

    #[test]
    fn test_tag_constraint() {
        let filter = EventFilter::new().tag('t', ["rust"]);
        assert!(filter.matches(&event(1, "a", 1, vec![vec!["t", "rust"]])));
        assert!(!filter.matches(&event(1, "a", 1, vec![vec!["t", "go"]])));
        assert!(!filter.matches(&event(1, "a", 1, vec![])));
    }

    #[test]
    fn test_try_tag() {
        assert!(EventFilter::new().try_tag("#e", ["x"]).is_ok());
        assert!(EventFilter::new().try_tag("p", ["x"]).is_ok());
        assert!(EventFilter::new().try_tag("emoji", ["x"]).is_err());
        assert!(EventFilter::new().try_tag("", ["x"]).is_err());
    }

    #[test]
    fn test_to_json_value() {
        let filter = EventFilter::new()
            .kinds([1])
            .tag('e', ["abc"])
            .since(5)
            .limit(10);
        let json = filter.to_json_value();
        assert_eq!(json["kinds"], serde_json::json!([1]));
        assert_eq!(json["#e"], serde_json::json!(["abc"]));
        assert_eq!(json["since"], 5);
        assert_eq!(json["limit"], 10);
        assert!(json.get("authors").is_none());
        assert!(json.get("until").is_none());
    }
}
