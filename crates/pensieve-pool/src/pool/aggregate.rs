//! Statistics over a batch of queried events.
//!
//! [`aggregate`] does no I/O; [`RelayPool::aggregate_events`] runs an
//! advanced query first and aggregates its result.

use std::collections::{BTreeMap, HashMap};

use pensieve_core::kind_label;
use serde::Serialize;

use super::RelayPool;
use super::query::{AdvancedQuery, RelayEvent};
use crate::Result;

/// Entries kept in each top-N list.
const TOP_N: usize = 10;

/// Most buckets a time histogram may have.
const MAX_BUCKETS: u64 = 50;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Events of one kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindCount {
    pub kind: u16,
    pub label: String,
    pub count: usize,
}

/// Occurrences of one key (author, tag value, relay URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyCount {
    pub key: String,
    pub count: usize,
}

/// Content length statistics, in characters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContentStats {
    pub min_length: usize,
    pub max_length: usize,
    pub avg_length: f64,
    pub empty_count: usize,
}

/// One histogram bucket covering `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeBucket {
    pub start: u64,
    pub end: u64,
    pub count: usize,
}

/// Aggregate statistics for an event batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationResult {
    pub total_events: usize,
    /// Sorted by count, descending.
    pub kind_counts: Vec<KindCount>,
    pub top_authors: Vec<KeyCount>,
    /// Top values per tracked tag name.
    pub top_tags: BTreeMap<String, Vec<KeyCount>>,
    pub relay_counts: Vec<KeyCount>,
    pub content: ContentStats,
    pub bucket_seconds: u64,
    pub time_histogram: Vec<TimeBucket>,
    pub earliest: Option<u64>,
    pub latest: Option<u64>,
}

impl RelayPool {
    /// Run `query` and aggregate the merged result.
    pub async fn aggregate_events(
        &self,
        query: &AdvancedQuery,
        tracked_tags: &[String],
    ) -> Result<AggregationResult> {
        let events = self.query_events_advanced(query).await?;
        Ok(aggregate(&events, tracked_tags))
    }
}

/// Compute statistics over `events`, counting values of `tracked_tags`.
pub fn aggregate(events: &[RelayEvent], tracked_tags: &[String]) -> AggregationResult {
    if events.is_empty() {
        return AggregationResult::default();
    }

    let mut kinds: HashMap<u16, usize> = HashMap::new();
    let mut authors: HashMap<&str, usize> = HashMap::new();
    let mut relays: HashMap<&str, usize> = HashMap::new();
    let mut tags: BTreeMap<&str, HashMap<&str, usize>> = tracked_tags
        .iter()
        .map(|name| (name.trim_start_matches('#'), HashMap::new()))
        .collect();

    let mut min_length = usize::MAX;
    let mut max_length = 0;
    let mut total_length = 0;
    let mut empty_count = 0;

    for RelayEvent { relay_url, event } in events {
        *kinds.entry(event.kind).or_default() += 1;
        *authors.entry(event.pubkey.as_str()).or_default() += 1;
        *relays.entry(relay_url.as_str()).or_default() += 1;

        for (name, counts) in tags.iter_mut() {
            for value in event.tag_values(*name) {
                *counts.entry(value).or_default() += 1;
            }
        }

        let length = event.content.chars().count();
        min_length = min_length.min(length);
        max_length = max_length.max(length);
        total_length += length;
        if length == 0 {
            empty_count += 1;
        }
    }

    let mut kind_counts: Vec<KindCount> = kinds
        .into_iter()
        .map(|(kind, count)| KindCount {
            kind,
            label: kind_label(kind),
            count,
        })
        .collect();
    kind_counts.sort_by(|a, b| b.count.cmp(&a.count).then(a.kind.cmp(&b.kind)));

    let earliest = events.iter().map(|e| e.event.created_at).min();
    let latest = events.iter().map(|e| e.event.created_at).max();
    let (bucket_seconds, time_histogram) = match (earliest, latest) {
        (Some(earliest), Some(latest)) => time_histogram(events, earliest, latest),
        _ => (0, Vec::new()),
    };

    AggregationResult {
        total_events: events.len(),
        kind_counts,
        top_authors: top_n(authors),
        top_tags: tags
            .into_iter()
            .map(|(name, counts)| (name.to_string(), top_n(counts)))
            .collect(),
        relay_counts: sorted_counts(relays),
        content: ContentStats {
            min_length,
            max_length,
            avg_length: total_length as f64 / events.len() as f64,
            empty_count,
        },
        bucket_seconds,
        time_histogram,
        earliest,
        latest,
    }
}

/// Bucket width for a time range: a day past 7 days, an hour past a day,
/// otherwise 10 minutes, widened so there are never more than 50 buckets.
pub(super) fn bucket_width(range: u64) -> u64 {
    let width = if range > 7 * DAY {
        DAY
    } else if range > DAY {
        HOUR
    } else {
        10 * MINUTE
    };

    if range / width + 1 > MAX_BUCKETS {
        range.div_ceil(MAX_BUCKETS)
    } else {
        width
    }
}

fn time_histogram(events: &[RelayEvent], earliest: u64, latest: u64) -> (u64, Vec<TimeBucket>) {
    let range = latest - earliest;
    let width = bucket_width(range);
    let bucket_count = (range / width + 1).min(MAX_BUCKETS) as usize;

    let mut buckets: Vec<TimeBucket> = (0..bucket_count as u64)
        .map(|i| TimeBucket {
            start: earliest + i * width,
            end: earliest + (i + 1) * width,
            count: 0,
        })
        .collect();

    for e in events {
        let index = ((e.event.created_at - earliest) / width) as usize;
        // Rounding can push the newest event one past the last bucket.
        buckets[index.min(bucket_count - 1)].count += 1;
    }

    (width, buckets)
}

fn sorted_counts(counts: HashMap<&str, usize>) -> Vec<KeyCount> {
    let mut sorted: Vec<KeyCount> = counts
        .into_iter()
        .map(|(key, count)| KeyCount {
            key: key.to_string(),
            count,
        })
        .collect();
    sorted.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    sorted
}

fn top_n(counts: HashMap<&str, usize>) -> Vec<KeyCount> {
    let mut sorted = sorted_counts(counts);
    sorted.truncate(TOP_N);
    sorted
}
