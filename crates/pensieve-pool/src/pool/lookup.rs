//! Event lookups built on the fan-out engine.
//!
//! - [`RelayPool::query_events_by_ids`]: merged set of the requested events
//! - [`RelayPool::query_event_broadcast`]: which relays hold one event
//! - [`RelayPool::query_events_batch`]: per-ID relay coverage
//! - [`RelayPool::query_replies`]: events referencing an event

use std::collections::HashSet;

use pensieve_core::{Event, EventFilter};
use serde::Serialize;
use tokio::time::Instant;

use super::RelayPool;
use super::query::{RelayEvent, merge_legs};
use crate::Result;

/// One relay's answer to a single-event lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayLookup {
    pub url: String,
    /// The relay returned the event.
    pub found: bool,
    /// Time to the event when found, otherwise time to the end of the leg.
    pub latency_ms: u64,
    /// Why the leg failed, if it did.
    pub error: Option<String>,
    /// The leg was still running at the query deadline.
    pub timed_out: bool,
}

/// Propagation of one event across the queried relays.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastLookup {
    pub event_id: String,
    /// The event as returned by the first relay that had it.
    pub event: Option<Event>,
    /// Number of relays that returned the event.
    pub found_count: usize,
    /// One entry per queried relay, sorted by URL.
    pub relays: Vec<RelayLookup>,
    /// Wall time of the whole lookup.
    pub duration_ms: u64,
}

/// Relay coverage of one requested event ID.
///
/// Every queried relay lands in exactly one of `found_on`, `missing_from`
/// or `incomplete`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchLookupEntry {
    pub id: String,
    /// The event, if any relay returned it.
    pub event: Option<Event>,
    /// Relays that returned the event.
    pub found_on: Vec<String>,
    /// Relays that answered in full (EOSE) without the event.
    pub missing_from: Vec<String>,
    /// Relays that failed or hit the deadline without returning the event.
    pub incomplete: Vec<String>,
}

/// What one leg of a batch lookup established.
struct LegCoverage {
    url: String,
    held: HashSet<String>,
    answered: bool,
}

impl RelayPool {
    /// Fetch the given events, deduplicated across relays.
    pub async fn query_events_by_ids(
        &self,
        ids: &[String],
        relays: Option<&[String]>,
    ) -> Result<Vec<Event>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = EventFilter::new().ids(ids.iter().cloned());
        let legs = self.fan_out(filter, relays).await?;
        Ok(merge_legs(legs, None).into_iter().map(|e| e.event).collect())
    }

    /// Ask every selected relay for one event and report who has it.
    pub async fn query_event_broadcast(
        &self,
        event_id: &str,
        relays: Option<&[String]>,
    ) -> Result<BroadcastLookup> {
        let started = Instant::now();
        let filter = EventFilter::new().ids([event_id]).limit(1);
        let legs = self.fan_out(filter, relays).await?;

        let mut event = None;
        let mut lookups = Vec::with_capacity(legs.len());
        for leg in legs {
            let found = leg.events.iter().find(|e| e.id == event_id);
            if event.is_none() {
                event = found.cloned();
            }
            lookups.push(RelayLookup {
                found: found.is_some(),
                latency_ms: match (found, leg.first_event) {
                    (Some(_), Some(first)) => first.as_millis() as u64,
                    _ => leg.latency.as_millis() as u64,
                },
                error: leg.error,
                timed_out: leg.timed_out,
                url: leg.url,
            });
        }
        lookups.sort_by(|a, b| a.url.cmp(&b.url));

        Ok(BroadcastLookup {
            event_id: event_id.to_string(),
            event,
            found_count: lookups.iter().filter(|l| l.found).count(),
            relays: lookups,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// For each requested ID, which queried relays had it and which did not.
    ///
    /// A relay only counts as missing an event once it answered in full.
    /// Failed or timed-out relays without the event are reported as
    /// incomplete. Entries follow the order of `ids`.
    pub async fn query_events_batch(
        &self,
        ids: &[String],
        relays: Option<&[String]>,
    ) -> Result<Vec<BatchLookupEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = EventFilter::new().ids(ids.iter().cloned());
        let mut legs = self.fan_out(filter, relays).await?;
        legs.sort_by(|a, b| a.url.cmp(&b.url));

        let coverage: Vec<LegCoverage> = legs
            .iter()
            .map(|leg| LegCoverage {
                url: leg.url.clone(),
                held: leg.events.iter().map(|e| e.id.clone()).collect(),
                answered: leg.error.is_none() && !leg.timed_out,
            })
            .collect();
        let events: Vec<Event> = merge_legs(legs, None)
            .into_iter()
            .map(|e| e.event)
            .collect();

        Ok(ids
            .iter()
            .map(|id| {
                let mut entry = BatchLookupEntry {
                    id: id.clone(),
                    event: events.iter().find(|e| e.id == *id).cloned(),
                    found_on: Vec::new(),
                    missing_from: Vec::new(),
                    incomplete: Vec::new(),
                };
                for leg in &coverage {
                    let bucket = if leg.held.contains(id) {
                        &mut entry.found_on
                    } else if leg.answered {
                        &mut entry.missing_from
                    } else {
                        &mut entry.incomplete
                    };
                    bucket.push(leg.url.clone());
                }
                entry
            })
            .collect())
    }

    /// Events whose `e` tags reference `event_id`, oldest first.
    pub async fn query_replies(
        &self,
        event_id: &str,
        limit: Option<usize>,
        relays: Option<&[String]>,
    ) -> Result<Vec<RelayEvent>> {
        let mut filter = EventFilter::new().tag('e', [event_id]);
        if let Some(limit) = limit {
            filter = filter.limit(limit);
        }
        let legs = self.fan_out(filter, relays).await?;

        let mut replies: Vec<RelayEvent> = merge_legs(legs, None)
            .into_iter()
            .filter(|r| r.event.references_event(event_id))
            .collect();
        replies.sort_by(|a, b| {
            a.event
                .created_at
                .cmp(&b.event.created_at)
                .then_with(|| a.event.id.cmp(&b.event.id))
        });
        if let Some(limit) = limit {
            replies.truncate(limit);
        }
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::pool::tests::{add_and_settle, pool_with};
    use crate::transport::mock::{MockNetwork, MockRelay, test_event};
    use std::time::Duration;

    fn reply(n: u64, created_at: u64, parent: &str) -> Event {
        let mut event = test_event(n, 1, created_at);
        event.tags = vec![vec!["e".to_string(), parent.to_string()]];
        event
    }

    #[tokio::test(start_paused = true)]
    async fn test_by_ids_dedups() {
        let a = test_event(1, 1, 10);
        let b = test_event(2, 1, 20);
        let network = MockNetwork::new();
        network
            .relay("wss://r1.example", MockRelay::with_events(vec![a.clone(), b.clone()]))
            .relay("wss://r2.example", MockRelay::with_events(vec![a.clone()]));
        let pool = pool_with(&network);
        add_and_settle(&pool, &["wss://r1.example", "wss://r2.example"]).await;

        let events = pool
            .query_events_by_ids(&[a.id.clone(), b.id.clone()], None)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);

        assert!(pool.query_events_by_ids(&[], None).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_lookup() {
        let target = test_event(1, 1, 10);
        let network = MockNetwork::new();
        network
            .relay("wss://has.example", MockRelay::with_events(vec![target.clone()]))
            .relay("wss://lacks.example", MockRelay::with_events(vec![test_event(2, 1, 10)]));
        let pool = pool_with(&network);
        add_and_settle(&pool, &["wss://has.example", "wss://lacks.example"]).await;

        let lookup = pool.query_event_broadcast(&target.id, None).await.unwrap();

        assert_eq!(lookup.event, Some(target));
        assert_eq!(lookup.found_count, 1);
        assert_eq!(lookup.relays.len(), 2);
        assert!(lookup.relays[0].found);
        assert_eq!(lookup.relays[0].url, "wss://has.example");
        assert!(!lookup.relays[1].found);
        assert!(lookup.relays[1].error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_lookup_no_relays() {
        let pool = pool_with(&MockNetwork::new());
        assert!(matches!(
            pool.query_event_broadcast("abc", None).await,
            Err(Error::NoConnectedRelays)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_lookup_coverage() {
        let a = test_event(1, 1, 10);
        let b = test_event(2, 1, 20);
        let network = MockNetwork::new();
        network
            .relay("wss://r1.example", MockRelay::with_events(vec![a.clone(), b.clone()]))
            .relay("wss://r2.example", MockRelay::with_events(vec![a.clone()]));
        let pool = pool_with(&network);
        add_and_settle(&pool, &["wss://r1.example", "wss://r2.example"]).await;

        let missing = test_event(3, 1, 30).id;
        let entries = pool
            .query_events_batch(&[b.id.clone(), a.id.clone(), missing.clone()], None)
            .await
            .unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].id, b.id);
        assert_eq!(entries[0].found_on, vec!["wss://r1.example".to_string()]);
        assert_eq!(entries[0].missing_from, vec!["wss://r2.example".to_string()]);
        assert_eq!(entries[1].found_on.len(), 2);
        assert_eq!(entries[1].event, Some(a));
        assert!(entries[2].event.is_none());
        assert!(entries[2].found_on.is_empty());
        assert_eq!(entries[2].missing_from.len(), 2);
        assert!(entries.iter().all(|e| e.incomplete.is_empty()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_lookup_slow_relay_is_incomplete() {
        let a = test_event(1, 1, 10);
        let network = MockNetwork::new();
        network
            .relay("wss://r1.example", MockRelay::with_events(vec![a.clone()]))
            .relay(
                "wss://slow.example",
                MockRelay::with_events(vec![a.clone()]).response_delay(Duration::from_secs(60)),
            )
            .relay("wss://empty.example", MockRelay::default());
        let pool = pool_with(&network);
        add_and_settle(
            &pool,
            &["wss://r1.example", "wss://slow.example", "wss://empty.example"],
        )
        .await;

        let entries = pool.query_events_batch(&[a.id.clone()], None).await.unwrap();

        assert_eq!(entries[0].found_on, vec!["wss://r1.example".to_string()]);
        assert_eq!(entries[0].missing_from, vec!["wss://empty.example".to_string()]);
        assert_eq!(entries[0].incomplete, vec!["wss://slow.example".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_lookup_failed_relay_is_incomplete() {
        let a = test_event(1, 1, 10);
        let network = MockNetwork::new();
        network
            .relay("wss://r1.example", MockRelay::with_events(vec![a.clone()]))
            .relay("wss://r2.example", MockRelay::with_events(vec![a.clone()]));
        let pool = pool_with(&network);
        add_and_settle(&pool, &["wss://r1.example", "wss://r2.example"]).await;

        let (_, handle) = pool
            .connected_handles(Some(&["wss://r2.example".to_string()]))
            .unwrap()
            .remove(0);
        handle.close().await;

        let entries = pool.query_events_batch(&[a.id.clone()], None).await.unwrap();
        assert!(entries[0].missing_from.is_empty());
        assert_eq!(entries[0].incomplete, vec!["wss://r2.example".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_oldest_first() {
        let parent = test_event(1, 1, 10);
        let network = MockNetwork::new();
        network
            .relay(
                "wss://r1.example",
                MockRelay::with_events(vec![
                    parent.clone(),
                    reply(3, 30, &parent.id),
                    reply(2, 20, &parent.id),
                ]),
            )
            .relay(
                "wss://r2.example",
                MockRelay::with_events(vec![reply(2, 20, &parent.id), reply(4, 40, &parent.id)]),
            );
        let pool = pool_with(&network);
        add_and_settle(&pool, &["wss://r1.example", "wss://r2.example"]).await;

        let replies = pool.query_replies(&parent.id, None, None).await.unwrap();
        let times: Vec<u64> = replies.iter().map(|r| r.event.created_at).collect();
        assert_eq!(times, vec![20, 30, 40]);

        let limited = pool.query_replies(&parent.id, Some(1), None).await.unwrap();
        assert_eq!(limited.len(), 1);
    }
}
