//! Fan-out query engine.
//!
//! Every query opens one subscription per target relay, all running
//! concurrently in a [`JoinSet`] under a single shared deadline. A leg ends
//! at EOSE, when its relay closes the subscription, at the deadline, or on
//! pool shutdown. Legs that miss the deadline keep whatever they received.
//!
//! Results are merged in leg completion order and deduplicated by event ID,
//! so the relay credited with an event is whichever leg finished first.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use pensieve_core::{Event, EventFilter};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::RelayPool;
use crate::Result;
use crate::relay::HealthMonitor;
use crate::transport::{RelayHandle, SubscriptionMessage};

/// A query with tag constraints and an optional relay selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedQuery {
    /// Event kinds to match. Empty matches any kind.
    pub kinds: Vec<u16>,
    /// Author pubkeys, hex. Empty matches any author.
    pub authors: Vec<String>,
    /// Tag constraints keyed by single-letter name (`"t"` or `"#t"`).
    pub tags: BTreeMap<String, Vec<String>>,
    /// Only events created at or after this unix timestamp.
    pub since: Option<u64>,
    /// Only events created at or before this unix timestamp.
    pub until: Option<u64>,
    /// Cap on merged events, also sent to each relay.
    pub limit: Option<usize>,
    /// Restrict the query to these relays (intersected with connected ones).
    pub relays: Option<Vec<String>>,
}

impl AdvancedQuery {
    /// Build the relay filter. Fails on a tag name that is not one letter.
    pub fn to_filter(&self) -> Result<EventFilter> {
        let mut filter = EventFilter::new()
            .kinds(self.kinds.iter().copied())
            .authors(self.authors.iter().cloned());
        for (name, values) in &self.tags {
            filter = filter.try_tag(name, values.iter().cloned())?;
        }
        if let Some(since) = self.since {
            filter = filter.since(since);
        }
        if let Some(until) = self.until {
            filter = filter.until(until);
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        Ok(filter)
    }
}

/// An event together with the relay it was first seen on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayEvent {
    /// Relay whose leg delivered the event first.
    pub relay_url: String,
    pub event: Event,
}

/// How one relay performed during a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayTiming {
    pub url: String,
    /// The relay acknowledged the subscription before the deadline.
    pub reachable: bool,
    /// Why the leg ended early, if it failed.
    pub error: Option<String>,
    /// The leg was still running at the deadline.
    pub timed_out: bool,
    /// Time from issuing the subscription to the end of the leg.
    pub latency_ms: u64,
    /// Time from issuing the subscription to the first event.
    pub first_event_ms: Option<u64>,
    /// Events received, before cross-relay deduplication.
    pub event_count: usize,
}

/// Merged events plus per-relay timing.
#[derive(Debug, Clone, Serialize)]
pub struct TimedQueryResult {
    /// Merged events, newest first.
    pub events: Vec<RelayEvent>,
    /// One entry per queried relay, sorted by URL.
    pub relays: Vec<RelayTiming>,
    /// Wall time of the whole fan-out.
    pub duration_ms: u64,
}

/// Everything one leg of a fan-out produced.
#[derive(Debug)]
pub(super) struct LegOutcome {
    pub url: String,
    pub events: Vec<Event>,
    pub error: Option<String>,
    /// `subscribe` returned a live subscription.
    pub subscribed: bool,
    pub timed_out: bool,
    pub latency: Duration,
    pub first_event: Option<Duration>,
}

impl LegOutcome {
    fn new(url: String) -> Self {
        Self {
            url,
            events: Vec::new(),
            error: None,
            subscribed: false,
            timed_out: false,
            latency: Duration::ZERO,
            first_event: None,
        }
    }

    fn outcome_label(&self) -> &'static str {
        if self.timed_out {
            "timeout"
        } else if self.error.is_some() {
            "error"
        } else {
            "complete"
        }
    }

    pub(super) fn timing(&self) -> RelayTiming {
        RelayTiming {
            url: self.url.clone(),
            reachable: self.subscribed,
            error: self.error.clone(),
            timed_out: self.timed_out,
            latency_ms: self.latency.as_millis() as u64,
            first_event_ms: self.first_event.map(|d| d.as_millis() as u64),
            event_count: self.events.len(),
        }
    }
}

impl RelayPool {
    /// Query every connected relay.
    pub async fn query_events(&self, filter: EventFilter) -> Result<Vec<Event>> {
        let limit = filter.limit;
        let legs = self.fan_out(filter, None).await?;
        Ok(into_events(merge_legs(legs, limit)))
    }

    /// Query the given relays (every connected relay if `relays` is empty).
    pub async fn query_events_from(
        &self,
        filter: EventFilter,
        relays: &[String],
    ) -> Result<Vec<Event>> {
        let limit = filter.limit;
        let legs = self.fan_out(filter, Some(relays)).await?;
        Ok(into_events(merge_legs(legs, limit)))
    }

    /// Query and report how each relay performed.
    pub async fn query_events_timed(
        &self,
        filter: EventFilter,
        relays: Option<&[String]>,
    ) -> Result<TimedQueryResult> {
        let started = Instant::now();
        let limit = filter.limit;
        let legs = self.fan_out(filter, relays).await?;
        Ok(timed_result(legs, limit, started))
    }

    /// Run an [`AdvancedQuery`], keeping each event's source relay.
    pub async fn query_events_advanced(&self, query: &AdvancedQuery) -> Result<Vec<RelayEvent>> {
        let filter = query.to_filter()?;
        let legs = self.fan_out(filter, query.relays.as_deref()).await?;
        Ok(merge_legs(legs, query.limit))
    }

    /// [`RelayPool::query_events_advanced`] with per-relay timing.
    pub async fn query_events_advanced_timed(
        &self,
        query: &AdvancedQuery,
    ) -> Result<TimedQueryResult> {
        let started = Instant::now();
        let filter = query.to_filter()?;
        let legs = self.fan_out(filter, query.relays.as_deref()).await?;
        Ok(timed_result(legs, query.limit, started))
    }

    /// Run one leg per selected relay and collect them in completion order.
    ///
    /// Fails before any network work if no relay is selected.
    pub(super) async fn fan_out(
        &self,
        filter: EventFilter,
        selection: Option<&[String]>,
    ) -> Result<Vec<LegOutcome>> {
        let targets = self.connected_handles(selection)?;
        let started = Instant::now();
        let deadline = started + self.inner.config.query_timeout;
        counter!("query_total").increment(1);

        tracing::debug!(
            "Fan-out query to {} relays: {}",
            targets.len(),
            filter.as_json()
        );

        let mut legs = JoinSet::new();
        for (url, handle) in targets {
            legs.spawn(run_leg(
                url,
                handle,
                filter.clone(),
                deadline,
                Arc::clone(&self.inner.monitor),
                self.inner.cancel.clone(),
            ));
        }

        let mut outcomes = Vec::with_capacity(legs.len());
        while let Some(joined) = legs.join_next().await {
            match joined {
                Ok(outcome) => {
                    counter!("query_legs_total", "outcome" => outcome.outcome_label())
                        .increment(1);
                    outcomes.push(outcome);
                }
                Err(e) => tracing::warn!("Query leg task failed: {}", e),
            }
        }

        histogram!("query_duration_seconds").record(started.elapsed().as_secs_f64());
        Ok(outcomes)
    }
}

/// Subscribe on one relay and collect events until EOSE or the deadline.
async fn run_leg(
    url: String,
    handle: Arc<dyn RelayHandle>,
    filter: EventFilter,
    deadline: Instant,
    monitor: Arc<HealthMonitor>,
    cancel: CancellationToken,
) -> LegOutcome {
    let started = Instant::now();
    let mut leg = LegOutcome::new(url);

    let subscribed = tokio::select! {
        _ = cancel.cancelled() => {
            leg.error = Some("pool shut down".to_string());
            None
        }
        r = tokio::time::timeout_at(deadline, handle.subscribe(filter)) => match r {
            Ok(Ok(subscription)) => {
                leg.subscribed = true;
                Some(subscription)
            }
            Ok(Err(e)) => {
                leg.error = Some(e.to_string());
                None
            }
            Err(_) => {
                leg.timed_out = true;
                None
            }
        },
    };

    if let Some(mut subscription) = subscribed {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    leg.error = Some("pool shut down".to_string());
                    break;
                }
                m = tokio::time::timeout_at(deadline, subscription.recv()) => m,
            };

            match message {
                Ok(Some(SubscriptionMessage::Event(event))) => {
                    if leg.first_event.is_none() {
                        leg.first_event = Some(started.elapsed());
                    }
                    monitor.record_event(&leg.url);
                    leg.events.push(event);
                }
                Ok(Some(SubscriptionMessage::EndOfStoredEvents)) => break,
                Ok(Some(SubscriptionMessage::Closed(reason))) => {
                    leg.error = Some(format!("subscription closed: {reason}"));
                    break;
                }
                Ok(None) => {
                    leg.error = Some("subscription ended before EOSE".to_string());
                    break;
                }
                Err(_) => {
                    leg.timed_out = true;
                    break;
                }
            }
        }
    }

    leg.latency = started.elapsed();
    if leg.timed_out {
        tracing::debug!(
            relay = %leg.url,
            "Query leg timed out with {} events",
            leg.events.len()
        );
    } else if let Some(ref e) = leg.error {
        tracing::debug!(relay = %leg.url, "Query leg failed: {}", e);
    }
    leg
}

/// Deduplicate legs by event ID (first leg wins), newest first, truncated to
/// `limit`.
pub(super) fn merge_legs(legs: Vec<LegOutcome>, limit: Option<usize>) -> Vec<RelayEvent> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    let mut duplicates = 0u64;

    for leg in legs {
        for event in leg.events {
            if seen.insert(event.id.clone()) {
                merged.push(RelayEvent {
                    relay_url: leg.url.clone(),
                    event,
                });
            } else {
                duplicates += 1;
            }
        }
    }

    if duplicates > 0 {
        counter!("query_events_duplicate_total").increment(duplicates);
    }

    // Equal timestamps fall back to ID so truncation does not depend on leg order.
    merged.sort_by(|a, b| {
        b.event
            .created_at
            .cmp(&a.event.created_at)
            .then_with(|| a.event.id.cmp(&b.event.id))
    });
    if let Some(limit) = limit {
        merged.truncate(limit);
    }
    merged
}

fn timed_result(legs: Vec<LegOutcome>, limit: Option<usize>, started: Instant) -> TimedQueryResult {
    let mut relays: Vec<RelayTiming> = legs.iter().map(LegOutcome::timing).collect();
    relays.sort_by(|a, b| a.url.cmp(&b.url));

    TimedQueryResult {
        events: merge_legs(legs, limit),
        relays,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

fn into_events(merged: Vec<RelayEvent>) -> Vec<Event> {
    merged.into_iter().map(|e| e.event).collect()
}
