//! Long-lived push subscriptions across every connected relay.
//!
//! Each relay gets its own leg task that forwards events into a shared
//! channel. A single dispatcher task drains the channel, drops events already
//! delivered by another relay, and invokes the caller's callback.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use metrics::counter;
use pensieve_core::EventFilter;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::RelayPool;
use super::query::RelayEvent;
use crate::Result;
use crate::relay::HealthMonitor;
use crate::transport::{RelayHandle, SUBSCRIPTION_BUFFER, SubscriptionMessage};

/// Event IDs remembered for cross-relay deduplication.
const SEEN_CAPACITY: usize = 10_000;

/// A running push subscription.
///
/// Dropping the handle ends the subscription on every relay.
#[derive(Debug)]
pub struct SubscriptionHandle {
    cancel: CancellationToken,
    relays: Vec<String>,
    _tasks: JoinSet<()>,
}

impl SubscriptionHandle {
    /// Stop receiving events. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Relays the subscription was opened on.
    pub fn relays(&self) -> &[String] {
        &self.relays
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Bounded set of recently seen event IDs, evicting the oldest.
struct SeenIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns `true` if `id` had not been seen yet.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.ids.remove(&oldest);
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

impl RelayPool {
    /// Subscribe to new events of the given kinds and authors on every
    /// connected relay.
    ///
    /// Empty `kinds` or `authors` leave that dimension unconstrained. Only
    /// events published after the subscription opens are delivered.
    /// `callback` runs on the pool's dispatcher task and should return
    /// quickly.
    pub async fn subscribe<F>(
        &self,
        kinds: &[u16],
        authors: &[String],
        callback: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(RelayEvent) + Send + Sync + 'static,
    {
        let targets = self.connected_handles(None)?;

        let mut filter = EventFilter::new().limit(0);
        if !kinds.is_empty() {
            filter = filter.kinds(kinds.iter().copied());
        }
        if !authors.is_empty() {
            filter = filter.authors(authors.iter().cloned());
        }

        let cancel = self.inner.cancel.child_token();
        let relays: Vec<String> = targets.iter().map(|(url, _)| url.clone()).collect();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let mut tasks = JoinSet::new();
        for (url, handle) in targets {
            tasks.spawn(run_subscription_leg(
                url,
                handle,
                filter.clone(),
                tx.clone(),
                Arc::clone(&self.inner.monitor),
                cancel.clone(),
            ));
        }
        drop(tx);
        tasks.spawn(dispatch(rx, callback, cancel.clone()));

        tracing::info!(
            "Opened subscription on {} relays: {}",
            relays.len(),
            filter.as_json()
        );

        Ok(SubscriptionHandle {
            cancel,
            relays,
            _tasks: tasks,
        })
    }
}

/// Forward one relay's events until it closes or the subscription is cancelled.
async fn run_subscription_leg(
    url: String,
    handle: Arc<dyn RelayHandle>,
    filter: EventFilter,
    events: mpsc::Sender<RelayEvent>,
    monitor: Arc<HealthMonitor>,
    cancel: CancellationToken,
) {
    let mut subscription = tokio::select! {
        _ = cancel.cancelled() => return,
        r = handle.subscribe(filter) => match r {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(relay = %url, "Subscription failed: {}", e);
                return;
            }
        },
    };

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            m = subscription.recv() => m,
        };

        match message {
            Some(SubscriptionMessage::Event(event)) => {
                monitor.record_event(&url);
                counter!("subscription_events_total").increment(1);
                let forwarded = RelayEvent {
                    relay_url: url.clone(),
                    event,
                };
                if events.send(forwarded).await.is_err() {
                    break;
                }
            }
            Some(SubscriptionMessage::EndOfStoredEvents) => {}
            Some(SubscriptionMessage::Closed(reason)) => {
                tracing::warn!(relay = %url, "Relay closed subscription: {}", reason);
                break;
            }
            None => {
                tracing::debug!(relay = %url, "Subscription stream ended");
                break;
            }
        }
    }
}

async fn dispatch<F>(mut events: mpsc::Receiver<RelayEvent>, callback: F, cancel: CancellationToken)
where
    F: Fn(RelayEvent) + Send + Sync + 'static,
{
    let mut seen = SeenIds::new(SEEN_CAPACITY);
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            e = events.recv() => e,
        };
        let Some(relay_event) = next else {
            break;
        };
        if seen.insert(&relay_event.event.id) {
            callback(relay_event);
        }
    }
    tracing::debug!("Subscription dispatcher stopped");
}
