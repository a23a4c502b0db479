//! Scripted in-memory relay network for tests.
//!
//! Each relay is configured up front with [`MockRelay`]: stored events,
//! delays, and failure modes. Connections and subscriptions run on the tokio
//! clock, so tests using `start_paused` see deterministic timing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pensieve_core::{Event, EventFilter, RelayInformationDocument};
use tokio::sync::broadcast;

use super::{
    BoxedFuture, InfoFetcher, RelayConnector, RelayHandle, SUBSCRIPTION_BUFFER, Subscription,
    SubscriptionMessage,
};
use crate::{Error, Result};

/// Behaviour of a single scripted relay.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockRelay {
    pub events: Vec<Event>,
    pub connect_error: Option<String>,
    pub connect_delay: Duration,
    pub response_delay: Duration,
    pub subscribe_delay: Duration,
    pub close_delay: Duration,
    pub never_eose: bool,
    pub publish_error: Option<String>,
    pub info: Option<RelayInformationDocument>,
}

impl MockRelay {
    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn unreachable(reason: &str) -> Self {
        Self {
            connect_error: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Delay before `subscribe` returns, as if the REQ were never acknowledged.
    pub fn subscribe_delay(mut self, delay: Duration) -> Self {
        self.subscribe_delay = delay;
        self
    }

    pub fn close_delay(mut self, delay: Duration) -> Self {
        self.close_delay = delay;
        self
    }

    pub fn never_eose(mut self) -> Self {
        self.never_eose = true;
        self
    }

    pub fn publish_error(mut self, reason: &str) -> Self {
        self.publish_error = Some(reason.to_string());
        self
    }

    pub fn info(mut self, info: RelayInformationDocument) -> Self {
        self.info = Some(info);
        self
    }
}

struct RelayState {
    config: MockRelay,
    live: broadcast::Sender<Event>,
    published: Vec<Event>,
    connects: usize,
    closes: usize,
    info_fetches: usize,
}

/// Shared scripted network implementing both transport traits.
#[derive(Clone, Default)]
pub(crate) struct MockNetwork {
    relays: Arc<Mutex<HashMap<String, RelayState>>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script (or re-script) the relay at `url`.
    pub fn relay(&self, url: &str, config: MockRelay) -> &Self {
        let mut relays = self.relays.lock();
        match relays.get_mut(url) {
            Some(state) => state.config = config,
            None => {
                let (live, _) = broadcast::channel(SUBSCRIPTION_BUFFER);
                relays.insert(
                    url.to_string(),
                    RelayState {
                        config,
                        live,
                        published: Vec::new(),
                        connects: 0,
                        closes: 0,
                        info_fetches: 0,
                    },
                );
            }
        }
        self
    }

    /// Deliver a live event to every open subscription on `url`.
    pub fn push(&self, url: &str, event: Event) {
        if let Some(state) = self.relays.lock().get(url) {
            let _ = state.live.send(event);
        }
    }

    /// Events accepted by the relay at `url`.
    pub fn published(&self, url: &str) -> Vec<Event> {
        self.relays
            .lock()
            .get(url)
            .map(|s| s.published.clone())
            .unwrap_or_default()
    }

    /// Connect attempts made against `url`.
    pub fn connects(&self, url: &str) -> usize {
        self.relays.lock().get(url).map_or(0, |s| s.connects)
    }

    /// Connections to `url` that have been closed.
    pub fn closes(&self, url: &str) -> usize {
        self.relays.lock().get(url).map_or(0, |s| s.closes)
    }

    /// NIP-11 fetches made against `url`.
    pub fn info_fetches(&self, url: &str) -> usize {
        self.relays.lock().get(url).map_or(0, |s| s.info_fetches)
    }

    /// Connectors and fetchers as the pool takes them.
    pub fn connector(&self) -> Arc<dyn RelayConnector> {
        Arc::new(self.clone())
    }

    pub fn fetcher(&self) -> Arc<dyn InfoFetcher> {
        Arc::new(self.clone())
    }

    fn config(&self, url: &str) -> Option<MockRelay> {
        self.relays.lock().get(url).map(|s| s.config.clone())
    }
}

impl RelayConnector for MockNetwork {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        timeout: Duration,
    ) -> BoxedFuture<'a, Result<Arc<dyn RelayHandle>>> {
        Box::pin(async move {
            let config = {
                let mut relays = self.relays.lock();
                match relays.get_mut(url) {
                    Some(state) => {
                        state.connects += 1;
                        state.config.clone()
                    }
                    None => return Err(Error::Transport(format!("{url}: connection refused"))),
                }
            };

            tokio::time::timeout(timeout, tokio::time::sleep(config.connect_delay))
                .await
                .map_err(|_| Error::Timeout(timeout))?;

            if let Some(reason) = config.connect_error {
                return Err(Error::Transport(reason));
            }

            Ok(Arc::new(MockHandle {
                network: self.clone(),
                url: url.to_string(),
                closed: AtomicBool::new(false),
            }) as Arc<dyn RelayHandle>)
        })
    }
}

impl InfoFetcher for MockNetwork {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxedFuture<'a, Result<RelayInformationDocument>> {
        Box::pin(async move {
            let mut relays = self.relays.lock();
            let state = relays
                .get_mut(url)
                .ok_or_else(|| Error::InfoFetch(format!("{url}: unknown relay")))?;
            state.info_fetches += 1;
            state
                .config
                .info
                .clone()
                .ok_or_else(|| Error::InfoFetch(format!("{url}: HTTP 404")))
        })
    }
}

struct MockHandle {
    network: MockNetwork,
    url: String,
    closed: AtomicBool,
}

impl MockHandle {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("{}: connection closed", self.url)));
        }
        Ok(())
    }
}

impl RelayHandle for MockHandle {
    fn subscribe(&self, filter: EventFilter) -> BoxedFuture<'_, Result<Subscription>> {
        Box::pin(async move {
            self.ensure_open()?;

            let (config, mut live) = {
                let relays = self.network.relays.lock();
                let state = relays
                    .get(&self.url)
                    .ok_or_else(|| Error::Transport(format!("{}: gone", self.url)))?;
                (state.config.clone(), state.live.subscribe())
            };
            tokio::time::sleep(config.subscribe_delay).await;

            let mut stored: Vec<Event> = config
                .events
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect();
            stored.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if let Some(limit) = filter.limit {
                stored.truncate(limit);
            }

            let (tx, subscription) = Subscription::channel(SUBSCRIPTION_BUFFER);

            tokio::spawn(async move {
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(config.response_delay) => {}
                }

                for event in stored {
                    if tx.send(SubscriptionMessage::Event(event)).await.is_err() {
                        return;
                    }
                }

                if !config.never_eose
                    && tx
                        .send(SubscriptionMessage::EndOfStoredEvents)
                        .await
                        .is_err()
                {
                    return;
                }

                loop {
                    let event = tokio::select! {
                        _ = tx.closed() => return,
                        event = live.recv() => event,
                    };
                    match event {
                        Ok(event) if filter.matches(&event) => {
                            if tx.send(SubscriptionMessage::Event(event)).await.is_err() {
                                return;
                            }
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            // Keep the subscription open until the receiver goes away.
                            tx.closed().await;
                            return;
                        }
                    }
                }
            });

            Ok(subscription)
        })
    }

    fn publish<'a>(&'a self, event: &'a Event) -> BoxedFuture<'a, Result<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            let config = self
                .network
                .config(&self.url)
                .ok_or_else(|| Error::Transport(format!("{}: gone", self.url)))?;

            tokio::time::sleep(config.response_delay).await;

            if let Some(reason) = config.publish_error {
                return Err(Error::Transport(reason));
            }

            let mut relays = self.network.relays.lock();
            if let Some(state) = relays.get_mut(&self.url) {
                state.published.push(event.clone());
                let _ = state.live.send(event.clone());
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxedFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            let delay = {
                let mut relays = self.network.relays.lock();
                match relays.get_mut(&self.url) {
                    Some(state) => {
                        state.closes += 1;
                        state.config.close_delay
                    }
                    None => Duration::ZERO,
                }
            };
            tokio::time::sleep(delay).await;
        })
    }
}

/// Build a shape-valid event for tests.
pub(crate) fn test_event(n: u64, kind: u16, created_at: u64) -> Event {
    Event {
        id: format!("{n:064x}"),
        pubkey: format!("{:064x}", 0xa000 + (n % 7)),
        created_at,
        kind,
        tags: Vec::new(),
        content: format!("event {n}"),
        sig: "0".repeat(128),
    }
}
