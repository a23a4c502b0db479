//! nostr-sdk backed relay transport.
//!
//! Each pooled relay gets its own nostr-sdk `Client` holding exactly that
//! relay, so connection state, subscriptions, and shutdown are per relay and
//! never interfere across pool entries.
//!
//! Events cross the seam as JSON: nostr-sdk events are serialized and parsed
//! into [`pensieve_core::Event`], and outgoing events go the other way.

use std::sync::Arc;
use std::time::Duration;

use nostr_sdk::prelude::*;
use tokio::sync::broadcast::error::RecvError;

use super::{
    BoxedFuture, RelayConnector, RelayHandle, SUBSCRIPTION_BUFFER, Subscription,
    SubscriptionMessage,
};
use crate::{Error, Result};

/// How often connection status is polled while waiting for a connect.
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connects to relays using nostr-sdk.
#[derive(Debug, Clone)]
pub struct NostrConnector {
    /// Size of each client's notification channel.
    notification_channel_size: usize,
}

impl Default for NostrConnector {
    fn default() -> Self {
        Self {
            notification_channel_size: 16384, // 4x nostr-sdk default
        }
    }
}

impl NostrConnector {
    /// Create a connector with the default notification buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the per-client notification channel size.
    pub fn notification_channel_size(mut self, size: usize) -> Self {
        self.notification_channel_size = size;
        self
    }

    async fn connect_inner(&self, url: &str) -> Result<Arc<dyn RelayHandle>> {
        let relay_url = RelayUrl::parse(url).map_err(|e| Error::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let pool_opts =
            RelayPoolOptions::default().notification_channel_size(self.notification_channel_size);
        let client = Client::builder()
            .opts(ClientOptions::new().pool(pool_opts))
            .build();

        client.add_relay(url).await.map_err(transport)?;
        client.connect_relay(url).await.map_err(transport)?;

        // connect_relay only schedules the connection; wait for the socket.
        loop {
            let status = client.relays().await.get(&relay_url).map(|r| r.status());
            match status {
                Some(nostr_sdk::RelayStatus::Connected) => break,
                Some(nostr_sdk::RelayStatus::Terminated) | None => {
                    client.disconnect().await;
                    return Err(Error::Transport(format!("connection to {url} terminated")));
                }
                _ => tokio::time::sleep(STATUS_POLL_INTERVAL).await,
            }
        }

        Ok(Arc::new(NostrRelayHandle { client, relay_url }))
    }
}

impl RelayConnector for NostrConnector {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        timeout: Duration,
    ) -> BoxedFuture<'a, Result<Arc<dyn RelayHandle>>> {
        Box::pin(async move {
            tokio::time::timeout(timeout, self.connect_inner(url))
                .await
                .map_err(|_| Error::Timeout(timeout))?
        })
    }
}

/// A connected nostr-sdk client holding one relay.
struct NostrRelayHandle {
    client: Client,
    relay_url: RelayUrl,
}

impl RelayHandle for NostrRelayHandle {
    fn subscribe(
        &self,
        filter: pensieve_core::EventFilter,
    ) -> BoxedFuture<'_, Result<Subscription>> {
        Box::pin(async move {
            let filter = Filter::from_json(filter.as_json())
                .map_err(|e| Error::Transport(format!("invalid filter: {e}")))?;

            // Take the receiver before subscribing so no early event is missed.
            let mut notifications = self.client.notifications();
            let output = self
                .client
                .subscribe_to(vec![self.relay_url.clone()], filter, None)
                .await
                .map_err(transport)?;
            let subscription_id = output.val;
            let wanted = subscription_id.to_string();

            let (tx, subscription) = Subscription::channel(SUBSCRIPTION_BUFFER);
            let client = self.client.clone();

            tokio::spawn(async move {
                loop {
                    let notification = tokio::select! {
                        _ = tx.closed() => break,
                        n = notifications.recv() => n,
                    };

                    let notification = match notification {
                        Ok(n) => n,
                        Err(RecvError::Lagged(count)) => {
                            tracing::warn!(
                                "Subscription {} lagged, dropped {} notifications",
                                wanted,
                                count
                            );
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    };

                    let message = match notification {
                        RelayPoolNotification::Message { message, .. } => match message {
                            RelayMessage::Event {
                                subscription_id,
                                event,
                            } if subscription_id.to_string() == wanted => {
                                match convert_event(&event.as_json()) {
                                    Some(event) => SubscriptionMessage::Event(event),
                                    None => continue,
                                }
                            }
                            RelayMessage::EndOfStoredEvents(id) if id.to_string() == wanted => {
                                SubscriptionMessage::EndOfStoredEvents
                            }
                            RelayMessage::Closed {
                                subscription_id,
                                message,
                            } if subscription_id.to_string() == wanted => {
                                SubscriptionMessage::Closed(message.to_string())
                            }
                            _ => continue,
                        },
                        RelayPoolNotification::Shutdown => break,
                        _ => continue,
                    };

                    if tx.send(message).await.is_err() {
                        break;
                    }
                }

                client.unsubscribe(&subscription_id).await;
            });

            Ok(subscription)
        })
    }

    fn publish<'a>(&'a self, event: &'a pensieve_core::Event) -> BoxedFuture<'a, Result<()>> {
        Box::pin(async move {
            let event = Event::from_json(event.as_json()?)
                .map_err(|e| Error::Transport(format!("invalid event: {e}")))?;

            let output = self
                .client
                .send_event_to(vec![self.relay_url.clone()], &event)
                .await
                .map_err(transport)?;

            match output.failed.into_values().next() {
                Some(reason) => Err(Error::Transport(reason)),
                None => Ok(()),
            }
        })
    }

    fn close(&self) -> BoxedFuture<'_, ()> {
        Box::pin(async move {
            self.client.disconnect().await;
        })
    }
}

/// Convert nostr-sdk event JSON into the pool's event type.
fn convert_event(json: &str) -> Option<pensieve_core::Event> {
    match pensieve_core::Event::from_json(json) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!("Dropping unparseable event: {}", e);
            None
        }
    }
}

fn transport(e: impl std::fmt::Display) -> Error {
    Error::Transport(e.to_string())
}
