//! Relay transport seam.
//!
//! The pool never speaks the relay wire protocol itself. It drives relays
//! through three object-safe traits:
//!
//! - [`RelayConnector`] opens a connection to a relay URL within a deadline
//! - [`RelayHandle`] is a live connection: subscribe, publish, close
//! - [`InfoFetcher`] retrieves a relay's NIP-11 document
//!
//! Production implementations live in [`sdk`] (nostr-sdk) and [`http`]
//! (reqwest). Tests use the scripted in-memory network in `mock`.

pub mod http;
#[cfg(test)]
pub(crate) mod mock;
pub mod sdk;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use pensieve_core::{Event, EventFilter, RelayInformationDocument};
use tokio::sync::mpsc;

use crate::Result;

pub use self::http::HttpInfoFetcher;
pub use self::sdk::NostrConnector;

/// Boxed, sendable future returned by the transport traits.
pub type BoxedFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Buffer size for subscription message channels.
pub const SUBSCRIPTION_BUFFER: usize = 1024;

/// A message delivered on a relay subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionMessage {
    /// A matching event.
    Event(Event),
    /// The relay has sent every stored event matching the filter (EOSE).
    EndOfStoredEvents,
    /// The relay closed the subscription, with its reason.
    Closed(String),
}

/// Receiving end of a relay subscription.
///
/// Dropping it ends the subscription; implementations watch for the closed
/// channel and unsubscribe.
#[derive(Debug)]
pub struct Subscription {
    messages: mpsc::Receiver<SubscriptionMessage>,
}

impl Subscription {
    /// Create a subscription and the sender that feeds it.
    pub fn channel(buffer: usize) -> (mpsc::Sender<SubscriptionMessage>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { messages: rx })
    }

    /// Receive the next message; `None` once the relay side is gone.
    pub async fn recv(&mut self) -> Option<SubscriptionMessage> {
        self.messages.recv().await
    }
}

/// Opens connections to relays.
pub trait RelayConnector: Send + Sync {
    /// Connect to `url`, giving up after `timeout`.
    fn connect<'a>(
        &'a self,
        url: &'a str,
        timeout: Duration,
    ) -> BoxedFuture<'a, Result<Arc<dyn RelayHandle>>>;
}

/// A live connection to a single relay.
pub trait RelayHandle: Send + Sync {
    /// Open a subscription with the given filter.
    fn subscribe(&self, filter: EventFilter) -> BoxedFuture<'_, Result<Subscription>>;

    /// Publish an event and wait for the relay's acceptance.
    fn publish<'a>(&'a self, event: &'a Event) -> BoxedFuture<'a, Result<()>>;

    /// Close the connection. Idempotent.
    fn close(&self) -> BoxedFuture<'_, ()>;
}

/// Fetches NIP-11 relay information documents.
pub trait InfoFetcher: Send + Sync {
    /// Fetch the document for the relay at `url` (a `ws://`/`wss://` URL).
    fn fetch<'a>(&'a self, url: &'a str) -> BoxedFuture<'a, Result<RelayInformationDocument>>;
}
