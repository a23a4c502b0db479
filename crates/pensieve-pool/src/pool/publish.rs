//! Fan-out publishing.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use pensieve_core::Event;
use serde::Serialize;
use tokio::task::JoinSet;

use super::RelayPool;
use crate::transport::RelayHandle;
use crate::{Error, Result};

/// Outcome of publishing to one relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishResult {
    pub url: String,
    pub success: bool,
    pub error: Option<String>,
}

impl PublishResult {
    fn ok(url: String) -> Self {
        Self {
            url,
            success: true,
            error: None,
        }
    }

    fn failed(url: String, error: impl Into<String>) -> Self {
        Self {
            url,
            success: false,
            error: Some(error.into()),
        }
    }
}

impl RelayPool {
    /// Publish `event` to `relay_urls`, or to every connected relay if empty.
    ///
    /// Always returns one entry per target. Requested relays that are not
    /// connected get a failure entry. With no connected relays at all the
    /// result is a single failure with an empty URL.
    pub async fn publish_event(&self, event: &Event, relay_urls: &[String]) -> Vec<PublishResult> {
        let connected: HashMap<String, Arc<dyn RelayHandle>> = match self.connected_handles(None) {
            Ok(handles) => handles.into_iter().collect(),
            Err(_) => {
                return vec![PublishResult::failed(
                    String::new(),
                    Error::NoConnectedRelays.to_string(),
                )];
            }
        };

        let mut results = Vec::new();
        let mut targets = Vec::new();
        if relay_urls.is_empty() {
            targets.extend(connected);
        } else {
            let mut requested: Vec<&str> = relay_urls.iter().map(|u| u.trim()).collect();
            requested.sort_unstable();
            requested.dedup();
            for url in requested {
                match connected.get(url) {
                    Some(handle) => targets.push((url.to_string(), Arc::clone(handle))),
                    None => results.push(PublishResult::failed(url.to_string(), "relay not connected")),
                }
            }
        }

        let timeout = self.inner.config.publish_timeout;
        let mut publishes = JoinSet::new();
        for (url, handle) in targets {
            let event = event.clone();
            let cancel = self.inner.cancel.clone();
            publishes.spawn(async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Shutdown),
                    r = tokio::time::timeout(timeout, handle.publish(&event)) => {
                        r.unwrap_or(Err(Error::Timeout(timeout)))
                    }
                };
                match outcome {
                    Ok(()) => PublishResult::ok(url),
                    Err(e) => PublishResult::failed(url, e.to_string()),
                }
            });
        }

        while let Some(joined) = publishes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::warn!("Publish task failed: {}", e),
            }
        }

        for result in &results {
            if result.success {
                counter!("publish_total", "result" => "ok").increment(1);
            } else {
                counter!("publish_total", "result" => "error").increment(1);
                tracing::debug!(
                    relay = %result.url,
                    "Publish failed: {}",
                    result.error.as_deref().unwrap_or_default()
                );
            }
        }

        results.sort_by(|a, b| a.url.cmp(&b.url));
        tracing::info!(
            "Published event {} to {}/{} relays",
            event.id,
            results.iter().filter(|r| r.success).count(),
            results.len()
        );
        results
    }

    /// Parse a NIP-01 event JSON string and publish it.
    pub async fn publish_event_json(
        &self,
        json: &str,
        relay_urls: &[String],
    ) -> Result<Vec<PublishResult>> {
        let event = Event::from_json(json)?;
        Ok(self.publish_event(&event, relay_urls).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::tests::{add_and_settle, pool_with};
    use crate::transport::mock::{MockNetwork, MockRelay, test_event};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_publish_without_relays() {
        let pool = pool_with(&MockNetwork::new());
        let results = pool.publish_event(&test_event(1, 1, 10), &[]).await;

        assert_eq!(
            results,
            vec![PublishResult {
                url: String::new(),
                success: false,
                error: Some("no connected relays".to_string()),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_to_all_connected() {
        let network = MockNetwork::new();
        network
            .relay("wss://a.example", MockRelay::default())
            .relay("wss://b.example", MockRelay::default().publish_error("blocked: spam"));
        let pool = pool_with(&network);
        add_and_settle(&pool, &["wss://a.example", "wss://b.example"]).await;

        let event = test_event(1, 1, 10);
        let results = pool.publish_event(&event, &[]).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert!(results[1].error.as_deref().unwrap().contains("blocked: spam"));
        assert_eq!(network.published("wss://a.example"), vec![event]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_to_selection() {
        let network = MockNetwork::new();
        network
            .relay("wss://a.example", MockRelay::default())
            .relay("wss://b.example", MockRelay::default());
        let pool = pool_with(&network);
        add_and_settle(&pool, &["wss://a.example", "wss://b.example"]).await;

        let results = pool
            .publish_event(
                &test_event(1, 1, 10),
                &["wss://b.example".to_string(), "wss://gone.example".to_string()],
            )
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0], PublishResult::ok("wss://b.example".to_string()));
        assert_eq!(
            results[1],
            PublishResult::failed("wss://gone.example".to_string(), "relay not connected")
        );
        assert!(network.published("wss://a.example").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_timeout() {
        let network = MockNetwork::new();
        network.relay(
            "wss://slow.example",
            MockRelay::default().response_delay(Duration::from_secs(60)),
        );
        let pool = pool_with(&network);
        add_and_settle(&pool, &["wss://slow.example"]).await;

        let results = pool.publish_event(&test_event(1, 1, 10), &[]).await;
        assert!(!results[0].success);
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_event_json() {
        let network = MockNetwork::new();
        network.relay("wss://a.example", MockRelay::default());
        let pool = pool_with(&network);
        add_and_settle(&pool, &["wss://a.example"]).await;

        let event = test_event(1, 1, 10);
        let json = event.as_json().unwrap();
        let results = pool.publish_event_json(&json, &[]).await.unwrap();
        assert!(results[0].success);

        assert!(pool.publish_event_json("{not json", &[]).await.is_err());
    }
}
