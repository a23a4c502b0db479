//! Relay health monitoring.
//!
//! The [`HealthMonitor`] keeps one [`RelayMetrics`] record per relay URL it
//! has ever seen. Records are fed from two independent sources:
//!
//! - Probe rounds ([`HealthMonitor::check_all`]), run by the pool's
//!   monitoring loop, which connect to each relay, send a minimal query, and
//!   record latency plus success or failure.
//! - Received application events ([`HealthMonitor::record_event`]), which
//!   arrive whenever a relay pushes them.
//!
//! All records live behind a single lock so a probe round applies every
//! result (and every ring buffer update) under one acquisition. The lock is
//! never held across an await.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use pensieve_core::{EventFilter, RingBuffer, TimeSeriesPoint};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::scoring::{HealthInputs, HealthScore, compute_health};
use crate::transport::{RelayConnector, RelayHandle, SubscriptionMessage};

/// Minimum span of an event-rate sample.
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Per-relay health counters and history.
#[derive(Debug, Clone)]
pub struct RelayMetrics {
    pub latency_ms: f64,
    pub event_count: u64,
    pub events_per_second: f64,
    pub check_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub latency_history: RingBuffer,
    pub event_rate_history: RingBuffer,
    window_start: Instant,
    window_events: u64,
}

impl RelayMetrics {
    fn new(history_capacity: usize) -> Self {
        let capacity = history_capacity as i64;
        Self {
            latency_ms: 0.0,
            event_count: 0,
            events_per_second: 0.0,
            check_count: 0,
            success_count: 0,
            error_count: 0,
            last_error: None,
            last_event_at: None,
            last_check_at: None,
            latency_history: RingBuffer::new(capacity),
            event_rate_history: RingBuffer::new(capacity),
            window_start: Instant::now(),
            window_events: 0,
        }
    }

    /// Close the current rate window if it has run for at least a second.
    fn roll_rate_window(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.window_start);
        if elapsed < RATE_WINDOW {
            return;
        }
        let rate = self.window_events as f64 / elapsed.as_secs_f64();
        self.events_per_second = rate;
        self.event_rate_history.add(Utc::now().timestamp(), rate);
        self.window_start = now;
        self.window_events = 0;
    }

    fn apply_check(&mut self, result: &Result<Duration, String>) {
        let now = Utc::now();
        self.check_count += 1;
        self.last_check_at = Some(now);
        match result {
            Ok(latency) => {
                self.success_count += 1;
                self.latency_ms = latency.as_secs_f64() * 1000.0;
                self.latency_history.add(now.timestamp(), self.latency_ms);
            }
            Err(e) => {
                self.error_count += 1;
                self.last_error = Some(e.clone());
            }
        }
        self.roll_rate_window(Instant::now());
    }

    fn health_inputs(&self, connected: bool) -> HealthInputs {
        HealthInputs {
            connected,
            latency_ms: self.latency_ms,
            check_count: self.check_count,
            success_count: self.success_count,
            error_count: self.error_count,
        }
    }
}

/// Health snapshot of one relay, for presentation.
#[derive(Debug, Clone, Serialize)]
pub struct RelayHealth {
    pub url: String,
    pub connected: bool,
    pub health: HealthScore,
    pub latency_ms: f64,
    pub event_count: u64,
    pub events_per_second: f64,
    pub check_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub latency_history: Vec<TimeSeriesPoint>,
    pub event_rate_history: Vec<TimeSeriesPoint>,
}

impl RelayHealth {
    fn from_metrics(url: &str, connected: bool, metrics: Option<&RelayMetrics>) -> Self {
        match metrics {
            Some(m) => Self {
                url: url.to_string(),
                connected,
                health: compute_health(&m.health_inputs(connected)),
                latency_ms: m.latency_ms,
                event_count: m.event_count,
                events_per_second: m.events_per_second,
                check_count: m.check_count,
                success_count: m.success_count,
                error_count: m.error_count,
                last_error: m.last_error.clone(),
                last_event_at: m.last_event_at,
                last_check_at: m.last_check_at,
                latency_history: m.latency_history.get_all(),
                event_rate_history: m.event_rate_history.get_all(),
            },
            None => Self {
                url: url.to_string(),
                connected,
                health: compute_health(&HealthInputs {
                    connected,
                    ..Default::default()
                }),
                latency_ms: 0.0,
                event_count: 0,
                events_per_second: 0.0,
                check_count: 0,
                success_count: 0,
                error_count: 0,
                last_error: None,
                last_event_at: None,
                last_check_at: None,
                latency_history: Vec::new(),
                event_rate_history: Vec::new(),
            },
        }
    }
}

/// Pool-wide monitoring snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringData {
    pub total_relays: usize,
    pub connected_relays: usize,
    pub total_events: u64,
    pub events_per_second: f64,
    pub relays: Vec<RelayHealth>,
}

/// Probes relays and tracks their health.
pub struct HealthMonitor {
    connector: Arc<dyn RelayConnector>,
    probe_timeout: Duration,
    history_capacity: usize,
    metrics: RwLock<HashMap<String, RelayMetrics>>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        probe_timeout: Duration,
        history_capacity: usize,
    ) -> Self {
        Self {
            connector,
            probe_timeout,
            history_capacity,
            metrics: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Abort in-flight probes when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Record one received application event for `url`.
    pub fn record_event(&self, url: &str) {
        let now = Instant::now();
        let mut metrics = self.metrics.write();
        let m = metrics
            .entry(url.to_string())
            .or_insert_with(|| RelayMetrics::new(self.history_capacity));
        m.roll_rate_window(now);
        m.event_count += 1;
        m.window_events += 1;
        m.last_event_at = Some(Utc::now());
    }

    /// Record the outcome of a single probe.
    pub fn record_check(&self, url: &str, result: Result<Duration, String>) {
        record_probe_metrics(&result);
        let mut metrics = self.metrics.write();
        metrics
            .entry(url.to_string())
            .or_insert_with(|| RelayMetrics::new(self.history_capacity))
            .apply_check(&result);
    }

    /// Connect to `url`, run a minimal query, and return its round-trip time.
    ///
    /// Connect and round trip share one probe deadline. A connection that
    /// was opened is closed before returning, whether the probe succeeded,
    /// timed out, or was cancelled.
    pub async fn probe(&self, url: &str) -> Result<Duration, String> {
        let deadline = Instant::now() + self.probe_timeout;
        let timed_out = || format!("probe timed out after {:?}", self.probe_timeout);

        let connected = tokio::select! {
            _ = self.cancel.cancelled() => return Err("probe cancelled".to_string()),
            r = tokio::time::timeout_at(deadline, self.connector.connect(url, self.probe_timeout)) => r,
        };
        let handle = match connected {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(timed_out()),
        };

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err("probe cancelled".to_string()),
            r = tokio::time::timeout_at(deadline, round_trip(handle.as_ref())) => {
                r.unwrap_or_else(|_| Err(timed_out()))
            }
        };

        handle.close().await;
        outcome
    }

    /// Probe every URL concurrently and apply all results at once.
    ///
    /// Dropping the returned future aborts outstanding probes.
    pub async fn check_all(self: &Arc<Self>, urls: &[String]) {
        if urls.is_empty() {
            return;
        }

        let mut probes = JoinSet::new();
        for url in urls {
            let monitor = Arc::clone(self);
            let url = url.clone();
            probes.spawn(async move {
                let result = monitor.probe(&url).await;
                (url, result)
            });
        }

        let mut results = Vec::with_capacity(urls.len());
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::warn!("Probe task failed: {}", e),
            }
        }

        if self.cancel.is_cancelled() {
            tracing::debug!("Health check round cancelled");
            return;
        }

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        {
            let mut metrics = self.metrics.write();
            for (url, result) in &results {
                record_probe_metrics(result);
                metrics
                    .entry(url.clone())
                    .or_insert_with(|| RelayMetrics::new(self.history_capacity))
                    .apply_check(result);
            }
        }

        tracing::debug!(
            "Health check round: {} relays probed, {} failed",
            results.len(),
            failed
        );
    }

    /// Current health of `url`. Relays never seen get a zeroed record.
    pub fn relay_health(&self, url: &str, connected: bool) -> RelayHealth {
        let metrics = self.metrics.read();
        RelayHealth::from_metrics(url, connected, metrics.get(url))
    }

    /// Raw metrics for `url`, if any were recorded.
    pub fn snapshot(&self, url: &str) -> Option<RelayMetrics> {
        self.metrics.read().get(url).cloned()
    }

    /// Aggregate health over the given `(url, connected)` relays.
    pub fn monitoring_data(&self, relays: &[(String, bool)]) -> MonitoringData {
        let metrics = self.metrics.read();
        let mut health: Vec<RelayHealth> = relays
            .iter()
            .map(|(url, connected)| RelayHealth::from_metrics(url, *connected, metrics.get(url)))
            .collect();
        drop(metrics);

        health.sort_by(|a, b| a.url.cmp(&b.url));

        let total_events = health.iter().map(|h| h.event_count).sum();
        let events_per_second = health.iter().map(|h| h.events_per_second).sum();
        gauge!("monitor_events_per_second").set(events_per_second);

        MonitoringData {
            total_relays: health.len(),
            connected_relays: health.iter().filter(|h| h.connected).count(),
            total_events,
            events_per_second,
            relays: health,
        }
    }
}

fn record_probe_metrics(result: &Result<Duration, String>) {
    match result {
        Ok(latency) => {
            counter!("monitor_probes_total", "result" => "ok").increment(1);
            histogram!("monitor_probe_latency_seconds").record(latency.as_secs_f64());
        }
        Err(_) => {
            counter!("monitor_probes_total", "result" => "error").increment(1);
        }
    }
}

/// Time from issuing a `limit: 1` subscription to the relay's first answer.
async fn round_trip(handle: &dyn RelayHandle) -> Result<Duration, String> {
    let started = Instant::now();
    let mut subscription = handle
        .subscribe(EventFilter::new().limit(1))
        .await
        .map_err(|e| e.to_string())?;
    match subscription.recv().await {
        Some(SubscriptionMessage::Event(_)) | Some(SubscriptionMessage::EndOfStoredEvents) => {
            Ok(started.elapsed())
        }
        Some(SubscriptionMessage::Closed(reason)) => Err(format!("subscription closed: {reason}")),
        None => Err("subscription ended without a response".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockNetwork, MockRelay, test_event};

    fn monitor(network: &MockNetwork) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(
            network.connector(),
            Duration::from_secs(10),
            60,
        ))
    }

    // =========================================================================
    // Recording
    // =========================================================================

    #[test]
    fn test_unknown_relay_health() {
        let monitor = monitor(&MockNetwork::new());

        let health = monitor.relay_health("wss://new.example", true);
        assert!((health.health.score - 50.0).abs() < 0.001);
        assert_eq!(health.check_count, 0);
        assert!(health.latency_history.is_empty());
        assert!(monitor.snapshot("wss://new.example").is_none());
    }

    #[test]
    fn test_record_check_counts() {
        let monitor = monitor(&MockNetwork::new());
        let url = "wss://a.example";

        monitor.record_check(url, Ok(Duration::from_millis(80)));
        monitor.record_check(url, Err("refused".to_string()));
        monitor.record_check(url, Ok(Duration::from_millis(120)));

        let m = monitor.snapshot(url).unwrap();
        assert_eq!(m.check_count, 3);
        assert_eq!(m.success_count, 2);
        assert_eq!(m.error_count, 1);
        assert_eq!(m.last_error.as_deref(), Some("refused"));
        assert!((m.latency_ms - 120.0).abs() < 0.001);
        assert_eq!(m.latency_history.len(), 2);
        assert!(m.last_check_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_rate_window() {
        let monitor = monitor(&MockNetwork::new());
        let url = "wss://a.example";

        for _ in 0..10 {
            monitor.record_event(url);
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        monitor.record_event(url);

        let m = monitor.snapshot(url).unwrap();
        assert_eq!(m.event_count, 11);
        assert!((m.events_per_second - 5.0).abs() < 0.01);
        assert_eq!(m.event_rate_history.len(), 1);
        assert!(m.last_event_at.is_some());
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = Arc::new(HealthMonitor::new(
            MockNetwork::new().connector(),
            Duration::from_secs(1),
            5,
        ));
        for i in 0..20 {
            monitor.record_check("wss://a.example", Ok(Duration::from_millis(i)));
        }
        let health = monitor.relay_health("wss://a.example", true);
        assert_eq!(health.latency_history.len(), 5);
        assert_eq!(health.check_count, 20);
    }

    // =========================================================================
    // Probing
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_probe_measures_round_trip() {
        let network = MockNetwork::new();
        network.relay(
            "wss://a.example",
            MockRelay::with_events(vec![test_event(1, 1, 100)])
                .response_delay(Duration::from_millis(50)),
        );
        let monitor = monitor(&network);

        let latency = monitor.probe("wss://a.example").await.unwrap();
        assert!(latency >= Duration::from_millis(50));
        assert!(latency < Duration::from_millis(60));
        assert_eq!(network.closes("wss://a.example"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_closes_connection() {
        let network = MockNetwork::new();
        network.relay("wss://mute.example", MockRelay::default().never_eose());
        let monitor = monitor(&network);

        let err = monitor.probe("wss://mute.example").await.unwrap_err();
        assert!(err.contains("timed out"));
        assert_eq!(network.closes("wss://mute.example"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_cancelled() {
        let network = MockNetwork::new();
        network.relay("wss://mute.example", MockRelay::default().never_eose());
        let cancel = CancellationToken::new();
        let monitor = Arc::new(
            HealthMonitor::new(network.connector(), Duration::from_secs(10), 60)
                .with_cancellation(cancel.clone()),
        );

        let started = Instant::now();
        let probing = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.probe("wss://mute.example").await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let err = probing.await.unwrap().unwrap_err();
        assert_eq!(err, "probe cancelled");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(network.closes("wss://mute.example"), 1);

        // Cancelled rounds leave no record behind.
        monitor.check_all(&["wss://mute.example".to_string()]).await;
        assert!(monitor.snapshot("wss://mute.example").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_times_out() {
        let network = MockNetwork::new();
        network.relay(
            "wss://slow.example",
            MockRelay::default().response_delay(Duration::from_secs(30)),
        );
        let monitor = monitor(&network);

        let err = monitor.probe("wss://slow.example").await.unwrap_err();
        assert!(err.contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_all_records_every_relay() {
        let network = MockNetwork::new();
        network
            .relay(
                "wss://good.example",
                MockRelay::default().response_delay(Duration::from_millis(40)),
            )
            .relay("wss://bad.example", MockRelay::unreachable("refused"));
        let monitor = monitor(&network);

        let urls = vec![
            "wss://good.example".to_string(),
            "wss://bad.example".to_string(),
        ];
        monitor.check_all(&urls).await;
        monitor.check_all(&urls).await;

        let good = monitor.relay_health("wss://good.example", true);
        assert_eq!(good.check_count, 2);
        assert_eq!(good.success_count, 2);
        assert!(good.latency_ms >= 40.0 && good.latency_ms < 50.0);
        assert!(good.health.score >= 99.0);

        let bad = monitor.relay_health("wss://bad.example", false);
        assert_eq!(bad.error_count, 2);
        assert!(bad.last_error.unwrap().contains("refused"));
        assert!(bad.health.score < 20.0);
    }

    #[tokio::test]
    async fn test_monitoring_data_aggregates() {
        let monitor = monitor(&MockNetwork::new());
        monitor.record_event("wss://a.example");
        monitor.record_event("wss://a.example");
        monitor.record_event("wss://b.example");

        let data = monitor.monitoring_data(&[
            ("wss://b.example".to_string(), false),
            ("wss://a.example".to_string(), true),
        ]);
        assert_eq!(data.total_relays, 2);
        assert_eq!(data.connected_relays, 1);
        assert_eq!(data.total_events, 3);
        assert_eq!(data.relays[0].url, "wss://a.example");
        assert_eq!(data.relays[1].url, "wss://b.example");
    }
}
